//! Wire codec (component A): pack/unpack of `NegTokenInit`, `NegTokenInit2`,
//! and `NegTokenResp`, with GSS-API pseudo-framing on the initiator's first
//! token only. Pure, side-effect-free — everything here is `(bytes) -> value`
//! or `(value) -> bytes`.

use der::asn1::OctetStringRef;
use der::oid::ObjectIdentifier;
use der::{AnyRef, Decode, Encode};
use gss_api::negotiation::{
    NegState as GssNegState, NegTokenInit as GssNegTokenInit, NegTokenInit2 as GssNegTokenInit2,
    NegTokenResp as GssNegTokenResp, NegotiationToken,
};
use gss_api::InitialContextToken;

use crate::error::Error;
use crate::mech::SPNEGO_OID;

/// `neg_state` as defined by RFC 4178 §4.2.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegState {
    AcceptCompleted,
    AcceptIncomplete,
    Reject,
    RequestMic,
}

impl From<NegState> for GssNegState {
    fn from(value: NegState) -> Self {
        match value {
            NegState::AcceptCompleted => GssNegState::AcceptCompleted,
            NegState::AcceptIncomplete => GssNegState::AcceptIncomplete,
            NegState::Reject => GssNegState::Reject,
            NegState::RequestMic => GssNegState::RequestMic,
        }
    }
}

impl TryFrom<GssNegState> for NegState {
    type Error = Error;

    fn try_from(value: GssNegState) -> Result<Self, Self::Error> {
        Ok(match value {
            GssNegState::AcceptCompleted => NegState::AcceptCompleted,
            GssNegState::AcceptIncomplete => NegState::AcceptIncomplete,
            GssNegState::Reject => NegState::Reject,
            GssNegState::RequestMic => NegState::RequestMic,
        })
    }
}

/// Owned, decoded form of a `NegTokenInit`/`NegTokenInit2` (we never need to
/// distinguish the two once decoded — only the initiator/acceptor-initiated
/// framing choice at *encode* time differs, per spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct NegTokenInitBody {
    pub mech_types: Vec<ObjectIdentifier>,
    pub mech_token: Option<Vec<u8>>,
    pub mech_list_mic: Option<Vec<u8>>,
}

/// Owned, decoded form of a `NegTokenResp`.
#[derive(Debug, Clone, Default)]
pub struct NegTokenRespBody {
    pub neg_state: Option<NegState>,
    pub supported_mech: Option<ObjectIdentifier>,
    pub response_token: Option<Vec<u8>>,
    pub mech_list_mic: Option<Vec<u8>>,
}

/// A decoded SPNEGO message, dispatched on the outer `NegotiationToken` CHOICE tag.
#[derive(Debug, Clone)]
pub enum NegToken {
    Init(NegTokenInitBody),
    Resp(NegTokenRespBody),
}

/// Canonicalizes a mech list as the exact `SEQUENCE OF MechType` octets both
/// peers must sign for the `mechListMIC` (spec.md §4.3, `pack(mech_list)`).
pub fn pack_mech_type_list(mechs: &[ObjectIdentifier]) -> Result<Vec<u8>, Error> {
    Ok(mechs.to_vec().to_der()?)
}

/// Packs the initiator's first message as `NegTokenInit`, wrapped in the
/// GSS-API pseudo-header (`application [0] { thisMech, innerContextToken }`).
pub fn pack_neg_token_init(body: &NegTokenInitBody) -> Result<Vec<u8>, Error> {
    let mech_token = body
        .mech_token
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;
    let mech_list_mic = body
        .mech_list_mic
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;

    let init = GssNegTokenInit {
        mech_types: Some(body.mech_types.clone()),
        req_flags: None,
        mech_token,
        mech_list_mic,
    };
    let inner = NegotiationToken::NegTokenInit(init).to_der()?;
    frame_initial_token(&inner)
}

/// Packs an acceptor-initiated first message as `NegTokenInit2` (used when
/// the acceptor speaks first, e.g. unsolicited negotiation), also framed with
/// the GSS-API pseudo-header.
pub fn pack_neg_token_init2(body: &NegTokenInitBody) -> Result<Vec<u8>, Error> {
    let mech_token = body
        .mech_token
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;
    let mech_list_mic = body
        .mech_list_mic
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;

    let init = GssNegTokenInit2 {
        mech_types: Some(body.mech_types.clone()),
        req_flags: None,
        neg_hints: None,
        mech_token,
        mech_list_mic,
    };
    let inner = NegotiationToken::NegTokenInit2(init).to_der()?;
    frame_initial_token(&inner)
}

/// Packs a `NegTokenResp`. These are never GSS-framed — only the very first
/// initiator token is.
pub fn pack_neg_token_resp(body: &NegTokenRespBody) -> Result<Vec<u8>, Error> {
    let response_token = body
        .response_token
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;
    let mech_list_mic = body
        .mech_list_mic
        .as_ref()
        .map(|t| OctetStringRef::new(t))
        .transpose()?;

    let resp = GssNegTokenResp {
        neg_state: body.neg_state.map(Into::into),
        supported_mech: body.supported_mech,
        response_token,
        mech_list_mic,
    };
    Ok(NegotiationToken::NegTokenResp(resp).to_der()?)
}

fn frame_initial_token(inner_der: &[u8]) -> Result<Vec<u8>, Error> {
    let token = InitialContextToken {
        this_mech: SPNEGO_OID,
        inner_context_token: AnyRef::from_der(inner_der)?,
    };
    Ok(token.to_der()?)
}

/// Decodes a SPNEGO message, accepting either the GSS-framed form (only valid
/// for the initiator's first token) or the bare `NegotiationToken` CHOICE.
pub fn unpack_neg_token(data: &[u8]) -> Result<NegToken, Error> {
    // The framed form starts with an `application [0]` constructed tag (0x60);
    // the bare CHOICE starts with a context-specific constructed tag (0xA0/0xA1).
    let inner = if data.first() == Some(&0x60) {
        let outer = InitialContextToken::from_der(data)
            .map_err(|e| Error::InvalidToken(e.to_string()))?;
        if outer.this_mech != SPNEGO_OID {
            return Err(Error::InvalidToken(format!(
                "unexpected outer mechanism OID {}",
                outer.this_mech
            )));
        }
        outer.inner_context_token.to_der()?
    } else {
        data.to_vec()
    };

    let token = NegotiationToken::from_der(&inner)
        .map_err(|e| Error::InvalidToken(e.to_string()))?;
    match token {
        NegotiationToken::NegTokenInit(init) => Ok(NegToken::Init(NegTokenInitBody {
            mech_types: init.mech_types.ok_or_else(|| {
                Error::InvalidToken("NegTokenInit missing mech_types".to_string())
            })?,
            mech_token: init.mech_token.map(|t| t.as_bytes().to_vec()),
            mech_list_mic: init.mech_list_mic.map(|t| t.as_bytes().to_vec()),
        })),
        NegotiationToken::NegTokenInit2(init) => Ok(NegToken::Init(NegTokenInitBody {
            mech_types: init.mech_types.ok_or_else(|| {
                Error::InvalidToken("NegTokenInit2 missing mech_types".to_string())
            })?,
            mech_token: init.mech_token.map(|t| t.as_bytes().to_vec()),
            mech_list_mic: init.mech_list_mic.map(|t| t.as_bytes().to_vec()),
        })),
        NegotiationToken::NegTokenResp(resp) => {
            let neg_state = resp.neg_state.map(NegState::try_from).transpose()?;
            Ok(NegToken::Resp(NegTokenRespBody {
                neg_state,
                supported_mech: resp.supported_mech,
                response_token: resp.response_token.map(|t| t.as_bytes().to_vec()),
                mech_list_mic: resp.mech_list_mic.map(|t| t.as_bytes().to_vec()),
            }))
        }
    }
}
