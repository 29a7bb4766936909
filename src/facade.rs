//! Public context facade (component F): the mechanism-neutral surface
//! applications drive. A thin shell over whatever backend
//! [`crate::selector`] picked — its only real behavior is argument
//! validation and SPN canonicalization (spec.md §4.5).

use sspi::AuthIdentity;
use url::Url;

use crate::context::{ContextReq, Qop, SubContext, Usage};
use crate::error::Error;
use crate::selector::{new_context, NewContextArgs, Options, Protocol};

/// One buffer in a scatter/gather list passed to [`SecurityContext::wrap_iov`]/
/// [`SecurityContext::unwrap_iov`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IovBufferType {
    Data,
    Header,
    Padding,
    Sign,
    Empty,
}

#[derive(Debug, Clone)]
pub struct IovBuffer {
    pub buffer_type: IovBufferType,
    pub data: Vec<u8>,
}

/// Arguments shared by [`SecurityContext::client`] and [`SecurityContext::server`].
pub struct ContextArgs {
    pub identity: AuthIdentity,
    pub hostname: String,
    pub service: String,
    pub kdc_url: Option<Url>,
    pub context_req: ContextReq,
    pub protocol: String,
    pub options: Options,
}

/// The mechanism-neutral handle applications hold. Wraps whichever backend
/// [`crate::selector`] resolved `protocol`/`options` to — a bare
/// [`crate::backends::ntlm::NtlmContext`]/`KerberosContext`, or the builtin
/// [`crate::spnego::SpnegoContext`] multiplexer for `protocol = "negotiate"`.
pub struct SecurityContext {
    backend: Box<dyn SubContext>,
    context_req: ContextReq,
}

impl std::fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityContext")
            .field("backend", &self.backend)
            .field("context_req", &self.context_req)
            .finish()
    }
}

impl SecurityContext {
    /// Builds an initiator-side context, canonicalizing the SPN as
    /// `lowercase(service) + "@" + hostname` (spec.md §4.5).
    pub fn client(args: ContextArgs) -> Result<Self, Error> {
        Self::new(args, Usage::Initiate)
    }

    /// Builds an acceptor-side context.
    pub fn server(args: ContextArgs) -> Result<Self, Error> {
        Self::new(args, Usage::Accept)
    }

    fn new(args: ContextArgs, usage: Usage) -> Result<Self, Error> {
        let protocol = Protocol::parse(&args.protocol)?;
        let target_name = canonicalize_spn(&args.service, &args.hostname);

        let backend = new_context(NewContextArgs {
            identity: args.identity,
            target_name,
            kdc_url: args.kdc_url,
            protocol,
            options: args.options,
            usage,
        })?;

        Ok(Self {
            backend,
            context_req: args.context_req,
        })
    }

    pub fn step(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error> {
        self.backend.step(in_token)
    }

    pub fn complete(&self) -> bool {
        self.backend.complete()
    }

    pub fn session_key(&self) -> Result<Vec<u8>, Error> {
        self.backend.session_key()
    }

    pub fn negotiated_protocol(&self) -> Result<&'static str, Error> {
        self.backend.negotiated_protocol()
    }

    /// The context requirements this handle was created with. This crate
    /// does not track per-flag negotiation outcomes distinct from the
    /// request, so this returns the requested flags unchanged (see
    /// DESIGN.md).
    pub fn context_attr(&self) -> ContextReq {
        self.context_req
    }

    pub fn wrap(&mut self, data: &[u8], encrypt: bool, qop: Qop) -> Result<(Vec<u8>, bool), Error> {
        let wrapped = self.backend.wrap(data, encrypt, qop)?;
        Ok((wrapped.ciphertext, wrapped.encrypted))
    }

    pub fn unwrap(&mut self, data: &[u8]) -> Result<(Vec<u8>, bool, Qop), Error> {
        let unwrapped = self.backend.unwrap(data)?;
        Ok((unwrapped.plaintext, unwrapped.encrypted, unwrapped.qop))
    }

    pub fn sign(&mut self, data: &[u8], qop: Qop) -> Result<Vec<u8>, Error> {
        self.backend.sign(data, qop)
    }

    pub fn verify(&mut self, data: &[u8], mic: &[u8]) -> Result<Qop, Error> {
        self.backend.verify(data, mic)
    }

    /// Scatter/gather wrap. No backend this crate ships supports true
    /// in-place IOV (`iov_available` is always false here), so this
    /// concatenates every `Data` buffer, wraps it as one message, and places
    /// the result back into the first `Data` buffer, clearing the rest.
    pub fn wrap_iov(&mut self, iov: &mut [IovBuffer], encrypt: bool, qop: Qop) -> Result<(), Error> {
        let plaintext: Vec<u8> = iov
            .iter()
            .filter(|b| b.buffer_type == IovBufferType::Data)
            .flat_map(|b| b.data.iter().copied())
            .collect();
        let wrapped = self.backend.wrap(&plaintext, encrypt, qop)?;

        let mut placed = false;
        for buf in iov.iter_mut() {
            if buf.buffer_type == IovBufferType::Data {
                if !placed {
                    buf.data = wrapped.ciphertext.clone();
                    placed = true;
                } else {
                    buf.data.clear();
                }
            }
        }
        Ok(())
    }

    /// Inverse of [`SecurityContext::wrap_iov`].
    pub fn unwrap_iov(&mut self, iov: &mut [IovBuffer]) -> Result<Qop, Error> {
        let ciphertext: Vec<u8> = iov
            .iter()
            .filter(|b| b.buffer_type == IovBufferType::Data)
            .flat_map(|b| b.data.iter().copied())
            .collect();
        let unwrapped = self.backend.unwrap(&ciphertext)?;

        let mut placed = false;
        for buf in iov.iter_mut() {
            if buf.buffer_type == IovBufferType::Data {
                if !placed {
                    buf.data = unwrapped.plaintext.clone();
                    placed = true;
                } else {
                    buf.data.clear();
                }
            }
        }
        Ok(unwrapped.qop)
    }
}

fn canonicalize_spn(service: &str, hostname: &str) -> String {
    format!("{}@{}", service.to_lowercase(), hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spn_is_lowercased_and_joined_with_at() {
        assert_eq!(canonicalize_spn("CIFS", "fileserver.example.com"), "cifs@fileserver.example.com");
        assert_eq!(canonicalize_spn("host", "DC01"), "host@DC01");
    }
}
