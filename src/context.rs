//! Sub-context abstraction (component C): the fixed capability set every
//! backend (Kerberos, NTLM, and the SPNEGO state machine itself, which also
//! implements this trait so it can be used wherever a plain mechanism is
//! expected) must provide, per spec.md §4.1.

use crate::error::Error;
use crate::mech::GssMech;

/// Quality of protection. Real-world deployments use `0` almost exclusively;
/// the type exists so callers that do negotiate non-default QoP values have
/// somewhere to put them, per spec.md §4.1's `sign`/`verify`/`wrap`/`unwrap`.
pub type Qop = u32;

/// Output of [`SubContext::wrap`].
#[derive(Debug, Clone)]
pub struct Wrapped {
    pub ciphertext: Vec<u8>,
    pub encrypted: bool,
}

/// Output of [`SubContext::unwrap`].
#[derive(Debug, Clone)]
pub struct Unwrapped {
    pub plaintext: Vec<u8>,
    pub encrypted: bool,
    pub qop: Qop,
}

/// What a caller wants from a backend, before one is chosen. Mirrors the
/// handful of capability bits spec.md §4.4 lists (`session_key`,
/// `wrapping_iov`, `wrapping_winrm`) plus the mechanism-selection bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextReq {
    pub mutual_auth: bool,
    pub replay_detect: bool,
    pub sequence_detect: bool,
    pub confidentiality: bool,
    pub integrity: bool,
    pub delegate: bool,
}

impl ContextReq {
    /// What the teacher's NTLM/Kerberos session setup requests by default
    /// (mutual auth, integrity, and delegation) — see
    /// `session::authenticator::NtlmGssAuthSession::next`'s
    /// `ClientRequestFlags::DELEGATE | MUTUAL_AUTH | INTEGRITY | FRAGMENT_TO_FIT`.
    pub const fn default_flags() -> Self {
        Self {
            mutual_auth: true,
            replay_detect: false,
            sequence_detect: false,
            confidentiality: false,
            integrity: true,
            delegate: true,
        }
    }
}

/// Usage role a context is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Initiate,
    Accept,
}

/// The operation contract every sub-mechanism backend honors (spec.md §4.1).
/// Implemented by the concrete backends in [`crate::backends`] and by
/// [`crate::spnego::SpnegoContext`] itself, so the SPNEGO state machine can
/// be nested or used standalone through the same interface its children use.
pub trait SubContext: std::fmt::Debug {
    /// Capabilities this backend can actually provide right now, given what
    /// the caller is asking for. A pure predicate over environment/library
    /// presence, computed once at construction and cached — never a global.
    fn available_protocols(&self, req: ContextReq) -> Vec<&'static str>;

    /// Advances the handshake. `None` in means "first initiator call"; `None`
    /// out means "nothing more to send, and the context may or may not be
    /// complete yet" (check [`SubContext::complete`]).
    fn step(&mut self, in_token: Option<&[u8]>) -> Result<Option<Vec<u8>>, Error>;

    /// Whether the handshake is done. Irreversible once true.
    fn complete(&self) -> bool;

    /// Derived session key material. Only valid once [`SubContext::complete`].
    fn session_key(&self) -> Result<Vec<u8>, Error>;

    /// Canonical name of the mechanism this backend negotiated (`"kerberos"`, `"ntlm"`).
    fn negotiated_protocol(&self) -> Result<&'static str, Error>;

    /// Wraps (optionally encrypts) application data.
    fn wrap(&mut self, data: &[u8], encrypt: bool, qop: Qop) -> Result<Wrapped, Error>;

    /// Inverse of [`SubContext::wrap`].
    fn unwrap(&mut self, data: &[u8]) -> Result<Unwrapped, Error>;

    /// Computes a standalone MIC over `data`.
    fn sign(&mut self, data: &[u8], qop: Qop) -> Result<Vec<u8>, Error>;

    /// Verifies a standalone MIC over `data`, returning the QoP it was made with.
    fn verify(&mut self, data: &[u8], mic: &[u8]) -> Result<Qop, Error>;

    /// True iff this mechanism demands SPNEGO `mechListMIC` protection (spec.md §4.1).
    fn requires_mech_list_mic(&self) -> bool;

    /// Notifies the backend that it was not the optimistically-chosen first
    /// mechanism — the initiator offered a different preference, or the
    /// acceptor picked something other than the peer's head-of-list choice.
    /// Per spec.md §4.1, this is what flips [`SubContext::requires_mech_list_mic`]
    /// to true for Kerberos/NTLM. A no-op default because mechanisms that
    /// never need SPNEGO MIC protection (e.g. the mock used only by this
    /// crate's own tests) have nothing to record.
    fn mark_mech_changed(&mut self) {}

    /// Whether this backend can wrap/unwrap scatter/gather buffer lists
    /// in-place (spec.md §6 backend contract). Neither builtin backend does;
    /// [`crate::facade::SecurityContext::wrap_iov`]/`unwrap_iov` fall back to
    /// a single-buffer `wrap`/`unwrap` when this is false.
    fn iov_available(&self) -> bool {
        false
    }

    /// Resets the per-direction sign/seal sequence counter so that SPNEGO's
    /// own `mechListMIC` traffic does not bleed into application traffic
    /// sequence numbers (spec.md §4.3 phase 3, §5).
    fn reset_crypto_counters(&mut self, outgoing: bool);
}

/// A single entry in the SPNEGO candidate list (spec.md §3 "Sub-context record").
pub struct Candidate {
    pub mech: GssMech,
    pub backend: Box<dyn SubContext>,
    /// The output of the backend's eager first `step()` call, embedded into
    /// the initial `NegTokenInit.mech_token`. Consumed and cleared on the
    /// first `step()` the state machine performs for this backend.
    pub cached_first_token: Option<Vec<u8>>,
}

impl std::fmt::Debug for Candidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Candidate")
            .field("mech", &self.mech)
            .field("has_cached_first_token", &self.cached_first_token.is_some())
            .finish()
    }
}
