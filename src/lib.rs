//! SPNEGO (RFC 4178) negotiation core.
//!
//! Negotiates a security context between two peers over a list of candidate
//! GSS-API mechanisms (Kerberos v5, NTLM) without either side knowing in
//! advance which the other supports, then exposes a mechanism-neutral
//! `step`/`wrap`/`unwrap`/`sign`/`verify` surface over whichever one was
//! agreed on. See `SpnegoContext` for the negotiation state machine itself.

pub mod backends;
pub mod context;
pub mod error;
pub mod facade;
pub mod mech;
pub mod selector;
pub mod spnego;
pub mod wire;

pub use context::{ContextReq, Qop, SubContext, Unwrapped, Usage, Wrapped};
pub use error::Error;
pub use facade::{ContextArgs, IovBuffer, IovBufferType, SecurityContext};
pub use selector::{Options, Protocol};
pub use spnego::SpnegoContext;

pub type Result<T> = std::result::Result<T, crate::Error>;
