use thiserror::Error;

/// Error taxonomy surfaced by the negotiation core, per the spec's §7 error design.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed DER, an unknown mandatory field, or an unrecognized `neg_state`.
    #[error("Invalid SPNEGO token: {0}")]
    InvalidToken(String),

    /// The candidate list was empty after intersecting peer and local mechanisms.
    #[error("No common mechanism could be negotiated")]
    NoCommonMechanism,

    /// The peer sent `neg_state = reject`.
    #[error("Peer rejected the negotiation")]
    NegotiationRejected,

    /// A `mechListMIC` failed to verify, or a backend reported an integrity failure.
    #[error("Integrity check failed: {0}")]
    IntegrityFailure(String),

    /// A backend reported a credential or handshake failure.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A post-handshake operation (`wrap`/`unwrap`/`sign`/`verify`/`session_key`) was invoked
    /// before the context reached `complete`.
    #[error("Security context is not complete")]
    NotComplete,

    /// The selector could not map a requested `protocol` string to a backend.
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    /// Internal state invariant violated (programmer error, invalid call order).
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Caller-supplied configuration (`Options`, `ContextReq`) was invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("ASN.1 DER error: {0}")]
    Der(#[from] der::Error),

    #[error("sspi error: {0}")]
    Sspi(#[from] sspi::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
}
