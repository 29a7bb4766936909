//! Context factory / selector (component E): resolves a protocol name plus
//! option flags into a concrete backend. A direct port of `pyspnego`'s
//! `auth._new_context` (see `examples/original_source/spnego/auth.py`),
//! adapted to the two backends this crate actually ships (there is no
//! separate "platform SSPI"/"platform GSSAPI" provider here — the `sspi`
//! crate's `Kerberos` type *is* this crate's platform provider; see
//! DESIGN.md for why `use_native_sspi`/`use_gssapi` collapse onto it).

use sspi::AuthIdentity;
use url::Url;

use crate::backends::kerberos::KerberosContext;
use crate::backends::ntlm::NtlmContext;
use crate::context::{SubContext, Usage};
use crate::error::Error;
use crate::spnego::SpnegoContext;

/// `protocol` argument accepted by [`new_context`] (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Kerberos,
    Negotiate,
    Ntlm,
}

impl Protocol {
    pub fn parse(value: &str) -> Result<Self, Error> {
        match value.to_ascii_lowercase().as_str() {
            "kerberos" => Ok(Self::Kerberos),
            "negotiate" => Ok(Self::Negotiate),
            "ntlm" => Ok(Self::Ntlm),
            other => Err(Error::UnknownProtocol(other.to_string())),
        }
    }
}

/// Capability/override bitset (spec.md §4.4). The four `use_*` bits force a
/// specific backend regardless of `protocol`; the remaining three describe
/// capabilities the caller wants and are currently informational only (every
/// backend this crate ships supports `session_key`; none support IOV or
/// WinRM-style wrapping yet — see DESIGN.md Open Questions).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    pub use_native_sspi: bool,
    pub use_gssapi: bool,
    pub use_spnego_builtin: bool,
    pub use_ntlm_builtin: bool,
    pub session_key: bool,
    pub wrapping_iov: bool,
    pub wrapping_winrm: bool,
}

impl Options {
    fn has_explicit_override(&self) -> bool {
        self.use_native_sspi || self.use_gssapi || self.use_spnego_builtin || self.use_ntlm_builtin
    }
}

/// Everything [`new_context`] needs to build any of the three backends.
pub struct NewContextArgs {
    pub identity: AuthIdentity,
    pub target_name: String,
    pub kdc_url: Option<Url>,
    pub protocol: Protocol,
    pub options: Options,
    pub usage: Usage,
}

/// Resolves `args` into a boxed backend, following spec.md §4.4's selection
/// order (simplified to this crate's two real backends plus the builtin
/// SPNEGO multiplexer — see module docs).
pub fn new_context(args: NewContextArgs) -> Result<Box<dyn SubContext>, Error> {
    let NewContextArgs {
        identity,
        target_name,
        kdc_url,
        protocol,
        options,
        usage,
    } = args;

    if options.has_explicit_override() {
        if options.use_native_sspi || options.use_gssapi {
            log::debug!("selector: explicit platform-provider override -> kerberos");
            return Ok(Box::new(KerberosContext::new(identity, target_name, kdc_url, usage)?));
        }
        if options.use_ntlm_builtin {
            log::debug!("selector: explicit builtin-NTLM override");
            return Ok(Box::new(NtlmContext::new(identity, usage)?));
        }
        if options.use_spnego_builtin {
            log::debug!("selector: explicit builtin-SPNEGO override");
            return Ok(Box::new(SpnegoContext::new(identity, target_name, kdc_url, usage)));
        }
    }

    log::debug!("selector: resolving protocol {:?} with no override", protocol);
    match protocol {
        Protocol::Kerberos => Ok(Box::new(KerberosContext::new(identity, target_name, kdc_url, usage)?)),
        Protocol::Negotiate => Ok(Box::new(SpnegoContext::new(identity, target_name, kdc_url, usage))),
        Protocol::Ntlm => Ok(Box::new(NtlmContext::new(identity, usage)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_protocol_name_is_rejected() {
        let err = Protocol::parse("ntlmv3").unwrap_err();
        assert!(matches!(err, Error::UnknownProtocol(_)));
    }

    #[test]
    fn protocol_names_are_case_insensitive() {
        assert_eq!(Protocol::parse("Negotiate").unwrap(), Protocol::Negotiate);
        assert_eq!(Protocol::parse("KERBEROS").unwrap(), Protocol::Kerberos);
        assert_eq!(Protocol::parse("ntlm").unwrap(), Protocol::Ntlm);
    }
}
