//! Mechanism catalog: known OIDs and classification helpers (component B).

use der::oid::ObjectIdentifier;

/// SPNEGO's own mechanism OID, used only for the GSS-API pseudo-header on the
/// initiator's very first token.
pub const SPNEGO_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.5.5.2");

/// RFC 4121 Kerberos v5.
pub const KRB5_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113554.1.2.2");

/// Microsoft's legacy Kerberos v5 OID, treated as equivalent to [`KRB5_OID`].
pub const KRB5_LEGACY_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.48018.1.2.2");

/// NTLM SSP.
pub const NTLM_OID: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.6.1.4.1.311.2.2.10");

/// Mechanism identity, independent of which concrete OID variant (modern or legacy) named it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GssMech {
    Kerberos,
    Ntlm,
}

impl GssMech {
    /// Classifies an OID, collapsing the Kerberos legacy/modern OIDs into one equivalence class.
    pub fn from_oid(oid: &ObjectIdentifier) -> Option<Self> {
        if *oid == KRB5_OID || *oid == KRB5_LEGACY_OID {
            Some(Self::Kerberos)
        } else if *oid == NTLM_OID {
            Some(Self::Ntlm)
        } else {
            None
        }
    }

    /// The canonical OID this crate emits when offering this mechanism.
    pub fn oid(&self) -> ObjectIdentifier {
        match self {
            Self::Kerberos => KRB5_OID,
            Self::Ntlm => NTLM_OID,
        }
    }

    /// The protocol name used by [`crate::facade`] and [`crate::selector`].
    pub fn name(&self) -> &'static str {
        match self {
            Self::Kerberos => "kerberos",
            Self::Ntlm => "ntlm",
        }
    }
}

/// Returns true if `oid` names any Kerberos v5 flavor (modern or MS legacy).
pub fn is_kerberos_oid(oid: &ObjectIdentifier) -> bool {
    *oid == KRB5_OID || *oid == KRB5_LEGACY_OID
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_kerberos_equivalence_class() {
        assert_eq!(GssMech::from_oid(&KRB5_OID), Some(GssMech::Kerberos));
        assert_eq!(GssMech::from_oid(&KRB5_LEGACY_OID), Some(GssMech::Kerberos));
        assert!(is_kerberos_oid(&KRB5_OID));
        assert!(is_kerberos_oid(&KRB5_LEGACY_OID));
    }

    #[test]
    fn classifies_ntlm() {
        assert_eq!(GssMech::from_oid(&NTLM_OID), Some(GssMech::Ntlm));
        assert!(!is_kerberos_oid(&NTLM_OID));
    }

    #[test]
    fn unknown_oid_is_none() {
        let unknown: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.3.4.5");
        assert_eq!(GssMech::from_oid(&unknown), None);
    }
}
