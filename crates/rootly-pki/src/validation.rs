//! Certificate validation utilities.

use chrono::Utc;
use tracing::debug;
use x509_parser::prelude::*;

use crate::backend::CryptoBackend;
use crate::error::{Error, Result};
use crate::types::{Certificate, PrivateKey};

/// Validates a certificate against its issuing CA certificate.
///
/// This performs the following checks:
/// - The certificate is inside its validity window
/// - The issuer matches the CA's subject
/// - The certificate was signed by the CA
///
/// # Errors
///
/// Returns [`Error::Crypto`] if validation fails.
pub fn validate_certificate(cert: &Certificate, ca_cert: &Certificate) -> Result<()> {
    debug!(subject = %cert.subject(), "validating certificate");

    if is_expired(cert) {
        return Err(Error::Crypto(format!(
            "certificate '{}' has expired",
            cert.subject()
        )));
    }
    if is_not_yet_valid(cert) {
        return Err(Error::Crypto(format!(
            "certificate '{}' is not yet valid",
            cert.subject()
        )));
    }
    verify_issued_by(cert, ca_cert)
}

/// Checks that `cert` names `issuer` as its issuer and carries its signature.
///
/// Unlike [`validate_certificate`] the validity window is not checked, so
/// material that is already expired can still be matched to its CA.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if the names differ or the signature does not verify.
pub fn verify_issued_by(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    if cert.issuer() != issuer.subject() {
        return Err(Error::Crypto(format!(
            "issuer '{}' does not match CA subject '{}'",
            cert.issuer(),
            issuer.subject()
        )));
    }
    verify_signature(cert, issuer)
}

/// Validates a certificate chain ordered from end-entity to root.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if any link fails or the last certificate is
/// not a valid self-signed root.
pub fn validate_chain(chain: &[Certificate]) -> Result<()> {
    let Some(root) = chain.last() else {
        return Err(Error::Crypto("empty certificate chain".into()));
    };

    for pair in chain.windows(2) {
        validate_certificate(&pair[0], &pair[1])?;
    }

    validate_self_signed(root)
}

/// Checks that a private key is the counterpart of a certificate's public key.
///
/// # Errors
///
/// Returns [`Error::Crypto`] if the key or certificate cannot be decoded.
pub fn key_matches_certificate(
    backend: &dyn CryptoBackend,
    key: &PrivateKey,
    cert: &Certificate,
) -> Result<bool> {
    let key_spki = backend.public_key_der(key)?;
    let (_, parsed) = X509Certificate::from_der(cert.der())
        .map_err(|e| Error::Crypto(format!("failed to parse certificate: {e}")))?;
    Ok(parsed.public_key().raw == key_spki.as_slice())
}

/// Checks if a certificate is expired.
#[must_use]
pub fn is_expired(cert: &Certificate) -> bool {
    cert.not_after() < Utc::now()
}

/// Checks if a certificate is not yet valid.
#[must_use]
pub fn is_not_yet_valid(cert: &Certificate) -> bool {
    cert.not_before() > Utc::now()
}

/// Validates a self-signed certificate.
fn validate_self_signed(cert: &Certificate) -> Result<()> {
    if cert.issuer() != cert.subject() {
        return Err(Error::Crypto(format!(
            "certificate '{}' is not self-signed",
            cert.subject()
        )));
    }
    verify_signature(cert, cert)
}

/// Verifies that a certificate was signed by the given issuer.
fn verify_signature(cert: &Certificate, issuer: &Certificate) -> Result<()> {
    let (_, parsed_cert) = X509Certificate::from_der(cert.der())
        .map_err(|e| Error::Crypto(format!("failed to parse certificate: {e}")))?;
    let (_, parsed_issuer) = X509Certificate::from_der(issuer.der())
        .map_err(|e| Error::Crypto(format!("failed to parse issuer certificate: {e}")))?;

    parsed_cert
        .verify_signature(Some(parsed_issuer.public_key()))
        .map_err(|e| {
            Error::Crypto(format!(
                "signature verification failed for '{}': {e:?}",
                cert.subject()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LeafParams, RcgenBackend};
    use crate::types::{Serial, SubjectDn, Validity};
    use chrono::{DateTime, Duration};

    fn window(from: DateTime<Utc>, to: DateTime<Utc>) -> Validity {
        Validity {
            not_before: from,
            not_after: to,
        }
    }

    fn root(name: &str) -> (Certificate, PrivateKey) {
        let backend = RcgenBackend;
        let now = Utc::now();
        let key = backend.generate_key_pair().unwrap();
        let cert = backend
            .self_sign(
                &SubjectDn::new(name, "Acme", "IT"),
                window(now - Duration::hours(1), now + Duration::days(365)),
                &key,
            )
            .unwrap();
        (cert, key)
    }

    fn leaf(ca: &(Certificate, PrivateKey), validity: Validity) -> (Certificate, PrivateKey) {
        let backend = RcgenBackend;
        let key = backend.generate_key_pair().unwrap();
        let params = LeafParams {
            hostname: "end-entity".into(),
            serial: Serial(1),
            validity,
        };
        let cert = backend.sign(&params, &key, &ca.0, &ca.1).unwrap();
        (cert, key)
    }

    #[test]
    fn expiry_checks() {
        let ca = root("Root");
        let now = Utc::now();
        let (expired, _) = leaf(
            &ca,
            window(now - Duration::days(60), now - Duration::days(30)),
        );
        let (future, _) = leaf(
            &ca,
            window(now + Duration::days(30), now + Duration::days(60)),
        );

        assert!(is_expired(&expired));
        assert!(!is_not_yet_valid(&expired));
        assert!(is_not_yet_valid(&future));
        assert!(validate_certificate(&expired, &ca.0).is_err());
        assert!(validate_certificate(&future, &ca.0).is_err());
    }

    #[test]
    fn validate_certificate_wrong_issuer() {
        let ca1 = root("CA One");
        let ca2 = root("CA Two");
        let now = Utc::now();
        let (cert, _) = leaf(&ca1, window(now - Duration::hours(1), now + Duration::days(30)));

        assert!(validate_certificate(&cert, &ca1.0).is_ok());
        assert!(matches!(
            validate_certificate(&cert, &ca2.0),
            Err(Error::Crypto(_))
        ));
    }

    #[test]
    fn same_subject_different_key_fails_signature() {
        let ca1 = root("Twin");
        let ca2 = root("Twin");
        let now = Utc::now();
        let (cert, _) = leaf(&ca1, window(now - Duration::hours(1), now + Duration::days(30)));

        let err = validate_certificate(&cert, &ca2.0).unwrap_err();
        assert!(err.to_string().contains("signature verification failed"));
    }

    #[test]
    fn issued_by_ignores_expiry() {
        let ca = root("Root");
        let other = root("Other");
        let now = Utc::now();
        let (expired, _) = leaf(
            &ca,
            window(now - Duration::days(60), now - Duration::days(30)),
        );

        assert!(verify_issued_by(&expired, &ca.0).is_ok());
        assert!(verify_issued_by(&expired, &other.0).is_err());
    }

    #[test]
    fn validate_chain_cases() {
        let ca = root("Root CA");
        let now = Utc::now();
        let (end_entity, _) = leaf(&ca, window(now - Duration::hours(1), now + Duration::days(30)));

        assert!(validate_chain(&[ca.0.clone()]).is_ok());
        assert!(validate_chain(&[end_entity.clone(), ca.0.clone()]).is_ok());
        assert!(validate_chain(&[]).is_err());
        // A leaf alone is not a self-signed root.
        assert!(validate_chain(&[end_entity]).is_err());
    }

    #[test]
    fn key_matching() {
        let backend = RcgenBackend;
        let ca = root("Root");
        let other = backend.generate_key_pair().unwrap();

        assert!(key_matches_certificate(&backend, &ca.1, &ca.0).unwrap());
        assert!(!key_matches_certificate(&backend, &other, &ca.0).unwrap());
    }
}
