//! Cryptographic backend: key generation, certificate construction and parsing.

use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::types::{Certificate, PrivateKey, Serial, SubjectDn, Validity};

/// Parameters of a leaf certificate.
#[derive(Debug, Clone)]
pub struct LeafParams {
    /// Subject common name and DNS SAN.
    pub hostname: String,
    /// Serial allocated by the issuing CA.
    pub serial: Serial,
    /// Validity window, already clamped to the issuer's.
    pub validity: Validity,
}

/// Native certificate and key operations.
pub trait CryptoBackend: Send + Sync {
    /// Generates a fresh key pair.
    fn generate_key_pair(&self) -> Result<PrivateKey>;

    /// Creates a self-signed root certificate.
    fn self_sign(&self, subject: &SubjectDn, validity: Validity, key: &PrivateKey)
    -> Result<Certificate>;

    /// Creates a leaf certificate for `leaf_key`, signed by the issuer.
    fn sign(
        &self,
        params: &LeafParams,
        leaf_key: &PrivateKey,
        issuer_cert: &Certificate,
        issuer_key: &PrivateKey,
    ) -> Result<Certificate>;

    /// Parses a certificate from PEM or DER bytes.
    fn parse_certificate(&self, bytes: &[u8]) -> Result<Certificate>;

    /// Parses and checks a PKCS#8 private key from PEM or DER bytes.
    fn parse_key(&self, bytes: &[u8]) -> Result<PrivateKey>;

    /// Returns the DER `SubjectPublicKeyInfo` of a private key.
    fn public_key_der(&self, key: &PrivateKey) -> Result<Vec<u8>>;
}

/// [`CryptoBackend`] built on rcgen and x509-parser.
///
/// New keys are ECDSA P-256. Existing PKCS#8 keys of any type rcgen can sign
/// with (ECDSA, Ed25519, RSA) are accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcgenBackend;

impl RcgenBackend {
    fn key_pair(key: &PrivateKey) -> Result<KeyPair> {
        KeyPair::try_from(key.der())
            .map_err(|e| Error::Crypto(format!("failed to parse private key: {e}")))
    }
}

impl CryptoBackend for RcgenBackend {
    fn generate_key_pair(&self) -> Result<PrivateKey> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Crypto(format!("failed to generate key pair: {e}")))?;
        Ok(PrivateKey::new(key_pair.serialize_der()))
    }

    fn self_sign(
        &self,
        subject: &SubjectDn,
        validity: Validity,
        key: &PrivateKey,
    ) -> Result<Certificate> {
        let key_pair = Self::key_pair(key)?;

        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, subject.common_name.as_str());
        if !subject.organization.is_empty() {
            params
                .distinguished_name
                .push(DnType::OrganizationName, subject.organization.as_str());
        }
        if !subject.organizational_unit.is_empty() {
            params.distinguished_name.push(
                DnType::OrganizationalUnitName,
                subject.organizational_unit.as_str(),
            );
        }
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        params.not_before = to_rcgen_time(validity.not_before)?;
        params.not_after = to_rcgen_time(validity.not_after)?;

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Crypto(format!("failed to generate root certificate: {e}")))?;

        debug!(subject = %subject, "root certificate generated");
        Certificate::from_der(cert.der())
    }

    fn sign(
        &self,
        params: &LeafParams,
        leaf_key: &PrivateKey,
        issuer_cert: &Certificate,
        issuer_key: &PrivateKey,
    ) -> Result<Certificate> {
        let issuer_key_pair = Self::key_pair(issuer_key)?;
        let leaf_key_pair = Self::key_pair(leaf_key)?;

        // rcgen signs against an rcgen::Certificate, so rebuild one from the
        // stored root. Only its name and key identifier end up in the leaf.
        let issuer_params = CertificateParams::from_ca_cert_pem(&issuer_cert.pem())
            .map_err(|e| Error::Crypto(format!("failed to load issuer certificate: {e}")))?;
        let issuer = issuer_params
            .self_signed(&issuer_key_pair)
            .map_err(|e| Error::Crypto(format!("failed to load issuer certificate: {e}")))?;

        let mut leaf = CertificateParams::default();
        leaf.distinguished_name
            .push(DnType::CommonName, params.hostname.as_str());
        leaf.is_ca = IsCa::NoCa;
        leaf.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        leaf.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let dns = Ia5String::try_from(params.hostname.clone())
            .map_err(|e| Error::Validation(format!("invalid DNS name '{}': {e}", params.hostname)))?;
        leaf.subject_alt_names = vec![SanType::DnsName(dns)];
        leaf.serial_number = Some(SerialNumber::from_slice(&params.serial.0.to_be_bytes()));
        leaf.use_authority_key_identifier_extension = true;
        leaf.not_before = to_rcgen_time(params.validity.not_before)?;
        leaf.not_after = to_rcgen_time(params.validity.not_after)?;

        let cert = leaf
            .signed_by(&leaf_key_pair, &issuer, &issuer_key_pair)
            .map_err(|e| Error::Crypto(format!("failed to sign certificate: {e}")))?;

        debug!(hostname = %params.hostname, serial = %params.serial, "leaf certificate signed");
        Certificate::from_der(cert.der())
    }

    fn parse_certificate(&self, bytes: &[u8]) -> Result<Certificate> {
        if looks_like_pem(bytes) {
            Certificate::from_pem(bytes)
        } else {
            Certificate::from_der(bytes)
        }
    }

    fn parse_key(&self, bytes: &[u8]) -> Result<PrivateKey> {
        let key = if looks_like_pem(bytes) {
            PrivateKey::from_pem(bytes)?
        } else {
            PrivateKey::new(bytes.to_vec())
        };
        Self::key_pair(&key)?;
        Ok(key)
    }

    fn public_key_der(&self, key: &PrivateKey) -> Result<Vec<u8>> {
        Ok(Self::key_pair(key)?.public_key_der())
    }
}

pub(crate) fn looks_like_pem(bytes: &[u8]) -> bool {
    bytes.windows(10).any(|w| w == b"-----BEGIN")
}

/// Random positive 128-bit serial for root certificates.
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    SerialNumber::from_slice(&bytes)
}

/// Converts a chrono `DateTime` to rcgen `OffsetDateTime`.
fn to_rcgen_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| Error::Crypto(format!("invalid timestamp: {e}")))
}
