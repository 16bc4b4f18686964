//! Structured metadata read straight from X.509 structures.
//!
//! Listing and status views are built from these functions instead of
//! scraping the human-readable output of an external tool.

use chrono::{DateTime, Utc};
use serde::Serialize;
use x509_parser::prelude::*;

use crate::error::{Error, Result};
use crate::types::{Certificate, SubjectDn, Validity};

/// Listing metadata for a CA certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaMetadata {
    /// Subject of the root certificate.
    #[serde(rename = "subjectDN")]
    pub subject_dn: SubjectDn,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Serial number, uppercase hex.
    pub serial: String,
}

/// Listing metadata for a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertMetadata {
    /// Subject common name, or the first DNS subject alternative name when
    /// the subject has none.
    pub hostname: String,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Issuer distinguished name.
    #[serde(rename = "issuerSubjectDN")]
    pub issuer_subject_dn: SubjectDn,
}

/// Extracts CA listing data from PEM or DER certificate bytes.
///
/// # Errors
///
/// Returns [`Error::Crypto`] on malformed input.
pub fn extract_ca_info(cert_bytes: &[u8]) -> Result<CaMetadata> {
    let cert = decode(cert_bytes)?;
    Ok(CaMetadata {
        subject_dn: cert.subject().clone(),
        not_after: cert.not_after(),
        serial: cert.serial().to_string(),
    })
}

/// Extracts leaf listing data from PEM or DER certificate bytes.
///
/// For a fullchain file the first certificate is used.
///
/// # Errors
///
/// Returns [`Error::Crypto`] on malformed input.
pub fn extract_cert_info(cert_bytes: &[u8]) -> Result<CertMetadata> {
    let cert = decode(cert_bytes)?;
    let hostname = if cert.subject().common_name.is_empty() {
        first_dns_name(cert.der()).unwrap_or_default()
    } else {
        cert.subject().common_name.clone()
    };
    Ok(CertMetadata {
        hostname,
        not_after: cert.not_after(),
        issuer_subject_dn: cert.issuer().clone(),
    })
}

fn decode(bytes: &[u8]) -> Result<Certificate> {
    if crate::backend::looks_like_pem(bytes) {
        Certificate::from_pem(bytes)
    } else {
        Certificate::from_der(bytes)
    }
}

/// Parses DER bytes into a [`Certificate`].
pub(crate) fn parse_certificate_der(der: &[u8]) -> Result<Certificate> {
    let (rest, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Crypto(format!("failed to parse certificate: {e}")))?;
    if !rest.is_empty() {
        return Err(Error::Crypto("trailing bytes after certificate".into()));
    }

    let not_before = DateTime::from_timestamp(cert.validity().not_before.timestamp(), 0)
        .ok_or_else(|| Error::Crypto("invalid not_before timestamp".into()))?;
    let not_after = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| Error::Crypto("invalid not_after timestamp".into()))?;

    let subject = subject_dn(cert.subject())?;
    let issuer = subject_dn(cert.issuer())?;
    let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

    Ok(Certificate::new(
        der.to_vec(),
        Validity {
            not_before,
            not_after,
        },
        subject,
        issuer,
        hex_serial(cert.raw_serial()),
        is_ca,
    ))
}

/// Reads CN, O and OU out of an X.509 name. Absent attributes are empty.
fn subject_dn(name: &X509Name) -> Result<SubjectDn> {
    Ok(SubjectDn {
        common_name: first_attr(name.iter_common_name())?,
        organization: first_attr(name.iter_organization())?,
        organizational_unit: first_attr(name.iter_organizational_unit())?,
    })
}

fn first_dns_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let san = cert.subject_alternative_name().ok()??;
    san.value.general_names.iter().find_map(|name| match name {
        GeneralName::DNSName(dns) => Some((*dns).to_string()),
        _ => None,
    })
}

fn first_attr<'a, 'b>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Result<String>
where
    'b: 'a,
{
    attrs.next().map_or(Ok(String::new()), |attr| {
        attr.as_str()
            .map(String::from)
            .map_err(|e| Error::Crypto(format!("failed to decode name attribute: {e}")))
    })
}

/// Formats raw serial bytes as uppercase hex without leading zero bytes.
fn hex_serial(raw: &[u8]) -> String {
    let trimmed: &[u8] = match raw.iter().position(|b| *b != 0) {
        Some(start) => &raw[start..],
        None => &[0],
    };
    trimmed.iter().map(|b| format!("{b:02X}")).collect()
}
