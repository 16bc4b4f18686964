//! Leaf certificate issuance.
//!
//! A signing run moves through [`SigningStage`]s while holding the issuing
//! CA's lock for its whole duration, which is what keeps serials of
//! concurrent runs strictly increasing. The serial is logged as pending
//! before the certificate is built and resolved once the outcome is known;
//! a crash in between is resolved by the next run against the same CA.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::backend::{CryptoBackend, LeafParams};
use crate::ca_store::{CaStore, CertificateAuthority, SerialState};
use crate::cert_store::{CertStore, LeafBundle};
use crate::config::{DEFAULT_CERT_VALIDITY_DAYS, DEFAULT_LOCK_TIMEOUT};
use crate::error::{Error, Result};
use crate::lock::{LockGuard, ensure_before};
use crate::types::{CaId, Certificate, Hostname, Passphrase, PrivateKey, Serial, Validity};
use crate::validation::validate_certificate;

/// Hours `notBefore` is backdated to absorb clock skew.
const BACKDATE_HOURS: i64 = 1;

/// Progress of one signing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningStage {
    /// Request received.
    Requested,
    /// Inputs checked and the CA found.
    Validated,
    /// CA key decrypted.
    KeyUnlocked,
    /// Serial logged and counter advanced.
    SerialAllocated,
    /// Leaf certificate signed.
    CertBuilt,
    /// Key, fullchain and certificate committed.
    Persisted,
}

impl fmt::Display for SigningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Requested => "requested",
            Self::Validated => "validated",
            Self::KeyUnlocked => "key_unlocked",
            Self::SerialAllocated => "serial_allocated",
            Self::CertBuilt => "cert_built",
            Self::Persisted => "persisted",
        })
    }
}

/// Request to sign a leaf certificate.
#[derive(Debug, Clone)]
pub struct SignRequest {
    hostname: Hostname,
    ca_id: CaId,
    passphrase: Passphrase,
    validity_days: Option<u32>,
    timeout: Option<Duration>,
}

impl SignRequest {
    /// Creates a request builder for `hostname`.
    #[must_use]
    pub fn builder(hostname: impl Into<String>) -> SignRequestBuilder {
        SignRequestBuilder {
            hostname: hostname.into(),
            ca_id: CaId::default_ca().into(),
            passphrase: None,
            validity_days: None,
            timeout: None,
        }
    }

    /// Returns the subject hostname.
    #[must_use]
    pub const fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    /// Returns the issuing CA.
    #[must_use]
    pub const fn ca_id(&self) -> &CaId {
        &self.ca_id
    }

    /// Returns the requested validity, if any.
    #[must_use]
    pub const fn validity_days(&self) -> Option<u32> {
        self.validity_days
    }
}

/// Builder for [`SignRequest`].
#[derive(Debug)]
pub struct SignRequestBuilder {
    hostname: String,
    ca_id: String,
    passphrase: Option<String>,
    validity_days: Option<u32>,
    timeout: Option<Duration>,
}

impl SignRequestBuilder {
    /// Sets the issuing CA. Defaults to `default`.
    #[must_use]
    pub fn ca(mut self, ca_id: impl Into<String>) -> Self {
        self.ca_id = ca_id.into();
        self
    }

    /// Sets the passphrase of the CA key.
    #[must_use]
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Sets the validity period in days.
    #[must_use]
    pub const fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = Some(days);
        self
    }

    /// Sets how long the request may wait before it starts writing.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed hostname or CA id, a
    /// missing passphrase, or a zero validity.
    pub fn build(self) -> Result<SignRequest> {
        let hostname = Hostname::new(self.hostname)?;
        let ca_id = CaId::new(self.ca_id)?;
        let passphrase = Passphrase::new(self.passphrase.unwrap_or_default())?;
        if self.validity_days == Some(0) {
            return Err(Error::Validation("validity_days must be greater than 0".into()));
        }
        Ok(SignRequest {
            hostname,
            ca_id,
            passphrase,
            validity_days: self.validity_days,
            timeout: self.timeout,
        })
    }
}

/// Outcome of a successful signing run.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    /// Subject hostname.
    pub hostname: Hostname,
    /// Issuing CA.
    pub ca_id: CaId,
    /// Allocated serial.
    pub serial: Serial,
    /// Issued certificate.
    pub certificate: Certificate,
}

/// Issues leaf certificates against stored CAs.
pub struct SigningEngine {
    cas: Arc<CaStore>,
    certs: Arc<CertStore>,
    backend: Arc<dyn CryptoBackend>,
    default_validity_days: u32,
    default_timeout: Duration,
}

impl fmt::Debug for SigningEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningEngine")
            .field("default_validity_days", &self.default_validity_days)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl SigningEngine {
    /// Creates an engine using [`DEFAULT_CERT_VALIDITY_DAYS`] and
    /// [`DEFAULT_LOCK_TIMEOUT`].
    #[must_use]
    pub fn new(cas: Arc<CaStore>, certs: Arc<CertStore>, backend: Arc<dyn CryptoBackend>) -> Self {
        Self {
            cas,
            certs,
            backend,
            default_validity_days: DEFAULT_CERT_VALIDITY_DAYS,
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets the validity used when a request carries none.
    #[must_use]
    pub const fn with_default_validity_days(mut self, days: u32) -> Self {
        self.default_validity_days = days;
        self
    }

    /// Sets the timeout used when a request carries none.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Signs a leaf certificate and persists its key, certificate and fullchain.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the CA does not exist
    /// - [`Error::Auth`] if the passphrase does not unlock the CA key
    /// - [`Error::Validation`] if the CA has expired
    /// - [`Error::Timeout`] if the deadline passes before the serial is allocated
    /// - [`Error::Crypto`] or [`Error::Io`] if signing or persistence fails;
    ///   the allocated serial is then burned, never reused
    pub fn sign(&self, request: &SignRequest) -> Result<SignedCertificate> {
        let deadline = Instant::now() + request.timeout.unwrap_or(self.default_timeout);
        let hostname = request.hostname();
        let ca_id = request.ca_id();
        let days = request.validity_days().unwrap_or(self.default_validity_days);
        trace_stage(hostname, ca_id, SigningStage::Requested);

        if days == 0 {
            return Err(Error::Validation("validity_days must be greater than 0".into()));
        }
        if !self.cas.exists(ca_id) {
            return Err(Error::NotFound(format!("certificate authority '{ca_id}'")));
        }
        trace_stage(hostname, ca_id, SigningStage::Validated);

        let ca_guard = self.cas.acquire(ca_id, deadline)?;
        let ca = self.cas.get_ca(ca_id)?;
        let ca_key = self.cas.unlock_key(&ca, &request.passphrase)?;
        trace_stage(hostname, ca_id, SigningStage::KeyUnlocked);

        let validity = clamp_validity(Utc::now(), days, ca.validity())?;
        let host_guard = self.certs.acquire(hostname, deadline)?;
        ensure_before(deadline, "certificate signing")?;

        self.cas.reconcile_pending(&ca_guard, |entry| {
            self.certs.holds_serial(&entry.hostname, entry.serial)
        })?;
        let serial = self.cas.allocate_serial(&ca_guard, hostname)?;
        trace_stage(hostname, ca_id, SigningStage::SerialAllocated);

        let issued = self.issue(&ca, &ca_key, hostname, serial, validity, &host_guard);
        drop(ca_key);

        let state = if issued.is_ok() {
            SerialState::Committed
        } else {
            SerialState::Abandoned
        };
        if let Err(e) = self.cas.finish_serial(&ca_guard, serial, state) {
            // the next run against this CA resolves the entry from disk
            warn!(ca_id = %ca_id, serial = %serial, error = %e, "could not record serial outcome");
        }

        let certificate = issued.inspect_err(|e| {
            warn!(ca_id = %ca_id, hostname = %hostname, serial = %serial, error = %e, "signing failed, serial abandoned");
        })?;
        info!(
            ca_id = %ca_id,
            hostname = %hostname,
            serial = %serial,
            not_after = %certificate.not_after(),
            "certificate signed"
        );
        Ok(SignedCertificate {
            hostname: hostname.clone(),
            ca_id: ca_id.clone(),
            serial,
            certificate,
        })
    }

    fn issue(
        &self,
        ca: &CertificateAuthority,
        ca_key: &PrivateKey,
        hostname: &Hostname,
        serial: Serial,
        validity: Validity,
        host_guard: &LockGuard<Hostname>,
    ) -> Result<Certificate> {
        let key = self.backend.generate_key_pair()?;
        let params = LeafParams {
            hostname: hostname.to_string(),
            serial,
            validity,
        };
        let certificate = self.backend.sign(&params, &key, ca.certificate(), ca_key)?;
        validate_certificate(&certificate, ca.certificate())?;
        trace_stage(hostname, ca.id(), SigningStage::CertBuilt);

        let bundle = LeafBundle {
            hostname: hostname.clone(),
            certificate,
            key,
            issuer: ca.certificate().clone(),
        };
        self.certs.persist(host_guard, &bundle)?;
        trace_stage(hostname, ca.id(), SigningStage::Persisted);
        Ok(bundle.certificate.clone())
    }
}

fn trace_stage(hostname: &Hostname, ca_id: &CaId, stage: SigningStage) {
    debug!(hostname = %hostname, ca_id = %ca_id, stage = %stage, "signing");
}

/// Computes a leaf validity window that stays inside the issuer's.
///
/// # Errors
///
/// Returns [`Error::Validation`] if the issuer has already expired.
pub fn clamp_validity(now: DateTime<Utc>, days: u32, issuer: Validity) -> Result<Validity> {
    if now >= issuer.not_after {
        return Err(Error::Validation(format!(
            "issuing CA expired at {}",
            issuer.not_after
        )));
    }
    let requested_end = now
        .checked_add_signed(chrono::Duration::days(i64::from(days)))
        .unwrap_or(issuer.not_after);
    Ok(Validity {
        not_before: (now - chrono::Duration::hours(BACKDATE_HOURS)).max(issuer.not_before),
        not_after: requested_end.min(issuer.not_after),
    })
}
