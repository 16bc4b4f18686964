//! The `Pki` facade: one entry point per external operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

use crate::backend::{CryptoBackend, RcgenBackend};
use crate::ca_store::{CaInfo, CaStatus, CaStore};
use crate::cert_store::{CertListing, CertStore};
use crate::config::PkiConfig;
use crate::error::{Error, Result};
use crate::export::ExportService;
use crate::protect::KeyProtector;
use crate::signing::{SignRequest, SigningEngine};
use crate::types::{ArtifactKind, ArtifactScope, CaId, Passphrase, SubjectDn};
use crate::upload::{UploadReport, UploadRequest, UploadValidator};

/// Common name of a CA created without one.
pub const DEFAULT_COMMON_NAME: &str = "rootly network";
/// Organization of a CA created without one.
pub const DEFAULT_ORGANIZATION: &str = "rootly";
/// Organizational unit of a CA created without one.
pub const DEFAULT_ORGANIZATIONAL_UNIT: &str = "IT";

/// Request to create a certificate authority.
#[derive(Debug, Clone)]
pub struct CreateCaRequest {
    id: CaId,
    subject: SubjectDn,
    passphrase: Passphrase,
    validity_days: Option<u32>,
    timeout: Option<Duration>,
}

impl CreateCaRequest {
    /// Creates a builder with the `default` id and the stock subject.
    #[must_use]
    pub fn builder() -> CreateCaRequestBuilder {
        CreateCaRequestBuilder {
            id: CaId::default_ca().into(),
            common_name: DEFAULT_COMMON_NAME.to_string(),
            organization: DEFAULT_ORGANIZATION.to_string(),
            organizational_unit: DEFAULT_ORGANIZATIONAL_UNIT.to_string(),
            passphrase: None,
            validity_days: None,
            timeout: None,
        }
    }

    /// Returns the id of the CA to create.
    #[must_use]
    pub const fn id(&self) -> &CaId {
        &self.id
    }

    /// Returns the root subject.
    #[must_use]
    pub const fn subject(&self) -> &SubjectDn {
        &self.subject
    }
}

/// Builder for [`CreateCaRequest`].
#[derive(Debug)]
pub struct CreateCaRequestBuilder {
    id: String,
    common_name: String,
    organization: String,
    organizational_unit: String,
    passphrase: Option<String>,
    validity_days: Option<u32>,
    timeout: Option<Duration>,
}

impl CreateCaRequestBuilder {
    /// Sets the CA id.
    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the common name.
    #[must_use]
    pub fn common_name(mut self, common_name: impl Into<String>) -> Self {
        self.common_name = common_name.into();
        self
    }

    /// Sets the organization.
    #[must_use]
    pub fn organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = organization.into();
        self
    }

    /// Sets the organizational unit.
    #[must_use]
    pub fn organizational_unit(mut self, unit: impl Into<String>) -> Self {
        self.organizational_unit = unit.into();
        self
    }

    /// Sets the passphrase protecting the CA key.
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

    /// Sets how long creation may wait for the CA lock.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed id, an empty common
    /// name, a missing passphrase, or a zero validity.
    pub fn build(self) -> Result<CreateCaRequest> {
        let id = CaId::new(self.id)?;
        if self.common_name.trim().is_empty() {
            return Err(Error::Validation("common name is required".into()));
        }
        let passphrase = Passphrase::new(self.passphrase.unwrap_or_default())?;
        if self.validity_days == Some(0) {
            return Err(Error::Validation("validity_days must be greater than 0".into()));
        }
        Ok(CreateCaRequest {
            id,
            subject: SubjectDn::new(self.common_name, self.organization, self.organizational_unit),
            passphrase,
            validity_days: self.validity_days,
            timeout: self.timeout,
        })
    }
}

/// Result of [`Pki::create_ca`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateCaResponse {
    /// Id of the new CA.
    pub id: CaId,
    /// Human-readable summary.
    pub message: String,
}

/// Result of [`Pki::sign_certificate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    /// Subject hostname.
    pub hostname: String,
    /// Issuing CA.
    pub ca_id: CaId,
    /// Allocated serial, uppercase hex.
    pub serial: String,
    /// Human-readable summary.
    pub message: String,
}

/// The certificate lifecycle engine.
///
/// Cheap to share across threads; every operation is synchronous and
/// serializes only against operations on the same CA or hostname.
#[derive(Debug)]
pub struct Pki {
    config: PkiConfig,
    cas: Arc<CaStore>,
    certs: Arc<CertStore>,
    signer: SigningEngine,
    uploads: UploadValidator,
    exports: ExportService,
}

impl Pki {
    /// Creates an engine using the native rcgen backend.
    #[must_use]
    pub fn new(config: PkiConfig) -> Self {
        Self::with_backend(config, Arc::new(RcgenBackend))
    }

    /// Creates an engine with a custom cryptographic backend.
    #[must_use]
    pub fn with_backend(config: PkiConfig, backend: Arc<dyn CryptoBackend>) -> Self {
        let protector = KeyProtector::new(config.kdf, Arc::clone(&backend));
        let cas = Arc::new(CaStore::new(config.ca_dir.clone(), Arc::clone(&backend), protector));
        let certs = Arc::new(CertStore::new(config.certs_dir.clone()));
        let signer = SigningEngine::new(Arc::clone(&cas), Arc::clone(&certs), Arc::clone(&backend))
            .with_default_validity_days(config.default_cert_validity_days)
            .with_default_timeout(config.lock_timeout);
        let uploads = UploadValidator::new(Arc::clone(&cas), Arc::clone(&certs), backend)
            .with_default_timeout(config.lock_timeout);
        let exports = ExportService::new(Arc::clone(&cas), Arc::clone(&certs))
            .with_default_timeout(config.lock_timeout);
        Self {
            config,
            cas,
            certs,
            signer,
            uploads,
            exports,
        }
    }

    /// Returns the active configuration.
    #[must_use]
    pub const fn config(&self) -> &PkiConfig {
        &self.config
    }

    /// Creates a certificate authority.
    ///
    /// # Errors
    ///
    /// - [`Error::Conflict`] if the id is taken
    /// - [`Error::Timeout`] if the CA lock is busy past the timeout
    /// - [`Error::Crypto`] or [`Error::Io`] if key generation or persistence fails
    pub fn create_ca(&self, request: &CreateCaRequest) -> Result<CreateCaResponse> {
        let days = request.validity_days.unwrap_or(self.config.default_ca_validity_days);
        let deadline = Instant::now() + request.timeout.unwrap_or(self.config.lock_timeout);
        self.cas
            .create_ca(&request.id, &request.subject, &request.passphrase, days, deadline)?;
        Ok(CreateCaResponse {
            id: request.id.clone(),
            message: format!(
                "Certificate authority '{}' created for {} ({days} days)",
                request.id, request.subject
            ),
        })
    }

    /// Signs a leaf certificate.
    ///
    /// # Errors
    ///
    /// See [`SigningEngine::sign`].
    pub fn sign_certificate(&self, request: &SignRequest) -> Result<SignResponse> {
        let signed = self.signer.sign(request)?;
        Ok(SignResponse {
            hostname: signed.hostname.to_string(),
            ca_id: signed.ca_id.clone(),
            serial: signed.serial.to_string(),
            message: format!(
                "Certificate for {} signed by '{}' with serial {}",
                signed.hostname, signed.ca_id, signed.serial
            ),
        })
    }

    /// Lists every committed CA, `default` first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the CA directory cannot be read.
    pub fn list_cas(&self) -> Result<Vec<CaInfo>> {
        self.cas.list_cas()
    }

    /// Reports the files of the `default` CA.
    #[must_use]
    pub fn ca_status(&self) -> CaStatus {
        self.cas.status(&CaId::default_ca())
    }

    /// Reports the files of any CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a malformed id.
    pub fn ca_status_for(&self, id: &str) -> Result<CaStatus> {
        Ok(self.cas.status(&CaId::new(id)?))
    }

    /// Lists stored leaf certificates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the certificates directory cannot be read.
    pub fn list_certificates(&self) -> Result<Vec<CertListing>> {
        self.certs.list_certificates()
    }

    /// Validates and stores a batch of uploaded files.
    ///
    /// # Errors
    ///
    /// See [`UploadValidator::upload`].
    pub fn upload(&self, request: &UploadRequest) -> Result<UploadReport> {
        self.uploads.upload(request)
    }

    /// Validates and stores one uploaded file.
    ///
    /// CA-scoped files go to the `default` CA. Use [`Pki::upload`] to target
    /// another CA or to supply a passphrase.
    ///
    /// # Errors
    ///
    /// See [`UploadValidator::upload`].
    pub fn upload_artifact(
        &self,
        scope: ArtifactScope,
        filename: &str,
        bytes: &[u8],
    ) -> Result<UploadReport> {
        let request = UploadRequest::new(scope).with_file(filename, bytes);
        let report = self.uploads.upload(&request)?;
        info!(scope = %scope, filename, accepted = report.is_clean(), "single artifact upload");
        Ok(report)
    }

    /// Returns the stored bytes of one artifact.
    ///
    /// # Errors
    ///
    /// See [`ExportService::export`].
    pub fn export_artifact(&self, scope: ArtifactScope, id: &str, kind: ArtifactKind) -> Result<Vec<u8>> {
        self.exports.export(scope, id, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::protect::KdfParams;

    fn pki(dir: &std::path::Path) -> Pki {
        Pki::new(
            PkiConfig::new(dir.join("ca"), dir.join("certs"))
                .with_kdf(KdfParams::insecure_fast())
                .with_lock_timeout(Duration::from_secs(5)),
        )
    }

    #[test]
    fn create_request_defaults() {
        let request = CreateCaRequest::builder().passphrase("pw").build().unwrap();
        assert!(request.id().is_default());
        assert_eq!(request.subject(), &SubjectDn::new("rootly network", "rootly", "IT"));
    }

    #[test]
    fn create_request_validation() {
        let missing_pw = CreateCaRequest::builder().build().unwrap_err();
        assert_eq!(missing_pw.kind(), ErrorKind::Validation);
        let blank_cn = CreateCaRequest::builder().common_name("  ").passphrase("pw").build();
        assert_eq!(blank_cn.unwrap_err().kind(), ErrorKind::Validation);
        let zero = CreateCaRequest::builder().passphrase("pw").validity_days(0).build();
        assert_eq!(zero.unwrap_err().kind(), ErrorKind::Validation);
        let bad_id = CreateCaRequest::builder().id("../x").passphrase("pw").build();
        assert_eq!(bad_id.unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn create_sign_list_status() {
        let dir = tempfile::tempdir().unwrap();
        let pki = pki(dir.path());
        assert!(!pki.ca_status().exists);

        let created = pki
            .create_ca(&CreateCaRequest::builder().passphrase("pw1").build().unwrap())
            .unwrap();
        assert!(created.id.is_default());
        assert!(pki.ca_status().exists);

        let request = SignRequest::builder("web.local").passphrase("pw1").build().unwrap();
        let signed = pki.sign_certificate(&request).unwrap();
        assert_eq!(signed.serial, "01");
        assert!(signed.message.contains("web.local"));

        let json = serde_json::to_value(&signed).unwrap();
        assert_eq!(json["caId"], "default");

        assert_eq!(pki.list_cas().unwrap().len(), 1);
        let certs = pki.list_certificates().unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0].hostname, "web.local");
        assert!(!pki.ca_status_for("other").unwrap().exists);
    }

    #[test]
    fn duplicate_create_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let pki = pki(dir.path());
        let request = CreateCaRequest::builder().id("prod").passphrase("pw1").build().unwrap();
        pki.create_ca(&request).unwrap();
        assert_eq!(pki.create_ca(&request).unwrap_err().kind(), ErrorKind::Conflict);
    }

    #[test]
    fn single_artifact_upload_and_export() {
        let dir = tempfile::tempdir().unwrap();
        let pki = pki(dir.path());
        pki.create_ca(&CreateCaRequest::builder().passphrase("pw1").build().unwrap())
            .unwrap();
        pki.sign_certificate(&SignRequest::builder("web").passphrase("pw1").build().unwrap())
            .unwrap();

        let cert = pki
            .export_artifact(ArtifactScope::Cert, "web", ArtifactKind::Certificate)
            .unwrap();
        let report = pki.upload_artifact(ArtifactScope::Cert, "copy.crt", &cert).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(
            pki.export_artifact(ArtifactScope::Cert, "copy", ArtifactKind::Certificate)
                .unwrap(),
            cert
        );

        let rejected = pki.upload_artifact(ArtifactScope::Ca, "notes.txt", b"hi").unwrap();
        assert_eq!(rejected.rejected.len(), 1);
    }
}
