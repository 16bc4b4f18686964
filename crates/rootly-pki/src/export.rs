//! Read-only access to stored artifacts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::ca_store::{CaFile, CaStore};
use crate::cert_store::{CertStore, LeafFile};
use crate::config::DEFAULT_LOCK_TIMEOUT;
use crate::error::Result;
use crate::types::{ArtifactKind, ArtifactScope, CaId, Hostname};

/// Returns stored files byte-for-byte.
///
/// CA keys are only ever handed out in their protected form. A CA has no
/// separate chain, so its fullchain is its certificate.
#[derive(Debug)]
pub struct ExportService {
    cas: Arc<CaStore>,
    certs: Arc<CertStore>,
    default_timeout: Duration,
}

impl ExportService {
    /// Creates an export service over the given stores.
    #[must_use]
    pub fn new(cas: Arc<CaStore>, certs: Arc<CertStore>) -> Self {
        Self {
            cas,
            certs,
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets how long a CA export may wait for the CA lock.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// How long a CA export may wait for the CA lock.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Returns the raw bytes of one artifact.
    ///
    /// `id` is a CA id for [`ArtifactScope::Ca`] and a hostname for
    /// [`ArtifactScope::Cert`].
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`](crate::Error::Validation) if `id` is malformed
    /// - [`Error::NotFound`](crate::Error::NotFound) if the file does not exist
    /// - [`Error::Timeout`](crate::Error::Timeout) if the CA lock is busy
    pub fn export(&self, scope: ArtifactScope, id: &str, kind: ArtifactKind) -> Result<Vec<u8>> {
        let bytes = match scope {
            ArtifactScope::Ca => {
                let id = CaId::new(id)?;
                let file = match kind {
                    ArtifactKind::Key => CaFile::Key,
                    ArtifactKind::Certificate | ArtifactKind::Fullchain => CaFile::Certificate,
                };
                // never observe a CA file mid-replacement by an upload
                let _guard = self.cas.acquire(&id, Instant::now() + self.default_timeout)?;
                self.cas.read_file(&id, file)?
            }
            ArtifactScope::Cert => {
                let hostname = Hostname::new(id)?;
                let file = match kind {
                    ArtifactKind::Certificate => LeafFile::Certificate,
                    ArtifactKind::Key => LeafFile::Key,
                    ArtifactKind::Fullchain => LeafFile::Fullchain,
                };
                self.certs.read_file(&hostname, file)?
            }
        };
        debug!(scope = %scope, id, kind = ?kind, len = bytes.len(), "artifact exported");
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use crate::backend::{CryptoBackend, RcgenBackend};
    use crate::protect::{KdfParams, KeyProtector, ProtectedKey};
    use crate::types::{Passphrase, SubjectDn};

    fn service(dir: &std::path::Path) -> (Arc<CaStore>, ExportService) {
        let backend: Arc<dyn CryptoBackend> = Arc::new(RcgenBackend);
        let protector = KeyProtector::new(KdfParams::insecure_fast(), Arc::clone(&backend));
        let cas = Arc::new(CaStore::new(dir.join("ca"), backend, protector));
        let certs = Arc::new(CertStore::new(dir.join("certs")));
        let export = ExportService::new(Arc::clone(&cas), certs)
            .with_default_timeout(Duration::from_millis(200));
        (cas, export)
    }

    #[test]
    fn ca_artifacts_are_exported_as_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (cas, export) = service(dir.path());
        let id = CaId::new("prod").unwrap();
        cas.create_ca(
            &id,
            &SubjectDn::new("Prod Root", "Acme", "IT"),
            &Passphrase::new("pw1").unwrap(),
            30,
            Instant::now() + Duration::from_secs(5),
        )
        .unwrap();

        let cert = export.export(ArtifactScope::Ca, "prod", ArtifactKind::Certificate).unwrap();
        assert_eq!(cert, std::fs::read(dir.path().join("ca/prod/root_ca.crt")).unwrap());
        let chain = export.export(ArtifactScope::Ca, "prod", ArtifactKind::Fullchain).unwrap();
        assert_eq!(chain, cert);
        let key = export.export(ArtifactScope::Ca, "prod", ArtifactKind::Key).unwrap();
        assert!(ProtectedKey::is_protected(&key));
    }

    #[test]
    fn missing_artifacts_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (_, export) = service(dir.path());
        for scope in [ArtifactScope::Ca, ArtifactScope::Cert] {
            let err = export.export(scope, "nothing", ArtifactKind::Certificate).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound);
        }
    }

    #[test]
    fn malformed_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, export) = service(dir.path());
        let err = export.export(ArtifactScope::Cert, "../ca/root_ca", ArtifactKind::Key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = export.export(ArtifactScope::Ca, "a/b", ArtifactKind::Key).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn busy_ca_export_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let (cas, export) = service(dir.path());
        let id = CaId::default_ca();
        let _held = cas.acquire(&id, Instant::now() + Duration::from_secs(1)).unwrap();
        let err = export.export(ArtifactScope::Ca, "default", ArtifactKind::Certificate).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
