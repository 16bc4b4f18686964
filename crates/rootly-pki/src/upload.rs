//! Validation and ingestion of externally supplied CA and leaf material.
//!
//! Every file is checked on its own first (name, size, structure). Files
//! that belong together are then cross-checked: a key must be the
//! counterpart of the certificate it arrives with, or of the certificate
//! already stored under the same name, and a leaf whose issuer names a known
//! CA must carry that CA's signature. Only accepted files are written, under
//! the same locks signing and creation use.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::backend::{CryptoBackend, looks_like_pem};
use crate::ca_store::{CaFile, CaStore};
use crate::config::DEFAULT_LOCK_TIMEOUT;
use crate::cert_store::{CertStore, LeafFile};
use crate::error::{Error, Result};
use crate::lock::ensure_before;
use crate::protect::ProtectedKey;
use crate::types::{
    ArtifactScope, CaId, Certificate, FULLCHAIN_SUFFIX, Hostname, Passphrase, PrivateKey, Serial,
};
use crate::validation::{key_matches_certificate, verify_issued_by};

/// Largest accepted file.
pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

/// Extensions accepted in the CA scope.
pub const CA_EXTENSIONS: &[&str] = &["crt", "key", "srl"];

/// Extensions accepted in the certificate scope.
pub const CERT_EXTENSIONS: &[&str] = &["crt", "key", "pem"];

/// One uploaded file.
#[derive(Clone)]
pub struct UploadFile {
    /// Client-supplied file name. Only the final path component is used.
    pub filename: String,
    /// Raw contents.
    pub bytes: Vec<u8>,
}

impl UploadFile {
    /// Creates an upload file.
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

impl fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadFile")
            .field("filename", &self.filename)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A batch of files for one scope.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Target scope.
    pub scope: ArtifactScope,
    /// Target CA for the CA scope.
    pub ca_id: CaId,
    /// Protects plaintext CA keys and unlocks protected ones for matching.
    pub passphrase: Option<Passphrase>,
    /// Files to ingest.
    pub files: Vec<UploadFile>,
    /// How long the upload may wait for locks.
    pub timeout: Option<Duration>,
}

impl UploadRequest {
    /// Creates an empty request for `scope` targeting the `default` CA.
    #[must_use]
    pub fn new(scope: ArtifactScope) -> Self {
        Self {
            scope,
            ca_id: CaId::default_ca(),
            passphrase: None,
            files: Vec::new(),
            timeout: None,
        }
    }

    /// Targets another CA.
    #[must_use]
    pub fn with_ca(mut self, ca_id: CaId) -> Self {
        self.ca_id = ca_id;
        self
    }

    /// Supplies the CA passphrase.
    #[must_use]
    pub fn with_passphrase(mut self, passphrase: Passphrase) -> Self {
        self.passphrase = Some(passphrase);
        self
    }

    /// Adds a file.
    #[must_use]
    pub fn with_file(mut self, filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.files.push(UploadFile::new(filename, bytes));
        self
    }

    /// Sets the lock timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A rejected file and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rejection {
    /// File name as uploaded.
    pub filename: String,
    /// Human-readable reason.
    pub reason: String,
}

/// Outcome of an upload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Files that were written.
    pub accepted: Vec<String>,
    /// Files that were refused and never written.
    pub rejected: Vec<Rejection>,
}

impl UploadReport {
    fn accept(&mut self, filename: &str) {
        self.accepted.push(filename.to_string());
    }

    fn reject(&mut self, filename: &str, reason: impl fmt::Display) {
        let reason = reason.to_string();
        debug!(filename, reason = %reason, "upload rejected");
        self.rejected.push(Rejection {
            filename: filename.to_string(),
            reason,
        });
    }

    /// Returns true if nothing was rejected.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Structural verdict for a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The file is well-formed for its scope.
    Accepted,
    /// The file cannot be accepted.
    Rejected(String),
}

enum CaArtifact {
    Certificate(Certificate),
    PlainKey(PrivateKey),
    ProtectedKey(ProtectedKey),
    Serial(Serial),
}

enum LeafArtifact {
    Certificate(Certificate),
    Fullchain(Vec<Certificate>),
    Key(PrivateKey),
}

#[derive(Default)]
struct LeafGroup {
    cert: Option<(String, Certificate)>,
    fullchain: Option<(String, Vec<Certificate>)>,
    key: Option<(String, PrivateKey)>,
}

impl LeafGroup {
    fn filenames(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Some((name, _)) = &self.key {
            names.push(name.clone());
        }
        if let Some((name, _)) = &self.fullchain {
            names.push(name.clone());
        }
        if let Some((name, _)) = &self.cert {
            names.push(name.clone());
        }
        names
    }

    fn leaf(&self) -> Option<&Certificate> {
        self.cert
            .as_ref()
            .map(|(_, c)| c)
            .or_else(|| self.fullchain.as_ref().and_then(|(_, chain)| chain.first()))
    }
}

/// Validates uploads and hands accepted files to the stores.
pub struct UploadValidator {
    cas: Arc<CaStore>,
    certs: Arc<CertStore>,
    backend: Arc<dyn CryptoBackend>,
    default_timeout: Duration,
}

impl fmt::Debug for UploadValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadValidator")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

impl UploadValidator {
    /// Creates a validator writing into the given stores.
    #[must_use]
    pub fn new(cas: Arc<CaStore>, certs: Arc<CertStore>, backend: Arc<dyn CryptoBackend>) -> Self {
        Self {
            cas,
            certs,
            backend,
            default_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Sets the timeout used when a request carries none.
    #[must_use]
    pub const fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Timeout used when a request carries none.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Checks a single CA-scope file without cross-validation or writing.
    #[must_use]
    pub fn validate_ca_artifact(&self, filename: &str, bytes: &[u8]) -> Verdict {
        match self.parse_ca(&UploadFile::new(filename, bytes)) {
            Ok(_) => Verdict::Accepted,
            Err(reason) => Verdict::Rejected(reason),
        }
    }

    /// Checks a single certificate-scope file, including its issuer when
    /// the issuer is a known CA. Nothing is written.
    #[must_use]
    pub fn validate_cert_artifact(&self, filename: &str, bytes: &[u8]) -> Verdict {
        let parsed = self.parse_leaf(&UploadFile::new(filename, bytes));
        let result = parsed.and_then(|(_, artifact)| match artifact {
            LeafArtifact::Certificate(cert) => self.check_issuer(&cert),
            LeafArtifact::Fullchain(chain) => self.check_chain(&chain),
            LeafArtifact::Key(_) => Ok(()),
        });
        match result {
            Ok(()) => Verdict::Accepted,
            Err(reason) => Verdict::Rejected(reason),
        }
    }

    /// Validates and stores a batch.
    ///
    /// Content problems are reported per file in the [`UploadReport`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if a lock is not obtained in time and
    /// [`Error::Io`] if an accepted file cannot be written.
    pub fn upload(&self, request: &UploadRequest) -> Result<UploadReport> {
        let deadline = Instant::now() + request.timeout.unwrap_or(self.default_timeout);
        let mut report = UploadReport::default();
        match request.scope {
            ArtifactScope::Ca => self.upload_ca(request, deadline, &mut report)?,
            ArtifactScope::Cert => self.upload_certs(request, deadline, &mut report)?,
        }
        info!(
            scope = %request.scope,
            accepted = report.accepted.len(),
            rejected = report.rejected.len(),
            "upload processed"
        );
        Ok(report)
    }

    fn parse_ca(&self, file: &UploadFile) -> std::result::Result<CaArtifact, String> {
        let (_, ext) = split_name(&file.filename, CA_EXTENSIONS)?;
        check_size(file)?;
        match ext.as_str() {
            "crt" => {
                let cert = self.backend.parse_certificate(&file.bytes).map_err(|e| e.to_string())?;
                if !cert.is_ca() {
                    return Err("certificate is not a CA certificate".into());
                }
                Ok(CaArtifact::Certificate(cert))
            }
            "key" if ProtectedKey::is_protected(&file.bytes) => ProtectedKey::from_bytes(&file.bytes)
                .map(CaArtifact::ProtectedKey)
                .map_err(|e| e.to_string()),
            "key" => self
                .backend
                .parse_key(&file.bytes)
                .map(CaArtifact::PlainKey)
                .map_err(|e| e.to_string()),
            _ => {
                let text = std::str::from_utf8(&file.bytes)
                    .map_err(|_| "serial file is not text".to_string())?;
                Serial::parse_hex(text)
                    .map(CaArtifact::Serial)
                    .map_err(|e| e.to_string())
            }
        }
    }

    fn parse_leaf(&self, file: &UploadFile) -> std::result::Result<(Hostname, LeafArtifact), String> {
        let (stem, ext) = split_name(&file.filename, CERT_EXTENSIONS)?;
        check_size(file)?;

        let (stem, artifact) = match ext.as_str() {
            "key" => (stem, LeafArtifact::Key(self.parse_key(&file.bytes)?)),
            "crt" => match stem.strip_suffix(FULLCHAIN_SUFFIX).map(str::to_string) {
                Some(host) => (host, LeafArtifact::Fullchain(self.parse_chain(&file.bytes)?)),
                None => (stem, self.parse_cert_or_chain(&file.bytes)?),
            },
            // .pem is classified by what it holds
            _ if contains_certificate(&file.bytes) => {
                let host = stem.strip_suffix(FULLCHAIN_SUFFIX).map_or_else(|| stem.clone(), str::to_string);
                (host, self.parse_cert_or_chain(&file.bytes)?)
            }
            _ => (stem, LeafArtifact::Key(self.parse_key(&file.bytes)?)),
        };

        let leaf = match &artifact {
            LeafArtifact::Certificate(cert) => Some(cert),
            LeafArtifact::Fullchain(chain) => chain.first(),
            LeafArtifact::Key(_) => None,
        };
        if leaf.is_some_and(Certificate::is_ca) {
            return Err("CA certificates belong in the ca scope".into());
        }

        let hostname = Hostname::new(stem).map_err(|e| e.to_string())?;
        Ok((hostname, artifact))
    }

    fn parse_key(&self, bytes: &[u8]) -> std::result::Result<PrivateKey, String> {
        if ProtectedKey::is_protected(bytes) {
            return Err("leaf keys are stored unencrypted; upload the plain PKCS#8 key".into());
        }
        self.backend.parse_key(bytes).map_err(|e| e.to_string())
    }

    fn parse_chain(&self, bytes: &[u8]) -> std::result::Result<Vec<Certificate>, String> {
        if looks_like_pem(bytes) {
            Certificate::chain_from_pem(bytes).map_err(|e| e.to_string())
        } else {
            self.backend
                .parse_certificate(bytes)
                .map(|c| vec![c])
                .map_err(|e| e.to_string())
        }
    }

    fn parse_cert_or_chain(&self, bytes: &[u8]) -> std::result::Result<LeafArtifact, String> {
        let mut chain = self.parse_chain(bytes)?;
        if chain.len() == 1 {
            Ok(LeafArtifact::Certificate(chain.remove(0)))
        } else {
            Ok(LeafArtifact::Fullchain(chain))
        }
    }

    fn known_cas(&self) -> Vec<(CaId, Certificate)> {
        let listed = match self.cas.list_cas() {
            Ok(listed) => listed,
            Err(e) => {
                warn!(error = %e, "cannot list CAs for issuer check");
                return Vec::new();
            }
        };
        listed
            .into_iter()
            .filter_map(|info| {
                let cert = self.cas.certificate(&info.id).ok()?;
                Some((info.id, cert))
            })
            .collect()
    }

    // A leaf naming a known CA must verify against it. Unknown issuers pass.
    fn check_issuer(&self, cert: &Certificate) -> std::result::Result<(), String> {
        let candidates: Vec<_> = self
            .known_cas()
            .into_iter()
            .filter(|(_, ca)| ca.subject() == cert.issuer())
            .collect();
        if candidates.is_empty() || candidates.iter().any(|(_, ca)| verify_issued_by(cert, ca).is_ok()) {
            return Ok(());
        }
        let ids: Vec<_> = candidates.iter().map(|(id, _)| id.to_string()).collect();
        Err(format!(
            "certificate names CA '{}' but does not verify against it",
            ids.join("', '")
        ))
    }

    fn check_chain(&self, chain: &[Certificate]) -> std::result::Result<(), String> {
        for pair in chain.windows(2) {
            verify_issued_by(&pair[0], &pair[1]).map_err(|e| format!("broken fullchain: {e}"))?;
        }
        match chain.first() {
            Some(leaf) => self.check_issuer(leaf),
            None => Err("empty fullchain".into()),
        }
    }

    fn matches(&self, key: &PrivateKey, cert: &Certificate) -> std::result::Result<(), String> {
        match key_matches_certificate(self.backend.as_ref(), key, cert) {
            Ok(true) => Ok(()),
            Ok(false) => Err("private key does not match certificate".into()),
            Err(e) => Err(e.to_string()),
        }
    }

    fn upload_ca(&self, request: &UploadRequest, deadline: Instant, report: &mut UploadReport) -> Result<()> {
        let mut cert: Option<(String, Certificate)> = None;
        let mut key: Option<(String, CaArtifact)> = None;
        let mut serial: Option<(String, Serial)> = None;

        for file in &request.files {
            let name = file.filename.as_str();
            match self.parse_ca(file) {
                Err(reason) => report.reject(name, reason),
                Ok(CaArtifact::Certificate(c)) if cert.is_none() => cert = Some((name.to_string(), c)),
                Ok(CaArtifact::Serial(s)) if serial.is_none() => serial = Some((name.to_string(), s)),
                Ok(k @ (CaArtifact::PlainKey(_) | CaArtifact::ProtectedKey(_))) if key.is_none() => {
                    key = Some((name.to_string(), k));
                }
                Ok(_) => report.reject(name, "more than one file of this kind in the upload"),
            }
        }
        if cert.is_none() && key.is_none() && serial.is_none() {
            return Ok(());
        }

        let id = &request.ca_id;
        let guard = self.cas.acquire(id, deadline)?;
        let passphrase = request.passphrase.as_ref();

        // plaintext key for matching, protected form for storage
        let mut key_plain: Option<PrivateKey> = None;
        let mut key_stored: Option<(String, ProtectedKey)> = None;
        if let Some((name, artifact)) = key.take() {
            match (artifact, passphrase) {
                (CaArtifact::PlainKey(_), None) => {
                    report.reject(&name, "a passphrase is required to protect a plaintext CA key");
                }
                (CaArtifact::PlainKey(plain), Some(pw)) => match self.cas.protector().protect(&plain, pw) {
                    Ok(protected) => {
                        key_plain = Some(plain);
                        key_stored = Some((name, protected));
                    }
                    Err(e) => report.reject(&name, e),
                },
                (CaArtifact::ProtectedKey(protected), Some(pw)) => {
                    match self.cas.protector().unlock(&protected, pw) {
                        Ok(plain) => {
                            key_plain = Some(plain);
                            key_stored = Some((name, protected));
                        }
                        Err(_) => report.reject(&name, "passphrase does not unlock the uploaded key"),
                    }
                }
                (CaArtifact::ProtectedKey(protected), None) => key_stored = Some((name, protected)),
                _ => {}
            }
        }

        // the certificate the key must match: uploaded, else stored
        let stored_cert = if cert.is_none() { self.cas.certificate(id).ok() } else { None };
        let target_cert = cert.as_ref().map(|(_, c)| c).or(stored_cert.as_ref());
        let key_mismatch = match (&key_stored, target_cert) {
            (Some(_), Some(target)) => match &key_plain {
                Some(plain) => self.matches(plain, target).err(),
                None => Some("a passphrase is required to verify the key against the certificate".to_string()),
            },
            _ => None,
        };
        let cert_mismatch = match (&cert, &key_stored) {
            // a lone certificate must match the stored key, if any
            (Some((_, uploaded)), None) => self.check_against_stored_key(id, uploaded, passphrase).err(),
            _ => None,
        };
        drop(key_plain);

        if let Some(reason) = key_mismatch {
            if let Some((name, _)) = key_stored.take() {
                report.reject(&name, &reason);
            }
            if let Some((name, _)) = cert.take() {
                report.reject(&name, &reason);
            }
        }
        if let Some(reason) = cert_mismatch {
            if let Some((name, _)) = cert.take() {
                report.reject(&name, reason);
            }
        }

        if let Some((name, value)) = serial.take() {
            match self.check_serial(id, value) {
                Ok(()) => serial = Some((name, value)),
                Err(reason) => report.reject(&name, reason),
            }
        }

        if serial.is_none() && key_stored.is_none() && cert.is_none() {
            return Ok(());
        }
        ensure_before(deadline, "CA upload")?;
        let mut contents: Vec<(CaFile, Vec<u8>)> = Vec::with_capacity(3);
        let mut accepted = Vec::with_capacity(3);
        if let Some((name, value)) = serial {
            contents.push((CaFile::Serial, format!("{value}\n").into_bytes()));
            accepted.push(name);
        }
        if let Some((name, protected)) = key_stored {
            contents.push((CaFile::Key, protected.as_bytes().to_vec()));
            accepted.push(name);
        }
        if let Some((name, c)) = cert {
            contents.push((CaFile::Certificate, c.pem().into_bytes()));
            accepted.push(name);
        }
        let files: Vec<(CaFile, &[u8])> = contents
            .iter()
            .map(|(file, bytes)| (*file, bytes.as_slice()))
            .collect();
        self.cas.write_set(&guard, &files)?;
        for name in &accepted {
            report.accept(name);
        }
        info!(ca_id = %id, "CA material uploaded");
        Ok(())
    }

    fn check_against_stored_key(
        &self,
        id: &CaId,
        uploaded: &Certificate,
        passphrase: Option<&Passphrase>,
    ) -> std::result::Result<(), String> {
        let bytes = match self.cas.read_file(id, CaFile::Key) {
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e.to_string()),
            Ok(bytes) => bytes,
        };
        let stored = ProtectedKey::from_bytes(&bytes).map_err(|e| format!("stored CA key is unreadable: {e}"))?;
        let Some(passphrase) = passphrase else {
            return Err("a passphrase is required to verify the certificate against the stored key".into());
        };
        let plain = self
            .cas
            .protector()
            .unlock(&stored, passphrase)
            .map_err(|_| "passphrase does not unlock the stored CA key".to_string())?;
        self.matches(&plain, uploaded)
    }

    // The counter never moves backwards and issued serials are never reused.
    fn check_serial(&self, id: &CaId, value: Serial) -> std::result::Result<(), String> {
        let current = self.cas.read_counter(id).map_err(|e| e.to_string())?;
        if value < current {
            return Err(format!("serial {value} is lower than the current counter {current}"));
        }
        let issued = self.cas.issued_index(id).map_err(|e| e.to_string())?;
        if issued.contains(value) {
            return Err(format!("serial {value} was already issued"));
        }
        Ok(())
    }

    fn upload_certs(&self, request: &UploadRequest, deadline: Instant, report: &mut UploadReport) -> Result<()> {
        let mut groups: BTreeMap<Hostname, LeafGroup> = BTreeMap::new();
        for file in &request.files {
            let name = file.filename.clone();
            let (hostname, artifact) = match self.parse_leaf(file) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    report.reject(&name, reason);
                    continue;
                }
            };
            let group = groups.entry(hostname).or_default();
            let occupied = match artifact {
                LeafArtifact::Certificate(c) if group.cert.is_none() => {
                    group.cert = Some((name.clone(), c));
                    false
                }
                LeafArtifact::Fullchain(c) if group.fullchain.is_none() => {
                    group.fullchain = Some((name.clone(), c));
                    false
                }
                LeafArtifact::Key(k) if group.key.is_none() => {
                    group.key = Some((name.clone(), k));
                    false
                }
                _ => true,
            };
            if occupied {
                report.reject(&name, "more than one file of this kind for the same hostname");
            }
        }
        pair_lone_cert_and_key(&mut groups);

        for (hostname, group) in groups {
            if let Err(reason) = self.check_group(&hostname, &group) {
                for name in group.filenames() {
                    report.reject(&name, &reason);
                }
                continue;
            }

            let guard = self.certs.acquire(&hostname, deadline)?;
            ensure_before(deadline, "certificate upload")?;
            let mut contents: Vec<(LeafFile, Zeroizing<String>)> = Vec::with_capacity(3);
            if let Some((_, key)) = &group.key {
                contents.push((LeafFile::Key, key.pem()));
            }
            if let Some((_, chain)) = &group.fullchain {
                let pem: String = chain.iter().map(Certificate::pem).collect();
                contents.push((LeafFile::Fullchain, Zeroizing::new(pem)));
            }
            // a lone fullchain still yields {hostname}.crt so the set is listed
            if let Some(leaf) = group.leaf() {
                contents.push((LeafFile::Certificate, Zeroizing::new(leaf.pem())));
            }
            let files: Vec<(LeafFile, &[u8])> = contents
                .iter()
                .map(|(file, pem)| (*file, pem.as_bytes()))
                .collect();
            self.certs.write_set(&guard, &files)?;
            for name in group.filenames() {
                report.accept(&name);
            }
            info!(hostname = %hostname, "certificate material uploaded");
        }
        Ok(())
    }

    fn check_group(&self, hostname: &Hostname, group: &LeafGroup) -> std::result::Result<(), String> {
        if let (Some((_, cert)), Some((_, chain))) = (&group.cert, &group.fullchain) {
            if chain.first().map(Certificate::der) != Some(cert.der()) {
                return Err("fullchain does not start with the uploaded certificate".into());
            }
        }
        if let Some((_, chain)) = &group.fullchain {
            self.check_chain(chain)?;
        } else if let Some((_, cert)) = &group.cert {
            self.check_issuer(cert)?;
        }

        match (group.leaf(), &group.key) {
            (Some(leaf), Some((_, key))) => self.matches(key, leaf),
            (Some(leaf), None) => match self.stored_key(hostname) {
                Some(stored) => self
                    .matches(&stored, leaf)
                    .map_err(|_| "certificate does not match the stored key".to_string()),
                None => Ok(()),
            },
            (None, Some((_, key))) => match self.certs.certificate(hostname) {
                Ok(Some(stored)) => self
                    .matches(key, &stored)
                    .map_err(|_| "key does not match the stored certificate".to_string()),
                _ => Ok(()),
            },
            (None, None) => Ok(()),
        }
    }

    fn stored_key(&self, hostname: &Hostname) -> Option<PrivateKey> {
        let bytes = self.certs.read_file(hostname, LeafFile::Key).ok()?;
        self.backend.parse_key(&bytes).ok()
    }
}

/// One certificate and one key under different names are treated as a pair.
fn pair_lone_cert_and_key(groups: &mut BTreeMap<Hostname, LeafGroup>) {
    if groups.len() != 2 {
        return;
    }
    let cert_host = groups
        .iter()
        .find(|(_, g)| g.cert.is_some() && g.fullchain.is_none() && g.key.is_none())
        .map(|(h, _)| h.clone());
    let key_host = groups
        .iter()
        .find(|(_, g)| g.key.is_some() && g.cert.is_none() && g.fullchain.is_none())
        .map(|(h, _)| h.clone());
    if let (Some(cert_host), Some(key_host)) = (cert_host, key_host) {
        let key = groups.remove(&key_host).and_then(|g| g.key);
        if let Some(group) = groups.get_mut(&cert_host) {
            group.key = key;
        }
    }
}

fn split_name(filename: &str, allowed: &[&str]) -> std::result::Result<(String, String), String> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    if base.is_empty() || base.starts_with('.') {
        return Err("invalid file name".into());
    }
    let (stem, ext) = base
        .rsplit_once('.')
        .ok_or_else(|| format!("file has no extension; allowed: {}", allowed.join(", ")))?;
    let ext = ext.to_ascii_lowercase();
    if !allowed.contains(&ext.as_str()) {
        return Err(format!(
            "extension '.{ext}' is not allowed; allowed: {}",
            allowed.join(", ")
        ));
    }
    Ok((stem.to_string(), ext))
}

fn check_size(file: &UploadFile) -> std::result::Result<(), String> {
    if file.bytes.is_empty() {
        return Err("file is empty".into());
    }
    if file.bytes.len() > MAX_UPLOAD_BYTES {
        return Err(format!("file exceeds the {MAX_UPLOAD_BYTES} byte limit"));
    }
    Ok(())
}

fn contains_certificate(bytes: &[u8]) -> bool {
    const MARKER: &[u8] = b"-----BEGIN CERTIFICATE-----";
    bytes.windows(MARKER.len()).any(|w| w == MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LeafParams, RcgenBackend};
    use crate::protect::{KdfParams, KeyProtector};
    use crate::types::{SubjectDn, Validity};
    use chrono::Utc;

    struct Fixture {
        dir: tempfile::TempDir,
        cas: Arc<CaStore>,
        certs: Arc<CertStore>,
        validator: UploadValidator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let backend: Arc<dyn CryptoBackend> = Arc::new(RcgenBackend);
        let protector = KeyProtector::new(KdfParams::insecure_fast(), Arc::clone(&backend));
        let cas = Arc::new(CaStore::new(dir.path().join("ca"), Arc::clone(&backend), protector));
        let certs = Arc::new(CertStore::new(dir.path().join("certs")));
        let validator = UploadValidator::new(Arc::clone(&cas), Arc::clone(&certs), backend)
            .with_default_timeout(Duration::from_secs(10));
        Fixture {
            dir,
            cas,
            certs,
            validator,
        }
    }

    fn validity() -> Validity {
        let now = Utc::now();
        Validity {
            not_before: now - chrono::Duration::hours(1),
            not_after: now + chrono::Duration::days(30),
        }
    }

    fn root(cn: &str) -> (Certificate, PrivateKey) {
        let key = RcgenBackend.generate_key_pair().unwrap();
        let cert = RcgenBackend
            .self_sign(&SubjectDn::new(cn, "Acme", "IT"), validity(), &key)
            .unwrap();
        (cert, key)
    }

    fn leaf(host: &str, issuer: &(Certificate, PrivateKey)) -> (Certificate, PrivateKey) {
        let key = RcgenBackend.generate_key_pair().unwrap();
        let params = LeafParams {
            hostname: host.into(),
            serial: Serial(9),
            validity: validity(),
        };
        let cert = RcgenBackend.sign(&params, &key, &issuer.0, &issuer.1).unwrap();
        (cert, key)
    }

    fn pw(s: &str) -> Passphrase {
        Passphrase::new(s).unwrap()
    }

    fn create_ca(fx: &Fixture, id: &str) {
        fx.cas
            .create_ca(
                &CaId::new(id).unwrap(),
                &SubjectDn::new("Prod Root", "Acme", "IT"),
                &pw("pw1"),
                365,
                Instant::now() + Duration::from_secs(5),
            )
            .unwrap();
    }

    fn rejected_names(report: &UploadReport) -> Vec<&str> {
        report.rejected.iter().map(|r| r.filename.as_str()).collect()
    }

    #[test]
    fn single_file_verdicts() {
        let fx = fixture();
        let (ca_cert, _) = root("Root");
        let (leaf_cert, leaf_key) = leaf("web", &root("Other"));

        assert_eq!(fx.validator.validate_ca_artifact("ca.crt", ca_cert.pem().as_bytes()), Verdict::Accepted);
        assert!(matches!(
            fx.validator.validate_ca_artifact("ca.crt", leaf_cert.pem().as_bytes()),
            Verdict::Rejected(_)
        ));
        assert!(matches!(fx.validator.validate_ca_artifact("ca.pem", b"x"), Verdict::Rejected(_)));
        assert_eq!(fx.validator.validate_ca_artifact("root_ca.srl", b"1A\n"), Verdict::Accepted);
        assert!(matches!(fx.validator.validate_ca_artifact("root_ca.srl", b"zz"), Verdict::Rejected(_)));

        assert_eq!(fx.validator.validate_cert_artifact("web.crt", leaf_cert.pem().as_bytes()), Verdict::Accepted);
        assert_eq!(fx.validator.validate_cert_artifact("web.key", leaf_key.pem().as_bytes()), Verdict::Accepted);
        assert!(matches!(fx.validator.validate_cert_artifact("web.srl", b"01"), Verdict::Rejected(_)));
        assert!(matches!(
            fx.validator.validate_cert_artifact("root.crt", ca_cert.pem().as_bytes()),
            Verdict::Rejected(_)
        ));
    }

    #[test]
    fn file_name_rules() {
        assert_eq!(
            split_name("../../etc/web.CRT", CERT_EXTENSIONS).unwrap(),
            ("web".to_string(), "crt".to_string())
        );
        assert!(split_name(".hidden.crt", CERT_EXTENSIONS).is_err());
        assert!(split_name("noext", CERT_EXTENSIONS).is_err());
        assert!(split_name("web.exe", CERT_EXTENSIONS).is_err());
        assert!(split_name("root_ca.pem", CA_EXTENSIONS).is_err());
    }

    #[test]
    fn oversized_and_empty_files_rejected() {
        let big = UploadFile::new("web.crt", vec![b'a'; MAX_UPLOAD_BYTES + 1]);
        assert!(check_size(&big).is_err());
        assert!(check_size(&UploadFile::new("web.crt", Vec::new())).is_err());
        assert!(check_size(&UploadFile::new("web.crt", vec![1])).is_ok());
    }

    #[test]
    fn matching_leaf_pair_is_stored() {
        let fx = fixture();
        let (cert, key) = leaf("web", &root("External"));
        let request = UploadRequest::new(ArtifactScope::Cert)
            .with_file("web.crt", cert.pem())
            .with_file("web.key", key.pem().as_bytes().to_vec());

        let report = fx.validator.upload(&request).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert_eq!(report.accepted.len(), 2);
        let host = Hostname::new("web").unwrap();
        assert_eq!(fx.certs.certificate(&host).unwrap().unwrap().der(), cert.der());
    }

    #[test]
    fn certificate_without_common_name_is_stored_and_listed() {
        let fx = fixture();
        let mut params = rcgen::CertificateParams::new(vec!["san.acme.local".to_string()]).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let request = UploadRequest::new(ArtifactScope::Cert)
            .with_file("san.crt", cert.pem())
            .with_file("san.key", key.serialize_pem());

        let report = fx.validator.upload(&request).unwrap();
        assert!(report.is_clean(), "{report:?}");
        let listing = fx.certs.list_certificates().unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].hostname, "san");
        assert_eq!(listing[0].metadata.as_ref().unwrap().hostname, "san.acme.local");
    }

    #[test]
    fn mismatched_pair_is_rejected_whatever_the_names() {
        let fx = fixture();
        let issuer = root("External");
        let (cert, _) = leaf("web", &issuer);
        let (_, other_key) = leaf("web", &issuer);

        for (cert_name, key_name) in [("web.crt", "web.key"), ("server.pem", "private.key")] {
            let request = UploadRequest::new(ArtifactScope::Cert)
                .with_file(cert_name, cert.pem())
                .with_file(key_name, other_key.pem().as_bytes().to_vec());
            let report = fx.validator.upload(&request).unwrap();
            assert!(report.accepted.is_empty());
            let mut names = rejected_names(&report);
            names.sort_unstable();
            let mut expected = vec![cert_name, key_name];
            expected.sort_unstable();
            assert_eq!(names, expected);
        }
        assert!(fx.certs.list_certificates().unwrap().is_empty());
    }

    #[test]
    fn differently_named_matching_pair_is_stored_under_cert_name() {
        let fx = fixture();
        let (cert, key) = leaf("web", &root("External"));
        let request = UploadRequest::new(ArtifactScope::Cert)
            .with_file("web.pem", cert.pem())
            .with_file("web-key.pem", key.pem().as_bytes().to_vec());

        let report = fx.validator.upload(&request).unwrap();
        assert!(report.is_clean(), "{report:?}");
        assert!(fx.dir.path().join("certs").join("web.key").is_file());
    }

    #[test]
    fn leaf_from_known_ca_must_verify() {
        let fx = fixture();
        create_ca(&fx, "prod");
        // same subject as the stored CA, different key
        let impostor = root("Prod Root");
        let (forged, _) = leaf("web", &impostor);

        let report = fx
            .validator
            .upload(&UploadRequest::new(ArtifactScope::Cert).with_file("web.crt", forged.pem()))
            .unwrap();
        assert_eq!(rejected_names(&report), vec!["web.crt"]);
        assert!(report.rejected[0].reason.contains("prod"));
    }

    #[test]
    fn fullchain_upload() {
        let fx = fixture();
        let issuer = root("External");
        let (cert, key) = leaf("web", &issuer);
        let mut chain = cert.pem();
        chain.push_str(&issuer.0.pem());

        let request = UploadRequest::new(ArtifactScope::Cert)
            .with_file("web.crt", cert.pem())
            .with_file("web.key", key.pem().as_bytes().to_vec())
            .with_file("web_fullchain.crt", chain);
        let report = fx.validator.upload(&request).unwrap();
        assert!(report.is_clean(), "{report:?}");
        let listing = fx.certs.list_certificates().unwrap();
        assert_eq!(listing.len(), 1);
        assert!(listing[0].key_exists && listing[0].fullchain_exists);
    }

    #[test]
    fn ca_upload_protects_plaintext_key() {
        let fx = fixture();
        let (cert, key) = root("Imported Root");
        let request = UploadRequest::new(ArtifactScope::Ca)
            .with_ca(CaId::new("imported").unwrap())
            .with_passphrase(pw("pw1"))
            .with_file("ca.crt", cert.pem())
            .with_file("ca.key", key.pem().as_bytes().to_vec())
            .with_file("ca.srl", "10\n");

        let report = fx.validator.upload(&request).unwrap();
        assert!(report.is_clean(), "{report:?}");
        let id = CaId::new("imported").unwrap();
        let stored_key = fx.cas.read_file(&id, CaFile::Key).unwrap();
        assert!(ProtectedKey::is_protected(&stored_key));
        let ca = fx.cas.get_ca(&id).unwrap();
        assert_eq!(fx.cas.unlock_key(&ca, &pw("pw1")).unwrap().der(), key.der());
        assert_eq!(fx.cas.read_counter(&id).unwrap(), Serial(0x10));
    }

    #[test]
    fn ca_upload_without_passphrase_rejects_plain_key() {
        let fx = fixture();
        let (cert, key) = root("Imported Root");
        let request = UploadRequest::new(ArtifactScope::Ca)
            .with_file("root_ca.crt", cert.pem())
            .with_file("root_ca.key", key.pem().as_bytes().to_vec());

        let report = fx.validator.upload(&request).unwrap();
        assert!(rejected_names(&report).contains(&"root_ca.key"));
        assert!(!fx.dir.path().join("ca").join("root_ca.key").exists());
    }

    #[test]
    fn ca_upload_rejects_mismatched_pair() {
        let fx = fixture();
        let (cert, _) = root("Imported Root");
        let (_, other_key) = root("Imported Root");
        let request = UploadRequest::new(ArtifactScope::Ca)
            .with_passphrase(pw("pw1"))
            .with_file("a.crt", cert.pem())
            .with_file("b.key", other_key.pem().as_bytes().to_vec());

        let report = fx.validator.upload(&request).unwrap();
        assert!(report.accepted.is_empty());
        assert_eq!(report.rejected.len(), 2);
        assert!(!fx.cas.exists(&CaId::default_ca()));
    }

    #[test]
    fn lone_ca_cert_is_checked_against_stored_key() {
        let fx = fixture();
        create_ca(&fx, "prod");
        let (foreign, _) = root("Foreign");
        let id = CaId::new("prod").unwrap();
        let before = fx.cas.read_file(&id, CaFile::Certificate).unwrap();

        let no_pw = UploadRequest::new(ArtifactScope::Ca)
            .with_ca(id.clone())
            .with_file("root_ca.crt", foreign.pem());
        assert_eq!(fx.validator.upload(&no_pw).unwrap().rejected.len(), 1);

        let with_pw = no_pw.clone().with_passphrase(pw("pw1"));
        assert_eq!(fx.validator.upload(&with_pw).unwrap().rejected.len(), 1);
        assert_eq!(fx.cas.read_file(&id, CaFile::Certificate).unwrap(), before);
    }

    #[test]
    fn serial_upload_never_moves_backwards() {
        let fx = fixture();
        create_ca(&fx, "prod");
        let id = CaId::new("prod").unwrap();
        {
            let guard = fx.cas.acquire(&id, Instant::now() + Duration::from_secs(1)).unwrap();
            for host in ["a", "b", "c"] {
                fx.cas.allocate_serial(&guard, &Hostname::new(host).unwrap()).unwrap();
            }
        }

        let lower = UploadRequest::new(ArtifactScope::Ca)
            .with_ca(id.clone())
            .with_file("root_ca.srl", "02");
        assert_eq!(fx.validator.upload(&lower).unwrap().rejected.len(), 1);

        let higher = UploadRequest::new(ArtifactScope::Ca)
            .with_ca(id.clone())
            .with_file("root_ca.srl", "20");
        assert!(fx.validator.upload(&higher).unwrap().is_clean());
        assert_eq!(fx.cas.read_counter(&id).unwrap(), Serial(0x20));
    }
}
