//! Filesystem-backed certificate authority store.
//!
//! # Layout
//!
//! The CA with id `default` lives directly in the CA directory, which keeps
//! single-CA deployments readable. Every other CA gets a subdirectory named
//! after its id:
//!
//! ```text
//! {ca_dir}/root_ca.key              protected key of `default`
//! {ca_dir}/root_ca.crt              root certificate of `default`
//! {ca_dir}/root_ca.srl              last allocated serial (hex)
//! {ca_dir}/issued_serials.json      allocation log
//! {ca_dir}/{id}/root_ca.{key,crt,srl}
//! {ca_dir}/{id}/issued_serials.json
//! ```
//!
//! Each CA also has a lock file, `{ca_dir}/.{id}.lock`, so that separate
//! processes sharing the directory serialize on the same CA.
//!
//! A CA exists exactly when its `root_ca.crt` exists. Creation writes the
//! certificate last, so a reader never sees a certificate without its key.
//!
//! All mutation happens while holding the CA's [`LockGuard`]; the guard is
//! passed to every mutating method as proof.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backend::CryptoBackend;
use crate::error::{Error, Result};
use crate::fs::{FileMode, atomic_write, atomic_write_all, ensure_dir, read_optional};
use crate::lock::{LockGuard, LockTable, ensure_before};
use crate::metadata::extract_ca_info;
use crate::protect::{KeyProtector, ProtectedKey};
use crate::types::{
    Certificate, CaId, DEFAULT_CA_ID, Hostname, Passphrase, PrivateKey, Serial, SubjectDn,
    Validity,
};

/// Protected CA private key.
pub const CA_KEY_FILE: &str = "root_ca.key";
/// Self-signed CA certificate.
pub const CA_CERT_FILE: &str = "root_ca.crt";
/// Serial counter in openssl `.srl` format.
pub const CA_SERIAL_FILE: &str = "root_ca.srl";
/// Log of allocated serials.
pub const ISSUED_INDEX_FILE: &str = "issued_serials.json";

/// A file owned by a CA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaFile {
    /// `root_ca.key`.
    Key,
    /// `root_ca.crt`.
    Certificate,
    /// `root_ca.srl`.
    Serial,
}

impl CaFile {
    /// Returns the on-disk file name.
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::Key => CA_KEY_FILE,
            Self::Certificate => CA_CERT_FILE,
            Self::Serial => CA_SERIAL_FILE,
        }
    }

    const fn mode(self) -> FileMode {
        match self {
            Self::Key => FileMode::Private,
            Self::Certificate | Self::Serial => FileMode::Public,
        }
    }
}

/// Listing entry for a CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaInfo {
    /// CA id.
    pub id: CaId,
    /// Subject of the root certificate.
    #[serde(rename = "subjectDN")]
    pub subject_dn: SubjectDn,
    /// End of validity.
    pub not_after: DateTime<Utc>,
    /// Root certificate serial, uppercase hex.
    pub serial: String,
}

/// Which files of a CA are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaStatus {
    /// `root_ca.key` is present.
    pub key_exists: bool,
    /// `root_ca.crt` is present.
    pub cert_exists: bool,
    /// Both are present and the CA can sign.
    pub exists: bool,
}

/// A loaded certificate authority. The key stays protected.
#[derive(Debug, Clone)]
pub struct CertificateAuthority {
    id: CaId,
    certificate: Certificate,
    protected_key: ProtectedKey,
}

impl CertificateAuthority {
    /// Returns the CA id.
    #[must_use]
    pub const fn id(&self) -> &CaId {
        &self.id
    }

    /// Returns the self-signed root certificate.
    #[must_use]
    pub const fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Returns the subject of the root certificate.
    #[must_use]
    pub const fn subject(&self) -> &SubjectDn {
        self.certificate.subject()
    }

    /// Returns the validity window fixed at creation.
    #[must_use]
    pub const fn validity(&self) -> Validity {
        self.certificate.validity()
    }

    /// Returns the key as stored on disk.
    #[must_use]
    pub const fn protected_key(&self) -> &ProtectedKey {
        &self.protected_key
    }
}

/// Lifecycle of an allocated serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialState {
    /// Allocated; the certificate has not been persisted yet.
    Pending,
    /// The certificate carrying this serial was persisted.
    Committed,
    /// Signing failed after allocation. The serial is burned.
    Abandoned,
}

/// One allocation in the issued-serial log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedEntry {
    /// Allocated serial.
    pub serial: Serial,
    /// Hostname the serial was allocated for.
    pub hostname: Hostname,
    /// Current state.
    pub state: SerialState,
    /// Allocation time.
    pub allocated_at: DateTime<Utc>,
}

/// Every serial a CA has handed out, in allocation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedIndex {
    /// Allocations.
    pub entries: Vec<IssuedEntry>,
}

impl IssuedIndex {
    /// Returns true if `serial` was ever allocated.
    #[must_use]
    pub fn contains(&self, serial: Serial) -> bool {
        self.entries.iter().any(|e| e.serial == serial)
    }

    /// Returns the highest allocated serial.
    #[must_use]
    pub fn max_serial(&self) -> Option<Serial> {
        self.entries.iter().map(|e| e.serial).max()
    }

    /// Returns allocations whose certificate was never confirmed.
    pub fn pending(&self) -> impl Iterator<Item = &IssuedEntry> {
        self.entries
            .iter()
            .filter(|e| e.state == SerialState::Pending)
    }

    fn set_state(&mut self, serial: Serial, state: SerialState) -> bool {
        self.entries
            .iter_mut()
            .find(|e| e.serial == serial)
            .map(|e| e.state = state)
            .is_some()
    }
}

/// Owner of all CA-scoped files.
pub struct CaStore {
    ca_dir: PathBuf,
    backend: Arc<dyn CryptoBackend>,
    protector: KeyProtector,
    locks: LockTable<CaId>,
}

impl std::fmt::Debug for CaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaStore")
            .field("ca_dir", &self.ca_dir)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl CaStore {
    /// Creates a store rooted at `ca_dir`. Nothing is touched until the first write.
    #[must_use]
    pub fn new(
        ca_dir: impl Into<PathBuf>,
        backend: Arc<dyn CryptoBackend>,
        protector: KeyProtector,
    ) -> Self {
        let ca_dir: PathBuf = ca_dir.into();
        let lock_dir = ca_dir.clone();
        Self {
            ca_dir,
            backend,
            protector,
            locks: LockTable::file_backed(move |id: &CaId| lock_dir.join(format!(".{id}.lock"))),
        }
    }

    /// Returns the root CA directory.
    #[must_use]
    pub fn ca_dir(&self) -> &Path {
        &self.ca_dir
    }

    /// Returns the key protector used for CA keys.
    #[must_use]
    pub const fn protector(&self) -> &KeyProtector {
        &self.protector
    }

    /// Directory holding the files of `id`.
    #[must_use]
    pub fn dir_of(&self, id: &CaId) -> PathBuf {
        if id.is_default() {
            self.ca_dir.clone()
        } else {
            self.ca_dir.join(id.as_str())
        }
    }

    /// Path of one of `id`'s files.
    #[must_use]
    pub fn path_of(&self, id: &CaId, file: CaFile) -> PathBuf {
        self.dir_of(id).join(file.file_name())
    }

    /// Returns true if `id` has a committed certificate.
    #[must_use]
    pub fn exists(&self, id: &CaId) -> bool {
        self.path_of(id, CaFile::Certificate).is_file()
    }

    /// Acquires the exclusive lock of `id`, across processes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the lock is not free before `deadline`.
    pub fn acquire(&self, id: &CaId, deadline: Instant) -> Result<LockGuard<CaId>> {
        self.locks.acquire(id, deadline)
    }

    /// Creates a CA with a fresh key and a self-signed root.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for an empty common name or zero validity
    /// - [`Error::Conflict`] if the CA already exists
    /// - [`Error::Timeout`] if the deadline passes before anything is written
    pub fn create_ca(
        &self,
        id: &CaId,
        subject: &SubjectDn,
        passphrase: &Passphrase,
        validity_days: u32,
        deadline: Instant,
    ) -> Result<CaInfo> {
        if subject.common_name.trim().is_empty() {
            return Err(Error::Validation("common name is required".into()));
        }
        if validity_days == 0 {
            return Err(Error::Validation("validity days must be greater than zero".into()));
        }

        let guard = self.acquire(id, deadline)?;
        if self.exists(id) {
            return Err(Error::Conflict(id.to_string()));
        }

        let now = Utc::now();
        let validity = Validity {
            not_before: now - Duration::hours(1),
            not_after: now + Duration::days(i64::from(validity_days)),
        };
        let key = self.backend.generate_key_pair()?;
        let certificate = self.backend.self_sign(subject, validity, &key)?;
        let protected = self.protector.protect(&key, passphrase)?;
        drop(key);

        ensure_before(deadline, "create CA")?;
        ensure_dir(&self.dir_of(id))?;
        // certificate last: it is the commit point
        self.write_file(&guard, CaFile::Key, protected.as_bytes())?;
        self.write_index(&guard, &IssuedIndex::default())?;
        self.write_file(&guard, CaFile::Certificate, certificate.pem().as_bytes())?;

        info!(ca_id = %id, subject = %subject, not_after = %certificate.not_after(), "certificate authority created");
        Ok(CaInfo {
            id: id.clone(),
            subject_dn: certificate.subject().clone(),
            not_after: certificate.not_after(),
            serial: certificate.serial().to_string(),
        })
    }

    /// Loads a CA.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if its certificate or key is missing and
    /// [`Error::Crypto`] if the certificate is malformed. A malformed key is
    /// only detected by [`CaStore::unlock_key`], as [`Error::Auth`].
    pub fn get_ca(&self, id: &CaId) -> Result<CertificateAuthority> {
        let cert_bytes = fs::read(self.path_of(id, CaFile::Certificate))
            .map_err(|e| Error::from_read(format!("certificate authority '{id}'"), e))?;
        let key_bytes = fs::read(self.path_of(id, CaFile::Key))
            .map_err(|e| Error::from_read(format!("private key of certificate authority '{id}'"), e))?;

        Ok(CertificateAuthority {
            id: id.clone(),
            certificate: self.backend.parse_certificate(&cert_bytes)?,
            protected_key: ProtectedKey::from_stored(&key_bytes),
        })
    }

    /// Loads only the root certificate of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it is missing and [`Error::Crypto`] if
    /// it does not parse.
    pub fn certificate(&self, id: &CaId) -> Result<Certificate> {
        let bytes = self.read_file(id, CaFile::Certificate)?;
        self.backend.parse_certificate(&bytes)
    }

    /// Decrypts the CA key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the passphrase does not unlock it.
    pub fn unlock_key(&self, ca: &CertificateAuthority, passphrase: &Passphrase) -> Result<PrivateKey> {
        self.protector.unlock(ca.protected_key(), passphrase).inspect_err(|_| {
            warn!(ca_id = %ca.id(), "CA key unlock rejected");
        })
    }

    /// Lists every CA with a committed, parseable certificate, sorted by id.
    ///
    /// Takes no lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the CA directory cannot be read.
    pub fn list_cas(&self) -> Result<Vec<CaInfo>> {
        let mut ids = Vec::new();
        let default = CaId::default_ca();
        if self.exists(&default) {
            ids.push(default);
        }

        let entries = match fs::read_dir(&self.ca_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(format!("reading {}", self.ca_dir.display()), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading CA directory entry", e))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if name == DEFAULT_CA_ID {
                continue;
            }
            if let Ok(id) = CaId::new(name) {
                if self.exists(&id) {
                    ids.push(id);
                }
            }
        }
        ids.sort();

        let mut cas = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(bytes) = read_optional(&self.path_of(&id, CaFile::Certificate))? else {
                continue;
            };
            match extract_ca_info(&bytes) {
                Ok(meta) => cas.push(CaInfo {
                    id,
                    subject_dn: meta.subject_dn,
                    not_after: meta.not_after,
                    serial: meta.serial,
                }),
                Err(e) => warn!(ca_id = %id, error = %e, "skipping unreadable CA certificate"),
            }
        }
        Ok(cas)
    }

    /// Reports which files of `id` are present.
    #[must_use]
    pub fn status(&self, id: &CaId) -> CaStatus {
        let key_exists = self.path_of(id, CaFile::Key).is_file();
        let cert_exists = self.path_of(id, CaFile::Certificate).is_file();
        CaStatus {
            key_exists,
            cert_exists,
            exists: key_exists && cert_exists,
        }
    }

    /// Reads one of `id`'s files exactly as stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file does not exist.
    pub fn read_file(&self, id: &CaId, file: CaFile) -> Result<Vec<u8>> {
        fs::read(self.path_of(id, file))
            .map_err(|e| Error::from_read(format!("{} of certificate authority '{id}'", file.file_name()), e))
    }

    /// Atomically replaces one of the locked CA's files.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    pub fn write_file(&self, guard: &LockGuard<CaId>, file: CaFile, contents: &[u8]) -> Result<()> {
        let id = guard.key();
        ensure_dir(&self.dir_of(id))?;
        atomic_write(&self.path_of(id, file), contents, file.mode())
    }

    /// Replaces several of the locked CA's files together, in the given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any write fails; no file is changed then.
    pub fn write_set(&self, guard: &LockGuard<CaId>, files: &[(CaFile, &[u8])]) -> Result<()> {
        let id = guard.key();
        ensure_dir(&self.dir_of(id))?;
        let paths: Vec<PathBuf> = files.iter().map(|(file, _)| self.path_of(id, *file)).collect();
        let set: Vec<(&Path, &[u8], FileMode)> = files
            .iter()
            .zip(&paths)
            .map(|((file, contents), path)| (path.as_path(), *contents, file.mode()))
            .collect();
        atomic_write_all(&set)
    }

    /// Returns the last allocated serial; zero if none was ever allocated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the counter file is corrupt.
    pub fn read_counter(&self, id: &CaId) -> Result<Serial> {
        match read_optional(&self.path_of(id, CaFile::Serial))? {
            None => Ok(Serial(0)),
            Some(bytes) => Serial::parse_hex(&String::from_utf8_lossy(&bytes)),
        }
    }

    /// Reads the issued-serial log of `id`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the log cannot be read or parsed.
    pub fn issued_index(&self, id: &CaId) -> Result<IssuedIndex> {
        let path = self.dir_of(id).join(ISSUED_INDEX_FILE);
        match read_optional(&path)? {
            None => Ok(IssuedIndex::default()),
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::io(
                    format!("parsing {}", path.display()),
                    std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                )
            }),
        }
    }

    fn write_index(&self, guard: &LockGuard<CaId>, index: &IssuedIndex) -> Result<()> {
        let json = serde_json::to_vec_pretty(index)
            .map_err(|e| Error::io("encoding issued serial log", std::io::Error::other(e)))?;
        atomic_write(
            &self.dir_of(guard.key()).join(ISSUED_INDEX_FILE),
            &json,
            FileMode::Public,
        )
    }

    /// Allocates the next serial of the locked CA for `hostname`.
    ///
    /// The allocation is logged as pending and the counter advanced before
    /// the serial is returned. The counter never moves backwards, so a serial
    /// is never handed out twice, even when the certificate is never written.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if either file cannot be persisted.
    pub fn allocate_serial(&self, guard: &LockGuard<CaId>, hostname: &Hostname) -> Result<Serial> {
        let id = guard.key();
        let counter = self.read_counter(id)?;
        let mut index = self.issued_index(id)?;

        let mut last = counter;
        if let Some(max) = index.max_serial() {
            if max > counter {
                warn!(ca_id = %id, counter = %counter, max_issued = %max, "serial counter behind issued log, skipping ahead");
                last = max;
            }
        }
        let serial = last.next();
        if serial == last {
            return Err(Error::Validation(format!("serial space of '{id}' is exhausted")));
        }

        index.entries.push(IssuedEntry {
            serial,
            hostname: hostname.clone(),
            state: SerialState::Pending,
            allocated_at: Utc::now(),
        });
        self.write_index(guard, &index)?;
        self.write_file(guard, CaFile::Serial, format!("{serial}\n").as_bytes())?;

        debug!(ca_id = %id, hostname = %hostname, serial = %serial, "serial allocated");
        Ok(serial)
    }

    /// Records the outcome of an allocation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the log cannot be rewritten.
    pub fn finish_serial(&self, guard: &LockGuard<CaId>, serial: Serial, state: SerialState) -> Result<()> {
        let mut index = self.issued_index(guard.key())?;
        if index.set_state(serial, state) {
            self.write_index(guard, &index)?;
        }
        Ok(())
    }

    /// Resolves allocations left pending by an interrupted signing run.
    ///
    /// `is_persisted` decides whether the certificate of an entry made it to
    /// disk. Returns the number of entries resolved.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the log cannot be read or rewritten.
    pub fn reconcile_pending(
        &self,
        guard: &LockGuard<CaId>,
        is_persisted: impl Fn(&IssuedEntry) -> bool,
    ) -> Result<usize> {
        let id = guard.key();
        let mut index = self.issued_index(id)?;
        let mut resolved = 0;
        for entry in &mut index.entries {
            if entry.state != SerialState::Pending {
                continue;
            }
            entry.state = if is_persisted(entry) {
                SerialState::Committed
            } else {
                SerialState::Abandoned
            };
            warn!(ca_id = %id, serial = %entry.serial, hostname = %entry.hostname, state = ?entry.state, "resolved interrupted serial allocation");
            resolved += 1;
        }
        if resolved > 0 {
            self.write_index(guard, &index)?;
        }
        Ok(resolved)
    }
}
