//! Filesystem-backed leaf certificate store.
//!
//! Leaf material sits flat in the certificates directory:
//! `{hostname}.crt`, `{hostname}.key` and `{hostname}_fullchain.crt`.
//! Re-issuing a hostname overwrites the previous set. Writes for one hostname
//! are serialized by a per-hostname lock (backed by `.{hostname}.lock` so
//! other processes see it too) and always commit `{hostname}.crt` last, so
//! listing (which keys off `.crt` files) never reports a set whose key or
//! chain is still being written. A set that fails partway is rolled back.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::fs::{FileMode, atomic_write, atomic_write_all, ensure_dir, is_temp_file, read_optional};
use crate::lock::{LockGuard, LockTable};
use crate::metadata::{CertMetadata, extract_cert_info};
use crate::types::{Certificate, FULLCHAIN_SUFFIX, Hostname, PrivateKey, Serial};

/// A file of a leaf certificate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafFile {
    /// `{hostname}.crt`.
    Certificate,
    /// `{hostname}.key`.
    Key,
    /// `{hostname}_fullchain.crt`.
    Fullchain,
}

impl LeafFile {
    /// Returns the file name used for `hostname`.
    #[must_use]
    pub fn file_name(self, hostname: &Hostname) -> String {
        match self {
            Self::Certificate => format!("{hostname}.crt"),
            Self::Key => format!("{hostname}.key"),
            Self::Fullchain => format!("{hostname}{FULLCHAIN_SUFFIX}.crt"),
        }
    }

    const fn mode(self) -> FileMode {
        match self {
            Self::Key => FileMode::Private,
            Self::Certificate | Self::Fullchain => FileMode::Public,
        }
    }
}

/// Listing entry for a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertListing {
    /// Hostname (file stem).
    pub hostname: String,
    /// `{hostname}.key` is present.
    pub key_exists: bool,
    /// `{hostname}_fullchain.crt` is present.
    pub fullchain_exists: bool,
    /// Parsed certificate data, absent if the certificate does not parse.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CertMetadata>,
}

/// A freshly issued leaf certificate with its key and issuer.
#[derive(Debug, Clone)]
pub struct LeafBundle {
    /// Subject hostname.
    pub hostname: Hostname,
    /// Leaf certificate.
    pub certificate: Certificate,
    /// Leaf private key (stored unencrypted).
    pub key: PrivateKey,
    /// Issuer certificate appended to the fullchain.
    pub issuer: Certificate,
}

impl LeafBundle {
    /// Returns the leaf followed by its issuer, PEM-encoded.
    #[must_use]
    pub fn fullchain_pem(&self) -> String {
        let mut chain = self.certificate.pem();
        chain.push_str(&self.issuer.pem());
        chain
    }
}

/// Owner of all leaf certificate files.
#[derive(Debug)]
pub struct CertStore {
    certs_dir: PathBuf,
    locks: LockTable<Hostname>,
}

impl CertStore {
    /// Creates a store rooted at `certs_dir`.
    #[must_use]
    pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
        let certs_dir: PathBuf = certs_dir.into();
        let lock_dir = certs_dir.clone();
        Self {
            certs_dir,
            locks: LockTable::file_backed(move |hostname: &Hostname| {
                lock_dir.join(format!(".{hostname}.lock"))
            }),
        }
    }

    /// Returns the certificates directory.
    #[must_use]
    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Path of one file of `hostname`'s set.
    #[must_use]
    pub fn path_of(&self, hostname: &Hostname, file: LeafFile) -> PathBuf {
        self.certs_dir.join(file.file_name(hostname))
    }

    /// Acquires the write lock of `hostname`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] if the lock is not free before `deadline`.
    pub fn acquire(&self, hostname: &Hostname, deadline: Instant) -> Result<LockGuard<Hostname>> {
        self.locks.acquire(hostname, deadline)
    }

    /// Writes a complete set: key, then fullchain, then the certificate.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any write fails. The previous set, if any,
    /// is then left in place unchanged.
    pub fn persist(&self, guard: &LockGuard<Hostname>, bundle: &LeafBundle) -> Result<()> {
        let key_pem = bundle.key.pem();
        let fullchain = bundle.fullchain_pem();
        let cert_pem = bundle.certificate.pem();
        self.write_set(
            guard,
            &[
                (LeafFile::Key, key_pem.as_bytes()),
                (LeafFile::Fullchain, fullchain.as_bytes()),
                (LeafFile::Certificate, cert_pem.as_bytes()),
            ],
        )?;
        info!(hostname = %bundle.hostname, serial = bundle.certificate.serial(), "certificate persisted");
        Ok(())
    }

    /// Replaces several files of the locked hostname's set together, in the
    /// given order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if any write fails; no file is changed then.
    pub fn write_set(&self, guard: &LockGuard<Hostname>, files: &[(LeafFile, &[u8])]) -> Result<()> {
        ensure_dir(&self.certs_dir)?;
        let paths: Vec<PathBuf> = files
            .iter()
            .map(|(file, _)| self.path_of(guard.key(), *file))
            .collect();
        let set: Vec<(&Path, &[u8], FileMode)> = files
            .iter()
            .zip(&paths)
            .map(|((file, contents), path)| (path.as_path(), *contents, file.mode()))
            .collect();
        atomic_write_all(&set)
    }

    /// Atomically replaces one file of the locked hostname's set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the write fails.
    pub fn write_file(&self, guard: &LockGuard<Hostname>, file: LeafFile, contents: &[u8]) -> Result<()> {
        ensure_dir(&self.certs_dir)?;
        atomic_write(&self.path_of(guard.key(), file), contents, file.mode())
    }

    /// Reads one file exactly as stored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the file does not exist.
    pub fn read_file(&self, hostname: &Hostname, file: LeafFile) -> Result<Vec<u8>> {
        let name = file.file_name(hostname);
        fs::read(self.certs_dir.join(&name)).map_err(|e| Error::from_read(name, e))
    }

    /// Loads the committed certificate of `hostname`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on read failure and [`Error::Crypto`] if the
    /// stored certificate does not parse.
    pub fn certificate(&self, hostname: &Hostname) -> Result<Option<Certificate>> {
        read_optional(&self.path_of(hostname, LeafFile::Certificate))?
            .map(|bytes| {
                if crate::backend::looks_like_pem(&bytes) {
                    Certificate::from_pem(&bytes)
                } else {
                    Certificate::from_der(&bytes)
                }
            })
            .transpose()
    }

    /// Returns true if `hostname` currently holds a certificate with `serial`.
    pub fn holds_serial(&self, hostname: &Hostname, serial: Serial) -> bool {
        match self.certificate(hostname) {
            Ok(Some(cert)) => cert.serial() == serial.to_string(),
            Ok(None) => false,
            Err(e) => {
                warn!(hostname = %hostname, error = %e, "stored certificate unreadable");
                false
            }
        }
    }

    /// Lists committed certificate sets, sorted by hostname.
    ///
    /// Takes no lock; temporary files and fullchains are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the directory cannot be read.
    pub fn list_certificates(&self) -> Result<Vec<CertListing>> {
        let entries = match fs::read_dir(&self.certs_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(format!("reading {}", self.certs_dir.display()), e));
            }
        };

        let mut hostnames = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io("reading certificate directory entry", e))?;
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if is_temp_file(&name) {
                continue;
            }
            let Some(stem) = name.strip_suffix(".crt") else {
                continue;
            };
            if let Ok(hostname) = Hostname::new(stem) {
                hostnames.push(hostname);
            }
        }
        hostnames.sort();

        let listings = hostnames
            .into_iter()
            .map(|hostname| {
                let metadata = read_optional(&self.path_of(&hostname, LeafFile::Certificate))
                    .ok()
                    .flatten()
                    .and_then(|bytes| extract_cert_info(&bytes).ok());
                CertListing {
                    key_exists: self.path_of(&hostname, LeafFile::Key).is_file(),
                    fullchain_exists: self.path_of(&hostname, LeafFile::Fullchain).is_file(),
                    hostname: hostname.to_string(),
                    metadata,
                }
            })
            .collect::<Vec<_>>();
        debug!(count = listings.len(), "listed certificates");
        Ok(listings)
    }
}
