//! Filesystem-backed certificate authority and certificate lifecycle engine.
#![forbid(unsafe_code)]
//!
//! `rootly-pki` creates named certificate authorities, issues leaf TLS
//! certificates from them, and ingests or hands out certificate material.
//! All state lives on disk; every write is staged in a hidden temporary file
//! and renamed into place, so readers only ever see complete files.
//!
//! # Overview
//!
//! - CA private keys are stored encrypted (Argon2id + ChaCha20-Poly1305) and
//!   only decrypted for the duration of a signing run.
//! - Each CA keeps an openssl-compatible serial counter plus a log of issued
//!   serials. Concurrent signing against one CA is serialized by a per-CA
//!   lock, so serials are strictly increasing and never reused.
//! - Uploaded keys and certificates are cross-checked before they are stored.
//!
//! # Example
//!
//! ```
//! use rootly_pki::{CreateCaRequest, KdfParams, Pki, PkiConfig, SignRequest};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = PkiConfig::new(dir.path().join("ca"), dir.path().join("certs"))
//!     .with_kdf(KdfParams::insecure_fast());
//! let pki = Pki::new(config);
//!
//! let request = CreateCaRequest::builder()
//!     .id("prod")
//!     .common_name("Prod Root")
//!     .passphrase("pw1")
//!     .build()
//!     .unwrap();
//! pki.create_ca(&request).unwrap();
//!
//! let signed = pki
//!     .sign_certificate(
//!         &SignRequest::builder("api.acme.local")
//!             .ca("prod")
//!             .passphrase("pw1")
//!             .validity_days(365)
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//! assert_eq!(signed.serial, "01");
//! ```
//!
//! # Modules
//!
//! - [`service`] - the [`Pki`] facade
//! - [`ca_store`] - CA creation, lookup and serial bookkeeping
//! - [`cert_store`] - leaf certificate files
//! - [`signing`] - leaf issuance
//! - [`upload`] - validation of uploaded material
//! - [`export`] - read-only artifact access
//! - [`protect`] - passphrase protection of CA keys
//! - [`metadata`] - certificate field extraction
//! - [`validation`] - certificate and key checks
//! - [`backend`] - the cryptographic backend
//! - [`types`] - identifiers and certificate types
//! - [`error`] - error types

pub mod backend;
pub mod ca_store;
pub mod cert_store;
pub mod config;
pub mod error;
pub mod export;
pub mod fs;
pub mod lock;
pub mod metadata;
pub mod protect;
pub mod service;
pub mod signing;
pub mod types;
pub mod upload;
pub mod validation;

pub use backend::{CryptoBackend, LeafParams, RcgenBackend};
pub use ca_store::{CaInfo, CaStatus, CaStore, CertificateAuthority, IssuedIndex};
pub use cert_store::{CertListing, CertStore, LeafBundle};
pub use config::PkiConfig;
pub use error::{Error, ErrorKind, Result};
pub use export::ExportService;
pub use metadata::{CaMetadata, CertMetadata, extract_ca_info, extract_cert_info};
pub use protect::{KdfParams, KeyProtector, ProtectedKey};
pub use service::{CreateCaRequest, CreateCaResponse, Pki, SignResponse};
pub use signing::{SignRequest, SignedCertificate, SigningEngine};
pub use types::{
    ArtifactKind, ArtifactScope, CaId, Certificate, Hostname, Passphrase, PrivateKey, Serial,
    SubjectDn, Validity,
};
pub use upload::{UploadFile, UploadReport, UploadRequest, UploadValidator};
pub use validation::{
    is_expired, is_not_yet_valid, key_matches_certificate, validate_certificate, validate_chain,
};
