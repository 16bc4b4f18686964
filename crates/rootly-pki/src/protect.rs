//! Passphrase protection for CA private keys.
//!
//! A passphrase is stretched with Argon2id into a 256-bit key that seals the
//! PKCS#8 key bytes with ChaCha20-Poly1305. The blob records its own KDF
//! parameters and salt, and that header is authenticated as associated data.
//!
//! Binary layout, stored base64 inside a PEM block labelled
//! `ROOTLY ENCRYPTED PRIVATE KEY`:
//!
//! ```text
//! version(1) | m_cost(4, BE) | t_cost(4, BE) | p_cost(4, BE) | salt(16) | nonce(12) | ciphertext | tag(16)
//! ```

use std::sync::Arc;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::backend::CryptoBackend;
use crate::error::{Error, Result};
use crate::types::{Passphrase, PrivateKey, pem_blocks, pem_encode};

/// PEM label of a protected key.
pub const PROTECTED_KEY_LABEL: &str = "ROOTLY ENCRYPTED PRIVATE KEY";

/// Current blob format version.
pub const FORMAT_VERSION: u8 = 1;

/// Size of the derived key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the KDF salt in bytes.
pub const SALT_SIZE: usize = 16;

/// Size of the nonce in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

const HEADER_SIZE: usize = 1 + 4 + 4 + 4 + SALT_SIZE;

// Bounds applied to parameters read back from disk.
const MAX_M_COST_KIB: u32 = 1 << 20;
const MAX_T_COST: u32 = 16;
const MAX_P_COST: u32 = 16;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost_kib: u32,
    /// Number of passes.
    pub t_cost: u32,
    /// Degree of parallelism.
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost_kib: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    /// Minimal parameters for tests and throwaway dev setups. Never use for real keys.
    #[must_use]
    pub const fn insecure_fast() -> Self {
        Self {
            m_cost_kib: 8,
            t_cost: 1,
            p_cost: 1,
        }
    }

    fn within_bounds(self) -> bool {
        self.m_cost_kib <= MAX_M_COST_KIB
            && (1..=MAX_T_COST).contains(&self.t_cost)
            && (1..=MAX_P_COST).contains(&self.p_cost)
    }
}

/// A protected private key as stored in `root_ca.key`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtectedKey {
    armored: String,
}

impl ProtectedKey {
    /// Checks the structure of a stored blob without decrypting it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the bytes are not a protected key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Crypto("protected key is not valid UTF-8".into()))?;
        let blob = decode_blob(bytes)?;
        if blob.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE || blob[0] != FORMAT_VERSION {
            return Err(Error::Crypto("unrecognised protected key format".into()));
        }
        Ok(Self {
            armored: text.to_string(),
        })
    }

    /// Wraps the contents of `root_ca.key` without checking them.
    ///
    /// Structure is only examined by [`KeyProtector::unlock`], so a damaged
    /// file fails the same way as a wrong passphrase.
    #[must_use]
    pub fn from_stored(bytes: &[u8]) -> Self {
        Self {
            armored: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    /// Returns true if `bytes` carry the protected-key PEM label.
    #[must_use]
    pub fn is_protected(bytes: &[u8]) -> bool {
        bytes
            .windows(PROTECTED_KEY_LABEL.len())
            .any(|w| w == PROTECTED_KEY_LABEL.as_bytes())
    }

    /// Returns the armored bytes exactly as persisted.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.armored.as_bytes()
    }
}

impl std::fmt::Debug for ProtectedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectedKey")
            .field("len", &self.armored.len())
            .finish()
    }
}

/// Seals and unseals CA keys.
#[derive(Clone)]
pub struct KeyProtector {
    params: KdfParams,
    backend: Arc<dyn CryptoBackend>,
}

impl KeyProtector {
    /// Creates a protector using `params` for new blobs.
    #[must_use]
    pub fn new(params: KdfParams, backend: Arc<dyn CryptoBackend>) -> Self {
        Self { params, backend }
    }

    /// Encrypts `key` under `passphrase`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Crypto`] if the key is not a usable PKCS#8 key.
    pub fn protect(&self, key: &PrivateKey, passphrase: &Passphrase) -> Result<ProtectedKey> {
        self.backend.parse_key(key.der())?;

        let mut salt = [0u8; SALT_SIZE];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let mut header = Vec::with_capacity(HEADER_SIZE);
        header.push(FORMAT_VERSION);
        header.extend_from_slice(&self.params.m_cost_kib.to_be_bytes());
        header.extend_from_slice(&self.params.t_cost.to_be_bytes());
        header.extend_from_slice(&self.params.p_cost.to_be_bytes());
        header.extend_from_slice(&salt);

        let derived = derive_key(passphrase, &salt, self.params)
            .map_err(|e| Error::Crypto(format!("key derivation failed: {e}")))?;
        let cipher = ChaCha20Poly1305::new_from_slice(derived.as_slice())
            .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: key.der(),
                    aad: &header,
                },
            )
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut blob = header;
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);

        Ok(ProtectedKey {
            armored: pem_encode(PROTECTED_KEY_LABEL, &blob),
        })
    }

    /// Decrypts a protected key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] for a wrong passphrase and for any corrupt or
    /// unreadable blob alike.
    pub fn unlock(&self, protected: &ProtectedKey, passphrase: &Passphrase) -> Result<PrivateKey> {
        self.try_unlock(protected, passphrase)
            .ok_or_else(|| Error::Auth("incorrect passphrase or unreadable CA key".into()))
    }

    fn try_unlock(&self, protected: &ProtectedKey, passphrase: &Passphrase) -> Option<PrivateKey> {
        let blob = decode_blob(protected.as_bytes()).ok()?;
        if blob.len() < HEADER_SIZE + NONCE_SIZE + TAG_SIZE || blob[0] != FORMAT_VERSION {
            return None;
        }
        let (header, rest) = blob.split_at(HEADER_SIZE);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_SIZE);

        let params = KdfParams {
            m_cost_kib: read_u32(&header[1..5])?,
            t_cost: read_u32(&header[5..9])?,
            p_cost: read_u32(&header[9..13])?,
        };
        if !params.within_bounds() {
            return None;
        }

        let derived = derive_key(passphrase, &header[13..], params).ok()?;
        let cipher = ChaCha20Poly1305::new_from_slice(derived.as_slice()).ok()?;
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .ok()?;

        let key = PrivateKey::new(plaintext);
        self.backend.parse_key(key.der()).ok()
    }
}

impl std::fmt::Debug for KeyProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyProtector")
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn derive_key(
    passphrase: &Passphrase,
    salt: &[u8],
    params: KdfParams,
) -> std::result::Result<Zeroizing<[u8; KEY_SIZE]>, argon2::Error> {
    let argon_params = Params::new(
        params.m_cost_kib,
        params.t_cost,
        params.p_cost,
        Some(KEY_SIZE),
    )?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);
    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    argon2.hash_password_into(passphrase.expose(), salt, out.as_mut_slice())?;
    Ok(out)
}

fn decode_blob(bytes: &[u8]) -> Result<Vec<u8>> {
    pem_blocks(bytes)?
        .into_iter()
        .find(|(label, _)| label == PROTECTED_KEY_LABEL)
        .map(|(_, der)| der)
        .ok_or_else(|| Error::Crypto("no protected key block found".into()))
}

fn read_u32(bytes: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(bytes.try_into().ok()?))
}
