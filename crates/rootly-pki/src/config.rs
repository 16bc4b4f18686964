//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::protect::KdfParams;

/// Default directory holding CA material.
pub const DEFAULT_CA_DIR: &str = "/app/ca";

/// Default directory holding leaf certificates.
pub const DEFAULT_CERTS_DIR: &str = "/app/certs";

/// Validity of a new CA when none is given.
pub const DEFAULT_CA_VALIDITY_DAYS: u32 = 3650;

/// Validity of a signed certificate when none is given.
pub const DEFAULT_CERT_VALIDITY_DAYS: u32 = 825;

/// How long an operation may wait for a busy CA or hostname.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the PKI engine.
#[derive(Debug, Clone)]
pub struct PkiConfig {
    /// Directory of the default CA and parent of named CA directories.
    pub ca_dir: PathBuf,
    /// Directory of issued leaf certificates.
    pub certs_dir: PathBuf,
    /// Validity used when a CA is created without one.
    pub default_ca_validity_days: u32,
    /// Validity used when a certificate is signed without one.
    pub default_cert_validity_days: u32,
    /// Timeout applied when a caller does not supply one.
    pub lock_timeout: Duration,
    /// Argon2id parameters for newly protected keys.
    pub kdf: KdfParams,
}

impl Default for PkiConfig {
    fn default() -> Self {
        Self {
            ca_dir: PathBuf::from(DEFAULT_CA_DIR),
            certs_dir: PathBuf::from(DEFAULT_CERTS_DIR),
            default_ca_validity_days: DEFAULT_CA_VALIDITY_DAYS,
            default_cert_validity_days: DEFAULT_CERT_VALIDITY_DAYS,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            kdf: KdfParams::default(),
        }
    }
}

impl PkiConfig {
    /// Create a configuration rooted at the given directories.
    #[must_use]
    pub fn new(ca_dir: impl Into<PathBuf>, certs_dir: impl Into<PathBuf>) -> Self {
        Self {
            ca_dir: ca_dir.into(),
            certs_dir: certs_dir.into(),
            ..Self::default()
        }
    }

    /// Set the default CA validity.
    #[must_use]
    pub const fn with_default_ca_validity_days(mut self, days: u32) -> Self {
        self.default_ca_validity_days = days;
        self
    }

    /// Set the default leaf validity.
    #[must_use]
    pub const fn with_default_cert_validity_days(mut self, days: u32) -> Self {
        self.default_cert_validity_days = days;
        self
    }

    /// Set the default operation timeout.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the key-derivation parameters.
    #[must_use]
    pub const fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PkiConfig::default();

        assert_eq!(config.ca_dir, PathBuf::from("/app/ca"));
        assert_eq!(config.certs_dir, PathBuf::from("/app/certs"));
        assert_eq!(config.default_ca_validity_days, 3650);
        assert_eq!(config.default_cert_validity_days, 825);
        assert_eq!(config.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.kdf, KdfParams::default());
    }

    #[test]
    fn test_config_builder() {
        let config = PkiConfig::new("/tmp/ca", "/tmp/certs")
            .with_default_ca_validity_days(365)
            .with_default_cert_validity_days(30)
            .with_lock_timeout(Duration::from_secs(5))
            .with_kdf(KdfParams::insecure_fast());

        assert_eq!(config.ca_dir, PathBuf::from("/tmp/ca"));
        assert_eq!(config.default_ca_validity_days, 365);
        assert_eq!(config.default_cert_validity_days, 30);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.kdf, KdfParams::insecure_fast());
    }
}
