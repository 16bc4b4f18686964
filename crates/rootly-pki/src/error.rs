//! PKI error types.

use serde::Serialize;
use thiserror::Error;

/// Result type for PKI operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Machine-distinguishable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed identifier, hostname, or missing required field.
    Validation,
    /// The CA id already exists.
    Conflict,
    /// Unknown CA, certificate, or file.
    NotFound,
    /// Wrong passphrase (or an unreadable protected key).
    Auth,
    /// Malformed key or certificate encoding, or a chain that does not verify.
    Crypto,
    /// Disk failure or permission problem.
    Io,
    /// The caller's deadline passed before any mutation began.
    Timeout,
}

impl ErrorKind {
    /// Returns the stable string form of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::NotFound => "not_found",
            Self::Auth => "auth",
            Self::Crypto => "crypto",
            Self::Io => "io",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// PKI error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// Input failed validation before anything was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A CA with this id already exists.
    #[error("certificate authority already exists: {0}")]
    Conflict(String),

    /// The requested CA, certificate or file does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The passphrase did not unlock the CA key.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Key or certificate material is malformed, or signing failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Filesystem failure.
    #[error("io error while {context}: {source}")]
    Io {
        /// What the engine was doing.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The operation's deadline expired before it started mutating state.
    #[error("operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Returns the kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Auth(_) => ErrorKind::Auth,
            Self::Crypto(_) => ErrorKind::Crypto,
            Self::Io { .. } => ErrorKind::Io,
            Self::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Wraps an I/O error with a short description of the failed step.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Maps a "file not found" I/O error to [`Error::NotFound`].
    pub(crate) fn from_read(what: impl Into<String>, source: std::io::Error) -> Self {
        let what = what.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(what)
        } else {
            Self::io(format!("reading {what}"), source)
        }
    }
}
