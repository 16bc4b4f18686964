//! CLI error types.

use rootly_pki::ErrorKind;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    /// The engine refused or failed the operation.
    #[error(transparent)]
    Pki(#[from] rootly_pki::Error),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Output formatting error.
    #[error("format error: {0}")]
    Format(String),

    /// Reading an input file or writing output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error.
    ///
    /// Scripts can tell "fix your input" (2), "wrong passphrase" (3),
    /// "not there" (4) and "already there" (5) apart from other failures.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidArgument(_) => 2,
            Self::Pki(e) => match e.kind() {
                ErrorKind::Validation => 2,
                ErrorKind::Auth => 3,
                ErrorKind::NotFound => 4,
                ErrorKind::Conflict => 5,
                ErrorKind::Timeout => 6,
                ErrorKind::Crypto | ErrorKind::Io => 1,
            },
            Self::Format(_) | Self::Io(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_error_display_invalid_argument() {
        let err = CliError::InvalidArgument("no files".into());
        assert_eq!(err.to_string(), "invalid argument: no files");
    }

    #[test]
    fn pki_errors_display_unchanged() {
        let err = CliError::from(rootly_pki::Error::Auth("wrong passphrase for CA 'prod'".into()));
        assert_eq!(err.to_string(), "authentication failed: wrong passphrase for CA 'prod'");
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn cli_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let cli_err = CliError::from(io_err);
        assert!(matches!(cli_err, CliError::Io(_)));
        assert_eq!(cli_err.exit_code(), 1);
    }
}
