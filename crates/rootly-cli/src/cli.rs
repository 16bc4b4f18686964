//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use rootly_pki::config::{
    DEFAULT_CA_DIR, DEFAULT_CA_VALIDITY_DAYS, DEFAULT_CERTS_DIR, DEFAULT_CERT_VALIDITY_DAYS,
    DEFAULT_LOCK_TIMEOUT,
};
use rootly_pki::service::{DEFAULT_COMMON_NAME, DEFAULT_ORGANIZATION, DEFAULT_ORGANIZATIONAL_UNIT};
use rootly_pki::{ArtifactKind, ArtifactScope};

/// rootly - certificate authority and certificate lifecycle management.
#[derive(Parser, Debug, Clone)]
#[command(name = "rootly")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory of the default CA and parent of named CA directories.
    #[arg(long, env = "ROOTLY_CA_DIR", default_value = DEFAULT_CA_DIR)]
    pub ca_dir: PathBuf,

    /// Directory of issued leaf certificates.
    #[arg(long, env = "ROOTLY_CERTS_DIR", default_value = DEFAULT_CERTS_DIR)]
    pub certs_dir: PathBuf,

    /// Seconds an operation may wait for a busy CA or hostname.
    #[arg(long, env = "ROOTLY_TIMEOUT", default_value_t = DEFAULT_LOCK_TIMEOUT.as_secs())]
    pub timeout: u64,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Certificate authority management.
    Ca {
        /// CA subcommand to execute.
        #[command(subcommand)]
        command: CaCommands,
    },

    /// Leaf certificate management.
    Cert {
        /// Certificate subcommand to execute.
        #[command(subcommand)]
        command: CertCommands,
    },

    /// Validate and store CA or certificate files.
    Upload(UploadArgs),
}

/// CA subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CaCommands {
    /// Create a certificate authority.
    Create(CreateCaArgs),

    /// List certificate authorities.
    List,

    /// Show which files of a CA are present.
    Status {
        /// CA id.
        #[arg(default_value = "default")]
        id: String,
    },

    /// Write a CA file to stdout or a path.
    Export(ExportArgs),
}

/// Certificate subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum CertCommands {
    /// Issue a certificate for a hostname.
    Sign(SignArgs),

    /// List issued certificates.
    List,

    /// Write a certificate file to stdout or a path.
    Export(ExportArgs),
}

/// Arguments for `ca create`.
#[derive(Args, Debug, Clone)]
pub struct CreateCaArgs {
    /// CA id.
    #[arg(default_value = "default")]
    pub id: String,

    /// Common name of the root certificate.
    #[arg(long, default_value = DEFAULT_COMMON_NAME)]
    pub common_name: String,

    /// Organization of the root certificate.
    #[arg(long, default_value = DEFAULT_ORGANIZATION)]
    pub organization: String,

    /// Organizational unit of the root certificate.
    #[arg(long, default_value = DEFAULT_ORGANIZATIONAL_UNIT)]
    pub organizational_unit: String,

    /// Validity in days.
    #[arg(long, default_value_t = DEFAULT_CA_VALIDITY_DAYS)]
    pub days: u32,

    /// Passphrase protecting the CA key.
    #[arg(long, env = "ROOTLY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,
}

/// Arguments for `cert sign`.
#[derive(Args, Debug, Clone)]
pub struct SignArgs {
    /// Hostname to issue for.
    pub hostname: String,

    /// Issuing CA id.
    #[arg(long, default_value = "default")]
    pub ca: String,

    /// Validity in days.
    #[arg(long, default_value_t = DEFAULT_CERT_VALIDITY_DAYS)]
    pub days: u32,

    /// Passphrase of the CA key.
    #[arg(long, env = "ROOTLY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: String,
}

/// Arguments for the export subcommands.
#[derive(Args, Debug, Clone)]
pub struct ExportArgs {
    /// CA id or hostname.
    pub id: String,

    /// Which file to export.
    #[arg(short, long, value_enum, default_value_t = KindArg::Certificate)]
    pub kind: KindArg,

    /// Write to this path instead of stdout.
    #[arg(short, long)]
    pub out: Option<PathBuf>,
}

/// Arguments for `upload`.
#[derive(Args, Debug, Clone)]
pub struct UploadArgs {
    /// Target scope.
    #[arg(value_enum)]
    pub scope: ScopeArg,

    /// Files to upload.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Target CA for the ca scope.
    #[arg(long, default_value = "default")]
    pub ca: String,

    /// Passphrase protecting (or unlocking) an uploaded CA key.
    #[arg(long, env = "ROOTLY_PASSPHRASE", hide_env_values = true)]
    pub passphrase: Option<String>,
}

/// Artifact scope on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    /// CA files.
    Ca,
    /// Leaf certificate files.
    Cert,
}

impl From<ScopeArg> for ArtifactScope {
    fn from(scope: ScopeArg) -> Self {
        match scope {
            ScopeArg::Ca => Self::Ca,
            ScopeArg::Cert => Self::Cert,
        }
    }
}

/// Artifact kind on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// The certificate.
    Certificate,
    /// The private key.
    Key,
    /// The certificate followed by its issuer.
    Fullchain,
}

impl From<KindArg> for ArtifactKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Certificate => Self::Certificate,
            KindArg::Key => Self::Key,
            KindArg::Fullchain => Self::Fullchain,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_help_does_not_panic() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_ca_list_defaults() {
        let cli = Cli::try_parse_from(["rootly", "ca", "list"]).unwrap();
        assert!(matches!(cli.command, Commands::Ca { command: CaCommands::List }));
        assert_eq!(cli.format, Format::Table);
        assert_eq!(cli.timeout, 30);
        assert!(!cli.log_json);
    }

    #[test]
    fn parse_ca_create() {
        let cli = Cli::try_parse_from([
            "rootly",
            "--ca-dir",
            "/tmp/ca",
            "ca",
            "create",
            "prod",
            "--common-name",
            "Prod Root",
            "--organization",
            "Acme",
            "--days",
            "3650",
            "--passphrase",
            "pw1",
        ])
        .unwrap();
        assert_eq!(cli.ca_dir, PathBuf::from("/tmp/ca"));
        match cli.command {
            Commands::Ca { command: CaCommands::Create(args) } => {
                assert_eq!(args.id, "prod");
                assert_eq!(args.common_name, "Prod Root");
                assert_eq!(args.organizational_unit, "IT");
                assert_eq!(args.days, 3650);
            }
            other => panic!("expected ca create, got {other:?}"),
        }
    }

    #[test]
    fn parse_cert_sign() {
        let cli = Cli::try_parse_from([
            "rootly", "-f", "json", "cert", "sign", "api.acme.local", "--ca", "prod",
            "--days", "365", "--passphrase", "pw1",
        ])
        .unwrap();
        assert_eq!(cli.format, Format::Json);
        match cli.command {
            Commands::Cert { command: CertCommands::Sign(args) } => {
                assert_eq!(args.hostname, "api.acme.local");
                assert_eq!(args.ca, "prod");
                assert_eq!(args.days, 365);
            }
            other => panic!("expected cert sign, got {other:?}"),
        }
    }

    #[test]
    fn parse_export_kind() {
        let cli = Cli::try_parse_from(["rootly", "cert", "export", "web", "--kind", "fullchain"]).unwrap();
        match cli.command {
            Commands::Cert { command: CertCommands::Export(args) } => {
                assert_eq!(ArtifactKind::from(args.kind), ArtifactKind::Fullchain);
                assert!(args.out.is_none());
            }
            other => panic!("expected cert export, got {other:?}"),
        }
    }

    #[test]
    fn upload_requires_files() {
        assert!(Cli::try_parse_from(["rootly", "upload", "cert"]).is_err());
        let cli = Cli::try_parse_from(["rootly", "upload", "ca", "a.crt", "a.key"]).unwrap();
        match cli.command {
            Commands::Upload(args) => {
                assert_eq!(ArtifactScope::from(args.scope), ArtifactScope::Ca);
                assert_eq!(args.files.len(), 2);
            }
            other => panic!("expected upload, got {other:?}"),
        }
    }
}
