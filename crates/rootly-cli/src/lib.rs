//! # rootly-cli
//!
//! Command-line front end for `rootly-pki`.
//!
//! Provides commands for:
//! - Creating, listing and exporting certificate authorities
//! - Signing, listing and exporting leaf certificates
//! - Uploading existing CA or certificate material
//!
//! Every command runs against the CA and certificate directories given by
//! `--ca-dir` / `--certs-dir` (or `ROOTLY_CA_DIR` / `ROOTLY_CERTS_DIR`).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;

pub use cli::{CaCommands, CertCommands, Cli, Commands, Format};
pub use error::CliError;
pub use output::OutputFormat;
