//! Command implementations.
//!
//! Each command borrows the engine and writes its result through an
//! [`OutputFormat`]. Exports write raw bytes instead.

use std::io::Write;
use std::path::Path;

use rootly_pki::fs::{FileMode, atomic_write};
use rootly_pki::{ArtifactKind, ArtifactScope, CaId, CreateCaRequest, Passphrase, Pki, SignRequest, UploadRequest};
use tracing::debug;

use crate::cli::{CaCommands, CertCommands, ExportArgs, UploadArgs};
use crate::error::CliError;
use crate::output::{CaList, CaStatusView, CertList, Message, OutputFormat};

/// `rootly ca ...`
#[derive(Debug)]
pub struct CaCommand<'a> {
    pki: &'a Pki,
}

impl<'a> CaCommand<'a> {
    /// Creates the command over `pki`.
    #[must_use]
    pub const fn new(pki: &'a Pki) -> Self {
        Self { pki }
    }

    /// Runs a CA subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation or writing its output fails.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        command: &CaCommands,
    ) -> Result<(), CliError> {
        match command {
            CaCommands::Create(args) => {
                let request = CreateCaRequest::builder()
                    .id(args.id.as_str())
                    .common_name(args.common_name.as_str())
                    .organization(args.organization.as_str())
                    .organizational_unit(args.organizational_unit.as_str())
                    .validity_days(args.days)
                    .passphrase(args.passphrase.as_str())
                    .build()?;
                let response = self.pki.create_ca(&request)?;
                format.write(writer, &response)
            }
            CaCommands::List => {
                let list = CaList {
                    cas: self.pki.list_cas()?,
                };
                format.write(writer, &list)
            }
            CaCommands::Status { id } => {
                let view = CaStatusView {
                    id: id.clone(),
                    status: self.pki.ca_status_for(id)?,
                };
                format.write(writer, &view)
            }
            CaCommands::Export(args) => export(self.pki, writer, format, ArtifactScope::Ca, args),
        }
    }
}

/// `rootly cert ...`
#[derive(Debug)]
pub struct CertCommand<'a> {
    pki: &'a Pki,
}

impl<'a> CertCommand<'a> {
    /// Creates the command over `pki`.
    #[must_use]
    pub const fn new(pki: &'a Pki) -> Self {
        Self { pki }
    }

    /// Runs a certificate subcommand.
    ///
    /// # Errors
    ///
    /// Returns an error if the operation or writing its output fails.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        command: &CertCommands,
    ) -> Result<(), CliError> {
        match command {
            CertCommands::Sign(args) => {
                let request = SignRequest::builder(args.hostname.as_str())
                    .ca(args.ca.as_str())
                    .validity_days(args.days)
                    .passphrase(args.passphrase.as_str())
                    .build()?;
                let response = self.pki.sign_certificate(&request)?;
                format.write(writer, &response)
            }
            CertCommands::List => {
                let list = CertList {
                    certs: self.pki.list_certificates()?,
                };
                format.write(writer, &list)
            }
            CertCommands::Export(args) => export(self.pki, writer, format, ArtifactScope::Cert, args),
        }
    }
}

/// `rootly upload ...`
#[derive(Debug)]
pub struct UploadCommand<'a> {
    pki: &'a Pki,
}

impl<'a> UploadCommand<'a> {
    /// Creates the command over `pki`.
    #[must_use]
    pub const fn new(pki: &'a Pki) -> Self {
        Self { pki }
    }

    /// Reads the given files and uploads them as one batch.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or the upload fails as a
    /// whole. Per-file rejections are part of the printed report.
    pub fn execute<W: Write>(
        &self,
        writer: &mut W,
        format: &OutputFormat,
        args: &UploadArgs,
    ) -> Result<(), CliError> {
        let mut request = UploadRequest::new(args.scope.into()).with_ca(CaId::new(args.ca.as_str())?);
        if let Some(passphrase) = &args.passphrase {
            request = request.with_passphrase(Passphrase::new(passphrase.as_str())?);
        }
        for path in &args.files {
            let filename = file_name(path)?;
            let bytes = std::fs::read(path)?;
            debug!(path = %path.display(), len = bytes.len(), "read upload file");
            request = request.with_file(filename, bytes);
        }

        let report = self.pki.upload(&request)?;
        format.write(writer, &report)
    }
}

fn export<W: Write>(
    pki: &Pki,
    writer: &mut W,
    format: &OutputFormat,
    scope: ArtifactScope,
    args: &ExportArgs,
) -> Result<(), CliError> {
    let kind = ArtifactKind::from(args.kind);
    let bytes = pki.export_artifact(scope, &args.id, kind)?;
    match &args.out {
        None => {
            writer.write_all(&bytes)?;
            writer.flush()?;
            Ok(())
        }
        Some(path) => {
            let mode = if kind == ArtifactKind::Key {
                FileMode::Private
            } else {
                FileMode::Public
            };
            atomic_write(path, &bytes, mode)?;
            format.write(
                writer,
                &Message::new(format!("Wrote {} bytes to {}", bytes.len(), path.display())),
            )
        }
    }
}

fn file_name(path: &Path) -> Result<String, CliError> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .ok_or_else(|| CliError::InvalidArgument(format!("not a file path: {}", path.display())))
}
