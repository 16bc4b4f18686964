//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use rootly_pki::{CaInfo, CaStatus, CertListing, CreateCaResponse, SignResponse, UploadReport};
use serde::Serialize;

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Get the current format.
    #[must_use]
    pub const fn format(&self) -> Format {
        self.format
    }

    /// Check if JSON format is selected.
    #[must_use]
    pub const fn is_json(&self) -> bool {
        matches!(self.format, Format::Json)
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => {
                value.write_table(writer)?;
            }
        }
        Ok(())
    }

    /// Write a serializable value to a string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_string<T>(&self, value: &T) -> Result<String, CliError>
    where
        T: Serialize + TableDisplay,
    {
        let mut buf = Vec::new();
        self.write(&mut buf, value)?;
        String::from_utf8(buf).map_err(|e| CliError::Format(format!("UTF-8 error: {e}")))
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// Certificate authorities for listing.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct CaList {
    /// Listed CAs.
    pub cas: Vec<CaInfo>,
}

impl TableDisplay for CaList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.cas.is_empty() {
            writeln!(writer, "No certificate authorities")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<20}  {:<28}  {:<16}  {:<10}",
            "ID", "COMMON NAME", "ORGANIZATION", "NOT AFTER"
        )?;
        writeln!(writer, "{}", "─".repeat(80))?;
        for ca in &self.cas {
            writeln!(
                writer,
                "{:<20}  {:<28}  {:<16}  {}",
                truncate(ca.id.as_str(), 20),
                truncate(&ca.subject_dn.common_name, 28),
                truncate(&ca.subject_dn.organization, 16),
                ca.not_after.format("%Y-%m-%d")
            )?;
        }

        writeln!(writer)?;
        writeln!(writer, "Total: {} CA(s)", self.cas.len())?;
        Ok(())
    }
}

/// Leaf certificates for listing.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct CertList {
    /// Listed certificates.
    pub certs: Vec<CertListing>,
}

impl TableDisplay for CertList {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.certs.is_empty() {
            writeln!(writer, "No certificates")?;
            return Ok(());
        }

        writeln!(
            writer,
            "{:<32}  {:<4}  {:<9}  {:<10}  {:<24}",
            "HOSTNAME", "KEY", "FULLCHAIN", "NOT AFTER", "ISSUER"
        )?;
        writeln!(writer, "{}", "─".repeat(87))?;
        for cert in &self.certs {
            let (not_after, issuer) = cert.metadata.as_ref().map_or_else(
                || ("-".to_string(), "-".to_string()),
                |m| {
                    (
                        m.not_after.format("%Y-%m-%d").to_string(),
                        m.issuer_subject_dn.common_name.clone(),
                    )
                },
            );
            writeln!(
                writer,
                "{:<32}  {:<4}  {:<9}  {:<10}  {}",
                truncate(&cert.hostname, 32),
                yes_no(cert.key_exists),
                yes_no(cert.fullchain_exists),
                not_after,
                truncate(&issuer, 24)
            )?;
        }

        writeln!(writer)?;
        writeln!(writer, "Total: {} certificate(s)", self.certs.len())?;
        Ok(())
    }
}

/// Presence of a CA's files.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaStatusView {
    /// CA id.
    pub id: String,
    /// File presence.
    #[serde(flatten)]
    pub status: CaStatus,
}

impl TableDisplay for CaStatusView {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "CA Status: {}", self.id)?;
        writeln!(writer, "══════════════════════════════════")?;
        writeln!(writer, "Key:          {}", present(self.status.key_exists))?;
        writeln!(writer, "Certificate:  {}", present(self.status.cert_exists))?;
        writeln!(writer, "Ready:        {}", yes_no(self.status.exists))?;
        Ok(())
    }
}

impl TableDisplay for CreateCaResponse {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "✓ {}", self.message)?;
        Ok(())
    }
}

impl TableDisplay for SignResponse {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "✓ {}", self.message)?;
        Ok(())
    }
}

impl TableDisplay for UploadReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        for name in &self.accepted {
            writeln!(writer, "✓ {name}")?;
        }
        for rejection in &self.rejected {
            writeln!(writer, "✗ {}: {}", rejection.filename, rejection.reason)?;
        }
        writeln!(writer)?;
        writeln!(
            writer,
            "Accepted: {}  Rejected: {}",
            self.accepted.len(),
            self.rejected.len()
        )?;
        Ok(())
    }
}

/// A simple message response.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// The message text.
    pub message: String,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl TableDisplay for Message {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "✓ {}", self.message)?;
        Ok(())
    }
}

const fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

const fn present(value: bool) -> &'static str {
    if value { "present" } else { "missing" }
}

/// Truncate a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len > 3 {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{head}...")
    } else {
        s.chars().take(max_len).collect()
    }
}
