//! Result reporter
//!
//! Serializes the output vector to a byte transport, one element per
//! newline-terminated record, in declaration order. Every write blocks and
//! the transport is flushed after each report.

use crate::config::ReportFormat;
use crate::error::{ErrorKind, Result};
use std::io::Write;
use tracing::{debug, error};

/// Writes results and fatal errors to a transport
#[derive(Debug)]
pub struct ResultReporter<W: Write> {
    transport: W,
    format: ReportFormat,
}

impl<W: Write> ResultReporter<W> {
    /// Create a reporter over `transport`
    pub const fn new(transport: W, format: ReportFormat) -> Self {
        Self { transport, format }
    }

    /// Emit every element of `output`
    ///
    /// # Errors
    ///
    /// Returns `Io` if the transport fails.
    pub fn report(&mut self, output: &[f32]) -> Result<()> {
        for &value in output {
            match self.format {
                ReportFormat::Decimal { precision } => {
                    writeln!(self.transport, "{value:.precision$}")?;
                }
                ReportFormat::RawByte => {
                    // Saturating: negatives and NaN become 0, values above 255 become 255
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let byte = value as u8;
                    self.transport.write_all(&[byte, b'\n'])?;
                }
            }
        }
        self.transport.flush()?;
        debug!("Reported {} elements", output.len());
        Ok(())
    }

    /// Emit the kind of a fatal error
    ///
    /// # Errors
    ///
    /// Returns `Io` if the transport fails.
    pub fn report_error(&mut self, kind: ErrorKind) -> Result<()> {
        error!("Run halted: {kind}");
        writeln!(self.transport, "error: {kind}")?;
        self.transport.flush()?;
        Ok(())
    }

    /// Borrow the transport
    pub const fn transport(&self) -> &W {
        &self.transport
    }

    /// Give the transport back
    pub fn into_inner(self) -> W {
        self.transport
    }
}

/// Write `sample` as rows of `side` right-aligned byte values
///
/// A trailing partial row is written as-is.
///
/// # Errors
///
/// Returns `Io` if the writer fails.
pub fn write_sample_grid<W: Write>(out: &mut W, sample: &[u8], side: usize) -> Result<()> {
    for row in sample.chunks(side.max(1)) {
        let line: Vec<String> = row.iter().map(|b| format!("{b:3}")).collect();
        writeln!(out, "{}", line.join(" "))?;
    }
    Ok(())
}
