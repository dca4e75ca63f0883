//! Output of ingest run reports.
//!
//! Supports pretty-printing, JSON logging, and CSV append.

use anyhow::Result;
use tracing::{debug, info};

use crate::ingest::IngestReport;
use csv::WriterBuilder;
use std::fs::OpenOptions;
use std::path::Path;

/// Logs a report using Rust's debug pretty-print format.
pub fn print_pretty(report: &IngestReport) {
    debug!("{:#?}", report);
}

/// Logs a report as pretty-printed JSON.
pub fn print_json(report: &IngestReport) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Appends an [`IngestReport`] as a row to a CSV run log.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &str, report: &IngestReport) -> Result<()> {
    let file_exists = Path::new(path).exists();
    debug!(path, file_exists, "Appending run report");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists)
        .from_writer(file);

    writer.serialize(report)?;
    writer.flush()?;

    Ok(())
}
