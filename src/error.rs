//! Error taxonomy shared by the ingest pipeline and the read paths.

use thiserror::Error;

/// An error raised while fetching, parsing, persisting or querying GTFS data.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("failed to fetch '{url}': {reason}")]
    Fetch { url: String, reason: String },
    #[error("failed to parse '{entry}': {reason}")]
    Parse { entry: String, reason: String },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{table} batch references {} unknown trip id(s)", .missing.len())]
    Referential {
        table: &'static str,
        missing: Vec<String>,
    },
    #[error("database write to {table} failed: {source}")]
    Persistence {
        table: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("database unavailable: {0}")]
    Database(#[source] sqlx::Error),
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unreadable archive: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("impossible to read archive: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn fetch(url: &str, reason: impl ToString) -> Self {
        PipelineError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A record that does not fit its destination table.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{table} row {row} ({key}): column '{column}' {problem}")]
pub struct ValidationError {
    pub table: &'static str,
    pub row: usize,
    pub key: String,
    pub column: &'static str,
    pub problem: String,
}
