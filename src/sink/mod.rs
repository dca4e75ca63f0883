//! Destinations for upserted record batches.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::{PgSink, connect, dedupe_by_key, migrate, upsert_statement};

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::PipelineError;
use crate::model::GtfsRecord;

/// A relational store that accepts natural-key upserts.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Inserts `batch`, updating every non-key column of rows whose natural
    /// key already exists. Returns the number of rows touched.
    async fn write_batch<T: GtfsRecord>(&self, batch: &[T]) -> Result<u64, PipelineError>;

    /// The subset of `trip_ids` present in the trips table.
    async fn existing_trip_ids(&self, trip_ids: &[String]) -> Result<HashSet<String>, PipelineError>;
}

#[async_trait]
impl<S: RecordSink> RecordSink for Arc<S> {
    async fn write_batch<T: GtfsRecord>(&self, batch: &[T]) -> Result<u64, PipelineError> {
        (**self).write_batch(batch).await
    }

    async fn existing_trip_ids(&self, trip_ids: &[String]) -> Result<HashSet<String>, PipelineError> {
        (**self).existing_trip_ids(trip_ids).await
    }
}
