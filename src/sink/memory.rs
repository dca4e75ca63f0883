use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::RecordSink;
use crate::error::PipelineError;
use crate::model::GtfsRecord;

/// Keeps upserted rows in process, keyed by table and natural key.
///
/// Backs `ingest --dry-run`, which parses and validates a feed without a
/// database.
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: Mutex<HashMap<&'static str, BTreeMap<String, String>>>,
    batches: Mutex<Vec<(&'static str, usize)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose trips table already holds `trip_ids`.
    pub fn with_trips<I, S>(trip_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let sink = Self::default();
        {
            let mut tables = sink.tables.lock().unwrap_or_else(|e| e.into_inner());
            let trips = tables.entry("trips").or_default();
            for id in trip_ids {
                trips.insert(id.into(), String::new());
            }
        }
        sink
    }

    pub fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Current rows of `table`, rendered with `Debug`.
    pub fn rows(&self, table: &str) -> BTreeMap<String, String> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.get(table).cloned().unwrap_or_default()
    }

    /// Sizes of the batches written to `table`, in write order.
    pub fn batch_sizes(&self, table: &str) -> Vec<usize> {
        let batches = self.batches.lock().unwrap_or_else(|e| e.into_inner());
        batches
            .iter()
            .filter(|(t, _)| *t == table)
            .map(|(_, size)| *size)
            .collect()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write_batch<T: GtfsRecord>(&self, batch: &[T]) -> Result<u64, PipelineError> {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let table = tables.entry(T::TABLE).or_default();
        for record in batch {
            table.insert(record.natural_key(), format!("{record:?}"));
        }
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((T::TABLE, batch.len()));
        Ok(batch.len() as u64)
    }

    async fn existing_trip_ids(&self, trip_ids: &[String]) -> Result<HashSet<String>, PipelineError> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let Some(trips) = tables.get("trips") else {
            return Ok(HashSet::new());
        };
        Ok(trip_ids
            .iter()
            .filter(|id| trips.contains_key(id.as_str()))
            .cloned()
            .collect())
    }
}
