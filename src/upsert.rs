//! Parameter-bounded batch upserts with validation and a trip reference gate.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{PipelineError, ValidationError};
use crate::metrics::IngestMetrics;
use crate::model::GtfsRecord;
use crate::sink::RecordSink;

/// Bind parameters Postgres accepts in one statement, minus one.
pub const MAX_BIND_PARAMETERS: usize = 65534;

/// Share of [`MAX_BIND_PARAMETERS`] a batch may use.
const PARAMETER_HEADROOM: f64 = 0.8;

/// Rows per statement for a record with `column_count` columns.
///
/// `floor((65534 / column_count) * 0.8)`, never less than one.
pub fn batch_size(column_count: usize) -> usize {
    let size = (MAX_BIND_PARAMETERS as f64 / column_count.max(1) as f64) * PARAMETER_HEADROOM;
    (size.floor() as usize).max(1)
}

/// Checks every record of a batch; `offset` is the index of the batch's
/// first record in the whole collection.
pub fn validate_batch<T: GtfsRecord>(batch: &[T], offset: usize) -> Result<(), ValidationError> {
    for (i, record) in batch.iter().enumerate() {
        if let Err(violation) = record.validate() {
            return Err(ValidationError {
                table: T::TABLE,
                row: offset + i,
                key: record.natural_key(),
                column: violation.column,
                problem: violation.problem,
            });
        }
    }
    Ok(())
}

/// Outcome of one [`BatchUpserter::upsert`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    pub batches: usize,
    pub written: usize,
    pub invalid: usize,
    pub unreferenced: usize,
    pub rows_written: u64,
}

pub struct BatchUpserter<S> {
    sink: S,
    metrics: Arc<IngestMetrics>,
}

impl<S: RecordSink> BatchUpserter<S> {
    pub fn new(sink: S, metrics: Arc<IngestMetrics>) -> Self {
        Self { sink, metrics }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Writes `records` in sequential batches.
    ///
    /// Invalid batches and batches referencing unknown trips are skipped. A
    /// sink error aborts the remaining batches and is returned.
    #[tracing::instrument(skip(self, records), fields(table = T::TABLE, records = records.len()))]
    pub async fn upsert<T: GtfsRecord>(&self, records: &[T]) -> Result<UpsertSummary, PipelineError> {
        let size = batch_size(T::COLUMNS.len());
        let mut summary = UpsertSummary {
            batches: records.len().div_ceil(size),
            ..Default::default()
        };
        info!(batch_size = size, batches = summary.batches, "Upserting");

        for (i, batch) in records.chunks(size).enumerate() {
            let number = i + 1;

            match self.check_batch(batch, i * size).await {
                Ok(()) => {}
                Err(e @ PipelineError::Validation(_)) => {
                    warn!(batch = number, error = %e, "Skipping invalid batch");
                    self.metrics.add_batch_invalid();
                    summary.invalid += 1;
                    continue;
                }
                Err(e @ PipelineError::Referential { .. }) => {
                    error!(batch = number, error = %e, "Skipping batch with unknown trips");
                    self.metrics.add_batch_unreferenced();
                    summary.unreferenced += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let rows = match self.sink.write_batch(batch).await {
                Ok(rows) => rows,
                Err(e) => {
                    self.metrics.add_batch_failed();
                    return Err(e);
                }
            };
            self.metrics.add_batch_written(rows);
            summary.written += 1;
            summary.rows_written += rows;
            info!(batch = number, of = summary.batches, rows, "Batch written");
        }

        Ok(summary)
    }

    /// Decides whether `batch` may be written. Validation and Referential
    /// errors mean skip the batch; any other error comes from the sink.
    pub async fn check_batch<T: GtfsRecord>(
        &self,
        batch: &[T],
        offset: usize,
    ) -> Result<(), PipelineError> {
        validate_batch(batch, offset)?;

        let missing = self.check_trip_ids_exist(batch).await?;
        if !missing.is_empty() {
            return Err(PipelineError::Referential {
                table: T::TABLE,
                missing,
            });
        }
        Ok(())
    }

    /// Trip ids referenced by `batch` that are not in the trips table.
    pub async fn check_trip_ids_exist<T: GtfsRecord>(
        &self,
        batch: &[T],
    ) -> Result<Vec<String>, PipelineError> {
        let referenced: BTreeSet<&str> = batch
            .iter()
            .filter_map(GtfsRecord::referenced_trip_id)
            .collect();
        if referenced.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = referenced.iter().map(|id| id.to_string()).collect();
        let existing = self.sink.existing_trip_ids(&ids).await?;
        Ok(ids.into_iter().filter(|id| !existing.contains(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Coerced, StopTime, Trip};
    use crate::sink::MemorySink;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use sqlx::Postgres;
    use sqlx::query_builder::Separated;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn version() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
    }

    fn trip(id: &str) -> Trip {
        Trip {
            route_id: "r1".to_string(),
            service_id: Coerced::Value(1),
            trip_id: id.to_string(),
            trip_headsign: "Gullmarsplan".to_string(),
            direction_id: Coerced::Value(0),
            shape_id: "sh1".to_string(),
            feed_version: version(),
        }
    }

    fn stop_time(trip_id: &str, seq: i32) -> StopTime {
        StopTime {
            trip_id: trip_id.to_string(),
            arrival_time: "08:00:00".to_string(),
            departure_time: "08:00:00".to_string(),
            stop_id: format!("s{seq}"),
            stop_sequence: Coerced::Value(seq),
            stop_headsign: String::new(),
            pickup_type: Coerced::Null,
            drop_off_type: Coerced::Null,
            shape_dist_traveled: Coerced::Null,
            timepoint: Coerced::Null,
            feed_version: version(),
        }
    }

    /// A ten-column record used to exercise batch partitioning.
    #[derive(Debug)]
    struct Wide(usize);

    impl GtfsRecord for Wide {
        const TABLE: &'static str = "wide";
        const COLUMNS: &'static [&'static str] =
            &["c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9"];
        const KEY_COLUMNS: &'static [&'static str] = &["c0"];

        fn natural_key(&self) -> String {
            self.0.to_string()
        }

        fn validate(&self) -> Result<(), crate::model::Violation> {
            Ok(())
        }

        fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
            for _ in Self::COLUMNS {
                row.push_bind(self.0 as i64);
            }
        }
    }

    /// Fails the n-th write (1-based).
    struct FailingSink {
        inner: MemorySink,
        fail_on: usize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl RecordSink for FailingSink {
        async fn write_batch<T: GtfsRecord>(&self, batch: &[T]) -> Result<u64, PipelineError> {
            if self.writes.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(PipelineError::Persistence {
                    table: T::TABLE,
                    source: sqlx::Error::Protocol("connection reset".into()),
                });
            }
            self.inner.write_batch(batch).await
        }

        async fn existing_trip_ids(
            &self,
            trip_ids: &[String],
        ) -> Result<HashSet<String>, PipelineError> {
            self.inner.existing_trip_ids(trip_ids).await
        }
    }

    #[test]
    fn test_batch_size_for_ten_columns() {
        assert_eq!(batch_size(10), 5242);
        assert_eq!(batch_size(11), 4766);
        assert_eq!(batch_size(3), 17475);
        assert!(batch_size(0) >= 1);
    }

    #[tokio::test]
    async fn test_partitions_into_sequential_batches() {
        let records: Vec<Wide> = (0..12_000).map(Wide).collect();
        let upserter = BatchUpserter::new(MemorySink::new(), IngestMetrics::new());

        let summary = upserter.upsert(&records).await.unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(summary.written, 3);
        assert_eq!(summary.rows_written, 12_000);
        assert_eq!(upserter.sink().batch_sizes("wide"), vec![5242, 5242, 1516]);
    }

    #[tokio::test]
    async fn test_upsert_twice_is_idempotent() {
        let trips = vec![trip("t1"), trip("t2"), trip("t3")];
        let upserter = BatchUpserter::new(MemorySink::new(), IngestMetrics::new());

        upserter.upsert(&trips).await.unwrap();
        let first = upserter.sink().rows("trips");
        upserter.upsert(&trips).await.unwrap();
        let second = upserter.sink().rows("trips");

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_upsert_updates_non_key_columns() {
        let upserter = BatchUpserter::new(MemorySink::new(), IngestMetrics::new());
        upserter.upsert(&[trip("t1")]).await.unwrap();

        let mut corrected = trip("t1");
        corrected.trip_headsign = "Hammarby sjöstad".to_string();
        upserter.upsert(&[corrected]).await.unwrap();

        let rows = upserter.sink().rows("trips");
        assert_eq!(rows.len(), 1);
        assert!(rows["t1"].contains("Hammarby sjöstad"));
    }

    #[tokio::test]
    async fn test_stop_times_with_unknown_trip_are_rejected() {
        let metrics = IngestMetrics::new();
        let upserter = BatchUpserter::new(MemorySink::with_trips(["t1"]), metrics.clone());

        let records = vec![stop_time("t1", 1), stop_time("t1", 2), stop_time("ghost", 1)];
        let summary = upserter.upsert(&records).await.unwrap();

        assert_eq!(summary.unreferenced, 1);
        assert_eq!(summary.written, 0);
        assert_eq!(upserter.sink().row_count("stop_times"), 0);
        assert_eq!(metrics.snapshot(chrono::Utc::now()).batches_unreferenced, 1);
    }

    #[tokio::test]
    async fn test_stop_times_with_known_trips_are_written() {
        let upserter = BatchUpserter::new(MemorySink::with_trips(["t1", "t2"]), IngestMetrics::new());

        let records = vec![stop_time("t1", 1), stop_time("t1", 2), stop_time("t2", 1)];
        let summary = upserter.upsert(&records).await.unwrap();

        assert_eq!(summary.written, 1);
        assert_eq!(upserter.sink().row_count("stop_times"), 3);
    }

    #[tokio::test]
    async fn test_check_trip_ids_exist_reports_missing_ids() {
        let upserter = BatchUpserter::new(MemorySink::with_trips(["t1"]), IngestMetrics::new());
        let records = vec![stop_time("t1", 1), stop_time("t9", 1), stop_time("t9", 2)];

        let missing = upserter.check_trip_ids_exist(&records).await.unwrap();
        assert_eq!(missing, vec!["t9".to_string()]);

        let none = upserter.check_trip_ids_exist(&[trip("t9")]).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_batch_is_skipped() {
        let metrics = IngestMetrics::new();
        let upserter = BatchUpserter::new(MemorySink::new(), metrics.clone());
        let mut bad = trip("t2");
        bad.service_id = Coerced::Invalid("weekday".to_string());

        let summary = upserter.upsert(&[trip("t1"), bad]).await.unwrap();

        assert_eq!(summary.invalid, 1);
        assert_eq!(upserter.sink().row_count("trips"), 0);
        assert_eq!(metrics.snapshot(chrono::Utc::now()).batches_invalid, 1);
    }

    #[tokio::test]
    async fn test_sink_error_aborts_remaining_batches() {
        let sink = FailingSink {
            inner: MemorySink::new(),
            fail_on: 2,
            writes: AtomicUsize::new(0),
        };
        let upserter = BatchUpserter::new(sink, IngestMetrics::new());
        let records: Vec<Wide> = (0..12_000).map(Wide).collect();

        let result = upserter.upsert(&records).await;

        assert!(matches!(result, Err(PipelineError::Persistence { table: "wide", .. })));
        assert_eq!(upserter.sink().inner.batch_sizes("wide"), vec![5242]);
    }

    #[test]
    fn test_validate_batch_reports_row_position() {
        let mut bad = stop_time("t1", 2);
        bad.arrival_time = "soon".to_string();
        let err = validate_batch(&[stop_time("t1", 1), bad], 100).unwrap_err();

        assert_eq!(err.table, "stop_times");
        assert_eq!(err.row, 101);
        assert_eq!(err.column, "arrival_time");
    }

    #[tokio::test]
    async fn test_check_batch_classifies_skips() {
        let upserter = BatchUpserter::new(MemorySink::with_trips(["t1"]), IngestMetrics::new());
        let mut bad = stop_time("t1", 2);
        bad.departure_time = "99999999:00:00".to_string();

        let invalid = upserter.check_batch(&[stop_time("t1", 1), bad], 0).await;
        assert!(matches!(
            invalid,
            Err(PipelineError::Validation(ValidationError { row: 1, column: "departure_time", .. }))
        ));

        let unreferenced = upserter.check_batch(&[stop_time("ghost", 1)], 0).await;
        assert!(matches!(
            unreferenced,
            Err(PipelineError::Referential { table: "stop_times", ref missing }) if *missing == vec!["ghost".to_string()]
        ));

        assert!(upserter.check_batch(&[stop_time("t1", 1)], 0).await.is_ok());
    }
}
