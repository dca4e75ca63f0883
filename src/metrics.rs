//! Ingest counters and their periodic reporter.
//!
//! One [`IngestMetrics`] is created per run and shared by `Arc` with the
//! extractor and the upserters. [`MetricsReporter`] logs a snapshot on a
//! fixed interval until it is stopped.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;

#[derive(Debug, Default)]
pub struct IngestMetrics {
    rows_parsed: AtomicU64,
    row_errors: AtomicU64,
    entries_skipped: AtomicU64,
    batches_written: AtomicU64,
    batches_invalid: AtomicU64,
    batches_unreferenced: AtomicU64,
    batches_failed: AtomicU64,
    rows_written: AtomicU64,
}

impl IngestMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_rows_parsed(&self, n: u64) {
        self.rows_parsed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_row_error(&self) {
        self.row_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_entry_skipped(&self) {
        self.entries_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch_written(&self, rows: u64) {
        self.batches_written.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn add_batch_invalid(&self) {
        self.batches_invalid.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch_unreferenced(&self) {
        self.batches_unreferenced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, timestamp: DateTime<Utc>) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp,
            rows_parsed: self.rows_parsed.load(Ordering::Relaxed),
            row_errors: self.row_errors.load(Ordering::Relaxed),
            entries_skipped: self.entries_skipped.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            batches_invalid: self.batches_invalid.load(Ordering::Relaxed),
            batches_unreferenced: self.batches_unreferenced.load(Ordering::Relaxed),
            batches_failed: self.batches_failed.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub rows_parsed: u64,
    pub row_errors: u64,
    pub entries_skipped: u64,
    pub batches_written: u64,
    pub batches_invalid: u64,
    pub batches_unreferenced: u64,
    pub batches_failed: u64,
    pub rows_written: u64,
}

impl MetricsSnapshot {
    pub fn pct(part: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of attempted batches that reached the database.
    pub fn batch_success_pct(&self) -> f64 {
        let attempted = self.batches_written
            + self.batches_invalid
            + self.batches_unreferenced
            + self.batches_failed;
        Self::pct(self.batches_written, attempted)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Destination of periodic snapshots.
pub trait MetricsSink: Send + Sync {
    fn report(&self, snapshot: &MetricsSnapshot);
}

/// Emits snapshots as structured `tracing` events.
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn report(&self, s: &MetricsSnapshot) {
        info!(
            rows_parsed = s.rows_parsed,
            row_errors = s.row_errors,
            entries_skipped = s.entries_skipped,
            batches_written = s.batches_written,
            batches_invalid = s.batches_invalid,
            batches_unreferenced = s.batches_unreferenced,
            batches_failed = s.batches_failed,
            rows_written = s.rows_written,
            batch_success_pct = s.batch_success_pct(),
            "Ingest progress"
        );
    }
}

pub struct MetricsReporter {
    metrics: Arc<IngestMetrics>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MetricsSink>,
    task: JoinHandle<()>,
}

impl MetricsReporter {
    /// Spawns the reporting loop. Must be called from within a tokio runtime.
    pub fn start(
        metrics: Arc<IngestMetrics>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MetricsSink>,
        every: Duration,
    ) -> Self {
        let task = {
            let metrics = metrics.clone();
            let clock = clock.clone();
            let sink = sink.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                // the first tick completes immediately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    sink.report(&metrics.snapshot(clock.now()));
                }
            })
        };

        Self {
            metrics,
            clock,
            sink,
            task,
        }
    }

    /// Stops the loop and reports one final snapshot, which is returned.
    pub async fn stop(self) -> MetricsSnapshot {
        self.task.abort();
        let _ = self.task.await;
        let last = self.metrics.snapshot(self.clock.now());
        self.sink.report(&last);
        last
    }
}
