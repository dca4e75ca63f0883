//! The scheduled ingest run: fetch the static feed, extract it and upsert
//! every entity kind.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tokio::io::AsyncRead;
use tracing::{error, info, warn};

use crate::error::PipelineError;
use crate::extract::{ArchiveExtractor, GtfsCollections};
use crate::fetch::{HttpClient, fetch_stream};
use crate::metrics::{IngestMetrics, MetricsReporter, SystemClock, TracingSink};
use crate::model::GtfsRecord;
use crate::output;
use crate::sink::RecordSink;
use crate::upsert::BatchUpserter;

/// One row of the run log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestReport {
    pub started_at: DateTime<Utc>,
    pub feed_version: NaiveDate,
    pub duration_ms: u64,
    pub routes: usize,
    pub trips: usize,
    pub stops: usize,
    pub stop_times: usize,
    pub calendar_dates: usize,
    pub shapes: usize,
    pub row_errors: u64,
    pub entries_skipped: u64,
    pub batches_written: u64,
    pub batches_invalid: u64,
    pub batches_unreferenced: u64,
    pub batches_failed: u64,
    pub rows_written: u64,
    /// Tables whose upsert was aborted, `;`-separated.
    pub failed_tables: String,
}

impl IngestReport {
    pub fn failed_tables(&self) -> impl Iterator<Item = &str> {
        self.failed_tables.split(';').filter(|t| !t.is_empty())
    }
}

/// Everything a run needs besides its sink. Shared by the CLI and the
/// scheduled-trigger endpoint.
pub struct IngestJob {
    pub client: Box<dyn HttpClient>,
    pub url: String,
    pub timezone: Tz,
    pub report_path: Option<String>,
    pub progress_every: std::time::Duration,
}

impl IngestJob {
    /// Runs one ingest stamped with today's date in the feed timezone,
    /// logging progress while it runs and appending the report to the run
    /// log when one is configured.
    pub async fn run<S: RecordSink>(&self, sink: S) -> Result<IngestReport, PipelineError> {
        let feed_version = Utc::now().with_timezone(&self.timezone).date_naive();
        let metrics = IngestMetrics::new();
        let reporter = MetricsReporter::start(
            metrics.clone(),
            Arc::new(SystemClock),
            Arc::new(TracingSink),
            self.progress_every,
        );

        let result = run_ingest(self.client.as_ref(), &self.url, sink, feed_version, metrics).await;
        reporter.stop().await;

        let report = result?;
        if let Some(path) = &self.report_path {
            if let Err(e) = output::append_record(path, &report) {
                warn!(path, error = ?e, "Failed to append run report");
            }
        }
        Ok(report)
    }
}

/// Downloads the feed at `url` and persists it into `sink`.
///
/// A failed download or an unreadable archive is returned as an error and
/// nothing is written. Entity kinds that fail to persist are logged and
/// listed in the report while the others still run.
#[tracing::instrument(skip(client, sink, metrics))]
pub async fn run_ingest<C, S>(
    client: &C,
    url: &str,
    sink: S,
    feed_version: NaiveDate,
    metrics: Arc<IngestMetrics>,
) -> Result<IngestReport, PipelineError>
where
    C: HttpClient + ?Sized,
    S: RecordSink,
{
    let stream = fetch_stream(client, url).await?;
    ingest_archive(stream, sink, feed_version, metrics).await
}

/// Extracts an archive from `stream` and persists it into `sink`.
pub async fn ingest_archive<R, S>(
    stream: R,
    sink: S,
    feed_version: NaiveDate,
    metrics: Arc<IngestMetrics>,
) -> Result<IngestReport, PipelineError>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: RecordSink,
{
    let started_at = Utc::now();
    let clock = Instant::now();

    let collections = ArchiveExtractor::new(feed_version, metrics.clone())
        .extract_stream(stream)
        .await?;
    info!(rows = collections.total_rows(), "Archive extracted");

    let upserter = BatchUpserter::new(sink, metrics.clone());
    let failed = persist_all(&upserter, &collections).await;

    let snapshot = metrics.snapshot(Utc::now());
    let report = IngestReport {
        started_at,
        feed_version,
        duration_ms: clock.elapsed().as_millis() as u64,
        routes: collections.routes.len(),
        trips: collections.trips.len(),
        stops: collections.stops.len(),
        stop_times: collections.stop_times.len(),
        calendar_dates: collections.calendar_dates.len(),
        shapes: collections.shapes.len(),
        row_errors: snapshot.row_errors,
        entries_skipped: snapshot.entries_skipped,
        batches_written: snapshot.batches_written,
        batches_invalid: snapshot.batches_invalid,
        batches_unreferenced: snapshot.batches_unreferenced,
        batches_failed: snapshot.batches_failed,
        rows_written: snapshot.rows_written,
        failed_tables: failed.join(";"),
    };
    info!(
        duration_ms = report.duration_ms,
        rows_written = report.rows_written,
        failed_tables = %report.failed_tables,
        "Ingest finished"
    );
    Ok(report)
}

/// Upserts every kind in dependency order, trips before stop_times. Returns
/// the tables whose upsert was aborted.
pub async fn persist_all<S: RecordSink>(
    upserter: &BatchUpserter<S>,
    c: &GtfsCollections,
) -> Vec<&'static str> {
    let mut failed = Vec::new();
    persist(upserter, &c.routes, &mut failed).await;
    persist(upserter, &c.stops, &mut failed).await;
    persist(upserter, &c.trips, &mut failed).await;
    persist(upserter, &c.calendar_dates, &mut failed).await;
    persist(upserter, &c.stop_times, &mut failed).await;
    persist(upserter, &c.shapes, &mut failed).await;
    failed
}

async fn persist<T: GtfsRecord, S: RecordSink>(
    upserter: &BatchUpserter<S>,
    records: &[T],
    failed: &mut Vec<&'static str>,
) {
    match upserter.upsert(records).await {
        Ok(summary) => info!(
            table = T::TABLE,
            written = summary.written,
            invalid = summary.invalid,
            unreferenced = summary.unreferenced,
            rows = summary.rows_written,
            "Table upserted"
        ),
        Err(e) => {
            error!(table = T::TABLE, error = %e, "Upsert aborted");
            failed.push(T::TABLE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;
    use crate::sink::MemorySink;
    use std::io::{Cursor, Write};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use zip::write::FileOptions;

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    fn version() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
    }

    #[tokio::test]
    async fn test_stop_times_follow_trips_in_one_run() {
        let bytes = archive(&[
            ("stop_times.txt", "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nt1,08:00:00,08:00:00,s1,1\n"),
            ("trips.txt", "route_id,service_id,trip_id\nr1,1,t1\n"),
        ]);
        let sink = Arc::new(MemorySink::new());
        let report = ingest_archive(Cursor::new(bytes), sink.clone(), version(), IngestMetrics::new())
            .await
            .unwrap();

        assert_eq!(report.trips, 1);
        assert_eq!(report.stop_times, 1);
        assert_eq!(sink.row_count("stop_times"), 1);
        assert_eq!(report.failed_tables().count(), 0);
    }

    #[tokio::test]
    async fn test_unreferenced_stop_times_are_counted() {
        let bytes = archive(&[(
            "stop_times.txt",
            "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nghost,08:00:00,08:00:00,s1,1\n",
        )]);
        let sink = Arc::new(MemorySink::new());
        let report = ingest_archive(Cursor::new(bytes), sink.clone(), version(), IngestMetrics::new())
            .await
            .unwrap();

        assert_eq!(report.batches_unreferenced, 1);
        assert_eq!(sink.row_count("stop_times"), 0);
    }

    #[tokio::test]
    async fn test_unreadable_archive_fails_the_run() {
        let sink = Arc::new(MemorySink::new());
        let result = ingest_archive(
            Cursor::new(b"<html>Rate limited</html>".to_vec()),
            sink.clone(),
            version(),
            IngestMetrics::new(),
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Archive(_))));
        assert_eq!(sink.row_count("routes"), 0);
    }

    #[test]
    fn test_failed_tables_split() {
        let report = IngestReport {
            failed_tables: "stop_times;shapes".to_string(),
            ..Default::default()
        };
        assert_eq!(report.failed_tables().collect::<Vec<_>>(), vec!["stop_times", "shapes"]);
        assert_eq!(IngestReport::default().failed_tables().count(), 0);
    }

    fn job(url: String, report_path: Option<String>) -> IngestJob {
        IngestJob {
            client: Box::new(BasicClient::new()),
            url,
            timezone: chrono_tz::Europe::Stockholm,
            report_path,
            progress_every: std::time::Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn test_job_propagates_fetch_error() {
        let result = job("http://127.0.0.1:9/sl.zip".to_string(), None)
            .run(MemorySink::new())
            .await;

        assert!(matches!(result, Err(PipelineError::Fetch { .. })));
    }

    #[tokio::test]
    async fn test_job_downloads_and_appends_report() {
        let body = archive(&[("routes.txt", "route_id,route_short_name,route_type\nr1,4,700\n")]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sl.zip", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(head.as_bytes()).await.unwrap();
            socket.write_all(&body).await.unwrap();
        });

        let path = format!("{}/gtfs_ingest_job_report.csv", std::env::temp_dir().display());
        let _ = std::fs::remove_file(&path);
        let sink = Arc::new(MemorySink::new());

        let report = job(url, Some(path.clone())).run(sink.clone()).await.unwrap();

        assert_eq!(report.routes, 1);
        assert_eq!(sink.row_count("routes"), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 2);
        std::fs::remove_file(&path).unwrap();
    }
}
