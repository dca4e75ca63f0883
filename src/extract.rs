//! Streaming extraction of GTFS CSV files from a zip archive.
//!
//! The archive is read front to back through its local file headers, so
//! nothing is seeked and only one entry is decompressed at a time. Entries
//! outside [`EntryKind`] are drained before the next header is read.
//! Archives written by streaming zip writers, whose local headers carry no
//! sizes, are buffered and read through their central directory.

use std::io::{self, BufReader, Read};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use tokio::io::AsyncRead;
use tokio_util::io::SyncIoBridge;
use tracing::{debug, error, info, warn};
use zip::ZipArchive;
use zip::result::ZipError;

use crate::error::PipelineError;
use crate::metrics::IngestMetrics;
use crate::model::{CalendarDate, Route, ShapePoint, Stop, StopTime, Trip};
use crate::normalize::{
    normalize_calendar_date, normalize_route, normalize_shape_point, normalize_stop,
    normalize_stop_time, normalize_trip,
};

/// The archive entries that are parsed; everything else is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Routes,
    Trips,
    Stops,
    StopTimes,
    CalendarDates,
    Shapes,
}

impl EntryKind {
    pub const ALL: [EntryKind; 6] = [
        EntryKind::Routes,
        EntryKind::Trips,
        EntryKind::Stops,
        EntryKind::StopTimes,
        EntryKind::CalendarDates,
        EntryKind::Shapes,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            EntryKind::Routes => "routes.txt",
            EntryKind::Trips => "trips.txt",
            EntryKind::Stops => "stops.txt",
            EntryKind::StopTimes => "stop_times.txt",
            EntryKind::CalendarDates => "calendar_dates.txt",
            EntryKind::Shapes => "shapes.txt",
        }
    }

    /// Matches an entry path on its file name, ignoring folders inside the zip.
    pub fn from_entry_name(name: &str) -> Option<Self> {
        let file = name.rsplit('/').next().unwrap_or(name);
        Self::ALL.into_iter().find(|kind| kind.file_name() == file)
    }
}

/// Everything collected from one archive.
#[derive(Debug, Default)]
pub struct GtfsCollections {
    pub routes: Vec<Route>,
    pub trips: Vec<Trip>,
    pub stops: Vec<Stop>,
    pub stop_times: Vec<StopTime>,
    pub calendar_dates: Vec<CalendarDate>,
    pub shapes: Vec<ShapePoint>,
}

impl GtfsCollections {
    pub fn len(&self, kind: EntryKind) -> usize {
        match kind {
            EntryKind::Routes => self.routes.len(),
            EntryKind::Trips => self.trips.len(),
            EntryKind::Stops => self.stops.len(),
            EntryKind::StopTimes => self.stop_times.len(),
            EntryKind::CalendarDates => self.calendar_dates.len(),
            EntryKind::Shapes => self.shapes.len(),
        }
    }

    pub fn total_rows(&self) -> usize {
        EntryKind::ALL.iter().map(|kind| self.len(*kind)).sum()
    }
}

/// Typed rows of one CSV entry, read lazily. Finite and not restartable.
pub struct EntryRows<R, T> {
    entry: String,
    rows: csv::DeserializeRecordsIntoIter<R, T>,
    done: bool,
}

impl<R: Read, T: DeserializeOwned> EntryRows<R, T> {
    pub fn new(entry: &str, reader: R) -> Self {
        let rows = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader)
            .into_deserialize();
        Self {
            entry: entry.to_string(),
            rows,
            done: false,
        }
    }
}

impl<R: Read, T: DeserializeOwned> Iterator for EntryRows<R, T> {
    type Item = Result<T, PipelineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.rows.next()? {
            Ok(row) => Some(Ok(row)),
            Err(e) => {
                // A broken byte stream will not recover, stop the entry.
                if e.is_io_error() {
                    self.done = true;
                }
                let line = e.position().map(|p| p.line());
                Some(Err(PipelineError::Parse {
                    entry: self.entry.clone(),
                    reason: match line {
                        Some(line) => format!("line {line}: {e}"),
                        None => e.to_string(),
                    },
                }))
            }
        }
    }
}

#[derive(Clone)]
pub struct ArchiveExtractor {
    feed_version: NaiveDate,
    metrics: Arc<IngestMetrics>,
}

impl ArchiveExtractor {
    pub fn new(feed_version: NaiveDate, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            feed_version,
            metrics,
        }
    }

    /// Extracts from an async byte stream, running the zip reader on a
    /// blocking thread while the stream keeps downloading.
    pub async fn extract_stream<S>(&self, stream: S) -> Result<GtfsCollections, PipelineError>
    where
        S: AsyncRead + Unpin + Send + 'static,
    {
        let bridge = SyncIoBridge::new(stream);
        let extractor = self.clone();
        tokio::task::spawn_blocking(move || extractor.extract(BufReader::new(bridge)))
            .await
            .map_err(|e| PipelineError::Io(io::Error::other(e)))?
    }

    /// Reads every entry of the archive in order.
    ///
    /// Row failures are logged and skipped. A broken archive framing fails
    /// the whole extraction. Archives whose first entry defers its sizes to a
    /// trailing data descriptor cannot be read front to back; those are
    /// buffered and read through their central directory instead.
    pub fn extract<R: Read>(&self, reader: R) -> Result<GtfsCollections, PipelineError> {
        let mut reader = Replay::new(reader);
        let mut out = GtfsCollections::default();

        loop {
            let recording = reader.is_recording();
            let framed = match zip::read::read_zipfile_from_stream(&mut reader) {
                Ok(Some(mut entry)) => {
                    let name = entry.name().to_string();
                    self.read_entry(&name, &mut entry, &mut out);

                    // The next local header only starts after this entry's bytes.
                    if let Err(e) = io::copy(&mut entry, &mut io::sink()) {
                        error!(entry = %name, error = %e, "Failed to drain entry");
                        return Err(PipelineError::Io(e));
                    }
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };

            match framed {
                Ok(true) => reader.stop_recording(),
                Ok(false) => break,
                Err(ZipError::UnsupportedArchive(reason)) if recording => {
                    warn!(reason, "Archive cannot be streamed, buffering it");
                    return self.extract_buffered(reader.into_buffered()?);
                }
                Err(e) => {
                    error!(error = %e, "Archive stream is unreadable");
                    return Err(e.into());
                }
            }
        }

        Ok(out)
    }

    /// Reads a fully buffered archive through its central directory.
    fn extract_buffered(&self, bytes: Vec<u8>) -> Result<GtfsCollections, PipelineError> {
        let mut archive = ZipArchive::new(io::Cursor::new(bytes))?;
        let mut out = GtfsCollections::default();
        for index in 0..archive.len() {
            let mut entry = archive.by_index(index)?;
            let name = entry.name().to_string();
            self.read_entry(&name, &mut entry, &mut out);
        }
        Ok(out)
    }

    fn read_entry<R: Read>(&self, name: &str, entry: R, out: &mut GtfsCollections) {
        match EntryKind::from_entry_name(name) {
            Some(kind) => {
                let (rows, errors) = self.collect_entry(kind, name, entry, out);
                info!(entry = %name, rows, errors, "Entry parsed");
            }
            None => {
                debug!(entry = %name, "Skipping entry");
                self.metrics.add_entry_skipped();
            }
        }
    }

    fn collect_entry<R: Read>(
        &self,
        kind: EntryKind,
        name: &str,
        reader: R,
        out: &mut GtfsCollections,
    ) -> (usize, usize) {
        let v = self.feed_version;
        match kind {
            EntryKind::Routes => {
                self.push_rows(name, reader, &mut out.routes, |raw| normalize_route(raw, v))
            }
            EntryKind::Trips => {
                self.push_rows(name, reader, &mut out.trips, |raw| normalize_trip(raw, v))
            }
            EntryKind::Stops => {
                self.push_rows(name, reader, &mut out.stops, |raw| normalize_stop(raw, v))
            }
            EntryKind::StopTimes => self.push_rows(name, reader, &mut out.stop_times, |raw| {
                normalize_stop_time(raw, v)
            }),
            EntryKind::CalendarDates => {
                self.push_rows(name, reader, &mut out.calendar_dates, normalize_calendar_date)
            }
            EntryKind::Shapes => self.push_rows(name, reader, &mut out.shapes, |raw| {
                normalize_shape_point(raw, v)
            }),
        }
    }

    fn push_rows<R, Raw, T>(
        &self,
        name: &str,
        reader: R,
        into: &mut Vec<T>,
        normalize: impl Fn(Raw) -> T,
    ) -> (usize, usize)
    where
        R: Read,
        Raw: DeserializeOwned,
    {
        let mut rows = 0;
        let mut errors = 0;
        for row in EntryRows::<R, Raw>::new(name, reader) {
            match row {
                Ok(raw) => {
                    into.push(normalize(raw));
                    rows += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Skipping row");
                    self.metrics.add_row_error();
                    errors += 1;
                }
            }
        }
        self.metrics.add_rows_parsed(rows as u64);
        (rows, errors)
    }
}

/// Keeps a copy of what has been read until the first entry is framed, so
/// the archive can still be handed to [`ZipArchive`] when streaming fails.
struct Replay<R> {
    inner: R,
    recorded: Option<Vec<u8>>,
}

impl<R: Read> Replay<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            recorded: Some(Vec::new()),
        }
    }

    fn is_recording(&self) -> bool {
        self.recorded.is_some()
    }

    fn stop_recording(&mut self) {
        self.recorded = None;
    }

    /// The recorded prefix followed by the rest of the stream.
    fn into_buffered(mut self) -> io::Result<Vec<u8>> {
        let mut bytes = self.recorded.take().unwrap_or_default();
        self.inner.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl<R: Read> Read for Replay<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(recorded) = &mut self.recorded {
            recorded.extend_from_slice(&buf[..n]);
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Coerced;
    use std::io::{Cursor, Write};
    use zip::write::FileOptions;

    fn archive_raw<'a>(entries: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in entries {
            writer.start_file(name, options).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn archive(entries: &[(&str, &str)]) -> Vec<u8> {
        archive_raw(entries.iter().map(|(name, body)| (*name, body.as_bytes())))
    }

    /// Stored entries laid out the way streaming writers emit them: zeroed
    /// sizes in the local header, then a trailing data descriptor.
    fn descriptor_archive(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, FileOptions::default().compression_method(zip::CompressionMethod::Stored))
                .unwrap();
            writer.write_all(body.as_bytes()).unwrap();
        }
        let mut plain = zip::ZipArchive::new(writer.finish().unwrap()).unwrap();
        let crcs: Vec<u32> = (0..plain.len())
            .map(|i| plain.by_index(i).unwrap().crc32())
            .collect();

        let date: u16 = (44 << 9) | (9 << 5) | 1;
        let mut out = Vec::new();
        let mut central = Vec::new();
        for ((name, body), crc) in entries.iter().zip(crcs) {
            let offset = out.len() as u32;
            let size = body.len() as u32;
            let name_len = name.len() as u16;

            out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
            out.extend_from_slice(&20u16.to_le_bytes());
            out.extend_from_slice(&0x0008u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(&date.to_le_bytes());
            out.extend_from_slice(&[0; 12]);
            out.extend_from_slice(&name_len.to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(body.as_bytes());
            out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
            out.extend_from_slice(&crc.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());

            central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&20u16.to_le_bytes());
            central.extend_from_slice(&0x0008u16.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes());
            central.extend_from_slice(&0u16.to_le_bytes());
            central.extend_from_slice(&date.to_le_bytes());
            central.extend_from_slice(&crc.to_le_bytes());
            central.extend_from_slice(&size.to_le_bytes());
            central.extend_from_slice(&size.to_le_bytes());
            central.extend_from_slice(&name_len.to_le_bytes());
            central.extend_from_slice(&[0; 12]);
            central.extend_from_slice(&offset.to_le_bytes());
            central.extend_from_slice(name.as_bytes());
        }

        let central_offset = out.len() as u32;
        let count = entries.len() as u16;
        out.extend_from_slice(&central);
        out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
        out.extend_from_slice(&[0; 4]);
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&count.to_le_bytes());
        out.extend_from_slice(&(central.len() as u32).to_le_bytes());
        out.extend_from_slice(&central_offset.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out
    }

    fn extractor() -> (ArchiveExtractor, Arc<IngestMetrics>) {
        let metrics = IngestMetrics::new();
        let version = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
        (ArchiveExtractor::new(version, metrics.clone()), metrics)
    }

    #[test]
    fn test_entry_kind_from_name() {
        assert_eq!(EntryKind::from_entry_name("stops.txt"), Some(EntryKind::Stops));
        assert_eq!(
            EntryKind::from_entry_name("sl/stop_times.txt"),
            Some(EntryKind::StopTimes)
        );
        assert_eq!(EntryKind::from_entry_name("agency.txt"), None);
        assert_eq!(EntryKind::from_entry_name("calendar.txt"), None);
    }

    #[test]
    fn test_agency_entry_is_skipped_without_blocking_later_entries() {
        let bytes = archive(&[
            ("agency.txt", "agency_id,agency_name\n1,SL\n2,Waxholmsbolaget\n"),
            (
                "routes.txt",
                "route_id,agency_id,route_short_name,route_long_name,route_type,route_desc\nr1,1,4,,700,\n",
            ),
            (
                "trips.txt",
                "route_id,service_id,trip_id,trip_headsign,direction_id,shape_id\nr1,1,t1,Gullmarsplan,0,sh1\n",
            ),
        ]);
        let (extractor, metrics) = extractor();
        let out = extractor.extract(Cursor::new(bytes)).unwrap();

        assert_eq!(out.routes.len(), 1);
        assert_eq!(out.trips.len(), 1);
        assert_eq!(out.total_rows(), 2);
        assert_eq!(out.routes[0].route_short_name, "4");
        assert_eq!(out.trips[0].trip_headsign, "Gullmarsplan");

        let snap = metrics.snapshot(chrono::Utc::now());
        assert_eq!(snap.entries_skipped, 1);
        assert_eq!(snap.rows_parsed, 2);
    }

    #[test]
    fn test_all_allow_listed_entries_are_collected() {
        let bytes = archive(&[
            ("stops.txt", "stop_id,stop_name,stop_lat,stop_lon,location_type,parent_station,platform_code\ns1,Slussen,59.31,18.07,0,,A\n"),
            ("stop_times.txt", "trip_id,arrival_time,departure_time,stop_id,stop_sequence,stop_headsign,pickup_type,drop_off_type,shape_dist_traveled,timepoint\nt1,25:10:00,25:10:00,s1,1,,0,0,,1\nt1,25:12:00,25:12:00,s2,2,,0,0,812.4,1\n"),
            ("calendar_dates.txt", "service_id,date,exception_type\n1,20240901,1\n"),
            ("shapes.txt", "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence,shape_dist_traveled\nsh1,59.31,18.07,1,0\n"),
        ]);
        let (extractor, _) = extractor();
        let out = extractor.extract(Cursor::new(bytes)).unwrap();

        assert_eq!(out.stops.len(), 1);
        assert_eq!(out.stop_times.len(), 2);
        assert_eq!(out.calendar_dates.len(), 1);
        assert_eq!(out.shapes.len(), 1);
        assert_eq!(out.stop_times[0].shape_dist_traveled, Coerced::Null);
        assert_eq!(out.stop_times[1].shape_dist_traveled, Coerced::Value(812.4));
    }

    #[test]
    fn test_malformed_row_is_skipped() {
        let body: &[u8] =
            b"service_id,date,exception_type\n1,20240901,1\n2,\xff\xfe,1\n3,20240903,1\n";
        let bytes = archive_raw([("calendar_dates.txt", body)]);
        let (extractor, metrics) = extractor();
        let out = extractor.extract(Cursor::new(bytes)).unwrap();

        assert_eq!(out.calendar_dates.len(), 2);
        assert_eq!(out.calendar_dates[1].date, "20240903");
        assert_eq!(metrics.snapshot(chrono::Utc::now()).row_errors, 1);
    }

    #[test]
    fn test_truncated_archive_fails_extraction() {
        let mut bytes = archive(&[
            ("routes.txt", "route_id,route_type\nr1,700\n"),
            ("trips.txt", "route_id,service_id,trip_id\nr1,1,t1\n"),
        ]);
        let second = bytes.windows(4).rposition(|w| w == b"PK\x03\x04").unwrap();
        bytes.truncate(second + 10);
        let (extractor, _) = extractor();

        assert!(extractor.extract(Cursor::new(bytes)).is_err());
    }

    #[test]
    fn test_non_zip_body_fails_extraction() {
        let (extractor, _) = extractor();
        let result = extractor.extract(Cursor::new(b"<html>Service unavailable</html>".to_vec()));

        assert!(matches!(result, Err(PipelineError::Archive(_))));
    }

    #[tokio::test]
    async fn test_data_descriptor_archive_is_buffered() {
        let bytes = descriptor_archive(&[
            ("agency.txt", "agency_id,agency_name\n1,SL\n"),
            ("routes.txt", "route_id,route_type\nr1,700\nr2,700\n"),
            ("trips.txt", "route_id,service_id,trip_id\nr1,1,t1\n"),
        ]);
        assert!(matches!(
            zip::read::read_zipfile_from_stream(&mut Cursor::new(bytes.clone())),
            Err(ZipError::UnsupportedArchive(_))
        ));
        let (extractor, metrics) = extractor();

        let out = extractor.extract_stream(Cursor::new(bytes)).await.unwrap();

        assert_eq!(out.routes.len(), 2);
        assert_eq!(out.trips.len(), 1);
        assert_eq!(metrics.snapshot(chrono::Utc::now()).entries_skipped, 1);
    }

    #[test]
    fn test_entry_rows_are_lazy() {
        let csv = "service_id,date,exception_type\n1,20240901,1\n2,20240902,2\n";
        let mut rows =
            EntryRows::<_, crate::normalize::RawCalendarDate>::new("calendar_dates.txt", csv.as_bytes());

        assert_eq!(rows.next().unwrap().unwrap().date, "20240901");
        assert_eq!(rows.next().unwrap().unwrap().date, "20240902");
        assert!(rows.next().is_none());
    }

    #[tokio::test]
    async fn test_extract_stream_from_async_reader() {
        let bytes = archive(&[("routes.txt", "route_id,route_type\nr1,700\nr2,700\n")]);
        let (extractor, _) = extractor();
        let out = extractor.extract_stream(Cursor::new(bytes)).await.unwrap();

        assert_eq!(out.routes.len(), 2);
    }
}
