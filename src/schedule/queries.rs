//! Read queries over the persisted schedule.
//!
//! Every query only joins rows of the newest `feed_version` of each table.
//! Failures are logged and produce an empty result: the callers render
//! best-effort views and have nothing useful to do with a database error.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, error};

use super::window::{TimeWindow, default_lookahead, default_lookback};
use crate::error::PipelineError;

/// Minutes after midnight of `st.departure_time`, hours not wrapped.
const DEPARTURE_MINUTES: &str = "(split_part(st.departure_time, ':', 1)::int * 60 \
     + split_part(st.departure_time, ':', 2)::int)";

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct UpcomingDeparture {
    pub trip_id: String,
    pub shape_id: String,
    pub trip_headsign: String,
    pub stop_name: String,
    pub stop_sequence: i32,
    pub stop_lat: f64,
    pub stop_lon: f64,
    pub departure_time: String,
    /// `YYYYMMDD` of the service day the departure belongs to.
    pub service_date: String,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct CurrentTrip {
    pub trip_id: String,
    pub route_id: String,
    pub route_short_name: String,
    pub trip_headsign: String,
    pub direction_id: Option<i32>,
    pub shape_id: String,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct ShapePointRow {
    pub shape_pt_sequence: i32,
    pub shape_pt_lat: f64,
    pub shape_pt_lon: f64,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowSettings {
    pub lookback: Duration,
    pub lookahead: Duration,
    pub limit: i64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            lookahead: default_lookahead(),
            limit: 20,
        }
    }
}

#[derive(Clone)]
pub struct ScheduleQueries {
    pool: PgPool,
    timezone: Tz,
    settings: WindowSettings,
}

impl ScheduleQueries {
    pub fn new(pool: PgPool, timezone: Tz, settings: WindowSettings) -> Self {
        Self {
            pool,
            timezone,
            settings,
        }
    }

    /// Departures of `route_short_name` from the stop named `stop_name`
    /// inside the window around `now`, earliest first.
    #[tracing::instrument(skip(self))]
    pub async fn upcoming_departures(
        &self,
        route_short_name: &str,
        stop_name: &str,
        now: DateTime<Utc>,
    ) -> Vec<UpcomingDeparture> {
        let local_now = now.with_timezone(&self.timezone).naive_local();
        let window = TimeWindow::compute(local_now, self.settings.lookback, self.settings.lookahead);
        debug!(
            start = %window.start_time(),
            end = %window.end_time(),
            "Departure window"
        );

        let mut query = departures_query(route_short_name, stop_name, &window, self.settings.limit);
        match query
            .build_query_as::<UpcomingDeparture>()
            .fetch_all(&self.pool)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %PipelineError::Query(e), "Departure query failed");
                Vec::new()
            }
        }
    }

    /// Trips of a route whose ids are currently reported as running.
    #[tracing::instrument(skip(self, trip_ids), fields(trip_count = trip_ids.len()))]
    pub async fn select_current_trips(
        &self,
        trip_ids: &[String],
        route_short_name: &str,
    ) -> Vec<CurrentTrip> {
        if trip_ids.is_empty() {
            return Vec::new();
        }

        let result = sqlx::query_as::<_, CurrentTrip>(
            r#"
            SELECT t.trip_id, t.route_id, r.route_short_name, t.trip_headsign,
                   t.direction_id, t.shape_id, t.feed_version
            FROM trips t
            JOIN routes r ON r.route_id = t.route_id
            WHERE t.trip_id = ANY($1)
              AND r.route_short_name = $2
              AND t.feed_version = (SELECT MAX(feed_version) FROM trips)
              AND r.feed_version = (SELECT MAX(feed_version) FROM routes)
            ORDER BY t.trip_id
            "#,
        )
        .bind(trip_ids)
        .bind(route_short_name)
        .fetch_all(&self.pool)
        .await;

        result.unwrap_or_else(|e| {
            error!(error = %PipelineError::Query(e), "Current trips query failed");
            Vec::new()
        })
    }

    /// The polyline of a shape, ordered by point sequence.
    #[tracing::instrument(skip(self))]
    pub async fn shape_points(&self, shape_id: &str) -> Vec<ShapePointRow> {
        let result = sqlx::query_as::<_, ShapePointRow>(
            r#"
            SELECT shape_pt_sequence, shape_pt_lat, shape_pt_lon, shape_dist_traveled
            FROM shapes
            WHERE shape_id = $1
              AND feed_version = (SELECT MAX(feed_version) FROM shapes)
            ORDER BY shape_pt_sequence
            "#,
        )
        .bind(shape_id)
        .fetch_all(&self.pool)
        .await;

        result.unwrap_or_else(|e| {
            error!(error = %PipelineError::Query(e), "Shape query failed");
            Vec::new()
        })
    }
}

/// Builds the departure query for `window`.
///
/// Trips must be explicitly added (`exception_type = 1`) on one of the
/// window's service dates, and each service date only accepts departure
/// minutes from its own range.
pub fn departures_query(
    route_short_name: &str,
    stop_name: &str,
    window: &TimeWindow,
    limit: i64,
) -> QueryBuilder<'static, Postgres> {
    let ranges = window.ranges();
    let today = window.now.date();
    let dates: Vec<String> = ranges.iter().map(|r| gtfs_date(r.service_date)).collect();

    let mut qb = QueryBuilder::new(
        "SELECT t.trip_id, t.shape_id, t.trip_headsign, s.stop_name, st.stop_sequence, \
         s.stop_lat, s.stop_lon, st.departure_time, cd.date AS service_date, st.feed_version \
         FROM trips t \
         JOIN routes r ON r.route_id = t.route_id \
         JOIN stop_times st ON st.trip_id = t.trip_id \
         JOIN stops s ON s.stop_id = st.stop_id \
         LEFT JOIN calendar_dates cd ON cd.service_id = t.service_id \
         AND cd.exception_type = 1 AND cd.date = ANY(",
    );
    qb.push_bind(dates);
    qb.push(") WHERE r.route_short_name = ");
    qb.push_bind(route_short_name.to_string());
    qb.push(" AND s.stop_name = ");
    qb.push_bind(stop_name.to_string());
    for (alias, table) in [("r", "routes"), ("t", "trips"), ("st", "stop_times"), ("s", "stops")] {
        qb.push(format!(
            " AND {alias}.feed_version = (SELECT MAX(feed_version) FROM {table})"
        ));
    }

    qb.push(" AND (");
    if ranges.is_empty() {
        qb.push("FALSE");
    }
    for (i, range) in ranges.iter().enumerate() {
        if i > 0 {
            qb.push(" OR ");
        }
        qb.push("(cd.date = ");
        qb.push_bind(gtfs_date(range.service_date));
        qb.push(format!(" AND {DEPARTURE_MINUTES} BETWEEN "));
        qb.push_bind(range.from as i32);
        qb.push(" AND ");
        qb.push_bind(range.to as i32);
        qb.push(")");
    }
    qb.push(")");

    qb.push(
        " GROUP BY t.trip_id, t.shape_id, t.trip_headsign, s.stop_name, st.stop_sequence, \
         s.stop_lat, s.stop_lon, st.departure_time, cd.date, st.feed_version",
    );

    // Earlier service dates are shifted so both encodings of one moment sort together.
    qb.push(format!(" ORDER BY {DEPARTURE_MINUTES} + CASE"));
    for range in &ranges {
        qb.push(" WHEN cd.date = ");
        qb.push_bind(gtfs_date(range.service_date));
        qb.push(" THEN ");
        qb.push_bind(range.day_offset(today) as i32);
    }
    qb.push(" ELSE 0 END, st.departure_time LIMIT ");
    qb.push_bind(limit);

    qb
}

pub fn gtfs_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}
