//! Typed GTFS records and their mapping onto the relational tables.

use chrono::NaiveDate;
use sqlx::Postgres;
use sqlx::query_builder::Separated;

use crate::schedule::gtfs_time_to_minutes;

/// A numeric column after coercion from CSV text.
///
/// `Invalid` keeps the original text so a bad value reaches the batch
/// validator instead of being written as zero.
#[derive(Debug, Clone, PartialEq)]
pub enum Coerced<T> {
    Value(T),
    Null,
    Invalid(String),
}

impl<T: Copy> Coerced<T> {
    /// The parsed value, `None` for null and invalid cells.
    pub fn value(&self) -> Option<T> {
        match self {
            Coerced::Value(v) => Some(*v),
            Coerced::Null | Coerced::Invalid(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub route_id: String,
    pub agency_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_type: Coerced<i32>,
    pub route_desc: String,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Trip {
    pub route_id: String,
    pub service_id: Coerced<i32>,
    pub trip_id: String,
    pub trip_headsign: String,
    pub direction_id: Coerced<i32>,
    pub shape_id: String,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: Coerced<f64>,
    pub stop_lon: Coerced<f64>,
    pub location_type: Coerced<i32>,
    pub parent_station: String,
    pub platform_code: String,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopTime {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_id: String,
    pub stop_sequence: Coerced<i32>,
    pub stop_headsign: String,
    pub pickup_type: Coerced<i32>,
    pub drop_off_type: Coerced<i32>,
    pub shape_dist_traveled: Coerced<f64>,
    pub timepoint: Coerced<i32>,
    pub feed_version: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CalendarDate {
    pub service_id: Coerced<i32>,
    /// `YYYYMMDD`, compared as text by the departure query.
    pub date: String,
    pub exception_type: Coerced<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapePoint {
    pub shape_id: String,
    pub shape_pt_lat: Coerced<f64>,
    pub shape_pt_lon: Coerced<f64>,
    pub shape_pt_sequence: Coerced<i32>,
    pub shape_dist_traveled: Coerced<f64>,
    pub feed_version: NaiveDate,
}

/// A column that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub column: &'static str,
    pub problem: String,
}

impl Violation {
    fn new(column: &'static str, problem: impl Into<String>) -> Self {
        Self {
            column,
            problem: problem.into(),
        }
    }
}

/// A record kind that can be upserted into its own table.
///
/// `COLUMNS` lists every inserted column in bind order; `KEY_COLUMNS` is the
/// natural key used as the conflict target.
pub trait GtfsRecord: std::fmt::Debug + Send + Sync {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];
    const KEY_COLUMNS: &'static [&'static str];

    fn natural_key(&self) -> String;

    fn validate(&self) -> Result<(), Violation>;

    /// Binds one value per entry of `COLUMNS`, in the same order.
    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);

    /// The trip this record depends on, checked before the batch is written.
    fn referenced_trip_id(&self) -> Option<&str> {
        None
    }
}

impl GtfsRecord for Route {
    const TABLE: &'static str = "routes";
    const COLUMNS: &'static [&'static str] = &[
        "route_id",
        "agency_id",
        "route_short_name",
        "route_long_name",
        "route_type",
        "route_desc",
        "feed_version",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["route_id"];

    fn natural_key(&self) -> String {
        self.route_id.clone()
    }

    fn validate(&self) -> Result<(), Violation> {
        non_empty("route_id", &self.route_id)?;
        required_int("route_type", &self.route_type)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.route_id.clone())
            .push_bind(self.agency_id.clone())
            .push_bind(self.route_short_name.clone())
            .push_bind(self.route_long_name.clone())
            .push_bind(self.route_type.value())
            .push_bind(self.route_desc.clone())
            .push_bind(self.feed_version);
    }
}

impl GtfsRecord for Trip {
    const TABLE: &'static str = "trips";
    const COLUMNS: &'static [&'static str] = &[
        "route_id",
        "service_id",
        "trip_id",
        "trip_headsign",
        "direction_id",
        "shape_id",
        "feed_version",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["trip_id"];

    fn natural_key(&self) -> String {
        self.trip_id.clone()
    }

    fn validate(&self) -> Result<(), Violation> {
        non_empty("trip_id", &self.trip_id)?;
        non_empty("route_id", &self.route_id)?;
        required_int("service_id", &self.service_id)?;
        optional_int("direction_id", &self.direction_id)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.route_id.clone())
            .push_bind(self.service_id.value())
            .push_bind(self.trip_id.clone())
            .push_bind(self.trip_headsign.clone())
            .push_bind(self.direction_id.value())
            .push_bind(self.shape_id.clone())
            .push_bind(self.feed_version);
    }
}

impl GtfsRecord for Stop {
    const TABLE: &'static str = "stops";
    const COLUMNS: &'static [&'static str] = &[
        "stop_id",
        "stop_name",
        "stop_lat",
        "stop_lon",
        "location_type",
        "parent_station",
        "platform_code",
        "feed_version",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["stop_id"];

    fn natural_key(&self) -> String {
        self.stop_id.clone()
    }

    fn validate(&self) -> Result<(), Violation> {
        non_empty("stop_id", &self.stop_id)?;
        coordinate("stop_lat", &self.stop_lat, 90.0)?;
        coordinate("stop_lon", &self.stop_lon, 180.0)?;
        optional_int("location_type", &self.location_type)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.stop_id.clone())
            .push_bind(self.stop_name.clone())
            .push_bind(self.stop_lat.value())
            .push_bind(self.stop_lon.value())
            .push_bind(self.location_type.value())
            .push_bind(self.parent_station.clone())
            .push_bind(self.platform_code.clone())
            .push_bind(self.feed_version);
    }
}

impl GtfsRecord for StopTime {
    const TABLE: &'static str = "stop_times";
    const COLUMNS: &'static [&'static str] = &[
        "trip_id",
        "arrival_time",
        "departure_time",
        "stop_id",
        "stop_sequence",
        "stop_headsign",
        "pickup_type",
        "drop_off_type",
        "shape_dist_traveled",
        "timepoint",
        "feed_version",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["trip_id", "stop_sequence", "stop_id"];

    fn natural_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.trip_id,
            self.stop_sequence.value().unwrap_or_default(),
            self.stop_id
        )
    }

    fn validate(&self) -> Result<(), Violation> {
        non_empty("trip_id", &self.trip_id)?;
        non_empty("stop_id", &self.stop_id)?;
        gtfs_time("arrival_time", &self.arrival_time)?;
        gtfs_time("departure_time", &self.departure_time)?;
        required_int("stop_sequence", &self.stop_sequence)?;
        optional_int("pickup_type", &self.pickup_type)?;
        optional_int("drop_off_type", &self.drop_off_type)?;
        optional_float("shape_dist_traveled", &self.shape_dist_traveled)?;
        optional_int("timepoint", &self.timepoint)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.trip_id.clone())
            .push_bind(self.arrival_time.clone())
            .push_bind(self.departure_time.clone())
            .push_bind(self.stop_id.clone())
            .push_bind(self.stop_sequence.value())
            .push_bind(self.stop_headsign.clone())
            .push_bind(self.pickup_type.value())
            .push_bind(self.drop_off_type.value())
            .push_bind(self.shape_dist_traveled.value())
            .push_bind(self.timepoint.value())
            .push_bind(self.feed_version);
    }

    fn referenced_trip_id(&self) -> Option<&str> {
        Some(&self.trip_id)
    }
}

impl GtfsRecord for CalendarDate {
    const TABLE: &'static str = "calendar_dates";
    const COLUMNS: &'static [&'static str] = &["service_id", "date", "exception_type"];
    const KEY_COLUMNS: &'static [&'static str] = &["service_id", "date"];

    fn natural_key(&self) -> String {
        format!(
            "{}/{}",
            self.service_id.value().unwrap_or_default(),
            self.date
        )
    }

    fn validate(&self) -> Result<(), Violation> {
        required_int("service_id", &self.service_id)?;
        if NaiveDate::parse_from_str(&self.date, "%Y%m%d").is_err() {
            return Err(Violation::new("date", format!("'{}' is not YYYYMMDD", self.date)));
        }
        match self.exception_type {
            Coerced::Value(1) | Coerced::Value(2) => Ok(()),
            ref other => Err(Violation::new(
                "exception_type",
                format!("{other:?} is neither 1 nor 2"),
            )),
        }
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.service_id.value())
            .push_bind(self.date.clone())
            .push_bind(self.exception_type.value());
    }
}

impl GtfsRecord for ShapePoint {
    const TABLE: &'static str = "shapes";
    const COLUMNS: &'static [&'static str] = &[
        "shape_id",
        "shape_pt_lat",
        "shape_pt_lon",
        "shape_pt_sequence",
        "shape_dist_traveled",
        "feed_version",
    ];
    const KEY_COLUMNS: &'static [&'static str] = &["shape_id", "shape_pt_sequence"];

    fn natural_key(&self) -> String {
        format!(
            "{}/{}",
            self.shape_id,
            self.shape_pt_sequence.value().unwrap_or_default()
        )
    }

    fn validate(&self) -> Result<(), Violation> {
        non_empty("shape_id", &self.shape_id)?;
        coordinate("shape_pt_lat", &self.shape_pt_lat, 90.0)?;
        coordinate("shape_pt_lon", &self.shape_pt_lon, 180.0)?;
        required_int("shape_pt_sequence", &self.shape_pt_sequence)?;
        optional_float("shape_dist_traveled", &self.shape_dist_traveled)
    }

    fn bind_row(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.shape_id.clone())
            .push_bind(self.shape_pt_lat.value())
            .push_bind(self.shape_pt_lon.value())
            .push_bind(self.shape_pt_sequence.value())
            .push_bind(self.shape_dist_traveled.value())
            .push_bind(self.feed_version);
    }
}

fn non_empty(column: &'static str, value: &str) -> Result<(), Violation> {
    if value.is_empty() {
        Err(Violation::new(column, "is empty"))
    } else {
        Ok(())
    }
}

fn required_int(column: &'static str, value: &Coerced<i32>) -> Result<(), Violation> {
    match value {
        Coerced::Value(_) => Ok(()),
        Coerced::Null => Err(Violation::new(column, "is required")),
        Coerced::Invalid(raw) => Err(Violation::new(column, format!("'{raw}' is not an integer"))),
    }
}

fn optional_int(column: &'static str, value: &Coerced<i32>) -> Result<(), Violation> {
    match value {
        Coerced::Invalid(raw) => Err(Violation::new(column, format!("'{raw}' is not an integer"))),
        _ => Ok(()),
    }
}

fn optional_float(column: &'static str, value: &Coerced<f64>) -> Result<(), Violation> {
    match value {
        Coerced::Invalid(raw) => Err(Violation::new(column, format!("'{raw}' is not a number"))),
        Coerced::Value(v) if !v.is_finite() => Err(Violation::new(column, "is not finite")),
        _ => Ok(()),
    }
}

fn coordinate(column: &'static str, value: &Coerced<f64>, bound: f64) -> Result<(), Violation> {
    match value {
        Coerced::Value(v) if v.is_finite() && v.abs() <= bound => Ok(()),
        Coerced::Value(v) => Err(Violation::new(column, format!("{v} is out of range"))),
        Coerced::Null => Err(Violation::new(column, "is required")),
        Coerced::Invalid(raw) => Err(Violation::new(column, format!("'{raw}' is not a number"))),
    }
}

fn gtfs_time(column: &'static str, value: &str) -> Result<(), Violation> {
    match gtfs_time_to_minutes(value) {
        Some(_) => Ok(()),
        None => Err(Violation::new(column, format!("'{value}' is not HH:MM:SS"))),
    }
}
