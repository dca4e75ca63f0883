//! Raw CSV rows and their coercion into typed records.
//!
//! Every raw field is read as text; missing columns default to an empty
//! string. Normalization never fails: bad numbers end up as
//! [`Coerced::Invalid`] and are rejected later by batch validation.

use std::str::FromStr;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::model::{CalendarDate, Coerced, Route, ShapePoint, Stop, StopTime, Trip};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawRoute {
    pub route_id: String,
    pub agency_id: String,
    pub route_short_name: String,
    pub route_long_name: String,
    pub route_type: String,
    pub route_desc: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawTrip {
    pub route_id: String,
    pub service_id: String,
    pub trip_id: String,
    pub trip_headsign: String,
    pub direction_id: String,
    pub shape_id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawStop {
    pub stop_id: String,
    pub stop_name: String,
    pub stop_lat: String,
    pub stop_lon: String,
    pub location_type: String,
    pub parent_station: String,
    pub platform_code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawStopTime {
    pub trip_id: String,
    pub arrival_time: String,
    pub departure_time: String,
    pub stop_id: String,
    pub stop_sequence: String,
    pub stop_headsign: String,
    pub pickup_type: String,
    pub drop_off_type: String,
    pub shape_dist_traveled: String,
    pub timepoint: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawCalendarDate {
    pub service_id: String,
    pub date: String,
    pub exception_type: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawShapePoint {
    pub shape_id: String,
    pub shape_pt_lat: String,
    pub shape_pt_lon: String,
    pub shape_pt_sequence: String,
    pub shape_dist_traveled: String,
}

/// Parses a numeric cell. Empty text is null, anything unparseable is kept
/// as `Invalid`.
pub fn coerce<T: FromStr>(raw: &str) -> Coerced<T> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Coerced::Null;
    }
    match raw.parse() {
        Ok(v) => Coerced::Value(v),
        Err(_) => Coerced::Invalid(raw.to_string()),
    }
}

pub fn normalize_route(raw: RawRoute, feed_version: NaiveDate) -> Route {
    Route {
        route_type: coerce(&raw.route_type),
        route_id: raw.route_id,
        agency_id: raw.agency_id,
        route_short_name: raw.route_short_name,
        route_long_name: raw.route_long_name,
        route_desc: raw.route_desc,
        feed_version,
    }
}

pub fn normalize_trip(raw: RawTrip, feed_version: NaiveDate) -> Trip {
    Trip {
        service_id: coerce(&raw.service_id),
        direction_id: coerce(&raw.direction_id),
        route_id: raw.route_id,
        trip_id: raw.trip_id,
        trip_headsign: raw.trip_headsign,
        shape_id: raw.shape_id,
        feed_version,
    }
}

pub fn normalize_stop(raw: RawStop, feed_version: NaiveDate) -> Stop {
    Stop {
        stop_lat: coerce(&raw.stop_lat),
        stop_lon: coerce(&raw.stop_lon),
        location_type: coerce(&raw.location_type),
        stop_id: raw.stop_id,
        stop_name: raw.stop_name,
        parent_station: raw.parent_station,
        platform_code: raw.platform_code,
        feed_version,
    }
}

pub fn normalize_stop_time(raw: RawStopTime, feed_version: NaiveDate) -> StopTime {
    StopTime {
        stop_sequence: coerce(&raw.stop_sequence),
        pickup_type: coerce(&raw.pickup_type),
        drop_off_type: coerce(&raw.drop_off_type),
        shape_dist_traveled: coerce(&raw.shape_dist_traveled),
        timepoint: coerce(&raw.timepoint),
        trip_id: raw.trip_id,
        arrival_time: raw.arrival_time,
        departure_time: raw.departure_time,
        stop_id: raw.stop_id,
        stop_headsign: raw.stop_headsign,
        feed_version,
    }
}

pub fn normalize_calendar_date(raw: RawCalendarDate) -> CalendarDate {
    CalendarDate {
        service_id: coerce(&raw.service_id),
        exception_type: coerce(&raw.exception_type),
        date: raw.date,
    }
}

pub fn normalize_shape_point(raw: RawShapePoint, feed_version: NaiveDate) -> ShapePoint {
    ShapePoint {
        shape_pt_lat: coerce(&raw.shape_pt_lat),
        shape_pt_lon: coerce(&raw.shape_pt_lon),
        shape_pt_sequence: coerce(&raw.shape_pt_sequence),
        shape_dist_traveled: coerce(&raw.shape_dist_traveled),
        shape_id: raw.shape_id,
        feed_version,
    }
}
