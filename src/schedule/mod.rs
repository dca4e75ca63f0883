//! Departure lookups over the stored timetable.

pub mod queries;
pub mod window;

pub use queries::{CurrentTrip, ScheduleQueries, ShapePointRow, UpcomingDeparture, WindowSettings};
pub use window::{
    MinuteRange, TimeWindow, candidate_dates, default_lookahead, default_lookback,
    gtfs_time_to_minutes, service_date,
};
