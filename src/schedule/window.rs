//! Service-day and departure-window arithmetic in GTFS extended time.
//!
//! GTFS keeps a trip that runs past midnight on the service date it started
//! on, writing its times as `24:xx:xx`, `25:xx:xx`, ... A moment shortly
//! after midnight therefore has two encodings: `00:10` of today and `24:10`
//! of yesterday's service. The window below produces one minute range per
//! service date that can contain it.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};

/// Before this local hour, the service day is still yesterday's.
pub const SERVICE_DAY_ROLLOVER_HOUR: u32 = 4;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Stop times at or past this hour of their service day are rejected.
pub const MAX_EXTENDED_HOURS: u32 = 48;

pub fn default_lookback() -> Duration {
    Duration::minutes(15)
}

pub fn default_lookahead() -> Duration {
    Duration::hours(4)
}

/// Converts `HH:MM:SS` to minutes after midnight without wrapping hours.
///
/// `"25:10:00"` is 1510. Hours from [`MAX_EXTENDED_HOURS`] on are rejected.
pub fn gtfs_time_to_minutes(time: &str) -> Option<u32> {
    let mut parts = time.trim().split(':');
    let hours: u32 = parts.next()?.parse().ok()?;
    let minutes: u32 = parts.next()?.parse().ok()?;
    let seconds: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours >= MAX_EXTENDED_HOURS || minutes >= 60 || seconds >= 60 {
        return None;
    }
    hours.checked_mul(60)?.checked_add(minutes)
}

/// Renders minutes after midnight as `HH:MM:00`, hours may exceed 23.
pub fn minutes_to_gtfs_time(minutes: i64) -> String {
    format!("{:02}:{:02}:00", minutes / 60, minutes % 60)
}

pub fn is_before_rollover(now: NaiveDateTime) -> bool {
    now.hour() < SERVICE_DAY_ROLLOVER_HOUR
}

/// The calendar date whose schedule is running at `now`.
pub fn service_date(now: NaiveDateTime) -> NaiveDate {
    let today = now.date();
    if is_before_rollover(now) {
        today.pred_opt().unwrap_or(today)
    } else {
        today
    }
}

/// Service dates whose trips can be on the road at `now`.
pub fn candidate_dates(now: NaiveDateTime) -> Vec<NaiveDate> {
    let today = now.date();
    if is_before_rollover(now) {
        vec![service_date(now), today]
    } else {
        vec![today]
    }
}

/// Departure minutes to accept for one service date, inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinuteRange {
    pub service_date: NaiveDate,
    pub from: i64,
    pub to: i64,
}

impl MinuteRange {
    pub fn contains(&self, minutes: i64) -> bool {
        self.from <= minutes && minutes <= self.to
    }

    /// Minutes between this service date's midnight and `now`'s calendar midnight.
    pub fn day_offset(&self, today: NaiveDate) -> i64 {
        (self.service_date - today).num_days() * MINUTES_PER_DAY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub now: NaiveDateTime,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeWindow {
    pub fn compute(now: NaiveDateTime, lookback: Duration, lookahead: Duration) -> Self {
        Self {
            now,
            start: now - lookback,
            end: now + lookahead,
        }
    }

    /// Window start as a wall-clock time; `23:55:00` when it falls on the
    /// previous day.
    pub fn start_time(&self) -> String {
        minutes_to_gtfs_time(self.start.hour() as i64 * 60 + self.start.minute() as i64)
    }

    /// Window end. Past the rollover hour an end after midnight stays on
    /// today's timeline (`27:45:00`); before it, the end is on the same
    /// calendar day as `now`.
    pub fn end_time(&self) -> String {
        let base = if is_before_rollover(self.now) {
            self.end.date()
        } else {
            self.now.date()
        };
        minutes_to_gtfs_time(minutes_since(base, self.end))
    }

    /// One minute range per candidate service date.
    pub fn ranges(&self) -> Vec<MinuteRange> {
        candidate_dates(self.now)
            .into_iter()
            .filter_map(|date| {
                let from = minutes_since(date, self.start).max(0);
                let to = minutes_since(date, self.end);
                (to >= from).then_some(MinuteRange {
                    service_date: date,
                    from,
                    to,
                })
            })
            .collect()
    }

    /// Whether a stored departure time on `service_date` lies in the window.
    pub fn matches(&self, service_date: NaiveDate, departure_time: &str) -> bool {
        let Some(minutes) = gtfs_time_to_minutes(departure_time) else {
            return false;
        };
        self.ranges()
            .iter()
            .any(|r| r.service_date == service_date && r.contains(minutes as i64))
    }
}

fn minutes_since(date: NaiveDate, at: NaiveDateTime) -> i64 {
    (at - date.and_time(chrono::NaiveTime::MIN)).num_minutes()
}
