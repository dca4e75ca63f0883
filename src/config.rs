//! Process configuration read from the environment (and `.env` via dotenvy).

use std::env;
use std::str::FromStr;

use chrono::Duration;
use chrono_tz::Tz;

use crate::error::PipelineError;

/// Everything the binary needs to build its clients, pool and server.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub static_feed_url: Option<String>,
    pub api_key: Option<String>,
    pub vehicle_positions_url: Option<String>,
    pub trip_updates_url: Option<String>,
    pub cron_secret: Option<String>,
    pub timezone: Tz,
    pub departure_limit: i64,
    pub lookahead: Duration,
    pub ingest_report_path: Option<String>,
    pub bind_addr: String,
}

impl Config {
    /// Reads the configuration from process environment variables.
    ///
    /// Every value has a default or is optional here. Commands that need the
    /// database or the static feed check for them with the `require_*`
    /// accessors, so reading a realtime file works with an empty environment.
    pub fn from_env() -> Result<Self, PipelineError> {
        Ok(Self {
            database_url: optional("DATABASE_URL"),
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 5)?,
            static_feed_url: optional("GTFS_STATIC_URL"),
            api_key: optional("GTFS_API_KEY"),
            vehicle_positions_url: optional("VEHICLE_POSITIONS_URL"),
            trip_updates_url: optional("TRIP_UPDATES_URL"),
            cron_secret: optional("CRON_SECRET"),
            timezone: timezone(optional("GTFS_TIMEZONE").as_deref())?,
            departure_limit: parsed("DEPARTURE_LIMIT", 20)?,
            lookahead: Duration::minutes(parsed("LOOKAHEAD_MINUTES", 240)?),
            ingest_report_path: optional("INGEST_REPORT_PATH"),
            bind_addr: optional("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, PipelineError> {
        required(self.database_url.as_deref(), "DATABASE_URL")
    }

    pub fn require_static_feed_url(&self) -> Result<&str, PipelineError> {
        required(self.static_feed_url.as_deref(), "GTFS_STATIC_URL")
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, PipelineError> {
    value.ok_or_else(|| PipelineError::Config(format!("{name} must be set")))
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, PipelineError> {
    match optional(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| PipelineError::Config(format!("{name}='{raw}' is not a valid number"))),
    }
}

/// Resolves an IANA timezone name; Stockholm when unset.
pub fn timezone(name: Option<&str>) -> Result<Tz, PipelineError> {
    match name {
        None => Ok(chrono_tz::Europe::Stockholm),
        Some(name) => Tz::from_str(name)
            .map_err(|_| PipelineError::Config(format!("unknown timezone '{name}'"))),
    }
}
