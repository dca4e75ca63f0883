//! CLI entry point for the GTFS ingestion service.
//!
//! Provides subcommands for running an ingest, applying the schema, serving
//! the HTTP API, and querying departures or realtime data from the shell.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use gtfs_ingest::{
    config::Config,
    fetch::{feed_client, load_feed},
    ingest::IngestJob,
    output::{print_json, print_pretty},
    parser::parse_feed,
    realtime::{RealtimeClient, trip_updates, vehicle_positions},
    schedule::{ScheduleQueries, WindowSettings, default_lookback},
    server::{AppState, serve},
    sink::{MemorySink, PgSink, connect, migrate},
};
use serde::Serialize;
use std::ffi::OsStr;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_ingest")]
#[command(about = "Ingest GTFS feeds into Postgres and serve departures", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download the static feed and upsert it
    Ingest {
        /// Feed URL, overrides GTFS_STATIC_URL
        #[arg(long)]
        url: Option<String>,

        /// Parse and validate without writing to the database
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// CSV file to append the run report to, overrides INGEST_REPORT_PATH
        #[arg(short, long)]
        report: Option<String>,

        /// Seconds between progress reports
        #[arg(long, default_value_t = 30)]
        progress_every: u64,
    },
    /// Apply the database schema
    Migrate,
    /// Serve the HTTP API
    Serve {
        /// Listen address, overrides BIND_ADDR
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Print upcoming departures of a route from a stop
    Departures {
        /// Route short name, e.g. "4"
        #[arg(long)]
        route: String,

        /// Stop name, e.g. "Slussen"
        #[arg(long)]
        stop: String,

        /// Query instant in RFC 3339, defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },
    /// Print vehicle positions from a file, a URL or VEHICLE_POSITIONS_URL
    Vehicles {
        #[arg(value_name = "FILE_OR_URL")]
        source: Option<String>,
    },
    /// Print trip updates from a file, a URL or TRIP_UPDATES_URL
    TripUpdates {
        #[arg(value_name = "FILE_OR_URL")]
        source: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Ingest {
            url,
            dry_run,
            report,
            progress_every,
        } => {
            let url = match url {
                Some(url) => url,
                None => config.require_static_feed_url()?.to_string(),
            };
            let job = IngestJob {
                client: feed_client(config.api_key.clone()),
                url,
                timezone: config.timezone,
                report_path: report.or(config.ingest_report_path.clone()),
                progress_every: Duration::from_secs(progress_every),
            };

            let report = if dry_run {
                info!("Dry run, nothing is written to the database");
                job.run(MemorySink::new()).await?
            } else {
                let pool = connect(config.require_database_url()?, config.db_max_connections).await?;
                job.run(PgSink::new(pool)).await?
            };
            print_pretty(&report);
            print_json(&report)?;
        }
        Commands::Migrate => {
            let pool = connect(config.require_database_url()?, config.db_max_connections).await?;
            migrate(&pool).await?;
            info!("Schema is up to date");
        }
        Commands::Serve { bind } => {
            let pool = connect(config.require_database_url()?, config.db_max_connections).await?;
            let state = AppState {
                queries: schedule_queries(&config, pool.clone()),
                realtime: realtime_client(&config),
                ingest: IngestJob {
                    client: feed_client(config.api_key.clone()),
                    url: config.require_static_feed_url()?.to_string(),
                    timezone: config.timezone,
                    report_path: config.ingest_report_path.clone(),
                    progress_every: Duration::from_secs(30),
                },
                pool,
                cron_secret: config.cron_secret.clone(),
            };
            let bind = bind.unwrap_or_else(|| config.bind_addr.clone());
            serve(state, &bind).await?;
        }
        Commands::Departures { route, stop, at } => {
            let pool = connect(config.require_database_url()?, config.db_max_connections).await?;
            let departures = schedule_queries(&config, pool)
                .upcoming_departures(&route, &stop, at.unwrap_or_else(Utc::now))
                .await;
            info!(count = departures.len(), "Departures found");
            print_rows(&departures)?;
        }
        Commands::Vehicles { source } => {
            let positions = match source {
                Some(source) => vehicle_positions(&parse_feed(
                    &load_feed(&source, config.api_key.clone()).await?,
                )?),
                None => realtime_client(&config).fetch_vehicle_positions().await,
            };
            print_rows(&positions)?;
        }
        Commands::TripUpdates { source } => {
            let updates = match source {
                Some(source) => trip_updates(&parse_feed(
                    &load_feed(&source, config.api_key.clone()).await?,
                )?),
                None => realtime_client(&config).fetch_trip_updates().await,
            };
            print_rows(&updates)?;
        }
    }

    Ok(())
}

fn schedule_queries(config: &Config, pool: sqlx::PgPool) -> ScheduleQueries {
    let settings = WindowSettings {
        lookback: default_lookback(),
        lookahead: config.lookahead,
        limit: config.departure_limit,
    };
    ScheduleQueries::new(pool, config.timezone, settings)
}

fn realtime_client(config: &Config) -> RealtimeClient {
    RealtimeClient::new(
        feed_client(config.api_key.clone()),
        config.vehicle_positions_url.clone(),
        config.trip_updates_url.clone(),
    )
}

fn print_rows<T: Serialize>(rows: &[T]) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(rows)?);
    Ok(())
}
