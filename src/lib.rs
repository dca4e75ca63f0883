pub mod config;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod ingest;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod output;
pub mod parser;
pub mod realtime;
pub mod schedule;
pub mod server;
pub mod sink;
pub mod upsert;

pub mod gtfs_rt {
    include!(concat!(env!("OUT_DIR"), "/transit_realtime.rs"));
}
