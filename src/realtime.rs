//! Vehicle positions and trip updates decoded from GTFS-RT feeds.
//!
//! Realtime reads are best effort: a failed fetch or decode is logged and
//! yields an empty list.

use serde::Serialize;
use tracing::{debug, error};

use crate::fetch::{HttpClient, fetch_bytes};
use crate::gtfs_rt::{self, FeedMessage};
use crate::parser::parse_feed;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehiclePosition {
    pub entity_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub schedule_relationship: Option<String>,
    pub latitude: Option<f32>,
    pub longitude: Option<f32>,
    pub bearing: Option<f32>,
    pub speed: Option<f32>,
    pub current_stop_sequence: Option<u32>,
    pub current_status: Option<String>,
    pub stop_id: Option<String>,
    pub timestamp: Option<u64>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopTimeUpdate {
    pub stop_sequence: Option<u32>,
    pub stop_id: Option<String>,
    pub arrival_delay: Option<i32>,
    pub arrival_time: Option<i64>,
    pub departure_delay: Option<i32>,
    pub departure_time: Option<i64>,
    pub schedule_relationship: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TripUpdate {
    pub entity_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
    pub schedule_relationship: Option<String>,
    pub delay: Option<i32>,
    pub stop_time_updates: Vec<StopTimeUpdate>,
    pub vehicle_id: Option<String>,
    pub timestamp: Option<u64>,
}

/// Maps every entity carrying a vehicle payload; deleted entities and
/// entities without one are dropped.
pub fn vehicle_positions(feed: &FeedMessage) -> Vec<VehiclePosition> {
    feed.entity
        .iter()
        .filter(|entity| !entity.is_deleted())
        .filter_map(|entity| {
            let vehicle = entity.vehicle.as_ref()?;
            let trip = vehicle.trip.as_ref();
            let position = vehicle.position.as_ref();
            let descriptor = vehicle.vehicle.as_ref();
            Some(VehiclePosition {
                entity_id: entity.id.clone(),
                trip_id: trip.and_then(|t| t.trip_id.clone()),
                route_id: trip.and_then(|t| t.route_id.clone()),
                schedule_relationship: trip.and_then(trip_relationship),
                latitude: position.map(|p| p.latitude),
                longitude: position.map(|p| p.longitude),
                bearing: position.and_then(|p| p.bearing),
                speed: position.and_then(|p| p.speed),
                current_stop_sequence: vehicle.current_stop_sequence,
                current_status: vehicle
                    .current_status
                    .map(|_| vehicle.current_status().as_str_name().to_string()),
                stop_id: vehicle.stop_id.clone(),
                timestamp: vehicle.timestamp,
                vehicle_id: descriptor.and_then(|v| v.id.clone()),
                vehicle_label: descriptor.and_then(|v| v.label.clone()),
            })
        })
        .collect()
}

/// Maps every entity carrying a trip update; deleted entities and entities
/// without one are dropped.
pub fn trip_updates(feed: &FeedMessage) -> Vec<TripUpdate> {
    feed.entity
        .iter()
        .filter(|entity| !entity.is_deleted())
        .filter_map(|entity| {
            let update = entity.trip_update.as_ref()?;
            Some(TripUpdate {
                entity_id: entity.id.clone(),
                trip_id: update.trip.trip_id.clone(),
                route_id: update.trip.route_id.clone(),
                start_date: update.trip.start_date.clone(),
                start_time: update.trip.start_time.clone(),
                schedule_relationship: trip_relationship(&update.trip),
                delay: update.delay,
                stop_time_updates: update.stop_time_update.iter().map(stop_time_update).collect(),
                vehicle_id: update.vehicle.as_ref().and_then(|v| v.id.clone()),
                timestamp: update.timestamp,
            })
        })
        .collect()
}

fn trip_relationship(trip: &gtfs_rt::TripDescriptor) -> Option<String> {
    trip.schedule_relationship
        .map(|_| trip.schedule_relationship().as_str_name().to_string())
}

fn stop_time_update(stu: &gtfs_rt::trip_update::StopTimeUpdate) -> StopTimeUpdate {
    StopTimeUpdate {
        stop_sequence: stu.stop_sequence,
        stop_id: stu.stop_id.clone(),
        arrival_delay: stu.arrival.as_ref().and_then(|e| e.delay),
        arrival_time: stu.arrival.as_ref().and_then(|e| e.time),
        departure_delay: stu.departure.as_ref().and_then(|e| e.delay),
        departure_time: stu.departure.as_ref().and_then(|e| e.time),
        schedule_relationship: stu.schedule_relationship().as_str_name().to_string(),
    }
}

/// Fetches and decodes the configured realtime endpoints.
pub struct RealtimeClient {
    client: Box<dyn HttpClient>,
    vehicle_positions_url: Option<String>,
    trip_updates_url: Option<String>,
}

impl RealtimeClient {
    pub fn new(
        client: Box<dyn HttpClient>,
        vehicle_positions_url: Option<String>,
        trip_updates_url: Option<String>,
    ) -> Self {
        Self {
            client,
            vehicle_positions_url,
            trip_updates_url,
        }
    }

    pub async fn fetch_vehicle_positions(&self) -> Vec<VehiclePosition> {
        match self.fetch_feed(self.vehicle_positions_url.as_deref()).await {
            Some(feed) => vehicle_positions(&feed),
            None => Vec::new(),
        }
    }

    pub async fn fetch_trip_updates(&self) -> Vec<TripUpdate> {
        match self.fetch_feed(self.trip_updates_url.as_deref()).await {
            Some(feed) => trip_updates(&feed),
            None => Vec::new(),
        }
    }

    async fn fetch_feed(&self, url: Option<&str>) -> Option<FeedMessage> {
        let Some(url) = url else {
            debug!("Realtime endpoint not configured");
            return None;
        };

        let bytes = match fetch_bytes(self.client.as_ref(), url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Realtime fetch failed");
                return None;
            }
        };

        match parse_feed(&bytes) {
            Ok(feed) => {
                debug!(url, entities = feed.entity.len(), "Realtime feed decoded");
                Some(feed)
            }
            Err(e) => {
                error!(url, error = ?e, "Realtime decode failed");
                None
            }
        }
    }
}
