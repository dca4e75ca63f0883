//! HTTP surface: the scheduled ingest trigger and the read endpoints.

use actix_web::http::header;
use actix_web::{App, HttpRequest, HttpResponse, HttpServer, middleware, web};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::ingest::IngestJob;
use crate::realtime::RealtimeClient;
use crate::schedule::ScheduleQueries;
use crate::sink::PgSink;

pub struct AppState {
    pub pool: PgPool,
    pub queries: ScheduleQueries,
    pub realtime: RealtimeClient,
    pub ingest: IngestJob,
    pub cron_secret: Option<String>,
}

/// True when `authorization` is exactly `Bearer <secret>`. With no secret
/// configured every request is refused.
pub fn authorized(authorization: Option<&str>, secret: Option<&str>) -> bool {
    match (authorization, secret) {
        (Some(value), Some(secret)) if !secret.is_empty() => {
            value.strip_prefix("Bearer ") == Some(secret)
        }
        _ => false,
    }
}

async fn cron_ingest(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if !authorized(authorization, state.cron_secret.as_deref()) {
        warn!(peer = ?req.peer_addr(), "Rejected ingest trigger");
        return HttpResponse::Unauthorized().json(json!({ "error": "Unauthorized" }));
    }

    info!("Ingest triggered");
    match state.ingest.run(PgSink::new(state.pool.clone())).await {
        Ok(report) => HttpResponse::Ok().json(json!({
            "success": true,
            "feed_version": report.feed_version,
        })),
        Err(e) => {
            error!(error = %e, "Triggered ingest failed");
            HttpResponse::InternalServerError().json(json!({ "success": false }))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DepartureParams {
    route: String,
    stop: String,
}

async fn departures(
    state: web::Data<AppState>,
    params: web::Query<DepartureParams>,
) -> HttpResponse {
    let rows = state
        .queries
        .upcoming_departures(&params.route, &params.stop, Utc::now())
        .await;
    HttpResponse::Ok().json(rows)
}

#[derive(Debug, Deserialize)]
pub struct RouteParams {
    route: String,
}

/// Trips of a route that currently have a vehicle reporting a position.
async fn current_trips(
    state: web::Data<AppState>,
    params: web::Query<RouteParams>,
) -> HttpResponse {
    let trip_ids: Vec<String> = state
        .realtime
        .fetch_vehicle_positions()
        .await
        .into_iter()
        .filter_map(|v| v.trip_id)
        .collect();
    let trips = state
        .queries
        .select_current_trips(&trip_ids, &params.route)
        .await;
    HttpResponse::Ok().json(trips)
}

async fn vehicles(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.realtime.fetch_vehicle_positions().await)
}

async fn trip_updates(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.realtime.fetch_trip_updates().await)
}

async fn shape(state: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    HttpResponse::Ok().json(state.queries.shape_points(&path).await)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health)).service(
        web::scope("/api")
            .route("/cron/ingest", web::get().to(cron_ingest))
            .route("/departures", web::get().to(departures))
            .route("/current-trips", web::get().to(current_trips))
            .route("/vehicles", web::get().to(vehicles))
            .route("/trip-updates", web::get().to(trip_updates))
            .route("/shapes/{shape_id}", web::get().to(shape)),
    );
}

pub async fn serve(state: AppState, bind_addr: &str) -> std::io::Result<()> {
    let state = web::Data::new(state);
    info!(bind_addr, "Starting HTTP server");

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind(bind_addr)?
    .run()
    .await
}
