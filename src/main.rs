//! ==============================================================================
//! main.rs - envmon host entry point
//! ==============================================================================
//!
//! purpose:
//!     runs the realtime reconciliation engine against the dashboard backend
//!     and serves the reconciled snapshot to whatever renders it.
//!
//! responsibilities:
//!     - load configuration (config/monitor.toml + env overrides)
//!     - build the auth context (static token or watched token file)
//!     - spawn the engine (push channel + status poll + liveness ticks)
//!     - serve GET /api (snapshot) and POST /api/select on the bind address
//!     - proxy the backend listings (locations, devices, csv export) with the
//!       current session token
//!     - log readings as they change, stop cleanly on ctrl-c
//!
//! architecture:
//!
//!     ┌──────────────────────────────────────────────────────────────┐
//!     │                      envmon host (this file)                  │
//!     │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐   │
//!     │  │ reading log  │   │ web server   │   │ token file watch │   │
//!     │  │ (on change)  │   │ (port 3000)  │   │ (notify)         │   │
//!     │  └──────┬───────┘   └──────┬───────┘   └────────┬─────────┘   │
//!     │         └──────────────────┼────────────────────┘             │
//!     │                     ┌──────┴──────┐                           │
//!     │                     │   engine    │ <- engine.rs              │
//!     │                     └──────┬──────┘                           │
//!     └────────────────────────────┼─────────────────────────────────┘
//!                    ws /ws/live   │   GET /api/locations/status
//!                                  ▼
//!                           dashboard backend
//!
//! ==============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use envmon_host::api::{ApiError, BackendClient, RegisterDevice};
use envmon_host::auth::{watch_token_file, AuthContext};
use envmon_host::config::MonitorConfig;
use envmon_host::domain::Reading;
use envmon_host::push::WebSocketConnector;
use envmon_host::{EngineHandle, EngineSnapshot, RealtimeEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // step 1: load configuration. the log level comes from it, so the search
    // runs first and its outcome is logged once the subscriber is up
    // (RUST_LOG wins when set)
    let loaded = MonitorConfig::load_or_default();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(loaded.config.logging.level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("envmon host starting");
    loaded.log();
    let config = loaded.config;

    // step 2: auth context
    let (auth, setter) = AuthContext::new(config.session.token.clone());
    let _token_watcher = match &config.session.token_file {
        Some(path) => Some(
            watch_token_file(path.clone(), setter.clone())
                .with_context(|| format!("failed to watch token file {}", path.display()))?,
        ),
        None => None,
    };
    if !auth.is_authenticated() {
        warn!("no bearer token yet, engine stays idle until one arrives");
    }

    // step 3: backend collaborators
    let client = BackendClient::new(&config.backend.api_url, config.request_timeout())
        .context("invalid backend url")?;
    let connector = WebSocketConnector::new(client.base_url().clone());

    // step 4: engine
    let engine = RealtimeEngine::spawn(
        config.engine_config(),
        auth.clone(),
        connector,
        client.clone(),
        config.session.location_id.clone().unwrap_or_default(),
    );

    if config.logging.show_sensor_data {
        tokio::spawn(log_readings(engine.handle()));
    }

    // step 5: snapshot server until ctrl-c
    let listener = tokio::net::TcpListener::bind(config.server.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    info!(bind = %config.server.bind, "snapshot server listening");

    let app = router(AppState { engine: engine.handle(), client, auth });
    let serve = async move { axum::serve(listener, app).await };
    tokio::select! {
        res = serve => {
            if let Err(e) = res {
                error!(error = %e, "snapshot server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    engine.stop().await;
    Ok(())
}

// ==============================================================================
// web server
// ==============================================================================

#[derive(Clone)]
struct AppState {
    engine: EngineHandle,
    client: BackendClient,
    auth: AuthContext,
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api", get(snapshot_handler))
        .route("/api/select", post(select_handler))
        .route("/api/locations", get(locations_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/register", post(register_handler))
        .route("/api/export/csv", get(export_handler))
        .route("/api/public/locations", get(public_locations_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// current reconciled state as json
async fn snapshot_handler(State(state): State<AppState>) -> Json<EngineSnapshot> {
    Json(state.engine.snapshot())
}

#[derive(Deserialize)]
struct SelectParams {
    location: String,
}

/// POST /api/select?location=<id>
async fn select_handler(
    State(state): State<AppState>,
    Query(params): Query<SelectParams>,
) -> (StatusCode, Json<serde_json::Value>) {
    state.engine.select(params.location.clone());
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "ok", "location": params.location})),
    )
}

// ------------------------------------------------------------------------------
// backend proxy
// ------------------------------------------------------------------------------

enum ProxyError {
    LoggedOut,
    Backend(ApiError),
}

impl From<ApiError> for ProxyError {
    fn from(e: ApiError) -> Self {
        Self::Backend(e)
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::LoggedOut => (StatusCode::UNAUTHORIZED, "not logged in".to_string()),
            Self::Backend(ApiError::Status { status, path }) => (
                // reqwest and axum sit on different http crate versions
                StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
                format!("backend returned {} for {}", status, path),
            ),
            Self::Backend(e) => {
                warn!(error = %e, "backend request failed");
                (StatusCode::BAD_GATEWAY, e.to_string())
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl AppState {
    fn token(&self) -> Result<String, ProxyError> {
        self.auth.token().ok_or(ProxyError::LoggedOut)
    }
}

async fn locations_handler(State(state): State<AppState>) -> Result<Response, ProxyError> {
    let token = state.token()?;
    Ok(Json(state.client.locations(&token).await?).into_response())
}

async fn devices_handler(State(state): State<AppState>) -> Result<Response, ProxyError> {
    let token = state.token()?;
    Ok(Json(state.client.devices(&token).await?).into_response())
}

async fn register_handler(
    State(state): State<AppState>,
    Json(device): Json<RegisterDevice>,
) -> Result<Response, ProxyError> {
    let token = state.token()?;
    let registration = state.client.register_device(&token, &device).await?;
    info!(device = %registration.device_id, location = %registration.assigned_location_id, "device registered");
    Ok(Json(registration).into_response())
}

async fn export_handler(State(state): State<AppState>) -> Result<Response, ProxyError> {
    let token = state.token()?;
    let csv = state.client.export_csv(&token).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv"),
            (header::CONTENT_DISPOSITION, "attachment; filename=\"sensor_data.csv\""),
        ],
        csv,
    )
        .into_response())
}

async fn public_locations_handler(State(state): State<AppState>) -> Result<Response, ProxyError> {
    Ok(Json(state.client.public_locations().await?).into_response())
}

// ==============================================================================
// reading log
// ==============================================================================

async fn log_readings(engine: EngineHandle) {
    let mut rx = engine.subscribe();
    let mut last_air = None;
    let mut last_water = None;
    let mut last_online = None;

    while rx.changed().await.is_ok() {
        let snapshot = rx.borrow_and_update().clone();

        if last_online != Some(snapshot.system_online) {
            last_online = Some(snapshot.system_online);
            info!(
                location = %snapshot.location_id,
                online = snapshot.system_online,
                air_offline = snapshot.liveness.is_air_offline,
                water_offline = snapshot.liveness.is_water_offline,
                "system status"
            );
        }

        if let Some(air) = fresh(&mut last_air, snapshot.latest_air.as_ref()) {
            info!(
                location = %snapshot.location_id,
                device = %air.device_id,
                aqi = snapshot.air_quality_index.unwrap_or(0),
                band = ?snapshot.air_quality_band,
                pm25 = air.values.get("pm25").copied().unwrap_or(0.0),
                pm10 = air.values.get("pm10").copied().unwrap_or(0.0),
                "air"
            );
        }
        if let Some(water) = fresh(&mut last_water, snapshot.latest_water.as_ref()) {
            info!(
                location = %snapshot.location_id,
                device = %water.device_id,
                level = water.values.get("level").copied().unwrap_or(0.0),
                ph = water.values.get("ph").copied().unwrap_or(0.0),
                turbidity = water.values.get("turbidity").copied().unwrap_or(0.0),
                "water"
            );
        }
    }
}

/// the reading, if it arrived after the last one logged for its category
fn fresh<'a>(last_logged: &mut Option<DateTime<Utc>>, reading: Option<&'a Reading>) -> Option<&'a Reading> {
    let reading = reading?;
    if *last_logged == Some(reading.received_at) {
        return None;
    }
    *last_logged = Some(reading.received_at);
    Some(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use envmon_host::domain::EnvelopeKind;

    fn reading(kind: EnvelopeKind, minute: u32) -> Reading {
        Reading {
            device_id: "dev-1".into(),
            kind,
            timestamp: None,
            received_at: Utc.with_ymd_and_hms(2025, 3, 1, 14, minute, 0).unwrap(),
            values: Default::default(),
        }
    }

    #[test]
    fn each_reading_is_logged_once() {
        let mut last_air = None;
        let air = reading(EnvelopeKind::AirQuality, 7);

        assert!(fresh(&mut last_air, Some(&air)).is_some());
        // a heartbeat or water frame republishes the same air reading
        assert!(fresh(&mut last_air, Some(&air)).is_none());

        let newer = reading(EnvelopeKind::AirQuality, 8);
        assert!(fresh(&mut last_air, Some(&newer)).is_some());
        assert!(fresh(&mut last_air, None).is_none());
    }

    #[test]
    fn categories_are_tracked_separately() {
        let mut last_air = None;
        let mut last_water = None;
        let air = reading(EnvelopeKind::AirQuality, 7);
        let water = reading(EnvelopeKind::WaterSensor, 9);

        assert!(fresh(&mut last_air, Some(&air)).is_some());
        assert!(fresh(&mut last_water, Some(&water)).is_some());
        assert!(fresh(&mut last_air, Some(&air)).is_none());
        assert!(fresh(&mut last_water, Some(&water)).is_none());
    }
}
