use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

use crate::auth::AuthUser;
use crate::automation::{update_all_farms, update_farm_status, FarmUpdateOutcome};
use crate::config::AutomationSettings;
use crate::db::{Db, Farm, Reading, Sensor, SystemStatus};
use crate::error::{ApiError, ApiResult};
use crate::state::{EventsResponse, SharedState};
use crate::suggestions::{farmer_suggestions, irrigation_schedule};
use crate::weather::{weather_report, WeatherClient};

const DEFAULT_READING_HOURS: i64 = 24;
const MAX_READING_HOURS: i64 = 24 * 366;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub shared: SharedState,
    pub weather: WeatherClient,
    pub settings: Arc<AutomationSettings>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/events", get(events))
        .route("/api/farms", get(list_farms))
        .route("/api/farms/{id}/status", get(farm_status))
        .route("/api/farms/{id}/sensors", get(farm_sensors))
        .route("/api/sensors/{sensor_id}/readings", get(sensor_readings))
        .route("/api/automation/update/{id}", post(update_one))
        .route("/api/automation/update-all", post(update_all))
        .route("/api/automation/weather/{id}", get(weather))
        .route("/api/automation/suggestions/{id}", get(suggestions))
        .route("/api/automation/schedule/{id}", get(schedule))
        .with_state(state)
}

/// Look up a farm the caller is allowed to see.
async fn visible_farm(state: &AppState, user: &AuthUser, farm_id: i64) -> ApiResult<Farm> {
    let farm = state
        .db
        .get_farm(farm_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("farm {farm_id}")))?;
    user.ensure_access(&farm)?;
    Ok(farm)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn events(_user: AuthUser, State(state): State<AppState>) -> Json<EventsResponse> {
    let st = state.shared.read().await;
    Json(st.to_response())
}

async fn list_farms(user: AuthUser, State(state): State<AppState>) -> ApiResult<Json<Vec<Farm>>> {
    let farms = state
        .db
        .load_farms()
        .await?
        .into_iter()
        .filter(|f| user.can_access(f))
        .collect();
    Ok(Json(farms))
}

async fn farm_status(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<SystemStatus>> {
    let farm = visible_farm(&state, &user, farm_id).await?;
    let cfg = state.settings.for_farm(farm_id);
    let status = state
        .db
        .get_or_create_status(&farm, cfg.initial_battery_level, Utc::now().timestamp())
        .await?;
    Ok(Json(status))
}

async fn farm_sensors(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<Vec<Sensor>>> {
    visible_farm(&state, &user, farm_id).await?;
    Ok(Json(state.db.sensors_for_farm(farm_id).await?))
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    hours: Option<i64>,
}

/// Sensor ids contain a slash (`node/channel`); clients percent-encode it.
async fn sensor_readings(
    user: AuthUser,
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(q): Query<ReadingsQuery>,
) -> ApiResult<Json<Vec<Reading>>> {
    let hours = q.hours.unwrap_or(DEFAULT_READING_HOURS);
    if !(1..=MAX_READING_HOURS).contains(&hours) {
        return Err(ApiError::BadRequest(format!(
            "hours must be between 1 and {MAX_READING_HOURS}"
        )));
    }

    let sensor = state
        .db
        .get_sensor(&sensor_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("sensor {sensor_id}")))?;
    visible_farm(&state, &user, sensor.farm_id).await?;

    let since = Utc::now().timestamp() - hours * 3600;
    Ok(Json(state.db.readings_since(&sensor_id, since).await?))
}

async fn update_one(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<SystemStatus>> {
    let farm = visible_farm(&state, &user, farm_id).await?;
    let cfg = state.settings.for_farm(farm_id);
    let status = update_farm_status(&state.db, &state.weather, cfg, &farm, Utc::now()).await?;

    state
        .shared
        .write()
        .await
        .record_update(&FarmUpdateOutcome::updated(&farm, &status));

    Ok(Json(status))
}

async fn update_all(user: AuthUser, State(state): State<AppState>) -> ApiResult<Json<Value>> {
    user.ensure_operator()?;
    info!(user = %user.username, "batch update requested");

    let outcomes =
        update_all_farms(&state.db, &state.weather, &state.settings, Utc::now()).await?;

    {
        let mut st = state.shared.write().await;
        for outcome in &outcomes {
            st.record_update(outcome);
        }
    }

    Ok(Json(json!({ "updated_farms": outcomes })))
}

async fn weather(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let farm = visible_farm(&state, &user, farm_id).await?;
    let days = state.settings.for_farm(farm_id).forecast_days;
    let report = weather_report(&state.weather, &farm, days, Utc::now()).await;

    Ok(Json(json!({
        "current": report.current,
        "forecast_tomorrow": report.tomorrow,
        "forecast": report.forecast,
    })))
}

async fn suggestions(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let farm = visible_farm(&state, &user, farm_id).await?;
    let status = state.db.get_status(farm_id).await?;
    let cfg = state.settings.for_farm(farm_id);
    let report = weather_report(&state.weather, &farm, cfg.forecast_days, Utc::now()).await;

    Ok(Json(json!({
        "suggestions": farmer_suggestions(status.as_ref(), &report.forecast, cfg),
        "generated_at": Utc::now().to_rfc3339(),
    })))
}

async fn schedule(
    user: AuthUser,
    State(state): State<AppState>,
    Path(farm_id): Path<i64>,
) -> ApiResult<Json<Value>> {
    let farm = visible_farm(&state, &user, farm_id).await?;
    let days = state.settings.for_farm(farm_id).forecast_days;
    let report = weather_report(&state.weather, &farm, days, Utc::now()).await;

    Ok(Json(json!({ "schedule": irrigation_schedule(&report.forecast) })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web api listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
