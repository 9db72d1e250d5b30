//! HTTP API for the dashboard.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;
use tracing::warn;

use greenhouse_common::{
    Actuator, ClimateSettings, ControlMode, LightMode, LightSchedule, TempSchedule, TriggerMode,
};

use crate::climate::ClimateController;
use crate::gateway::BoardGateway;
use crate::history::History;
use crate::light::LightScheduler;
use crate::predictor::Predictor;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ClimateController>,
    pub light: Arc<LightScheduler>,
    pub gateway: Arc<BoardGateway>,
    pub store: Store,
    pub history: History,
    pub predictor: Arc<Predictor>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(rename = "boardConnected")]
    board_connected: bool,
    climate: greenhouse_common::ClimateStatus,
    #[serde(rename = "lightMode")]
    light_mode: LightMode,
    #[serde(rename = "lightSchedule")]
    light_schedule: LightSchedule,
}

#[derive(Debug, Deserialize)]
struct RelayUpdate {
    state: bool,
}

#[derive(Debug, Serialize)]
struct RelayResponse {
    success: bool,
    relay: String,
    state: bool,
}

#[derive(Debug, Deserialize)]
struct ModeUpdate {
    mode: String,
}

/// Partial settings update; absent fields keep their current value.
#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    #[serde(default)]
    target_temp: Option<f32>,
    #[serde(default)]
    temp_tolerance: Option<f32>,
    #[serde(default)]
    target_humidity: Option<f32>,
    #[serde(default)]
    humidity_tolerance: Option<f32>,
    #[serde(default)]
    use_ml: Option<bool>,
}

#[derive(Debug, Serialize)]
struct MlStatus {
    enabled: bool,
    trained: bool,
}

#[derive(Debug, Deserialize)]
struct MlToggle {
    enabled: bool,
}

pub fn router(state: AppState, web_root: String) -> Router {
    Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/sensors/current", get(handle_get_current_sensors))
        .route("/api/sensors/history", get(handle_get_sensor_history))
        .route("/api/relays", get(handle_get_relays))
        .route("/api/relays/history", get(handle_get_relay_history))
        .route("/api/relays/{name}", post(handle_set_relay))
        .route(
            "/api/climate/mode",
            get(handle_get_climate_mode).post(handle_set_climate_mode),
        )
        .route(
            "/api/climate/settings",
            get(handle_get_climate_settings).post(handle_set_climate_settings),
        )
        .route(
            "/api/light/mode",
            get(handle_get_light_mode).post(handle_set_light_mode),
        )
        .route(
            "/api/light/schedule",
            get(handle_get_light_schedule).post(handle_set_light_schedule),
        )
        .route(
            "/api/temp/schedule",
            get(handle_get_temp_schedule).post(handle_set_temp_schedule),
        )
        .route("/api/settings", get(handle_get_settings))
        .route(
            "/api/ml/status",
            get(handle_get_ml_status),
        )
        .route("/api/ml/toggle", post(handle_ml_toggle))
        .fallback_service(ServeDir::new(web_root))
        .with_state(state)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let board_connected = state.gateway.ping().await.is_ok();
    Json(StatusResponse {
        board_connected,
        climate: state.controller.status().await,
        light_mode: state.light.mode().await,
        light_schedule: state.light.schedule().await,
    })
}

async fn handle_get_current_sensors(State(state): State<AppState>) -> impl IntoResponse {
    match state.controller.current_conditions().await {
        Some(conditions) => Json(conditions).into_response(),
        None => error_response(StatusCode::SERVICE_UNAVAILABLE, "No sensor reading yet"),
    }
}

async fn handle_get_sensor_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let hours = params
        .get("hours")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|hours| (0.0..=crate::history::RETENTION_HOURS).contains(hours))
        .unwrap_or(24.0);

    match state.history.recent_samples(hours).await {
        Ok(samples) => Json(samples).into_response(),
        Err(err) => {
            warn!("history read failed: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read sensor history",
            )
        }
    }
}

async fn handle_get_relay_history(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let hours = params
        .get("hours")
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|hours| (0.0..=crate::history::RETENTION_HOURS).contains(hours))
        .unwrap_or(24.0);

    match state.history.recent_transitions(hours).await {
        Ok(events) => Json(events).into_response(),
        Err(err) => {
            warn!("transition history read failed: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read relay history",
            )
        }
    }
}

async fn handle_get_relays(State(state): State<AppState>) -> impl IntoResponse {
    match state.gateway.actuator_states().await {
        Ok(relays) => Json(relays).into_response(),
        Err(err) => {
            warn!("relay state read failed: {err}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "Board not reachable")
        }
    }
}

/// Manual relay control. Climate actuators are refused while the climate
/// loop is in auto mode, the light while it is in schedule mode.
async fn handle_set_relay(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<RelayUpdate>,
) -> impl IntoResponse {
    let Some(actuator) = Actuator::parse(&name) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid relay name");
    };

    if Actuator::CLIMATE.contains(&actuator) && state.controller.mode() == ControlMode::Auto {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Climate controller is in auto mode; switch to manual first",
        );
    }
    if actuator == Actuator::Light && state.light.mode().await == LightMode::Schedule {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Light is in schedule mode; switch to manual first",
        );
    }

    if let Err(err) = state.gateway.set_actuator(actuator, update.state).await {
        warn!("manual relay write failed: {err}");
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Failed to control relay");
    }

    if let Err(err) = state
        .history
        .log_transition(actuator, update.state, TriggerMode::Manual)
        .await
    {
        warn!("failed to record manual transition: {err:#}");
    }

    Json(RelayResponse {
        success: true,
        relay: name,
        state: update.state,
    })
    .into_response()
}

async fn handle_get_climate_mode(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "mode": state.controller.mode() }))
}

async fn handle_set_climate_mode(
    State(state): State<AppState>,
    Json(update): Json<ModeUpdate>,
) -> impl IntoResponse {
    let Some(mode) = ControlMode::parse(&update.mode) else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid mode. Use 'auto' or 'manual'");
    };

    if let Err(err) = state.controller.set_mode(mode).await {
        warn!("failed to persist mode change: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist mode");
    }

    Json(serde_json::json!({ "mode": mode })).into_response()
}

async fn handle_get_climate_settings(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.controller.status().await;
    Json(ClimateSettings {
        target_temp: status.target_temp,
        temp_tolerance: status.temp_tolerance,
        target_humidity: status.target_humidity,
        humidity_tolerance: status.humidity_tolerance,
        use_ml: status.use_ml,
    })
}

async fn handle_set_climate_settings(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> impl IntoResponse {
    let status = state.controller.status().await;
    let settings = ClimateSettings {
        target_temp: update.target_temp.unwrap_or(status.target_temp),
        temp_tolerance: update.temp_tolerance.unwrap_or(status.temp_tolerance),
        target_humidity: update.target_humidity.unwrap_or(status.target_humidity),
        humidity_tolerance: update
            .humidity_tolerance
            .unwrap_or(status.humidity_tolerance),
        use_ml: update.use_ml.unwrap_or(status.use_ml),
    };

    if let Err(err) = state.controller.update_settings(settings).await {
        warn!("failed to persist settings update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist settings",
        );
    }

    handle_get_climate_settings(State(state)).await.into_response()
}

async fn handle_get_light_mode(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({ "mode": state.light.mode().await }))
}

async fn handle_set_light_mode(
    State(state): State<AppState>,
    Json(update): Json<ModeUpdate>,
) -> impl IntoResponse {
    let Some(mode) = LightMode::parse(&update.mode) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "Invalid mode. Use 'schedule' or 'manual'",
        );
    };

    if let Err(err) = state.light.set_mode(mode).await {
        warn!("failed to persist light mode: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist mode");
    }

    Json(serde_json::json!({ "mode": mode })).into_response()
}

async fn handle_get_light_schedule(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.light.schedule().await)
}

async fn handle_set_light_schedule(
    State(state): State<AppState>,
    Json(schedule): Json<LightSchedule>,
) -> impl IntoResponse {
    if let Err(err) = state.light.set_schedule(schedule).await {
        return error_response(StatusCode::BAD_REQUEST, &err.to_string());
    }
    Json(state.light.schedule().await).into_response()
}

async fn handle_get_temp_schedule(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.controller.temp_schedule().await)
}

async fn handle_set_temp_schedule(
    State(state): State<AppState>,
    Json(schedule): Json<TempSchedule>,
) -> impl IntoResponse {
    if let Err(err) = state.controller.set_temp_schedule(schedule).await {
        warn!("failed to persist temp schedule: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist schedule",
        );
    }
    Json(state.controller.temp_schedule().await).into_response()
}

async fn handle_get_settings(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.load_settings().await {
        Ok(settings) => Json(settings).into_response(),
        Err(err) => {
            warn!("settings read failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read settings")
        }
    }
}

async fn handle_get_ml_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(MlStatus {
        enabled: state.controller.status().await.use_ml,
        trained: state.predictor.is_trained(),
    })
}

async fn handle_ml_toggle(
    State(state): State<AppState>,
    Json(update): Json<MlToggle>,
) -> impl IntoResponse {
    if let Err(err) = state
        .store
        .set_setting("use_ml", if update.enabled { "true" } else { "false" })
        .await
    {
        warn!("failed to persist ml toggle: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist toggle");
    }
    Json(serde_json::json!({ "ml_enabled": update.enabled })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
