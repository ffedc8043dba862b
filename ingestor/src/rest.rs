use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::dispatch::IngressHandle;
use crate::errors::Error;
use crate::fanout::FanOut;
use crate::gateway::decode_direct;
use crate::model::{Alert, AlertQuery, Device, DirectReading, ListResponse, Reading, ReadingQuery};
use crate::store::{page_bounds, Stores};
use crate::ws::ws_handler;

#[derive(Clone)]
pub struct AppState {
    pub stores: Stores,
    pub ingress: IngressHandle,
    pub fanout: Arc<FanOut>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    pub reading: Reading,
    pub alerts: Vec<Alert>,
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    pub actor: String,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/readings", get(list_readings).post(ingest_reading))
        .route("/api/v1/devices/:device_id", get(get_device))
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/alerts/:alert_id/acknowledge", post(acknowledge_alert))
        .route("/api/v1/alerts/:alert_id/resolve", post(resolve_alert))
        .route("/ws/farms/:farm_id", get(ws_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn list_readings(
    State(state): State<AppState>,
    Query(mut params): Query<ReadingQuery>,
) -> Result<Json<ListResponse<Reading>>, AppError> {
    let (limit, offset) = page_bounds(params.limit, params.offset);
    params.limit = Some(limit);
    params.offset = Some(offset);

    let readings = state.stores.readings.list_readings(&params).await?;
    let total = state.stores.readings.count_readings(&params).await?;

    Ok(Json(ListResponse {
        total,
        data: readings,
        limit,
        offset,
    }))
}

/// Synchronous ingress: the reading goes through its device lane like a bus
/// message, and the caller gets the stored reading and any alerts back.
async fn ingest_reading(
    State(state): State<AppState>,
    Json(request): Json<DirectReading>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    let event = decode_direct(request)?;
    debug!("Direct reading for {}", event.device_id);

    let outcome = state.ingress.submit(event).await?;

    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            reading: outcome.reading,
            alerts: outcome.alerts,
        }),
    ))
}

async fn get_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> Result<Json<Device>, AppError> {
    match state.stores.devices.find_device(&device_id).await? {
        Some(device) => Ok(Json(device)),
        None => Err(Error::UnknownDevice(device_id).into()),
    }
}

async fn list_alerts(
    State(state): State<AppState>,
    Query(mut params): Query<AlertQuery>,
) -> Result<Json<ListResponse<Alert>>, AppError> {
    let (limit, offset) = page_bounds(params.limit, params.offset);
    params.limit = Some(limit);
    params.offset = Some(offset);

    let alerts = state.stores.alerts.list_alerts(&params).await?;
    let total = state.stores.alerts.count_alerts(&params).await?;

    Ok(Json(ListResponse {
        total,
        data: alerts,
        limit,
        offset,
    }))
}

async fn acknowledge_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<AcknowledgeRequest>,
) -> Result<Json<Alert>, AppError> {
    let actor = required_actor(&request.actor)?;
    let alert = state
        .stores
        .alerts
        .acknowledge(alert_id, actor, Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("alert {}", alert_id)))?;

    info!("Alert {} acknowledged by {}", alert_id, actor);
    Ok(Json(alert))
}

async fn resolve_alert(
    State(state): State<AppState>,
    Path(alert_id): Path<Uuid>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<Alert>, AppError> {
    let actor = required_actor(&request.actor)?;
    let alert = state
        .stores
        .alerts
        .resolve(alert_id, actor, request.notes.as_deref(), Utc::now())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("alert {}", alert_id)))?;

    info!("Alert {} resolved by {}", alert_id, actor);
    Ok(Json(alert))
}

fn required_actor(actor: &str) -> Result<&str, AppError> {
    let actor = actor.trim();
    if actor.is_empty() {
        return Err(Error::Validation("actor must not be empty".to_string()).into());
    }
    Ok(actor)
}

#[derive(Debug)]
pub enum AppError {
    Core(Error),
    NotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(what) => (StatusCode::NOT_FOUND, format!("{} not found", what)),
            AppError::Core(e) => (status_for(e), e.to_string()),
        };

        if status.is_server_error() {
            error!("API error: {}", message);
        } else {
            debug!("API request rejected: {}", message);
        }

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Decode(_) | Error::Validation(_) | Error::Json(_) => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        Error::UnknownDevice(_) => StatusCode::NOT_FOUND,
        Error::ChannelSend => StatusCode::SERVICE_UNAVAILABLE,
        Error::Database(_) | Error::Migration(_) | Error::Mqtt(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Core(err)
    }
}
