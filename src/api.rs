use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::deploy::{
    error::DeployError,
    machine::{Deployments, StatusReport},
    project::HostPort,
};
use crate::service::inventory::Inventory;

/// State shared across axum handlers.
pub struct AppState {
    pub deployments: Arc<Deployments>,
    pub inventory: Inventory,
}

pub type SharedState = Arc<AppState>;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/desplegar", post(deploy))
        .route("/status", get(status))
        .route("/list", get(list))
        .route("/stop", post(stop))
        .route("/logs", get(logs))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    Deploy(DeployError),
    /// The container runtime could not be asked. Clients should retry.
    Unavailable,
}

impl From<DeployError> for ApiError {
    fn from(e: DeployError) -> Self {
        Self::Deploy(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Deploy(DeployError::InvalidRequest(rejection.body_text()))
    }
}

fn status_code(e: &DeployError) -> StatusCode {
    match e {
        DeployError::InvalidRequest(_) | DeployError::Fetch(_) => StatusCode::BAD_REQUEST,
        DeployError::NotFound(_) => StatusCode::NOT_FOUND,
        DeployError::Conflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Deploy(e) => {
                let status = status_code(&e);
                if status.is_server_error() {
                    log::error!("Request failed: {e}");
                }
                let mut body = json!({ "error": e.to_string(), "kind": e.kind() });
                if let Some(details) = e.output() {
                    body["details"] = details.into();
                }
                (status, Json(body)).into_response()
            }
            // Nothing in here may read as a final answer to a polling client.
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "retry": true, "details": "container runtime unavailable" })),
            )
                .into_response(),
        }
    }
}

// ── Requests ──────────────────────────────────────────────────────────

/// Ports arrive as numbers from the UI but as strings from forms.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PortField {
    Number(i64),
    Text(String),
}

impl PortField {
    fn into_port(self) -> Result<HostPort, DeployError> {
        match self {
            PortField::Number(n) => HostPort::try_from(n),
            PortField::Text(s) => s.parse(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeployRequest {
    nombre: Option<String>,
    link: Option<String>,
    puerto: Option<PortField>,
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    nombre: Option<String>,
}

fn required(value: Option<String>, field: &str) -> Result<String, DeployError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| DeployError::InvalidRequest(format!("missing field {field:?}")))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn deploy(
    State(state): State<SharedState>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let nombre = required(request.nombre, "nombre")?;
    let link = required(request.link, "link")?;
    let puerto = request
        .puerto
        .ok_or_else(|| DeployError::InvalidRequest("missing field \"puerto\"".into()))?
        .into_port()?;

    let record = state.deployments.start(&nombre, &link, puerto)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "message": format!("Deployment of {} started on localhost:{puerto}", record.project),
            "details": "Fetching and building in the background, poll /status for progress",
            "deployment": record,
        })),
    ))
}

/// Failure messages go to clients that look for `Up` anywhere in the
/// body, so the marker is lower-cased in them.
fn mask_success_marker(report: &mut StatusReport) {
    if let Some(error) = report.deployment.as_mut().and_then(|d| d.error.as_mut()) {
        error.message = error.message.replace("Up", "up");
    }
}

async fn status(
    State(state): State<SharedState>,
    Query(query): Query<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nombre = required(query.nombre, "nombre")?;
    let mut report = match state.deployments.status(&nombre).await {
        Ok(report) => report,
        Err(DeployError::Runtime(e)) => {
            log::warn!("Unable to inspect containers of {nombre}: {e}");
            return Err(ApiError::Unavailable);
        }
        Err(e) => return Err(e.into()),
    };
    mask_success_marker(&mut report);
    Ok(Json(report))
}

async fn list(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let containers = state.inventory.list().await?;
    Ok(Json(json!({ "containers": containers })))
}

async fn stop(
    State(state): State<SharedState>,
    payload: Result<Json<NameRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = payload?;
    let nombre = required(request.nombre, "nombre")?;
    let outcome = state.deployments.stop(&nombre).await?;

    let message = if outcome.stopped.is_empty() && !outcome.cancelled {
        format!("Nothing was running for {}", nombre.trim())
    } else {
        format!("{} stopped and removed", nombre.trim())
    };
    Ok(Json(json!({
        "message": message,
        "stopped": outcome.stopped,
        "cancelled": outcome.cancelled,
    })))
}

async fn logs(
    State(state): State<SharedState>,
    Query(query): Query<NameRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let nombre = required(query.nombre, "nombre")?;
    let (record, lines) = state.deployments.logs(&nombre)?;
    Ok(Json(json!({
        "nombre": record.project,
        "deployment": record,
        "lines": lines,
    })))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// ── Tests ─────────────────────────────────────────────────────────────
