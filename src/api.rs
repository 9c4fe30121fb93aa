use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    clients::health::HealthChecker,
    error::DispatchError,
    models::{
        health::HealthStatus, request::NotificationCreateRequest, response::ApiResponse,
        status::SubmitOutcome,
    },
    pipeline::service::NotificationService,
};

pub const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

pub struct AppState {
    pub service: Arc<NotificationService>,
    pub health_checker: HealthChecker,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/v1/notifications", post(create_notification))
        .route("/api/v1/notifications/{idempotency_key}", get(notification_status))
        .route(
            "/api/v1/notifications/{idempotency_key}/messages",
            get(notification_messages),
        )
        .route("/api/v1/notifications/scheduled/{job_id}", delete(cancel_scheduled))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_api_server(
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!(address = %addr, "API server started");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

fn status_for_code(code: &str) -> StatusCode {
    match code {
        "missing_idempotency_key" | "validation_error" => StatusCode::BAD_REQUEST,
        "idempotency_conflict" | "request_in_flight" => StatusCode::CONFLICT,
        "resolution_error" => StatusCode::SERVICE_UNAVAILABLE,
        "template_render_error" => StatusCode::UNPROCESSABLE_ENTITY,
        "content_too_large" => StatusCode::PAYLOAD_TOO_LARGE,
        "not_found" => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            DispatchError::TemplateRender {
                retryable: true, ..
            } => StatusCode::SERVICE_UNAVAILABLE,
            other => status_for_code(other.code()),
        };

        let body = ApiResponse::<()>::error(self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}

async fn create_notification(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DispatchError> {
    let key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(DispatchError::MissingIdempotencyKey)?;

    let request: NotificationCreateRequest = serde_json::from_slice(&body).map_err(|e| {
        warn!(idempotency_key = %key, error = %e, "Malformed notification request body");
        DispatchError::Validation(format!("malformed request body: {}", e))
    })?;

    let outcome = state.service.submit(Some(key), &request).await?;

    let (status, message) = match &outcome {
        SubmitOutcome::Accepted { .. } => (StatusCode::ACCEPTED, "Notification accepted"),
        SubmitOutcome::Scheduled { .. } => (StatusCode::ACCEPTED, "Notification scheduled"),
        SubmitOutcome::Rejected { code, reason } => {
            let body = ApiResponse::<()>::error(code.as_str(), reason.as_str());
            return Ok((status_for_code(code), Json(body)).into_response());
        }
    };

    Ok((status, Json(ApiResponse::success(outcome, message))).into_response())
}

async fn notification_status(
    State(state): State<Arc<AppState>>,
    Path(idempotency_key): Path<String>,
) -> Result<Response, DispatchError> {
    let view = state.service.status(&idempotency_key).await?;
    let message = format!("Notification is {}", view.state);

    Ok((StatusCode::OK, Json(ApiResponse::success(view, message))).into_response())
}

async fn notification_messages(
    State(state): State<Arc<AppState>>,
    Path(idempotency_key): Path<String>,
) -> Result<Response, DispatchError> {
    let records = state.service.deliveries(&idempotency_key).await?;
    let message = format!("{} message(s)", records.len());

    Ok((StatusCode::OK, Json(ApiResponse::success(records, message))).into_response())
}

async fn cancel_scheduled(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Response, DispatchError> {
    let job_id = Uuid::parse_str(&job_id)
        .map_err(|_| DispatchError::Validation(format!("'{}' is not a valid job id", job_id)))?;

    let view = state.service.cancel(job_id).await?;

    Ok((
        StatusCode::OK,
        Json(ApiResponse::success(view, "Scheduled notification cancelled")),
    )
        .into_response())
}

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_checker.check_all().await;

    let status_code = match health.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}
