//! REST service implementation
//!
//! Serves the standard keymanager endpoints under `/eth/v1/keystores`.

use crate::api::auth::AuthService;
use crate::api::types::{
    DeleteKeystoresRequest, DeleteKeystoresResponse, ErrorResponse, HealthResponse,
    ImportKeystoresRequest, ImportKeystoresResponse, KeystoreEntry, ListKeystoresResponse,
    StatusEntry,
};
use crate::errors::KeyManagerError;
use crate::manager::KeyManager;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use std::time::Instant;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
pub struct AppState {
    pub manager: Arc<KeyManager>,
    pub auth_service: Arc<AuthService>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(manager: Arc<KeyManager>, auth_service: Arc<AuthService>) -> Self {
        Self {
            manager,
            auth_service,
            start_time: Instant::now(),
        }
    }
}

/// Build the API router
pub fn router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    let keystores = Router::new()
        .route(
            "/eth/v1/keystores",
            get(list_keystores)
                .post(import_keystores)
                .delete(delete_keystores),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(keystores)
        .route("/health", get(health))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, KeyManagerError> {
    state.auth_service.validate_headers(request.headers())?;
    Ok(next.run(request).await)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        keys_loaded: state.manager.key_store().len(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn list_keystores(State(state): State<Arc<AppState>>) -> Json<ListKeystoresResponse> {
    let data = state
        .manager
        .list_keys()
        .into_iter()
        .map(KeystoreEntry::from)
        .collect();
    Json(ListKeystoresResponse { data })
}

async fn import_keystores(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ImportKeystoresRequest>, JsonRejection>,
) -> Result<Json<ImportKeystoresResponse>, ApiError> {
    let Json(request) = body?;
    let (keystores, passwords, slashing_protection) = request.into_parts();

    info!("Import request for {} keystores", keystores.len());
    let statuses = state
        .manager
        .import_keystores(keystores, passwords, slashing_protection)
        .await?;

    Ok(Json(ImportKeystoresResponse {
        data: statuses.iter().map(StatusEntry::from).collect(),
    }))
}

async fn delete_keystores(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DeleteKeystoresRequest>, JsonRejection>,
) -> Result<Json<DeleteKeystoresResponse>, ApiError> {
    let Json(request) = body?;

    info!("Delete request for {} keys", request.pubkeys.len());
    let outcome = state.manager.delete_keystores(request.pubkeys).await?;

    Ok(Json(DeleteKeystoresResponse {
        data: outcome.statuses.iter().map(StatusEntry::from).collect(),
        slashing_protection: outcome.slashing_protection.to_json()?,
    }))
}

/// Error body returned by every endpoint
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<KeyManagerError> for ApiError {
    fn from(err: KeyManagerError) -> Self {
        let status = match &err {
            KeyManagerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            e if e.is_request_error() => StatusCode::BAD_REQUEST,
            KeyManagerError::InvalidPublicKey(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", err);
        }
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // Structurally invalid bodies are plain bad requests here
        let status = match rejection.status() {
            StatusCode::UNPROCESSABLE_ENTITY => StatusCode::BAD_REQUEST,
            other => other,
        };
        Self {
            status,
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            code: self.status.as_u16(),
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl IntoResponse for KeyManagerError {
    fn into_response(self) -> Response {
        ApiError::from(self).into_response()
    }
}
