//! Credential management HTTP API.
//!
//! All routes sit behind HTTP Basic auth:
//! - `GET /api/credentials` — list credentials
//! - `POST /api/credentials` — create a credential
//! - `GET|PUT|DELETE /api/credentials/:id` — read, update, delete one
//! - `POST /api/credentials/:id/toggle` — flip the enabled flag
//! - `POST /api/credentials/:id/refresh` — refresh now
//! - `GET /api/credentials/:id/token` — current tokens
//! - `GET /api/credentials/:id/logs?limit=N` — refresh history, newest first

use super::auth_middleware::require_basic_auth;
use crate::credentials::{
    is_constraint_violation, CredentialRecord, CredentialStore, CredentialUpdate, NewCredential,
    RefreshLog,
};
use crate::refresher::RefreshEngine;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

/// Default number of log entries returned by the logs endpoint.
pub const DEFAULT_LOG_LIMIT: usize = 50;

/// Shared state for the credential API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<CredentialStore>,
    pub engine: Arc<RefreshEngine>,
    pub username: String,
    pub password: String,
}

/// Response body for `GET /api/credentials/:id/token`.
#[derive(Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(rename = "expires_at")]
    pub token_expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<String>,
}

impl LogsQuery {
    /// Unparseable or non-positive limits fall back to the default.
    fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .filter(|n| *n > 0)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_LOG_LIMIT)
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// ---------------------------------------------------------------------------
// HTTP handlers
// ---------------------------------------------------------------------------

async fn list_credentials(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<CredentialRecord>>, AppError> {
    Ok(Json(state.store.list_all()?))
}

async fn get_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<CredentialRecord>, AppError> {
    let record = state.store.get(id)?.ok_or_else(|| AppError::not_found(id))?;
    Ok(Json(record))
}

async fn create_credential(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewCredential>,
) -> Result<(StatusCode, Json<CredentialRecord>), AppError> {
    req.config.validate().map_err(AppError::BadRequest)?;

    let record = state.store.create(req).map_err(|e| {
        if is_constraint_violation(&e) {
            AppError::Conflict("A credential with this name already exists".to_string())
        } else {
            AppError::from(e)
        }
    })?;

    info!(credential_id = record.id, name = %record.name, "Credential created");
    Ok((StatusCode::CREATED, Json(record)))
}

async fn update_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(req): Json<CredentialUpdate>,
) -> Result<Json<CredentialRecord>, AppError> {
    req.config.validate().map_err(AppError::BadRequest)?;

    let record = state
        .store
        .update_config(id, req)
        .map_err(|e| {
            if is_constraint_violation(&e) {
                AppError::Conflict("A credential with this name already exists".to_string())
            } else {
                AppError::from(e)
            }
        })?
        .ok_or_else(|| AppError::not_found(id))?;

    info!(credential_id = id, "Credential updated");
    Ok(Json(record))
}

async fn delete_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if !state.store.delete(id)? {
        return Err(AppError::not_found(id));
    }
    info!(credential_id = id, "Credential deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<CredentialRecord>, AppError> {
    let enabled = state
        .store
        .toggle(id)?
        .ok_or_else(|| AppError::not_found(id))?;
    info!(credential_id = id, enabled, "Credential toggled");

    let record = state.store.get(id)?.ok_or_else(|| AppError::not_found(id))?;
    Ok(Json(record))
}

/// Runs the same refresh the scheduler would, bypassing due-ness.
async fn refresh_credential(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<CredentialRecord>, AppError> {
    let record = state.store.get(id)?.ok_or_else(|| AppError::not_found(id))?;

    info!(credential_id = id, "Manual refresh requested");
    if let Err(e) = state.engine.refresh(&record).await {
        warn!(credential_id = id, error = %e, "Manual refresh failed");
        return Err(AppError::BadGateway(e.to_string()));
    }

    let refreshed = state.store.get(id)?.ok_or_else(|| AppError::not_found(id))?;
    Ok(Json(refreshed))
}

async fn get_token(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Result<Json<TokenResponse>, AppError> {
    let record = state.store.get(id)?.ok_or_else(|| AppError::not_found(id))?;
    Ok(Json(TokenResponse {
        access_token: record.current_access_token,
        refresh_token: record.current_refresh_token,
        token_expires_at: record.token_expires_at,
    }))
}

async fn list_logs(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<RefreshLog>>, AppError> {
    if state.store.get(id)?.is_none() {
        return Err(AppError::not_found(id));
    }
    Ok(Json(state.store.list_logs(id, query.limit())?))
}

// ---------------------------------------------------------------------------
// Error handling
// ---------------------------------------------------------------------------

enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    BadGateway(String),
    Internal(String),
}

impl AppError {
    fn not_found(id: i64) -> Self {
        AppError::NotFound(format!("Credential {} not found", id))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(e: anyhow::Error) -> Self {
        AppError::Internal(format!("{:#}", e))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(ErrorResponse { error: msg })).into_response()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn create_router(state: ApiState) -> Router {
    let state = Arc::new(state);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/api/credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/api/credentials/:id",
            get(get_credential)
                .put(update_credential)
                .delete(delete_credential),
        )
        .route("/api/credentials/:id/toggle", post(toggle_credential))
        .route("/api/credentials/:id/refresh", post(refresh_credential))
        .route("/api/credentials/:id/token", get(get_token))
        .route("/api/credentials/:id/logs", get(list_logs))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_basic_auth,
        ))
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(limit: Option<&str>) -> LogsQuery {
        LogsQuery {
            limit: limit.map(str::to_string),
        }
    }

    #[test]
    fn test_logs_limit_default() {
        assert_eq!(query(None).limit(), DEFAULT_LOG_LIMIT);
    }

    #[test]
    fn test_logs_limit_explicit() {
        assert_eq!(query(Some("5")).limit(), 5);
    }

    #[test]
    fn test_logs_limit_invalid_falls_back() {
        assert_eq!(query(Some("abc")).limit(), DEFAULT_LOG_LIMIT);
        assert_eq!(query(Some("0")).limit(), DEFAULT_LOG_LIMIT);
        assert_eq!(query(Some("-3")).limit(), DEFAULT_LOG_LIMIT);
    }
}
