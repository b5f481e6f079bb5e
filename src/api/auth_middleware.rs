use super::credentials::ApiState;
use crate::auth::extract_basic_credentials;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Realm advertised in the `WWW-Authenticate` challenge.
pub const AUTH_REALM: &str = "JWT Refresher";

/// Basic auth middleware for the admin API.
///
/// Runs as a route layer so unmatched paths still 404 without a challenge.
pub async fn require_basic_auth(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Response {
    match extract_basic_credentials(req.headers()) {
        Ok(creds) if creds.matches(&state.username, &state.password) => next.run(req).await,
        Ok(creds) => {
            warn!(username = %creds.username, "Rejected admin API credentials");
            unauthorized()
        }
        Err(_) => unauthorized(),
    }
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            format!("Basic realm=\"{}\"", AUTH_REALM),
        )],
        "Unauthorized",
    )
        .into_response()
}
