// Admin HTTP API

pub mod auth_middleware;
pub mod credentials;

pub use auth_middleware::{require_basic_auth, AUTH_REALM};
pub use credentials::{create_router, ApiState};
