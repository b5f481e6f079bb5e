//! Token refresh engine.
//!
//! One refresh attempt renders the credential's body template, calls its
//! refresh endpoint, pulls the new tokens out of the JSON response and writes
//! them back to the credential store, logging the attempt either way.
//!
//! ```text
//! render (template) → send (reqwest, 30s) → extract (paths) → persist → log
//! ```

mod engine;
mod extractor;
mod template;

pub use engine::{should_refresh_at, ExpiryUpdate, RefreshEngine, RefreshOutcome, REQUEST_TIMEOUT};
pub use extractor::{extract_expires_in, extract_token};
pub use template::{render_template, REFRESH_TOKEN_VAR};

use thiserror::Error;

/// Why a refresh attempt failed.
///
/// `Config` and `Extraction` need the credential (or the endpoint) to be
/// fixed; `Transport` and `HttpStatus` are retried by the next scheduler tick.
#[derive(Debug, Error)]
pub enum RefreshError {
    /// Bad template, custom variables, method or headers.
    #[error("configuration error: {0}")]
    Config(String),

    /// The response did not have the expected shape.
    #[error("failed to extract '{path}' from response: {reason}")]
    Extraction { path: String, reason: String },

    /// Network failure or timeout.
    #[error("request to refresh endpoint failed: {0}")]
    Transport(#[source] reqwest::Error),

    /// The endpoint answered with something other than 200.
    #[error("refresh endpoint returned HTTP {status}: {body}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body: String,
    },

    /// The new tokens could not be written. The remote refresh may have
    /// succeeded, so the stored refresh token can now be stale.
    #[error("failed to persist refreshed tokens: {0:#}")]
    Persistence(#[source] anyhow::Error),
}

impl RefreshError {
    /// True for failures the next scheduled attempt may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RefreshError::Transport(_) | RefreshError::HttpStatus { .. }
        )
    }
}
