//! Credential records and refresh history.
//!
//! A credential record is one managed integration: where and how to call its
//! refresh endpoint, how to pull tokens out of the response, and the token
//! state from the last successful refresh.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       CredentialStore                    │
//! │  - Record CRUD, token updates            │
//! │  - Append-only refresh log               │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//!    (encrypt)            (decrypt)
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       Encryption Module                  │
//! │  - AES-256-GCM, one nonce per token      │
//! └─────────────────────────────────────────┘
//!          ↓                    ↑
//! ┌─────────────────────────────────────────┐
//! │       SQLite Database                    │
//! │  - credentials + refresh_logs tables     │
//! │  - logs cascade on credential delete     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Security
//!
//! - Access and refresh tokens are encrypted at rest
//! - Tokens are never serialized to API clients except via the token endpoint
//! - Refresh logs only carry 10-character previews

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

mod encryption;
mod storage;

pub use storage::{is_constraint_violation, CredentialStore};

pub use encryption::{validate_key, SealedToken, TokenCipher};

/// Default lead time before expiry at which a refresh is attempted.
pub const DEFAULT_REFRESH_BEFORE_SECONDS: u32 = 300;

/// Default HTTP method for refresh calls.
pub const DEFAULT_REFRESH_METHOD: &str = "POST";

/// Outcome of the most recent refresh attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Success,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RefreshStatus::Success),
            "failed" => Some(RefreshStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RefreshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted credential: refresh configuration plus current token state.
///
/// The current tokens are skipped when serializing so that listing records
/// over the admin API never leaks them.
#[derive(Clone, Serialize)]
pub struct CredentialRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub enabled: bool,

    /// Refresh endpoint
    pub refresh_url: String,
    pub refresh_method: String,
    pub refresh_headers: BTreeMap<String, String>,
    pub refresh_body_template: String,

    /// Extraction paths into the refresh response
    pub access_token_path: String,
    pub refresh_token_path: String,
    pub expires_in_path: Option<String>,

    /// Raw JSON object merged into the template context
    pub custom_variables: String,

    #[serde(skip_serializing)]
    pub current_access_token: String,
    #[serde(skip_serializing)]
    pub current_refresh_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,

    /// Lead time before expiry
    pub refresh_before_seconds: u32,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh_status: Option<RefreshStatus>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("refresh_url", &self.refresh_url)
            .field("refresh_method", &self.refresh_method)
            .field("access_token", &token_preview(&self.current_access_token))
            .field("refresh_token", &token_preview(&self.current_refresh_token))
            .field("token_expires_at", &self.token_expires_at)
            .field("refresh_before_seconds", &self.refresh_before_seconds)
            .field("last_refresh_status", &self.last_refresh_status)
            .finish_non_exhaustive()
    }
}

/// Configuration fields shared by create and update requests.
#[derive(Clone, Debug, Deserialize)]
pub struct CredentialConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub refresh_url: String,
    #[serde(default = "default_refresh_method")]
    pub refresh_method: String,
    #[serde(default)]
    pub refresh_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub refresh_body_template: String,
    pub access_token_path: String,
    pub refresh_token_path: String,
    #[serde(default)]
    pub expires_in_path: Option<String>,
    #[serde(default)]
    pub custom_variables: String,
    #[serde(default = "default_refresh_before_seconds")]
    pub refresh_before_seconds: u32,
}

fn default_refresh_method() -> String {
    DEFAULT_REFRESH_METHOD.to_string()
}

fn default_refresh_before_seconds() -> u32 {
    DEFAULT_REFRESH_BEFORE_SECONDS
}

impl CredentialConfig {
    /// Checks required fields. Returns a message suitable for a 400 response.
    pub fn validate(&self) -> Result<(), String> {
        let required = [
            ("name", &self.name),
            ("refresh_url", &self.refresh_url),
            ("access_token_path", &self.access_token_path),
            ("refresh_token_path", &self.refresh_token_path),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(format!("'{}' must not be empty", field));
            }
        }
        if !self.custom_variables.trim().is_empty() {
            match serde_json::from_str::<serde_json::Value>(&self.custom_variables) {
                Ok(serde_json::Value::Object(_)) => {}
                _ => return Err("'custom_variables' must be a JSON object".to_string()),
            }
        }
        Ok(())
    }

    /// Fills in defaults for blank optional fields.
    pub fn normalized(mut self) -> Self {
        if self.refresh_method.trim().is_empty() {
            self.refresh_method = default_refresh_method();
        } else {
            self.refresh_method = self.refresh_method.trim().to_uppercase();
        }
        if matches!(&self.expires_in_path, Some(p) if p.trim().is_empty()) {
            self.expires_in_path = None;
        }
        self
    }
}

/// Request to create a credential. New credentials start enabled.
#[derive(Clone, Debug, Deserialize)]
pub struct NewCredential {
    #[serde(flatten)]
    pub config: CredentialConfig,
    /// Initial refresh token used for the first refresh call
    #[serde(default)]
    pub refresh_token: String,
}

/// Request to update a credential's configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct CredentialUpdate {
    #[serde(flatten)]
    pub config: CredentialConfig,
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replaces the current refresh token when present and non-empty
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// One refresh attempt as written by the refresh engine.
#[derive(Clone, Debug, PartialEq)]
pub struct RefreshLogEntry {
    pub credential_id: i64,
    pub status: RefreshStatus,
    pub error_message: Option<String>,
    pub old_token_preview: String,
    pub new_token_preview: String,
    pub old_refresh_token_preview: String,
    pub new_refresh_token_preview: String,
    pub response_body: String,
}

/// A stored refresh log record.
#[derive(Clone, Debug, Serialize)]
pub struct RefreshLog {
    pub id: i64,
    pub credential_id: i64,
    pub refresh_at: DateTime<Utc>,
    pub status: RefreshStatus,
    pub error_message: Option<String>,
    pub old_token_preview: String,
    pub new_token_preview: String,
    pub old_refresh_token_preview: String,
    pub new_refresh_token_preview: String,
    pub response_body: String,
}

/// Number of leading characters of a token that may appear in logs.
pub const TOKEN_PREVIEW_LEN: usize = 10;

/// Returns the first 10 characters of a token, or the whole token if shorter.
pub fn token_preview(token: &str) -> String {
    token.chars().take(TOKEN_PREVIEW_LEN).collect()
}
