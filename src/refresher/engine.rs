use super::{extract_expires_in, extract_token, render_template, RefreshError};
use crate::credentials::{
    token_preview, CredentialRecord, CredentialStore, RefreshLogEntry, RefreshStatus,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Fixed timeout for one call to a refresh endpoint.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a successful refresh did to the stored expiry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpiryUpdate {
    /// The response carried a lifetime; the new expiry is set.
    Known(DateTime<Utc>),
    /// An expires-in path is configured but could not be read. The previous
    /// expiry is cleared and the token is not refreshed proactively again.
    Unknown,
    /// No expires-in path is configured; expiry stays cleared.
    NotTracked,
}

impl ExpiryUpdate {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        match self {
            ExpiryUpdate::Known(at) => Some(*at),
            ExpiryUpdate::Unknown | ExpiryUpdate::NotTracked => None,
        }
    }
}

/// Result of a successful refresh attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshOutcome {
    pub access_token_preview: String,
    pub refresh_token_preview: String,
    pub expiry: ExpiryUpdate,
}

/// Tokens pulled out of a 200 response, not yet persisted.
struct FetchedTokens {
    access_token: String,
    refresh_token: String,
    expiry: ExpiryUpdate,
    response_body: String,
}

/// A failed attempt plus whatever response body was seen before it failed.
struct AttemptFailure {
    error: RefreshError,
    response_body: Option<String>,
}

impl AttemptFailure {
    fn before_response(error: RefreshError) -> Self {
        Self {
            error,
            response_body: None,
        }
    }

    fn with_body(error: RefreshError, body: &str) -> Self {
        Self {
            error,
            response_body: Some(body.to_string()),
        }
    }
}

/// Runs refresh attempts for credentials.
///
/// Shared by the scheduler and the admin API's manual trigger, so both go
/// through the same render → send → extract → persist → log sequence.
pub struct RefreshEngine {
    store: Arc<CredentialStore>,
    http_client: reqwest::Client,
}

impl RefreshEngine {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            http_client: reqwest::Client::new(),
        }
    }

    /// Returns true if the credential is due for a refresh right now.
    pub fn should_refresh(&self, credential: &CredentialRecord) -> bool {
        should_refresh_at(credential, Utc::now())
    }

    /// Executes one refresh attempt against the given snapshot.
    ///
    /// The snapshot is never re-read: a concurrent edit of the credential is
    /// invisible to this attempt. Every failure writes a failed log entry and
    /// marks the credential failed before the error is returned.
    pub async fn refresh(
        &self,
        credential: &CredentialRecord,
    ) -> Result<RefreshOutcome, RefreshError> {
        info!(
            credential_id = credential.id,
            name = %credential.name,
            "Starting token refresh"
        );

        let fetched = match self.fetch_tokens(credential).await {
            Ok(fetched) => fetched,
            Err(failure) => {
                self.record_failure(credential, &failure);
                return Err(failure.error);
            }
        };

        if let Err(e) = self.store.update_tokens(
            credential.id,
            &fetched.access_token,
            &fetched.refresh_token,
            fetched.expiry.expires_at(),
            RefreshStatus::Success,
        ) {
            let failure =
                AttemptFailure::with_body(RefreshError::Persistence(e), &fetched.response_body);
            self.record_failure(credential, &failure);
            return Err(failure.error);
        }

        let outcome = RefreshOutcome {
            access_token_preview: token_preview(&fetched.access_token),
            refresh_token_preview: token_preview(&fetched.refresh_token),
            expiry: fetched.expiry,
        };

        let entry = RefreshLogEntry {
            credential_id: credential.id,
            status: RefreshStatus::Success,
            error_message: None,
            old_token_preview: token_preview(&credential.current_access_token),
            new_token_preview: outcome.access_token_preview.clone(),
            old_refresh_token_preview: token_preview(&credential.current_refresh_token),
            new_refresh_token_preview: outcome.refresh_token_preview.clone(),
            response_body: fetched.response_body,
        };
        if let Err(e) = self.store.append_log(&entry) {
            warn!(credential_id = credential.id, error = %e, "Failed to write refresh log");
        }

        info!(
            credential_id = credential.id,
            name = %credential.name,
            expires_at = ?outcome.expiry.expires_at(),
            "Token refresh succeeded"
        );

        Ok(outcome)
    }

    /// Render, send and extract. No store writes.
    async fn fetch_tokens(
        &self,
        credential: &CredentialRecord,
    ) -> Result<FetchedTokens, AttemptFailure> {
        let body = render_template(&credential.refresh_body_template, credential)
            .map_err(AttemptFailure::before_response)?;

        let method = parse_method(&credential.refresh_method)
            .map_err(AttemptFailure::before_response)?;
        let headers = build_headers(credential).map_err(AttemptFailure::before_response)?;

        let response = self
            .http_client
            .request(method, &credential.refresh_url)
            .headers(headers)
            .body(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| AttemptFailure::before_response(RefreshError::Transport(e)))?;

        let status = response.status();
        let response_body = response
            .text()
            .await
            .map_err(|e| AttemptFailure::before_response(RefreshError::Transport(e)))?;

        if status != StatusCode::OK {
            return Err(AttemptFailure::with_body(
                RefreshError::HttpStatus {
                    status,
                    body: response_body.clone(),
                },
                &response_body,
            ));
        }

        let access_token = extract_token(&response_body, &credential.access_token_path)
            .map_err(|e| AttemptFailure::with_body(e, &response_body))?;
        let refresh_token = extract_token(&response_body, &credential.refresh_token_path)
            .map_err(|e| AttemptFailure::with_body(e, &response_body))?;

        let expiry = match credential.expires_in_path.as_deref() {
            None => ExpiryUpdate::NotTracked,
            Some(path) => match extract_expires_in(&response_body, path) {
                Ok(seconds) => match expiry_after(Utc::now(), seconds) {
                    Some(expires_at) => ExpiryUpdate::Known(expires_at),
                    None => {
                        warn!(
                            credential_id = credential.id,
                            expires_in = seconds,
                            "Token lifetime out of range, expiry is now unknown"
                        );
                        ExpiryUpdate::Unknown
                    }
                },
                Err(e) => {
                    warn!(
                        credential_id = credential.id,
                        error = %e,
                        "Could not read token lifetime, expiry is now unknown"
                    );
                    ExpiryUpdate::Unknown
                }
            },
        };

        Ok(FetchedTokens {
            access_token,
            refresh_token,
            expiry,
            response_body,
        })
    }

    /// Marks the credential failed and writes a failed log entry.
    ///
    /// Store errors here are only logged; the attempt's own error is what the
    /// caller gets back.
    fn record_failure(&self, credential: &CredentialRecord, failure: &AttemptFailure) {
        warn!(
            credential_id = credential.id,
            name = %credential.name,
            error = %failure.error,
            transient = failure.error.is_transient(),
            "Token refresh failed"
        );

        if let Err(e) = self
            .store
            .update_status(credential.id, RefreshStatus::Failed)
        {
            warn!(credential_id = credential.id, error = %e, "Failed to update refresh status");
        }

        let entry = RefreshLogEntry {
            credential_id: credential.id,
            status: RefreshStatus::Failed,
            error_message: Some(failure.error.to_string()),
            old_token_preview: token_preview(&credential.current_access_token),
            new_token_preview: String::new(),
            old_refresh_token_preview: String::new(),
            new_refresh_token_preview: String::new(),
            response_body: failure.response_body.clone().unwrap_or_default(),
        };
        if let Err(e) = self.store.append_log(&entry) {
            warn!(credential_id = credential.id, error = %e, "Failed to write refresh log");
        }
    }
}

/// Due-ness at a fixed instant. Pure.
///
/// - no access token yet → due
/// - no expiry known → never due (manual refresh still works)
/// - otherwise due once `now + lead ≥ expiry`
pub fn should_refresh_at(credential: &CredentialRecord, now: DateTime<Utc>) -> bool {
    if credential.current_access_token.is_empty() {
        return true;
    }

    match credential.token_expires_at {
        None => false,
        Some(expires_at) => {
            let lead = ChronoDuration::seconds(i64::from(credential.refresh_before_seconds));
            now + lead >= expires_at
        }
    }
}

/// `now + seconds`, or `None` if the lifetime does not fit a timestamp.
fn expiry_after(now: DateTime<Utc>, seconds: i64) -> Option<DateTime<Utc>> {
    ChronoDuration::try_seconds(seconds).and_then(|lifetime| now.checked_add_signed(lifetime))
}

fn parse_method(method: &str) -> Result<Method, RefreshError> {
    let method = if method.trim().is_empty() {
        crate::credentials::DEFAULT_REFRESH_METHOD.to_string()
    } else {
        method.trim().to_uppercase()
    };
    Method::from_bytes(method.as_bytes())
        .map_err(|_| RefreshError::Config(format!("invalid HTTP method '{}'", method)))
}

fn build_headers(credential: &CredentialRecord) -> Result<HeaderMap, RefreshError> {
    let mut headers = HeaderMap::new();
    for (key, value) in &credential.refresh_headers {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| RefreshError::Config(format!("invalid header name '{}'", key)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| RefreshError::Config(format!("invalid value for header '{}'", key)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}
