//! Calendar provider access.
//!
//! The sync engine talks to providers only through [`CalendarProvider`] and
//! [`ProviderFactory`]; the Google Calendar v3 client and the file-backed
//! token store are the production implementations.
//!
//! Modules:
//! - calendar: Google Calendar API v3 event listing
//! - token_store: per-user access tokens on disk

pub mod calendar;
pub mod token_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Provider key stored in `sync_state.provider`.
pub const GOOGLE_PROVIDER: &str = "google";

// ============================================================================
// Error type
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// Token missing, expired or revoked. Fatal to the run; the user reconnects.
    #[error("Token expired or revoked")]
    AuthExpired,
    /// Network failure or 5xx after the retry policy gave up.
    #[error("Transient provider failure: {0}")]
    Transient(String),
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("Malformed provider response: {0}")]
    Decode(String),
    /// The stored sync token is no longer accepted (HTTP 410); the caller
    /// drops it and refetches the full window.
    #[error("Sync token expired")]
    SyncTokenExpired,
}

impl ProviderError {
    /// Whether a later run may succeed without user action.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

// ============================================================================
// Provider contract
// ============================================================================

/// One page request against a calendar.
///
/// With `sync_token` set the request is incremental: the provider returns
/// only changes since that token (removals included, flagged cancelled) and
/// the time bounds are not sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub calendar_id: String,
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
    pub sync_token: Option<String>,
    pub page_token: Option<String>,
    pub page_size: u32,
}

/// An event as the provider reports it, before normalization.
///
/// Times are the provider's raw strings so the sync engine can report
/// unparseable values per event instead of failing the page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderEvent {
    pub id: String,
    pub title: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub attendees: Vec<String>,
    pub organizer: Option<String>,
    pub conference_link: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPage {
    pub events: Vec<ProviderEvent>,
    pub next_page_token: Option<String>,
    /// Present on the last page only.
    pub next_sync_token: Option<String>,
}

#[async_trait]
pub trait CalendarProvider: Send + Sync {
    async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ProviderError>;
}

/// Hands out providers bound to a user's stored credentials.
#[async_trait]
pub trait ProviderFactory: Send + Sync {
    /// Key stored alongside each user's sync checkpoint.
    fn name(&self) -> &str;

    async fn for_user(&self, user_id: &str) -> Result<Arc<dyn CalendarProvider>, ProviderError>;
}

// ============================================================================
// Retry policy
// ============================================================================

/// Per-request retry budget shared by the provider and extraction clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
        }
    }
}

/// Longest `Retry-After` we are willing to sleep for.
const MAX_RETRY_AFTER_SECS: u64 = 30;
const JITTER_MS: u64 = 150;

impl RetryPolicy {
    /// 429, 408 and 5xx are worth another attempt.
    pub fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(
            status,
            reqwest::StatusCode::TOO_MANY_REQUESTS | reqwest::StatusCode::REQUEST_TIMEOUT
        ) || status.is_server_error()
    }

    /// Sleep before attempt `attempt + 1`. A numeric `Retry-After` wins
    /// (capped); otherwise exponential backoff plus a little jitter.
    pub fn backoff(&self, attempt: u32, retry_after: Option<&str>) -> Duration {
        if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<u64>().ok()) {
            return Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS));
        }
        let doubling = 1u64 << attempt.saturating_sub(1).min(20);
        let base = self
            .initial_backoff_ms
            .saturating_mul(doubling)
            .min(self.max_backoff_ms);
        let jitter = Utc::now().timestamp_subsec_millis() as u64 % JITTER_MS;
        Duration::from_millis(base + jitter)
    }
}

/// Send `request`, retrying retryable statuses and connect/timeout errors
/// while the policy allows. The last response comes back whatever its
/// status; callers decide what a failure status means.
pub async fn send_with_retry(
    request: reqwest::RequestBuilder,
    policy: &RetryPolicy,
) -> Result<reqwest::Response, reqwest::Error> {
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        // Streaming bodies can't be cloned; those get a single attempt.
        let Some(this_try) = request.try_clone() else {
            return request.send().await;
        };
        let last = attempt >= attempts;

        match this_try.send().await {
            Ok(resp) if !last && RetryPolicy::is_retryable_status(resp.status()) => {
                let retry_after = resp
                    .headers()
                    .get(reqwest::header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                let delay = policy.backoff(attempt, retry_after);
                log::warn!(
                    "Http: {} on attempt {}/{}, retrying in {:?}",
                    resp.status(),
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) if !last && (err.is_timeout() || err.is_connect()) => {
                let delay = policy.backoff(attempt, None);
                log::warn!(
                    "Http: {} on attempt {}/{}, retrying in {:?}",
                    err,
                    attempt,
                    attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            outcome => return outcome,
        }
        attempt += 1;
    }
}

/// Map a non-success response to a provider error.
pub(crate) async fn error_for_response(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return ProviderError::AuthExpired;
    }
    if status == reqwest::StatusCode::GONE {
        return ProviderError::SyncTokenExpired;
    }
    let body = response.text().await.unwrap_or_default();
    if RetryPolicy::is_retryable_status(status) {
        return ProviderError::Transient(format!("HTTP {}: {}", status.as_u16(), body));
    }
    ProviderError::Api {
        status: status.as_u16(),
        message: body,
    }
}
