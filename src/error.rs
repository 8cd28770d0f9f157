//! Top-level pipeline errors
//!
//! Every failure falls into one of three buckets:
//! - Retryable: provider network failures and 5xx
//! - NonRetryable: bad input, missing records, schema problems
//! - RequiresUserAction: expired or missing calendar credentials

use thiserror::Error;

use crate::db::DbError;
use crate::google_api::ProviderError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Calendar provider: {0}")]
    Provider(#[from] ProviderError),

    #[error("Database: {0}")]
    Db(#[from] DbError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Consolidation needs at least 2 parsed calls, found {completed}")]
    ConsolidationPrecondition { completed: usize },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        PipelineError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Returns true if the next scheduled run may succeed unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, PipelineError::Provider(e) if e.is_transient())
    }

    /// Only reconnecting the calendar fixes it.
    pub fn requires_user_action(&self) -> bool {
        matches!(self, PipelineError::Provider(ProviderError::AuthExpired))
    }

    /// HTTP-equivalent status for the trigger surface.
    pub fn status_code(&self) -> u16 {
        match self {
            PipelineError::InvalidInput(_) | PipelineError::ConsolidationPrecondition { .. } => 400,
            PipelineError::NotFound { .. } => 404,
            PipelineError::Provider(ProviderError::AuthExpired) => 401,
            PipelineError::Provider(_) => 502,
            PipelineError::Db(_) | PipelineError::Config(_) => 500,
        }
    }

    /// One-line hint shown next to the message.
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            PipelineError::Provider(ProviderError::AuthExpired) => {
                "Reconnect your calendar account."
            }
            PipelineError::Provider(ProviderError::Transient(_)) => {
                "The calendar provider is unavailable. The next scheduled sync will retry."
            }
            PipelineError::Provider(_) => "Check the calendar ID in ~/.dealsync/config.json",
            PipelineError::Db(_) => "Check file permissions and disk space.",
            PipelineError::NotFound { .. } => "Refresh and try again.",
            PipelineError::ConsolidationPrecondition { .. } => {
                "Parse at least two calls for this opportunity first."
            }
            PipelineError::InvalidInput(_) => "Correct the request and try again.",
            PipelineError::Config(_) => "Check your configuration in ~/.dealsync/config.json",
        }
    }
}

/// Serializable error body for trigger responses
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub status_code: u16,
    pub message: String,
    pub error_type: ErrorType,
    pub can_retry: bool,
    pub recovery_suggestion: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Retryable,
    NonRetryable,
    RequiresUserAction,
}

impl From<&PipelineError> for ErrorResponse {
    fn from(err: &PipelineError) -> Self {
        let error_type = if err.requires_user_action() {
            ErrorType::RequiresUserAction
        } else if err.is_retryable() {
            ErrorType::Retryable
        } else {
            ErrorType::NonRetryable
        };

        ErrorResponse {
            status_code: err.status_code(),
            message: err.to_string(),
            error_type,
            can_retry: err.is_retryable(),
            recovery_suggestion: err.recovery_suggestion().to_string(),
        }
    }
}
