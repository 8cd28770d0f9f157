//! Insight extraction collaborator.
//!
//! How insights are generated is outside this crate. The pipelines only see
//! [`InsightExtractor`]; [`HttpInsightExtractor`] forwards to a JSON service.

use async_trait::async_trait;
use serde::Serialize;

use crate::google_api::{send_with_retry, RetryPolicy};
use crate::types::{ConsolidatedInsights, ExtractedInsights, ExtractionConfig};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("Extraction timed out after {0}s")]
    Timeout(u64),
    #[error("Extraction service returned {status}: {message}")]
    Service { status: u16, message: String },
    #[error("Extraction service unreachable: {0}")]
    Transport(String),
    #[error("Malformed extraction response: {0}")]
    Decode(String),
    #[error("No extraction service configured")]
    NotConfigured,
}

impl From<reqwest::Error> for ExtractionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ExtractionError::Decode(err.to_string())
        } else {
            ExtractionError::Transport(err.to_string())
        }
    }
}

#[async_trait]
pub trait InsightExtractor: Send + Sync {
    async fn extract(&self, transcript: &str) -> Result<ExtractedInsights, ExtractionError>;

    /// Refine the concatenated per-call insights. The default keeps them as
    /// they are and produces no risk assessment.
    async fn consolidate(
        &self,
        merged: ConsolidatedInsights,
    ) -> Result<ConsolidatedInsights, ExtractionError> {
        Ok(merged)
    }
}

/// Stand-in used when no endpoint is configured. Every parse fails with a
/// readable error; consolidation still passes through.
pub struct UnconfiguredExtractor;

#[async_trait]
impl InsightExtractor for UnconfiguredExtractor {
    async fn extract(&self, _transcript: &str) -> Result<ExtractedInsights, ExtractionError> {
        Err(ExtractionError::NotConfigured)
    }
}

#[derive(Serialize)]
struct ExtractRequest<'a> {
    transcript: &'a str,
}

/// Extraction over HTTP: `POST {endpoint}/extract` with `{"transcript": …}`
/// and `POST {endpoint}/consolidate` with the merged insights.
pub struct HttpInsightExtractor {
    client: reqwest::Client,
    endpoint: url::Url,
    api_key: Option<String>,
    retry: RetryPolicy,
}

impl HttpInsightExtractor {
    pub fn new(endpoint: url::Url, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            retry: RetryPolicy::default(),
        }
    }

    /// Build from config. The API key is read from the environment variable
    /// the config names; a missing variable means unauthenticated requests.
    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let endpoint = config
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(ExtractionError::NotConfigured)?;
        let endpoint = url::Url::parse(endpoint)
            .map_err(|e| ExtractionError::Transport(format!("invalid endpoint '{}': {}", endpoint, e)))?;
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        Ok(Self {
            retry: config.retry.clone(),
            ..Self::new(endpoint, api_key)
        })
    }

    fn url_for(&self, action: &str) -> Result<url::Url, ExtractionError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| ExtractionError::Transport("endpoint cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(action);
        Ok(url)
    }

    async fn post<B, T>(&self, action: &str, body: &B) -> Result<T, ExtractionError>
    where
        B: Serialize + ?Sized + Sync,
        T: serde::de::DeserializeOwned + Send,
    {
        let mut request = self.client.post(self.url_for(action)?).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = send_with_retry(request, &self.retry).await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ExtractionError::Service {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl InsightExtractor for HttpInsightExtractor {
    async fn extract(&self, transcript: &str) -> Result<ExtractedInsights, ExtractionError> {
        self.post("extract", &ExtractRequest { transcript }).await
    }

    async fn consolidate(
        &self,
        merged: ConsolidatedInsights,
    ) -> Result<ConsolidatedInsights, ExtractionError> {
        self.post("consolidate", &merged).await
    }
}
