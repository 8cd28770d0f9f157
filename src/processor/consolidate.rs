//! Opportunity-level insight consolidation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use super::extractor::{ExtractionError, InsightExtractor};
use super::transcript::DEFAULT_EXTRACTION_TIMEOUT_SECS;
use super::JobOutcome;
use crate::db::DbCall;
use crate::error::PipelineError;
use crate::repository::{CallRepository, OpportunityRepository};
use crate::types::{ConsolidatedInsights, ConsolidationStatus};

/// Fewest completed calls an opportunity needs before consolidating.
pub const MIN_COMPLETED_CALLS: usize = 2;

pub struct ConsolidationProcessor {
    calls: Arc<dyn CallRepository>,
    opportunities: Arc<dyn OpportunityRepository>,
    extractor: Arc<dyn InsightExtractor>,
    timeout: Duration,
}

impl ConsolidationProcessor {
    pub fn new(
        calls: Arc<dyn CallRepository>,
        opportunities: Arc<dyn OpportunityRepository>,
        extractor: Arc<dyn InsightExtractor>,
    ) -> Self {
        Self {
            calls,
            opportunities,
            extractor,
            timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Check the precondition and move the opportunity into `processing`.
    /// Nothing is written when fewer than two calls are parsed.
    pub fn begin(&self, opportunity_id: &str) -> Result<i64, PipelineError> {
        if self.opportunities.get_opportunity(opportunity_id)?.is_none() {
            return Err(PipelineError::not_found("opportunity", opportunity_id));
        }
        let completed = self.calls.count_completed_calls(opportunity_id)?;
        if completed < MIN_COMPLETED_CALLS {
            return Err(PipelineError::ConsolidationPrecondition { completed });
        }
        let generation = self
            .opportunities
            .begin_consolidation(opportunity_id)?
            .ok_or_else(|| PipelineError::not_found("opportunity", opportunity_id))?;
        log::info!(
            "Consolidation: {} queued over {} calls (generation {})",
            opportunity_id,
            completed,
            generation
        );
        Ok(generation)
    }

    pub async fn handle(
        &self,
        opportunity_id: &str,
        generation: i64,
    ) -> Result<JobOutcome, PipelineError> {
        let Some(stored) = self.opportunities.get_opportunity(opportunity_id)? else {
            return Ok(JobOutcome::Stale);
        };
        if stored.consolidation_generation != generation
            || stored.consolidation_status != ConsolidationStatus::Processing
        {
            log::debug!(
                "Consolidation: dropping stale job for {} (generation {})",
                opportunity_id,
                generation
            );
            return Ok(JobOutcome::Stale);
        }

        // A call may have been re-submitted since the trigger.
        let calls = self.calls.get_completed_calls(opportunity_id)?;
        if calls.len() < MIN_COMPLETED_CALLS {
            let message = PipelineError::ConsolidationPrecondition {
                completed: calls.len(),
            }
            .to_string();
            return self.record_failure(opportunity_id, generation, message);
        }

        let merged = merge_insights(&calls);
        let result = match tokio::time::timeout(self.timeout, self.extractor.consolidate(merged)).await
        {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout.as_secs())),
        };

        match result {
            Ok(insights) => {
                if !self.opportunities.complete_consolidation(
                    opportunity_id,
                    generation,
                    &insights,
                    &Utc::now(),
                )? {
                    return Ok(JobOutcome::Stale);
                }
                log::info!(
                    "Consolidation: {} completed from {} calls",
                    opportunity_id,
                    calls.len()
                );
                Ok(JobOutcome::Completed)
            }
            Err(e) => self.record_failure(opportunity_id, generation, e.to_string()),
        }
    }

    fn record_failure(
        &self,
        opportunity_id: &str,
        generation: i64,
        message: String,
    ) -> Result<JobOutcome, PipelineError> {
        if !self
            .opportunities
            .fail_consolidation(opportunity_id, generation, &message)?
        {
            return Ok(JobOutcome::Stale);
        }
        log::warn!("Consolidation: {} failed: {}", opportunity_id, message);
        Ok(JobOutcome::Failed(message))
    }
}

/// Concatenate the per-call lists in call order. Deduplication and
/// summarization belong to the extractor's `consolidate`.
pub fn merge_insights(calls: &[DbCall]) -> ConsolidatedInsights {
    let mut merged = ConsolidatedInsights::default();
    for insights in calls.iter().filter_map(|c| c.insights.as_ref()) {
        merged.pain_points.extend(insights.pain_points.iter().cloned());
        merged.goals.extend(insights.goals.iter().cloned());
        merged
            .why_and_why_now
            .extend(insights.why_and_why_now.iter().cloned());
        merged
            .metrics
            .extend(insights.quantifiable_metrics.iter().cloned());
    }
    merged
}
