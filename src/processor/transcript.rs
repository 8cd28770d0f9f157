//! Per-call transcript parsing.
//!
//! `none → parsing → completed | failed`. Only a submission moves a call
//! into `parsing`; a re-submission supersedes any in-flight job, whose
//! result is then discarded because its generation no longer matches.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;

use super::extractor::{ExtractionError, InsightExtractor};
use super::JobOutcome;
use crate::error::PipelineError;
use crate::repository::CallRepository;
use crate::types::{CallKind, CallRef, ParsingStatus};

/// Default deadline for one extraction call.
pub const DEFAULT_EXTRACTION_TIMEOUT_SECS: u64 = 300;

/// Returned to the submitter before any extraction runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParseAccepted {
    pub call: CallRef,
    pub status: ParsingStatus,
    pub generation: i64,
}

pub struct TranscriptProcessor {
    calls: Arc<dyn CallRepository>,
    extractor: Arc<dyn InsightExtractor>,
    timeout: Duration,
}

fn entity_name(kind: CallKind) -> &'static str {
    match kind {
        CallKind::CallRecording => "call recording",
        CallKind::MeetingNote => "meeting note",
    }
}

impl TranscriptProcessor {
    pub fn new(calls: Arc<dyn CallRepository>, extractor: Arc<dyn InsightExtractor>) -> Self {
        Self {
            calls,
            extractor,
            timeout: Duration::from_secs(DEFAULT_EXTRACTION_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Persist the transcript and move the call into `parsing`.
    ///
    /// The caller enqueues the returned generation.
    pub fn submit(&self, call: &CallRef, transcript: &str) -> Result<ParseAccepted, PipelineError> {
        if transcript.trim().is_empty() {
            return Err(PipelineError::InvalidInput("transcript is empty".to_string()));
        }
        let generation = self
            .calls
            .begin_parse(call, transcript)?
            .ok_or_else(|| PipelineError::not_found(entity_name(call.kind), call.id.clone()))?;

        log::info!(
            "Transcript: {} submitted ({} chars, generation {})",
            call,
            transcript.len(),
            generation
        );
        Ok(ParseAccepted {
            call: call.clone(),
            status: ParsingStatus::Parsing,
            generation,
        })
    }

    /// Run extraction for one queued job.
    pub async fn handle(&self, call: &CallRef, generation: i64) -> Result<JobOutcome, PipelineError> {
        let Some(stored) = self.calls.get_call(call)? else {
            log::warn!("Transcript: {} vanished before parsing", call);
            return Ok(JobOutcome::Stale);
        };
        if stored.parse_generation != generation || stored.parsing_status != ParsingStatus::Parsing {
            log::debug!(
                "Transcript: dropping stale job for {} (job generation {}, current {} {:?})",
                call,
                generation,
                stored.parse_generation,
                stored.parsing_status
            );
            return Ok(JobOutcome::Stale);
        }

        let text = stored.transcript_text.unwrap_or_default();
        let started = std::time::Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.extractor.extract(&text)).await {
            Ok(result) => result,
            Err(_) => Err(ExtractionError::Timeout(self.timeout.as_secs())),
        };

        match result {
            Ok(insights) => {
                if !self.calls.complete_parse(call, generation, &insights, &Utc::now())? {
                    log::debug!("Transcript: {} superseded during extraction", call);
                    return Ok(JobOutcome::Stale);
                }
                log::info!(
                    "Transcript: {} parsed in {}ms",
                    call,
                    started.elapsed().as_millis()
                );
                Ok(JobOutcome::Completed)
            }
            Err(e) => {
                let message = e.to_string();
                if !self.calls.fail_parse(call, generation, &message)? {
                    return Ok(JobOutcome::Stale);
                }
                log::warn!("Transcript: {} failed: {}", call, message);
                Ok(JobOutcome::Failed(message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::{seed_account, seed_opportunity, seed_org, test_db};
    use crate::db::PipelineDb;
    use crate::processor::test_support::FakeExtractor;
    use crate::types::ExtractedInsights;

    fn setup() -> (Arc<PipelineDb>, CallRef) {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "acme", "Acme", Some("acme.com"));
        seed_opportunity(&db, "acme", "deal", "Acme Platform");
        let call = db
            .insert_call(CallKind::CallRecording, Some("deal"), "Discovery", None)
            .unwrap();
        (Arc::new(db), call)
    }

    fn insights() -> ExtractedInsights {
        ExtractedInsights {
            pain_points: vec!["manual reconciliation".to_string()],
            goals: vec!["close books in 3 days".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_submit_then_complete() {
        let (db, call) = setup();
        let processor =
            TranscriptProcessor::new(db.clone(), Arc::new(FakeExtractor::returning(insights())));

        let accepted = processor.submit(&call, "We reconcile by hand.").unwrap();
        assert_eq!(accepted.status, ParsingStatus::Parsing);
        assert_eq!(accepted.generation, 1);

        let outcome = processor.handle(&call, accepted.generation).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed);

        let stored = db.get_call(&call).unwrap().unwrap();
        assert_eq!(stored.parsing_status, ParsingStatus::Completed);
        assert_eq!(stored.insights, Some(insights()));
        assert!(stored.parsing_error.is_none());
        assert!(stored.parsed_at.is_some());
    }

    #[tokio::test]
    async fn test_failure_records_error_without_payload() {
        let (db, call) = setup();
        let processor = TranscriptProcessor::new(
            db.clone(),
            Arc::new(FakeExtractor::failing(ExtractionError::Service {
                status: 500,
                message: "model overloaded".to_string(),
            })),
        );

        let accepted = processor.submit(&call, "transcript").unwrap();
        let outcome = processor.handle(&call, accepted.generation).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("model overloaded")));

        let stored = db.get_call(&call).unwrap().unwrap();
        assert_eq!(stored.parsing_status, ParsingStatus::Failed);
        assert!(stored.insights.is_none());
        assert!(stored.parsing_error.is_some());
    }

    #[tokio::test]
    async fn test_resubmission_discards_stale_result() {
        let (db, call) = setup();
        let extractor = Arc::new(FakeExtractor::returning(insights()));
        let processor = TranscriptProcessor::new(db.clone(), extractor.clone());

        let first = processor.submit(&call, "first draft").unwrap();
        let second = processor.submit(&call, "corrected transcript").unwrap();
        assert_eq!(second.generation, first.generation + 1);

        assert_eq!(
            processor.handle(&call, first.generation).await.unwrap(),
            JobOutcome::Stale
        );
        assert!(extractor.seen.lock().is_empty());
        assert_eq!(
            db.get_call(&call).unwrap().unwrap().parsing_status,
            ParsingStatus::Parsing
        );

        assert_eq!(
            processor.handle(&call, second.generation).await.unwrap(),
            JobOutcome::Completed
        );
        assert_eq!(*extractor.seen.lock(), vec!["corrected transcript".to_string()]);
    }

    #[tokio::test]
    async fn test_deadline_marks_failed() {
        let (db, call) = setup();
        let extractor = FakeExtractor {
            delay: Some(Duration::from_secs(5)),
            ..FakeExtractor::returning(insights())
        };
        let processor = TranscriptProcessor::new(db.clone(), Arc::new(extractor))
            .with_timeout(Duration::from_millis(20));

        let accepted = processor.submit(&call, "long call").unwrap();
        let outcome = processor.handle(&call, accepted.generation).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref m) if m.contains("timed out")));
        assert_eq!(
            db.get_call(&call).unwrap().unwrap().parsing_status,
            ParsingStatus::Failed
        );
    }

    #[test]
    fn test_submit_validation() {
        let (db, call) = setup();
        let processor = TranscriptProcessor::new(
            db.clone(),
            Arc::new(FakeExtractor::returning(ExtractedInsights::default())),
        );

        let err = processor.submit(&call, "   ").unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(
            db.get_call(&call).unwrap().unwrap().parsing_status,
            ParsingStatus::NotStarted
        );

        let missing = CallRef::new(CallKind::MeetingNote, "nope");
        let err = processor.submit(&missing, "text").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn test_completed_call_can_be_resubmitted() {
        let (db, call) = setup();
        let processor =
            TranscriptProcessor::new(db.clone(), Arc::new(FakeExtractor::returning(insights())));
        let first = processor.submit(&call, "v1").unwrap();
        processor.handle(&call, first.generation).await.unwrap();

        processor.submit(&call, "v2").unwrap();
        let stored = db.get_call(&call).unwrap().unwrap();
        assert_eq!(stored.parsing_status, ParsingStatus::Parsing);
        assert!(stored.insights.is_none());
    }
}
