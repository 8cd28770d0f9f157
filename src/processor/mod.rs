//! Transcript parsing and insight consolidation.
//!
//! Both pipelines follow the same shape: a synchronous trigger persists the
//! state transition and bumps a generation counter, then a queued job does
//! the slow extraction work and writes back only if its generation is still
//! current.

pub mod consolidate;
pub mod extractor;
pub mod transcript;

pub use consolidate::ConsolidationProcessor;
pub use extractor::{ExtractionError, HttpInsightExtractor, InsightExtractor, UnconfiguredExtractor};
pub use transcript::{ParseAccepted, TranscriptProcessor};

/// What a queued job did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The failure was recorded on the row.
    Failed(String),
    /// Superseded by a newer submission; nothing written.
    Stale,
}
