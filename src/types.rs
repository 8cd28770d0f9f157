use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::google_api::RetryPolicy;

/// Configuration stored in ~/.dealsync/config.json
///
/// Every field has a default so an empty `{}` file is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Explicit database path. Defaults to `~/.dealsync/dealsync.db`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
    /// Directory holding per-user provider tokens. Defaults to `~/.dealsync/tokens`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_dir: Option<String>,
    pub calendar: CalendarConfig,
    pub extraction: ExtractionConfig,
    pub workers: WorkerConfig,
    pub next_call: NextCallConfig,
}

/// Calendar synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CalendarConfig {
    pub calendar_id: String,
    pub lookback_days: i64,
    pub lookahead_days: i64,
    pub page_size: u32,
    pub poll_interval_minutes: u64,
    /// Stored sync tokens are reused while the rolling window has moved less
    /// than this. `0` turns every run into a full window fetch.
    pub full_refresh_hours: i64,
    /// Fixed sync window. When unset the window rolls with `now`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window: Option<SyncWindow>,
    pub retry: RetryPolicy,
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_id: "primary".to_string(),
            lookback_days: 30,
            lookahead_days: 60,
            page_size: 250,
            poll_interval_minutes: 15,
            full_refresh_hours: 24,
            window: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl CalendarConfig {
    /// Resolve the window for a run starting at `now`.
    pub fn resolve_window(&self, now: DateTime<Utc>) -> SyncWindow {
        if let Some(window) = &self.window {
            return window.clone();
        }
        SyncWindow {
            time_min: now - chrono::Duration::days(self.lookback_days.max(0)),
            time_max: now + chrono::Duration::days(self.lookahead_days.max(0)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncWindow {
    pub time_min: DateTime<Utc>,
    pub time_max: DateTime<Utc>,
}

/// Extraction service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractionConfig {
    /// Base URL of the extraction service (`POST {endpoint}/extract`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the service API key.
    pub api_key_env: String,
    /// Deadline after which an in-flight parse is forced to `failed`.
    pub timeout_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "DEALSYNC_EXTRACTION_KEY".to_string(),
            timeout_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub max_concurrent_jobs: usize,
    /// Fallback poll interval when no enqueue notification arrives.
    pub poll_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 4,
            poll_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NextCallConfig {
    pub manual_policy: ManualDatePolicy,
}

/// What the resolver does with a next-call date a user set by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualDatePolicy {
    /// Recalculation always wins and clears the manual flag.
    #[default]
    Overwrite,
    /// Recalculation leaves manually set dates alone.
    RespectManual,
}

// =============================================================================
// Pipeline enums
// =============================================================================

/// Provenance of an opportunity's next call date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingSource {
    AutoCalendar,
    AutoCallRecording,
    AutoMeetingNote,
    Manual,
}

impl MeetingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingSource::AutoCalendar => "auto_calendar",
            MeetingSource::AutoCallRecording => "auto_call_recording",
            MeetingSource::AutoMeetingNote => "auto_meeting_note",
            MeetingSource::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto_calendar" => Some(MeetingSource::AutoCalendar),
            "auto_call_recording" => Some(MeetingSource::AutoCallRecording),
            "auto_meeting_note" => Some(MeetingSource::AutoMeetingNote),
            "manual" => Some(MeetingSource::Manual),
            _ => None,
        }
    }
}

/// Transcript extraction lifecycle of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParsingStatus {
    #[serde(rename = "none")]
    NotStarted,
    Parsing,
    Completed,
    Failed,
}

impl ParsingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParsingStatus::NotStarted => "none",
            ParsingStatus::Parsing => "parsing",
            ParsingStatus::Completed => "completed",
            ParsingStatus::Failed => "failed",
        }
    }

    /// Unknown values read back as `NotStarted`.
    pub fn parse(s: &str) -> Self {
        match s {
            "parsing" => ParsingStatus::Parsing,
            "completed" => ParsingStatus::Completed,
            "failed" => ParsingStatus::Failed,
            _ => ParsingStatus::NotStarted,
        }
    }
}

/// Opportunity-level consolidation lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsolidationStatus {
    #[serde(rename = "none")]
    NotStarted,
    Processing,
    Completed,
    Failed,
}

impl ConsolidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsolidationStatus::NotStarted => "none",
            ConsolidationStatus::Processing => "processing",
            ConsolidationStatus::Completed => "completed",
            ConsolidationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => ConsolidationStatus::Processing,
            "completed" => ConsolidationStatus::Completed,
            "failed" => ConsolidationStatus::Failed,
            _ => ConsolidationStatus::NotStarted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Success,
    Error,
    InProgress,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Success => "success",
            SyncStatus::Error => "error",
            SyncStatus::InProgress => "in_progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SyncStatus::Success),
            "error" => Some(SyncStatus::Error),
            "in_progress" => Some(SyncStatus::InProgress),
            _ => None,
        }
    }
}

/// Where a calendar event row came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Synced,
    Manual,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::Synced => "synced",
            EventOrigin::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "manual" => EventOrigin::Manual,
            _ => EventOrigin::Synced,
        }
    }
}

/// The two call variants. They share one shape and live in separate tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    CallRecording,
    MeetingNote,
}

impl CallKind {
    pub fn table(&self) -> &'static str {
        match self {
            CallKind::CallRecording => "call_recordings",
            CallKind::MeetingNote => "meeting_notes",
        }
    }

    pub fn meeting_source(&self) -> MeetingSource {
        match self {
            CallKind::CallRecording => MeetingSource::AutoCallRecording,
            CallKind::MeetingNote => MeetingSource::AutoMeetingNote,
        }
    }
}

/// Address of a call row across both variants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRef {
    pub kind: CallKind,
    pub id: String,
}

impl CallRef {
    pub fn new(kind: CallKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }
}

impl std::fmt::Display for CallRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.table(), self.id)
    }
}

// =============================================================================
// Extraction payloads
// =============================================================================

/// Fields the extraction service pulls out of one transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExtractedInsights {
    pub pain_points: Vec<String>,
    pub goals: Vec<String>,
    pub people_mentioned: Vec<String>,
    pub next_steps: Vec<String>,
    pub why_and_why_now: Vec<String>,
    pub quantifiable_metrics: Vec<String>,
}

/// Opportunity-level insights after consolidation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsolidatedInsights {
    pub pain_points: Vec<String>,
    pub goals: Vec<String>,
    pub why_and_why_now: Vec<String>,
    pub metrics: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,
}

// =============================================================================
// Derived values and run summaries
// =============================================================================

/// Provenance-tagged next call date. All fields are `None` when no future
/// meeting exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextCallDate {
    pub date: Option<DateTime<Utc>>,
    pub source: Option<MeetingSource>,
    pub event_id: Option<String>,
}

impl NextCallDate {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
    }
}

/// Result of one calendar sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    /// Synced rows dropped because the provider cancelled or stopped listing them.
    pub removed: usize,
    /// Events that carry an account link after this run.
    pub matched: usize,
    pub errors: Vec<String>,
}

/// A future meeting from any of the three sources, tagged with provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingCandidate {
    pub kind: MeetingSource,
    pub id: String,
    pub date: DateTime<Utc>,
    pub opportunity_id: String,
}
