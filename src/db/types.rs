//! Row types returned by the `PipelineDb` stores, plus `DbError`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    CallKind, ConsolidationStatus, EventOrigin, ExtractedInsights, MeetingSource, ParsingStatus,
    SyncStatus,
};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

/// A row from `users`, joined with its organization's domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbUser {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub organization_domain: Option<String>,
}

/// A row from `accounts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbAccount {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    pub website: Option<String>,
    pub updated_at: String,
}

/// The slice of an opportunity the matcher needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityRef {
    pub id: String,
    pub name: String,
}

/// An account with its opportunities, ordered by opportunity name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountWithOpportunities {
    pub account: DbAccount,
    pub opportunities: Vec<OpportunityRef>,
}

/// A row from `opportunities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbOpportunity {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub next_call_date: Option<DateTime<Utc>>,
    pub next_call_date_source: Option<MeetingSource>,
    pub next_call_date_event_id: Option<String>,
    pub next_call_date_last_calculated: Option<String>,
    pub next_call_date_manually_set: bool,
    pub consolidated_pain_points: Vec<String>,
    pub consolidated_goals: Vec<String>,
    pub consolidated_why_and_why_now: Vec<String>,
    pub consolidated_metrics: Vec<String>,
    pub risk_assessment: Option<String>,
    pub consolidation_status: ConsolidationStatus,
    pub consolidation_error: Option<String>,
    pub consolidation_generation: i64,
    pub consolidated_at: Option<String>,
}

/// A row from `calendar_events`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCalendarEvent {
    pub id: String,
    pub external_id: String,
    pub user_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub organizer: Option<String>,
    pub is_external: bool,
    pub conference_link: Option<String>,
    pub account_id: Option<String>,
    pub opportunity_id: Option<String>,
    pub source: EventOrigin,
    pub created_at: String,
    pub updated_at: String,
}

/// Normalized event ready to be upserted by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EventUpsert {
    pub external_id: String,
    pub user_id: String,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub attendees: Vec<String>,
    pub organizer: Option<String>,
    pub is_external: bool,
    pub conference_link: Option<String>,
    pub account_id: Option<String>,
    pub opportunity_id: Option<String>,
}

/// What an upsert did to the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub created: bool,
    /// The stored row is user-owned (`source = manual`) and was left alone.
    pub skipped: bool,
    /// Opportunity linked before the write (only for updates).
    pub previous_opportunity_id: Option<String>,
    pub previous_start_time: Option<DateTime<Utc>>,
    /// Links as stored after the write.
    pub account_id: Option<String>,
    pub opportunity_id: Option<String>,
}

/// A synced event row deleted because the provider dropped or cancelled it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEvent {
    pub id: String,
    pub external_id: String,
    pub opportunity_id: Option<String>,
}

/// A row from `call_recordings` or `meeting_notes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbCall {
    pub id: String,
    pub kind: CallKind,
    pub opportunity_id: Option<String>,
    pub title: String,
    pub meeting_date: Option<DateTime<Utc>>,
    pub transcript_text: Option<String>,
    pub parsing_status: ParsingStatus,
    pub parse_generation: i64,
    pub parsed_at: Option<String>,
    pub parsing_error: Option<String>,
    /// Present only while `parsing_status` is `completed`.
    pub insights: Option<ExtractedInsights>,
}

/// A row from `sync_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSyncState {
    pub user_id: String,
    pub provider: String,
    pub cursor: Option<String>,
    pub window_min: Option<DateTime<Utc>>,
    pub window_max: Option<DateTime<Utc>>,
    pub last_run_at: Option<String>,
    pub last_status: Option<SyncStatus>,
    pub last_error: Option<String>,
    pub last_created: i64,
    pub last_updated: i64,
}

/// Final write for a sync run.
#[derive(Debug, Clone)]
pub struct SyncStateUpdate {
    pub status: SyncStatus,
    pub cursor: Option<String>,
    pub window_min: Option<DateTime<Utc>>,
    pub window_max: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created: i64,
    pub updated: i64,
}

/// Canonical timestamp column format: RFC 3339, UTC, whole seconds.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

/// Parse an RFC 3339 column value, tolerating legacy SQLite `datetime()` output.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .ok()
}

/// Decode a JSON string-list column. NULL or blank reads as an empty list.
pub(crate) fn decode_list(value: Option<String>) -> Result<Vec<String>, DbError> {
    match value.as_deref().map(str::trim) {
        None | Some("") | Some("null") => Ok(Vec::new()),
        Some(raw) => Ok(serde_json::from_str(raw)?),
    }
}

pub(crate) fn encode_list(values: &[String]) -> Result<String, DbError> {
    Ok(serde_json::to_string(values)?)
}

/// Read a required timestamp column.
pub(crate) fn timestamp_at(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp: {raw}").into(),
        )
    })
}

/// Read a nullable timestamp column. Unparseable values read as NULL.
pub(crate) fn optional_timestamp_at(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    Ok(raw.as_deref().and_then(parse_timestamp))
}
