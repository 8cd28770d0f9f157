//! Trigger surface.
//!
//! Each command persists at most the initial state transition and returns;
//! slow work runs on the task queue. Responses carry an HTTP-equivalent
//! `statusCode` and errors come back as [`ErrorResponse`].

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{DbAccount, DbOpportunity};
use crate::error::{ErrorResponse, PipelineError};
use crate::processor::ParseAccepted;
use crate::state::PipelineState;
use crate::task_queue::Job;
use crate::types::{CallRef, ConsolidationStatus, NextCallDate, SyncSummary};

pub type CommandResult<T> = Result<T, ErrorResponse>;

fn to_response(err: PipelineError) -> ErrorResponse {
    ErrorResponse::from(&err)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub status_code: u16,
    #[serde(flatten)]
    pub summary: SyncSummary,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptAccepted {
    pub status_code: u16,
    #[serde(flatten)]
    pub accepted: ParseAccepted,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationAccepted {
    pub status_code: u16,
    pub opportunity_id: String,
    pub status: ConsolidationStatus,
    pub generation: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountUpdated {
    pub status_code: u16,
    pub account: DbAccount,
    /// Events linked by the backfill this edit triggered.
    pub linked_events: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextCallResponse {
    pub status_code: u16,
    pub opportunity_id: String,
    #[serde(flatten)]
    pub next_call: NextCallDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpportunityResponse {
    pub status_code: u16,
    pub opportunity: DbOpportunity,
}

/// Run one user's calendar sync now.
pub async fn trigger_sync(state: &PipelineState, user_id: &str) -> CommandResult<SyncResponse> {
    let summary = state.calendar.sync(user_id).await.map_err(to_response)?;
    Ok(SyncResponse {
        status_code: 200,
        summary,
    })
}

/// Ask the background poller to sync every user now.
pub fn wake_calendar_poller(state: &PipelineState) {
    state.calendar_wake.notify_one();
}

/// Accept a transcript for parsing (202).
pub fn submit_transcript(
    state: &PipelineState,
    call: &CallRef,
    transcript: &str,
) -> CommandResult<TranscriptAccepted> {
    let accepted = state
        .transcripts
        .submit(call, transcript)
        .map_err(to_response)?;
    state.queue.enqueue(Job::ParseTranscript {
        call: accepted.call.clone(),
        generation: accepted.generation,
    });
    Ok(TranscriptAccepted {
        status_code: 202,
        accepted,
    })
}

/// Accept a consolidation request (202), or 400 when fewer than two calls
/// are parsed.
pub fn trigger_consolidation(
    state: &PipelineState,
    opportunity_id: &str,
) -> CommandResult<ConsolidationAccepted> {
    let generation = state
        .consolidation
        .begin(opportunity_id)
        .map_err(to_response)?;
    state.queue.enqueue(Job::Consolidate {
        opportunity_id: opportunity_id.to_string(),
        generation,
    });
    Ok(ConsolidationAccepted {
        status_code: 202,
        opportunity_id: opportunity_id.to_string(),
        status: ConsolidationStatus::Processing,
        generation,
    })
}

/// Change an account's website, then backfill links for the new domain.
///
/// The website write commits first; a failing backfill is logged and never
/// undoes it.
pub fn update_account_website(
    state: &PipelineState,
    account_id: &str,
    website: Option<&str>,
) -> CommandResult<AccountUpdated> {
    let website = website.map(str::trim).filter(|w| !w.is_empty());
    let previous = state
        .db
        .update_account_website(account_id, website)
        .map_err(|e| to_response(e.into()))?
        .ok_or_else(|| to_response(PipelineError::not_found("account", account_id)))?;

    let linked_events = state.backfill.on_website_changed(
        account_id,
        previous.website.as_deref(),
        website,
        &previous.organization_id,
    );

    let account = state
        .db
        .get_account(account_id)
        .map_err(|e| to_response(e.into()))?
        .ok_or_else(|| to_response(PipelineError::not_found("account", account_id)))?;

    Ok(AccountUpdated {
        status_code: 200,
        account,
        linked_events,
    })
}

/// Set (or with `None`, clear) a hand-entered next call date.
pub fn set_manual_next_call_date(
    state: &PipelineState,
    opportunity_id: &str,
    date: Option<DateTime<Utc>>,
) -> CommandResult<OpportunityResponse> {
    state
        .next_call
        .set_manual_next_call_date(opportunity_id, date)
        .map_err(to_response)?;
    get_opportunity(state, opportunity_id)
}

/// Recompute an opportunity's next call date from its linked meetings.
pub fn recalculate_next_call_date(
    state: &PipelineState,
    opportunity_id: &str,
) -> CommandResult<NextCallResponse> {
    let next_call = state
        .next_call
        .recalculate(opportunity_id)
        .map_err(to_response)?;
    Ok(NextCallResponse {
        status_code: 200,
        opportunity_id: opportunity_id.to_string(),
        next_call,
    })
}

pub fn get_opportunity(
    state: &PipelineState,
    opportunity_id: &str,
) -> CommandResult<OpportunityResponse> {
    let opportunity = state
        .db
        .get_opportunity(opportunity_id)
        .map_err(|e| to_response(e.into()))?
        .ok_or_else(|| to_response(PipelineError::not_found("opportunity", opportunity_id)))?;
    Ok(OpportunityResponse {
        status_code: 200,
        opportunity,
    })
}
