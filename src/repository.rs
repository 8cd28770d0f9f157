//! Repository traits the pipelines depend on.
//!
//! Engines hold `Arc<dyn …Repository>` so tests can swap in fakes; the
//! SQLite [`PipelineDb`] implements every trait by delegating to its own
//! methods.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::db::{
    AccountWithOpportunities, DbAccount, DbCalendarEvent, DbCall, DbError, DbOpportunity,
    DbSyncState, DbUser, EventUpsert, PipelineDb, RemovedEvent, SyncStateUpdate, UpsertOutcome,
};
use crate::types::{
    CallKind, CallRef, ConsolidatedInsights, ExtractedInsights, MeetingCandidate, MeetingSource,
    NextCallDate,
};

pub trait EventRepository: Send + Sync {
    fn upsert_synced_event(&self, event: &EventUpsert) -> Result<UpsertOutcome, DbError>;
    fn get_event(&self, id: &str) -> Result<Option<DbCalendarEvent>, DbError>;
    fn get_unlinked_events_for_org(&self, organization_id: &str)
        -> Result<Vec<DbCalendarEvent>, DbError>;
    fn fill_event_links(
        &self,
        event_id: &str,
        account_id: &str,
        opportunity_id: Option<&str>,
    ) -> Result<bool, DbError>;
    fn remove_synced_event(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<RemovedEvent>, DbError>;
    fn remove_unseen_synced_events(
        &self,
        user_id: &str,
        window_min: &DateTime<Utc>,
        window_max: &DateTime<Utc>,
        seen: &HashSet<String>,
    ) -> Result<Vec<RemovedEvent>, DbError>;
}

pub trait AccountRepository: Send + Sync {
    fn get_user(&self, user_id: &str) -> Result<Option<DbUser>, DbError>;
    fn list_user_ids(&self) -> Result<Vec<String>, DbError>;
    fn get_account(&self, id: &str) -> Result<Option<DbAccount>, DbError>;
    fn get_accounts_with_opportunities(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AccountWithOpportunities>, DbError>;
    fn update_account_website(
        &self,
        id: &str,
        website: Option<&str>,
    ) -> Result<Option<DbAccount>, DbError>;
}

pub trait OpportunityRepository: Send + Sync {
    fn get_opportunity(&self, id: &str) -> Result<Option<DbOpportunity>, DbError>;
    fn write_next_call_date(
        &self,
        opportunity_id: &str,
        value: &NextCallDate,
        calculated_at: &DateTime<Utc>,
        respect_manual: bool,
    ) -> Result<bool, DbError>;
    fn set_manual_next_call_date(
        &self,
        opportunity_id: &str,
        date: Option<&DateTime<Utc>>,
    ) -> Result<bool, DbError>;
    fn begin_consolidation(&self, opportunity_id: &str) -> Result<Option<i64>, DbError>;
    fn complete_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        insights: &ConsolidatedInsights,
        consolidated_at: &DateTime<Utc>,
    ) -> Result<bool, DbError>;
    fn fail_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        error: &str,
    ) -> Result<bool, DbError>;
    fn list_processing_opportunities(&self) -> Result<Vec<(String, i64)>, DbError>;
    fn list_elapsed_next_calls(&self, now: &DateTime<Utc>) -> Result<Vec<String>, DbError>;
}

pub trait CallRepository: Send + Sync {
    fn get_call(&self, call: &CallRef) -> Result<Option<DbCall>, DbError>;
    fn begin_parse(&self, call: &CallRef, transcript: &str) -> Result<Option<i64>, DbError>;
    fn complete_parse(
        &self,
        call: &CallRef,
        generation: i64,
        insights: &ExtractedInsights,
        parsed_at: &DateTime<Utc>,
    ) -> Result<bool, DbError>;
    fn fail_parse(&self, call: &CallRef, generation: i64, error: &str) -> Result<bool, DbError>;
    fn get_completed_calls(&self, opportunity_id: &str) -> Result<Vec<DbCall>, DbError>;
    fn count_completed_calls(&self, opportunity_id: &str) -> Result<usize, DbError>;
    fn list_parsing_calls(&self) -> Result<Vec<(CallRef, i64)>, DbError>;
}

pub trait SyncStateRepository: Send + Sync {
    fn get_sync_state(&self, user_id: &str, provider: &str)
        -> Result<Option<DbSyncState>, DbError>;
    fn mark_sync_started(&self, user_id: &str, provider: &str) -> Result<(), DbError>;
    fn finish_sync(
        &self,
        user_id: &str,
        provider: &str,
        update: &SyncStateUpdate,
    ) -> Result<(), DbError>;
}

/// Future meetings of an opportunity across calendar events, call
/// recordings and meeting notes.
pub trait MeetingSourceRepository: Send + Sync {
    fn future_meetings(
        &self,
        opportunity_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<Vec<MeetingCandidate>, DbError>;
}

// =============================================================================
// SQLite implementations
// =============================================================================

impl EventRepository for PipelineDb {
    fn upsert_synced_event(&self, event: &EventUpsert) -> Result<UpsertOutcome, DbError> {
        PipelineDb::upsert_synced_event(self, event)
    }

    fn get_event(&self, id: &str) -> Result<Option<DbCalendarEvent>, DbError> {
        PipelineDb::get_event(self, id)
    }

    fn get_unlinked_events_for_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<DbCalendarEvent>, DbError> {
        PipelineDb::get_unlinked_events_for_org(self, organization_id)
    }

    fn fill_event_links(
        &self,
        event_id: &str,
        account_id: &str,
        opportunity_id: Option<&str>,
    ) -> Result<bool, DbError> {
        PipelineDb::fill_event_links(self, event_id, account_id, opportunity_id)
    }

    fn remove_synced_event(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<RemovedEvent>, DbError> {
        PipelineDb::remove_synced_event(self, user_id, external_id)
    }

    fn remove_unseen_synced_events(
        &self,
        user_id: &str,
        window_min: &DateTime<Utc>,
        window_max: &DateTime<Utc>,
        seen: &HashSet<String>,
    ) -> Result<Vec<RemovedEvent>, DbError> {
        PipelineDb::remove_unseen_synced_events(self, user_id, window_min, window_max, seen)
    }
}

impl AccountRepository for PipelineDb {
    fn get_user(&self, user_id: &str) -> Result<Option<DbUser>, DbError> {
        PipelineDb::get_user(self, user_id)
    }

    fn list_user_ids(&self) -> Result<Vec<String>, DbError> {
        PipelineDb::list_user_ids(self)
    }

    fn get_account(&self, id: &str) -> Result<Option<DbAccount>, DbError> {
        PipelineDb::get_account(self, id)
    }

    fn get_accounts_with_opportunities(
        &self,
        organization_id: &str,
    ) -> Result<Vec<AccountWithOpportunities>, DbError> {
        PipelineDb::get_accounts_with_opportunities(self, organization_id)
    }

    fn update_account_website(
        &self,
        id: &str,
        website: Option<&str>,
    ) -> Result<Option<DbAccount>, DbError> {
        PipelineDb::update_account_website(self, id, website)
    }
}

impl OpportunityRepository for PipelineDb {
    fn get_opportunity(&self, id: &str) -> Result<Option<DbOpportunity>, DbError> {
        PipelineDb::get_opportunity(self, id)
    }

    fn write_next_call_date(
        &self,
        opportunity_id: &str,
        value: &NextCallDate,
        calculated_at: &DateTime<Utc>,
        respect_manual: bool,
    ) -> Result<bool, DbError> {
        PipelineDb::write_next_call_date(self, opportunity_id, value, calculated_at, respect_manual)
    }

    fn set_manual_next_call_date(
        &self,
        opportunity_id: &str,
        date: Option<&DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        PipelineDb::set_manual_next_call_date(self, opportunity_id, date)
    }

    fn begin_consolidation(&self, opportunity_id: &str) -> Result<Option<i64>, DbError> {
        PipelineDb::begin_consolidation(self, opportunity_id)
    }

    fn complete_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        insights: &ConsolidatedInsights,
        consolidated_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        PipelineDb::complete_consolidation(self, opportunity_id, generation, insights, consolidated_at)
    }

    fn fail_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        error: &str,
    ) -> Result<bool, DbError> {
        PipelineDb::fail_consolidation(self, opportunity_id, generation, error)
    }

    fn list_processing_opportunities(&self) -> Result<Vec<(String, i64)>, DbError> {
        PipelineDb::list_processing_opportunities(self)
    }

    fn list_elapsed_next_calls(&self, now: &DateTime<Utc>) -> Result<Vec<String>, DbError> {
        PipelineDb::list_elapsed_next_calls(self, now)
    }
}

impl CallRepository for PipelineDb {
    fn get_call(&self, call: &CallRef) -> Result<Option<DbCall>, DbError> {
        PipelineDb::get_call(self, call)
    }

    fn begin_parse(&self, call: &CallRef, transcript: &str) -> Result<Option<i64>, DbError> {
        PipelineDb::begin_parse(self, call, transcript)
    }

    fn complete_parse(
        &self,
        call: &CallRef,
        generation: i64,
        insights: &ExtractedInsights,
        parsed_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        PipelineDb::complete_parse(self, call, generation, insights, parsed_at)
    }

    fn fail_parse(&self, call: &CallRef, generation: i64, error: &str) -> Result<bool, DbError> {
        PipelineDb::fail_parse(self, call, generation, error)
    }

    fn get_completed_calls(&self, opportunity_id: &str) -> Result<Vec<DbCall>, DbError> {
        PipelineDb::get_completed_calls(self, opportunity_id)
    }

    fn count_completed_calls(&self, opportunity_id: &str) -> Result<usize, DbError> {
        PipelineDb::count_completed_calls(self, opportunity_id)
    }

    fn list_parsing_calls(&self) -> Result<Vec<(CallRef, i64)>, DbError> {
        PipelineDb::list_parsing_calls(self)
    }
}

impl SyncStateRepository for PipelineDb {
    fn get_sync_state(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<DbSyncState>, DbError> {
        PipelineDb::get_sync_state(self, user_id, provider)
    }

    fn mark_sync_started(&self, user_id: &str, provider: &str) -> Result<(), DbError> {
        PipelineDb::mark_sync_started(self, user_id, provider)
    }

    fn finish_sync(
        &self,
        user_id: &str,
        provider: &str,
        update: &SyncStateUpdate,
    ) -> Result<(), DbError> {
        PipelineDb::finish_sync(self, user_id, provider, update)
    }
}

impl MeetingSourceRepository for PipelineDb {
    fn future_meetings(
        &self,
        opportunity_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<Vec<MeetingCandidate>, DbError> {
        let tag = |kind: MeetingSource, rows: Vec<(String, DateTime<Utc>)>| {
            rows.into_iter().map(move |(id, date)| MeetingCandidate {
                kind,
                id,
                date,
                opportunity_id: opportunity_id.to_string(),
            })
        };

        let mut candidates: Vec<MeetingCandidate> = tag(
            MeetingSource::AutoCalendar,
            self.get_future_calendar_meetings(opportunity_id, now)?,
        )
        .collect();
        for kind in [CallKind::CallRecording, CallKind::MeetingNote] {
            candidates.extend(tag(
                kind.meeting_source(),
                self.get_future_call_meetings(kind, opportunity_id, now)?,
            ));
        }
        Ok(candidates)
    }
}
