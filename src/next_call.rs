//! Next call date resolution.
//!
//! Every opportunity carries one provenance-tagged "next call" value derived
//! from three sources: calendar events, call recordings and meeting notes.
//! Recalculation writes unconditionally (nulls included) so a stale value
//! never survives the meeting it pointed at.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::PipelineError;
use crate::repository::{MeetingSourceRepository, OpportunityRepository};
use crate::types::{ManualDatePolicy, MeetingCandidate, MeetingSource, NextCallDate};

/// Tie order when two sources report the same instant.
fn source_rank(source: MeetingSource) -> u8 {
    match source {
        MeetingSource::AutoCalendar => 0,
        MeetingSource::AutoCallRecording => 1,
        MeetingSource::AutoMeetingNote => 2,
        MeetingSource::Manual => 3,
    }
}

/// Pick the earliest candidate strictly after `now`.
///
/// Ties break on source (calendar, call recording, meeting note) then ID.
pub fn resolve_next_call(candidates: &[MeetingCandidate], now: DateTime<Utc>) -> NextCallDate {
    candidates
        .iter()
        .filter(|c| c.date > now)
        .min_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then_with(|| source_rank(a.kind).cmp(&source_rank(b.kind)))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|c| NextCallDate {
            date: Some(c.date),
            source: Some(c.kind),
            event_id: Some(c.id.clone()),
        })
        .unwrap_or_default()
}

pub struct NextCallResolver {
    meetings: Arc<dyn MeetingSourceRepository>,
    opportunities: Arc<dyn OpportunityRepository>,
    policy: ManualDatePolicy,
}

impl NextCallResolver {
    pub fn new(
        meetings: Arc<dyn MeetingSourceRepository>,
        opportunities: Arc<dyn OpportunityRepository>,
        policy: ManualDatePolicy,
    ) -> Self {
        Self {
            meetings,
            opportunities,
            policy,
        }
    }

    /// Recalculate and persist the next call date of one opportunity.
    pub fn recalculate(&self, opportunity_id: &str) -> Result<NextCallDate, PipelineError> {
        self.recalculate_at(opportunity_id, Utc::now())
    }

    pub fn recalculate_at(
        &self,
        opportunity_id: &str,
        now: DateTime<Utc>,
    ) -> Result<NextCallDate, PipelineError> {
        let candidates = self.meetings.future_meetings(opportunity_id, &now)?;
        let next = resolve_next_call(&candidates, now);
        let respect_manual = self.policy == ManualDatePolicy::RespectManual;
        let written =
            self.opportunities
                .write_next_call_date(opportunity_id, &next, &now, respect_manual)?;
        if !written {
            if self.opportunities.get_opportunity(opportunity_id)?.is_none() {
                return Err(PipelineError::not_found("opportunity", opportunity_id));
            }
            log::debug!(
                "NextCall: kept manual date on {} ({} candidates)",
                opportunity_id,
                candidates.len()
            );
        }
        Ok(next)
    }

    /// Recalculate a batch, logging failures instead of aborting.
    pub fn recalculate_many(&self, opportunity_ids: &BTreeSet<String>) -> usize {
        let mut updated = 0;
        for id in opportunity_ids {
            match self.recalculate(id) {
                Ok(_) => updated += 1,
                Err(e) => log::warn!("NextCall: recalculation failed for {}: {}", id, e),
            }
        }
        updated
    }

    /// Recalculate every opportunity whose stored date has passed.
    pub fn refresh_elapsed(&self) -> Result<usize, PipelineError> {
        self.refresh_elapsed_at(Utc::now())
    }

    pub fn refresh_elapsed_at(&self, now: DateTime<Utc>) -> Result<usize, PipelineError> {
        let elapsed = self.opportunities.list_elapsed_next_calls(&now)?;
        let mut refreshed = 0;
        for id in &elapsed {
            match self.recalculate_at(id, now) {
                Ok(_) => refreshed += 1,
                Err(e) => log::warn!("NextCall: refresh failed for {}: {}", id, e),
            }
        }
        if refreshed > 0 {
            log::info!("NextCall: refreshed {} elapsed next call dates", refreshed);
        }
        Ok(refreshed)
    }

    /// Record a user-entered date. Clearing (`None`) drops the manual flag.
    pub fn set_manual_next_call_date(
        &self,
        opportunity_id: &str,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), PipelineError> {
        if !self
            .opportunities
            .set_manual_next_call_date(opportunity_id, date.as_ref())?
        {
            return Err(PipelineError::not_found("opportunity", opportunity_id));
        }
        Ok(())
    }
}
