use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::events::future_rows;
use super::types::{decode_list, encode_list, format_timestamp, optional_timestamp_at};
use super::*;
use crate::types::{CallKind, CallRef, ExtractedInsights, ParsingStatus};

fn call_columns() -> &'static str {
    "id, opportunity_id, title, meeting_date, transcript_text, parsing_status,
     parse_generation, parsed_at, parsing_error, pain_points, goals,
     people_mentioned, next_steps, why_and_why_now, quantifiable_metrics"
}

impl PipelineDb {
    // =========================================================================
    // Call recordings & meeting notes
    // =========================================================================

    /// Create a call row. Used by importers and tests.
    pub fn insert_call(
        &self,
        kind: CallKind,
        opportunity_id: Option<&str>,
        title: &str,
        meeting_date: Option<&DateTime<Utc>>,
    ) -> Result<CallRef, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_timestamp(&Utc::now());
        self.conn().execute(
            &format!(
                "INSERT INTO {} (id, opportunity_id, title, meeting_date, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                kind.table()
            ),
            params![
                id,
                opportunity_id,
                title,
                meeting_date.map(format_timestamp),
                now
            ],
        )?;
        Ok(CallRef::new(kind, id))
    }

    pub fn get_call(&self, call: &CallRef) -> Result<Option<DbCall>, DbError> {
        let conn = self.conn();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE id = ?1",
                    call_columns(),
                    call.kind.table()
                ),
                params![call.id],
                |row| map_call_row(call.kind, row),
            )
            .optional()?;
        row.map(RawCall::into_call).transpose()
    }

    /// Move a call into `parsing` for a fresh submission.
    ///
    /// Persists the transcript, clears any previous payload and error and
    /// bumps the generation. Returns the new generation, or `None` when the
    /// call doesn't exist.
    pub fn begin_parse(&self, call: &CallRef, transcript: &str) -> Result<Option<i64>, DbError> {
        self.with_transaction(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE {} SET
                        transcript_text = ?2,
                        parsing_status = 'parsing',
                        parse_generation = parse_generation + 1,
                        parsing_error = NULL,
                        parsed_at = NULL,
                        pain_points = NULL, goals = NULL, people_mentioned = NULL,
                        next_steps = NULL, why_and_why_now = NULL, quantifiable_metrics = NULL,
                        updated_at = ?3
                     WHERE id = ?1",
                    call.kind.table()
                ),
                params![call.id, transcript, format_timestamp(&Utc::now())],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let generation: i64 = conn.query_row(
                &format!(
                    "SELECT parse_generation FROM {} WHERE id = ?1",
                    call.kind.table()
                ),
                params![call.id],
                |row| row.get(0),
            )?;
            Ok(Some(generation))
        })
    }

    /// Store an extraction result. Returns false when the job is stale.
    pub fn complete_parse(
        &self,
        call: &CallRef,
        generation: i64,
        insights: &ExtractedInsights,
        parsed_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET
                    parsing_status = 'completed',
                    parsing_error = NULL,
                    parsed_at = ?3,
                    pain_points = ?4, goals = ?5, people_mentioned = ?6,
                    next_steps = ?7, why_and_why_now = ?8, quantifiable_metrics = ?9,
                    updated_at = ?3
                 WHERE id = ?1 AND parse_generation = ?2 AND parsing_status = 'parsing'",
                call.kind.table()
            ),
            params![
                call.id,
                generation,
                format_timestamp(parsed_at),
                encode_list(&insights.pain_points)?,
                encode_list(&insights.goals)?,
                encode_list(&insights.people_mentioned)?,
                encode_list(&insights.next_steps)?,
                encode_list(&insights.why_and_why_now)?,
                encode_list(&insights.quantifiable_metrics)?,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record an extraction failure and drop any payload. Returns false when
    /// the job is stale.
    pub fn fail_parse(&self, call: &CallRef, generation: i64, error: &str) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            &format!(
                "UPDATE {} SET
                    parsing_status = 'failed',
                    parsing_error = ?3,
                    parsed_at = NULL,
                    pain_points = NULL, goals = NULL, people_mentioned = NULL,
                    next_steps = NULL, why_and_why_now = NULL, quantifiable_metrics = NULL,
                    updated_at = ?4
                 WHERE id = ?1 AND parse_generation = ?2 AND parsing_status = 'parsing'",
                call.kind.table()
            ),
            params![call.id, generation, error, format_timestamp(&Utc::now())],
        )?;
        Ok(changed > 0)
    }

    /// Completed calls of both variants for an opportunity, ordered by
    /// meeting date then ID. Undated calls sort last.
    pub fn get_completed_calls(&self, opportunity_id: &str) -> Result<Vec<DbCall>, DbError> {
        let conn = self.conn();
        let mut raw = Vec::new();
        for kind in [CallKind::CallRecording, CallKind::MeetingNote] {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} WHERE opportunity_id = ?1 AND parsing_status = 'completed'",
                call_columns(),
                kind.table()
            ))?;
            let rows = stmt.query_map(params![opportunity_id], |row| map_call_row(kind, row))?;
            for row in rows {
                raw.push(row?);
            }
        }
        drop(conn);

        let mut calls = raw
            .into_iter()
            .map(RawCall::into_call)
            .collect::<Result<Vec<_>, _>>()?;
        calls.sort_by(|a, b| match (a.meeting_date, b.meeting_date) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.id.cmp(&b.id)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.id.cmp(&b.id),
        });
        Ok(calls)
    }

    pub fn count_completed_calls(&self, opportunity_id: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT
                (SELECT COUNT(*) FROM call_recordings
                 WHERE opportunity_id = ?1 AND parsing_status = 'completed')
              + (SELECT COUNT(*) FROM meeting_notes
                 WHERE opportunity_id = ?1 AND parsing_status = 'completed')",
            params![opportunity_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Calls left in `parsing` with their current generation, for startup recovery.
    pub fn list_parsing_calls(&self) -> Result<Vec<(CallRef, i64)>, DbError> {
        let conn = self.conn();
        let mut out = Vec::new();
        for kind in [CallKind::CallRecording, CallKind::MeetingNote] {
            let mut stmt = conn.prepare(&format!(
                "SELECT id, parse_generation FROM {} WHERE parsing_status = 'parsing' ORDER BY id",
                kind.table()
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok((CallRef::new(kind, row.get::<_, String>(0)?), row.get(1)?))
            })?;
            for row in rows {
                out.push(row?);
            }
        }
        Ok(out)
    }

    /// Calls of one variant linked to an opportunity with a meeting date after `now`.
    pub fn get_future_call_meetings(
        &self,
        kind: CallKind,
        opportunity_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let conn = self.conn();
        future_rows(
            &conn,
            &format!(
                "SELECT id, meeting_date FROM {} WHERE opportunity_id = ?1",
                kind.table()
            ),
            opportunity_id,
            now,
        )
    }
}

/// Row image before the JSON list columns are decoded.
struct RawCall {
    id: String,
    kind: CallKind,
    opportunity_id: Option<String>,
    title: String,
    meeting_date: Option<DateTime<Utc>>,
    transcript_text: Option<String>,
    parsing_status: ParsingStatus,
    parse_generation: i64,
    parsed_at: Option<String>,
    parsing_error: Option<String>,
    lists: [Option<String>; 6],
}

impl RawCall {
    fn into_call(self) -> Result<DbCall, DbError> {
        let insights = if self.parsing_status == ParsingStatus::Completed {
            let [pain_points, goals, people_mentioned, next_steps, why_and_why_now, quantifiable_metrics] =
                self.lists;
            Some(ExtractedInsights {
                pain_points: decode_list(pain_points)?,
                goals: decode_list(goals)?,
                people_mentioned: decode_list(people_mentioned)?,
                next_steps: decode_list(next_steps)?,
                why_and_why_now: decode_list(why_and_why_now)?,
                quantifiable_metrics: decode_list(quantifiable_metrics)?,
            })
        } else {
            None
        };
        Ok(DbCall {
            id: self.id,
            kind: self.kind,
            opportunity_id: self.opportunity_id,
            title: self.title,
            meeting_date: self.meeting_date,
            transcript_text: self.transcript_text,
            parsing_status: self.parsing_status,
            parse_generation: self.parse_generation,
            parsed_at: self.parsed_at,
            parsing_error: self.parsing_error,
            insights,
        })
    }
}

fn map_call_row(kind: CallKind, row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCall> {
    let status: String = row.get(5)?;
    Ok(RawCall {
        id: row.get(0)?,
        kind,
        opportunity_id: row.get(1)?,
        title: row.get(2)?,
        meeting_date: optional_timestamp_at(row, 3)?,
        transcript_text: row.get(4)?,
        parsing_status: ParsingStatus::parse(&status),
        parse_generation: row.get(6)?,
        parsed_at: row.get(7)?,
        parsing_error: row.get(8)?,
        lists: [
            row.get(9)?,
            row.get(10)?,
            row.get(11)?,
            row.get(12)?,
            row.get(13)?,
            row.get(14)?,
        ],
    })
}
