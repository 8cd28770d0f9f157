use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::types::{encode_list, format_timestamp, optional_timestamp_at, timestamp_at};
use super::*;
use crate::types::EventOrigin;

const EVENT_COLUMNS: &str = "id, external_id, user_id, title, start_time, end_time, attendees,
     organizer, is_external, conference_link, account_id, opportunity_id, source,
     created_at, updated_at";

impl PipelineDb {
    // =========================================================================
    // Calendar events
    // =========================================================================

    /// Insert or refresh a synced event keyed by (user_id, external_id).
    ///
    /// Runs in one short transaction so a concurrent backfill can't interleave
    /// between the read of the current links and the write. Links are merged,
    /// never cleared: a resolved account replaces the stored one, and the stored
    /// opportunity survives only when it belongs to the same account. Rows the
    /// user created by hand are left untouched.
    pub fn upsert_synced_event(&self, event: &EventUpsert) -> Result<UpsertOutcome, DbError> {
        self.with_transaction(|conn| {
            let existing = conn
                .query_row(
                    "SELECT id, account_id, opportunity_id, start_time, source
                     FROM calendar_events
                     WHERE user_id = ?1 AND external_id = ?2",
                    params![event.user_id, event.external_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            optional_timestamp_at(row, 3)?,
                            row.get::<_, String>(4)?,
                        ))
                    },
                )
                .optional()?;

            let now = format_timestamp(&Utc::now());
            let attendees = encode_list(&event.attendees)?;

            match existing {
                None => {
                    conn.execute(
                        "INSERT INTO calendar_events (
                            id, external_id, user_id, title, start_time, end_time, attendees,
                            organizer, is_external, conference_link, account_id, opportunity_id,
                            source, created_at, updated_at
                         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 'synced', ?13, ?13)",
                        params![
                            uuid::Uuid::new_v4().to_string(),
                            event.external_id,
                            event.user_id,
                            event.title,
                            format_timestamp(&event.start_time),
                            format_timestamp(&event.end_time),
                            attendees,
                            event.organizer,
                            event.is_external as i32,
                            event.conference_link,
                            event.account_id,
                            event.opportunity_id,
                            now,
                        ],
                    )?;
                    Ok(UpsertOutcome {
                        created: true,
                        skipped: false,
                        previous_opportunity_id: None,
                        previous_start_time: None,
                        account_id: event.account_id.clone(),
                        opportunity_id: event.opportunity_id.clone(),
                    })
                }
                Some((_, account_id, opportunity_id, start_time, source))
                    if EventOrigin::parse(&source) == EventOrigin::Manual =>
                {
                    Ok(UpsertOutcome {
                        created: false,
                        skipped: true,
                        previous_opportunity_id: opportunity_id.clone(),
                        previous_start_time: start_time,
                        account_id,
                        opportunity_id,
                    })
                }
                Some((id, account_id, opportunity_id, start_time, _)) => {
                    let (merged_account, merged_opportunity) = merge_links(
                        account_id.as_deref(),
                        opportunity_id.as_deref(),
                        event.account_id.as_deref(),
                        event.opportunity_id.as_deref(),
                    );
                    conn.execute(
                        "UPDATE calendar_events SET
                            title = ?2, start_time = ?3, end_time = ?4, attendees = ?5,
                            organizer = ?6, is_external = ?7, conference_link = ?8,
                            account_id = ?9, opportunity_id = ?10, updated_at = ?11
                         WHERE id = ?1",
                        params![
                            id,
                            event.title,
                            format_timestamp(&event.start_time),
                            format_timestamp(&event.end_time),
                            attendees,
                            event.organizer,
                            event.is_external as i32,
                            event.conference_link,
                            merged_account,
                            merged_opportunity,
                            now,
                        ],
                    )?;
                    Ok(UpsertOutcome {
                        created: false,
                        skipped: false,
                        previous_opportunity_id: opportunity_id,
                        previous_start_time: start_time,
                        account_id: merged_account,
                        opportunity_id: merged_opportunity,
                    })
                }
            }
        })
    }

    /// Insert a user-authored event. Sync never overwrites these rows.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_manual_event(
        &self,
        user_id: &str,
        title: &str,
        start_time: &DateTime<Utc>,
        end_time: &DateTime<Utc>,
        attendees: &[String],
        account_id: Option<&str>,
        opportunity_id: Option<&str>,
    ) -> Result<String, DbError> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_timestamp(&Utc::now());
        self.conn().execute(
            "INSERT INTO calendar_events (
                id, external_id, user_id, title, start_time, end_time, attendees,
                account_id, opportunity_id, source, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'manual', ?10, ?10)",
            params![
                id,
                format!("manual-{}", id),
                user_id,
                title,
                format_timestamp(start_time),
                format_timestamp(end_time),
                encode_list(attendees)?,
                account_id,
                opportunity_id.filter(|_| account_id.is_some()),
                now,
            ],
        )?;
        Ok(id)
    }

    /// Look up a single event by local ID.
    pub fn get_event(&self, id: &str) -> Result<Option<DbCalendarEvent>, DbError> {
        let conn = self.conn();
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM calendar_events WHERE id = ?1"),
                params![id],
                Self::map_event_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Look up an event by its provider identity.
    pub fn get_event_by_external_id(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<DbCalendarEvent>, DbError> {
        let conn = self.conn();
        let event = conn
            .query_row(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM calendar_events
                     WHERE user_id = ?1 AND external_id = ?2"
                ),
                params![user_id, external_id],
                Self::map_event_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Events owned by the organization's users that are missing an account
    /// or an opportunity link.
    pub fn get_unlinked_events_for_org(
        &self,
        organization_id: &str,
    ) -> Result<Vec<DbCalendarEvent>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT e.id, e.external_id, e.user_id, e.title, e.start_time, e.end_time,
                    e.attendees, e.organizer, e.is_external, e.conference_link, e.account_id,
                    e.opportunity_id, e.source, e.created_at, e.updated_at
             FROM calendar_events e
             INNER JOIN users u ON u.id = e.user_id
             WHERE u.organization_id = ?1
               AND (e.account_id IS NULL OR e.opportunity_id IS NULL)
             ORDER BY e.start_time, e.id",
        )?;
        let rows = stmt.query_map(params![organization_id], Self::map_event_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Fill unset link columns only. Returns true when the row changed.
    ///
    /// The account is written only when none is stored. The opportunity is
    /// written only when none is stored and the row's (possibly just written)
    /// account is the one the opportunity was resolved under.
    pub fn fill_event_links(
        &self,
        event_id: &str,
        account_id: &str,
        opportunity_id: Option<&str>,
    ) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            "UPDATE calendar_events SET
                account_id = COALESCE(account_id, ?2),
                opportunity_id = CASE
                    WHEN opportunity_id IS NULL AND ?3 IS NOT NULL
                         AND COALESCE(account_id, ?2) = ?2
                    THEN ?3
                    ELSE opportunity_id
                END,
                updated_at = ?4
             WHERE id = ?1
               AND (account_id IS NULL
                    OR (opportunity_id IS NULL AND ?3 IS NOT NULL AND account_id = ?2))",
            params![
                event_id,
                account_id,
                opportunity_id,
                format_timestamp(&Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    /// Delete a synced event the provider reports as cancelled or deleted.
    /// Manual rows are never removed. `None` when nothing was stored.
    pub fn remove_synced_event(
        &self,
        user_id: &str,
        external_id: &str,
    ) -> Result<Option<RemovedEvent>, DbError> {
        let conn = self.conn();
        let removed = conn
            .query_row(
                "DELETE FROM calendar_events
                 WHERE user_id = ?1 AND external_id = ?2 AND source = 'synced'
                 RETURNING id, external_id, opportunity_id",
                params![user_id, external_id],
                map_removed_row,
            )
            .optional()?;
        Ok(removed)
    }

    /// Delete the user's synced events starting inside `[window_min, window_max)`
    /// whose external ID the provider no longer lists.
    ///
    /// Only valid after a complete full-window walk.
    pub fn remove_unseen_synced_events(
        &self,
        user_id: &str,
        window_min: &DateTime<Utc>,
        window_max: &DateTime<Utc>,
        seen: &HashSet<String>,
    ) -> Result<Vec<RemovedEvent>, DbError> {
        self.with_transaction(|conn| {
            let stale = {
                let mut stmt = conn.prepare(
                    "SELECT id, external_id, opportunity_id FROM calendar_events
                     WHERE user_id = ?1 AND source = 'synced'
                       AND start_time >= ?2 AND start_time < ?3",
                )?;
                let rows = stmt.query_map(
                    params![
                        user_id,
                        format_timestamp(window_min),
                        format_timestamp(window_max)
                    ],
                    map_removed_row,
                )?;
                rows.filter(|row| !matches!(row, Ok(r) if seen.contains(&r.external_id)))
                    .collect::<Result<Vec<_>, _>>()?
            };
            for row in &stale {
                conn.execute("DELETE FROM calendar_events WHERE id = ?1", params![row.id])?;
            }
            Ok(stale)
        })
    }

    /// Calendar meetings linked to an opportunity that start after `now`.
    pub fn get_future_calendar_meetings(
        &self,
        opportunity_id: &str,
        now: &DateTime<Utc>,
    ) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
        let conn = self.conn();
        future_rows(
            &conn,
            "SELECT id, start_time FROM calendar_events WHERE opportunity_id = ?1",
            opportunity_id,
            now,
        )
    }

    /// Count events of a user carrying an account link.
    pub fn count_matched_events(&self, user_id: &str) -> Result<usize, DbError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM calendar_events WHERE user_id = ?1 AND account_id IS NOT NULL",
            params![user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Helper: map a row to `DbCalendarEvent`.
    pub(crate) fn map_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DbCalendarEvent> {
        let attendees: String = row.get(6)?;
        let source: String = row.get(12)?;
        Ok(DbCalendarEvent {
            id: row.get(0)?,
            external_id: row.get(1)?,
            user_id: row.get(2)?,
            title: row.get(3)?,
            start_time: timestamp_at(row, 4)?,
            end_time: timestamp_at(row, 5)?,
            attendees: serde_json::from_str(&attendees).unwrap_or_default(),
            organizer: row.get(7)?,
            is_external: row.get::<_, i32>(8).unwrap_or(0) != 0,
            conference_link: row.get(9)?,
            account_id: row.get(10)?,
            opportunity_id: row.get(11)?,
            source: EventOrigin::parse(&source),
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }
}

fn map_removed_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemovedEvent> {
    Ok(RemovedEvent {
        id: row.get(0)?,
        external_id: row.get(1)?,
        opportunity_id: row.get(2)?,
    })
}

/// Resolve the link columns of a re-synced row.
fn merge_links(
    stored_account: Option<&str>,
    stored_opportunity: Option<&str>,
    resolved_account: Option<&str>,
    resolved_opportunity: Option<&str>,
) -> (Option<String>, Option<String>) {
    match resolved_account {
        Some(account) => {
            let opportunity = resolved_opportunity.or(if stored_account == Some(account) {
                stored_opportunity
            } else {
                None
            });
            (Some(account.to_string()), opportunity.map(str::to_string))
        }
        None => (
            stored_account.map(str::to_string),
            stored_opportunity.map(str::to_string),
        ),
    }
}

/// Run an `(id, timestamp)` query bound to an opportunity and keep rows after `now`.
pub(crate) fn future_rows(
    conn: &Connection,
    sql: &str,
    opportunity_id: &str,
    now: &DateTime<Utc>,
) -> Result<Vec<(String, DateTime<Utc>)>, DbError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![opportunity_id], |row| {
        Ok((row.get::<_, String>(0)?, optional_timestamp_at(row, 1)?))
    })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, at) = row?;
        if let Some(at) = at.filter(|at| at > now) {
            out.push((id, at));
        }
    }
    Ok(out)
}
