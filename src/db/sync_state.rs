use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::types::{format_timestamp, optional_timestamp_at};
use super::*;
use crate::types::SyncStatus;

impl PipelineDb {
    // =========================================================================
    // Sync checkpoints
    // =========================================================================

    pub fn get_sync_state(
        &self,
        user_id: &str,
        provider: &str,
    ) -> Result<Option<DbSyncState>, DbError> {
        let conn = self.conn();
        let state = conn
            .query_row(
                "SELECT user_id, provider, cursor, window_min, window_max, last_run_at,
                        last_status, last_error, last_created, last_updated
                 FROM sync_state WHERE user_id = ?1 AND provider = ?2",
                params![user_id, provider],
                |row| {
                    let status: Option<String> = row.get(6)?;
                    Ok(DbSyncState {
                        user_id: row.get(0)?,
                        provider: row.get(1)?,
                        cursor: row.get(2)?,
                        window_min: optional_timestamp_at(row, 3)?,
                        window_max: optional_timestamp_at(row, 4)?,
                        last_run_at: row.get(5)?,
                        last_status: status.as_deref().and_then(SyncStatus::parse),
                        last_error: row.get(7)?,
                        last_created: row.get(8)?,
                        last_updated: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Stamp a run as started. Cursor and window are not touched.
    pub fn mark_sync_started(&self, user_id: &str, provider: &str) -> Result<(), DbError> {
        self.conn().execute(
            "INSERT INTO sync_state (user_id, provider, last_run_at, last_status)
             VALUES (?1, ?2, ?3, 'in_progress')
             ON CONFLICT(user_id, provider) DO UPDATE SET
                last_run_at = excluded.last_run_at,
                last_status = 'in_progress'",
            params![user_id, provider, format_timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// The single end-of-run write.
    ///
    /// Error updates keep the stored cursor and window; success updates
    /// replace them with the run's values.
    pub fn finish_sync(
        &self,
        user_id: &str,
        provider: &str,
        update: &SyncStateUpdate,
    ) -> Result<(), DbError> {
        let keep_checkpoint = update.status != SyncStatus::Success;
        self.conn().execute(
            "INSERT INTO sync_state (
                user_id, provider, cursor, window_min, window_max, last_run_at,
                last_status, last_error, last_created, last_updated
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(user_id, provider) DO UPDATE SET
                cursor = CASE WHEN ?11 THEN sync_state.cursor ELSE excluded.cursor END,
                window_min = CASE WHEN ?11 THEN sync_state.window_min ELSE excluded.window_min END,
                window_max = CASE WHEN ?11 THEN sync_state.window_max ELSE excluded.window_max END,
                last_run_at = excluded.last_run_at,
                last_status = excluded.last_status,
                last_error = excluded.last_error,
                last_created = excluded.last_created,
                last_updated = excluded.last_updated",
            params![
                user_id,
                provider,
                if keep_checkpoint { None } else { update.cursor.clone() },
                update.window_min.as_ref().map(format_timestamp).filter(|_| !keep_checkpoint),
                update.window_max.as_ref().map(format_timestamp).filter(|_| !keep_checkpoint),
                format_timestamp(&Utc::now()),
                update.status.as_str(),
                update.error,
                update.created,
                update.updated,
                keep_checkpoint,
            ],
        )?;
        Ok(())
    }
}
