use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::types::{decode_list, encode_list, format_timestamp, optional_timestamp_at};
use super::*;
use crate::types::{ConsolidatedInsights, ConsolidationStatus, MeetingSource, NextCallDate};

impl PipelineDb {
    // =========================================================================
    // Opportunities
    // =========================================================================

    pub fn get_opportunity(&self, id: &str) -> Result<Option<DbOpportunity>, DbError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT id, account_id, name, next_call_date, next_call_date_source,
                        next_call_date_event_id, next_call_date_last_calculated,
                        next_call_date_manually_set, consolidated_pain_points,
                        consolidated_goals, consolidated_why_and_why_now,
                        consolidated_metrics, risk_assessment, consolidation_status,
                        consolidation_error, consolidation_generation, consolidated_at
                 FROM opportunities WHERE id = ?1",
                params![id],
                |row| {
                    let source: Option<String> = row.get(4)?;
                    let status: String = row.get(13)?;
                    Ok((
                        DbOpportunity {
                            id: row.get(0)?,
                            account_id: row.get(1)?,
                            name: row.get(2)?,
                            next_call_date: optional_timestamp_at(row, 3)?,
                            next_call_date_source: source.as_deref().and_then(MeetingSource::parse),
                            next_call_date_event_id: row.get(5)?,
                            next_call_date_last_calculated: row.get(6)?,
                            next_call_date_manually_set: row.get::<_, i32>(7)? != 0,
                            consolidated_pain_points: Vec::new(),
                            consolidated_goals: Vec::new(),
                            consolidated_why_and_why_now: Vec::new(),
                            consolidated_metrics: Vec::new(),
                            risk_assessment: row.get(12)?,
                            consolidation_status: ConsolidationStatus::parse(&status),
                            consolidation_error: row.get(14)?,
                            consolidation_generation: row.get(15)?,
                            consolidated_at: row.get(16)?,
                        },
                        [
                            row.get::<_, Option<String>>(8)?,
                            row.get::<_, Option<String>>(9)?,
                            row.get::<_, Option<String>>(10)?,
                            row.get::<_, Option<String>>(11)?,
                        ],
                    ))
                },
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some((mut opp, [pain, goals, why, metrics])) => {
                opp.consolidated_pain_points = decode_list(pain)?;
                opp.consolidated_goals = decode_list(goals)?;
                opp.consolidated_why_and_why_now = decode_list(why)?;
                opp.consolidated_metrics = decode_list(metrics)?;
                Ok(Some(opp))
            }
        }
    }

    /// Persist a recalculated next call date.
    ///
    /// Always writes (nulls included) and clears the manual flag. With
    /// `respect_manual` set, rows carrying the flag are left untouched and the
    /// method returns false.
    pub fn write_next_call_date(
        &self,
        opportunity_id: &str,
        value: &NextCallDate,
        calculated_at: &DateTime<Utc>,
        respect_manual: bool,
    ) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            "UPDATE opportunities SET
                next_call_date = ?2,
                next_call_date_source = ?3,
                next_call_date_event_id = ?4,
                next_call_date_last_calculated = ?5,
                next_call_date_manually_set = 0,
                updated_at = ?5
             WHERE id = ?1 AND (?6 = 0 OR next_call_date_manually_set = 0)",
            params![
                opportunity_id,
                value.date.as_ref().map(format_timestamp),
                value.source.map(|s| s.as_str()),
                value.event_id,
                format_timestamp(calculated_at),
                respect_manual as i32,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Record a next call date entered by hand. Returns false for unknown IDs.
    pub fn set_manual_next_call_date(
        &self,
        opportunity_id: &str,
        date: Option<&DateTime<Utc>>,
    ) -> Result<bool, DbError> {
        let now = format_timestamp(&Utc::now());
        let changed = self.conn().execute(
            "UPDATE opportunities SET
                next_call_date = ?2,
                next_call_date_source = CASE WHEN ?2 IS NULL THEN NULL ELSE 'manual' END,
                next_call_date_event_id = NULL,
                next_call_date_manually_set = CASE WHEN ?2 IS NULL THEN 0 ELSE 1 END,
                updated_at = ?3
             WHERE id = ?1",
            params![opportunity_id, date.map(format_timestamp), now],
        )?;
        Ok(changed > 0)
    }

    /// Move an opportunity into `processing` and return the new generation.
    /// `None` when the opportunity doesn't exist.
    pub fn begin_consolidation(&self, opportunity_id: &str) -> Result<Option<i64>, DbError> {
        self.with_transaction(|conn| {
            let changed = conn.execute(
                "UPDATE opportunities SET
                    consolidation_status = 'processing',
                    consolidation_error = NULL,
                    consolidation_generation = consolidation_generation + 1,
                    updated_at = ?2
                 WHERE id = ?1",
                params![opportunity_id, format_timestamp(&Utc::now())],
            )?;
            if changed == 0 {
                return Ok(None);
            }
            let generation: i64 = conn.query_row(
                "SELECT consolidation_generation FROM opportunities WHERE id = ?1",
                params![opportunity_id],
                |row| row.get(0),
            )?;
            Ok(Some(generation))
        })
    }

    /// Store consolidated insights. Returns false when the job is stale.
    pub fn complete_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        insights: &ConsolidatedInsights,
        consolidated_at: &DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            "UPDATE opportunities SET
                consolidated_pain_points = ?3,
                consolidated_goals = ?4,
                consolidated_why_and_why_now = ?5,
                consolidated_metrics = ?6,
                risk_assessment = ?7,
                consolidation_status = 'completed',
                consolidation_error = NULL,
                consolidated_at = ?8,
                updated_at = ?8
             WHERE id = ?1 AND consolidation_generation = ?2
               AND consolidation_status = 'processing'",
            params![
                opportunity_id,
                generation,
                encode_list(&insights.pain_points)?,
                encode_list(&insights.goals)?,
                encode_list(&insights.why_and_why_now)?,
                encode_list(&insights.metrics)?,
                insights.risk_assessment,
                format_timestamp(consolidated_at),
            ],
        )?;
        Ok(changed > 0)
    }

    /// Mark consolidation failed. Previously consolidated arrays stay as they were.
    pub fn fail_consolidation(
        &self,
        opportunity_id: &str,
        generation: i64,
        error: &str,
    ) -> Result<bool, DbError> {
        let changed = self.conn().execute(
            "UPDATE opportunities SET
                consolidation_status = 'failed',
                consolidation_error = ?3,
                updated_at = ?4
             WHERE id = ?1 AND consolidation_generation = ?2
               AND consolidation_status = 'processing'",
            params![
                opportunity_id,
                generation,
                error,
                format_timestamp(&Utc::now())
            ],
        )?;
        Ok(changed > 0)
    }

    /// Opportunities left in `processing`, with their generation.
    pub fn list_processing_opportunities(&self) -> Result<Vec<(String, i64)>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, consolidation_generation FROM opportunities
             WHERE consolidation_status = 'processing' ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Opportunities whose stored next call date is at or before `now`.
    pub fn list_elapsed_next_calls(&self, now: &DateTime<Utc>) -> Result<Vec<String>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id FROM opportunities
             WHERE next_call_date IS NOT NULL AND next_call_date <= ?1
             ORDER BY id",
        )?;
        let rows = stmt.query_map(params![format_timestamp(now)], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::super::test_utils::{seed_account, seed_opportunity, seed_org, test_db};
    use super::*;

    fn seeded() -> PipelineDb {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "a1", "Acme", Some("acme.com"));
        seed_opportunity(&db, "a1", "o1", "Acme Renewal");
        db
    }

    #[test]
    fn test_list_elapsed_next_calls() {
        let db = seeded();
        seed_opportunity(&db, "a1", "o2", "Acme Expansion");
        seed_opportunity(&db, "a1", "o3", "Acme Services");
        let now = Utc::now();
        let at = |date| NextCallDate {
            date: Some(date),
            source: Some(MeetingSource::AutoCalendar),
            event_id: Some("e".to_string()),
        };
        db.write_next_call_date("o1", &at(now - Duration::hours(1)), &now, false)
            .unwrap();
        db.write_next_call_date("o2", &at(now + Duration::days(1)), &now, false)
            .unwrap();

        assert_eq!(db.list_elapsed_next_calls(&now).unwrap(), vec!["o1"]);
        assert_eq!(
            db.list_elapsed_next_calls(&(now + Duration::days(2))).unwrap(),
            vec!["o1", "o2"]
        );
    }

    #[test]
    fn test_new_opportunity_defaults() {
        let db = seeded();
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.consolidation_status, ConsolidationStatus::NotStarted);
        assert!(opp.consolidated_goals.is_empty());
        assert!(opp.next_call_date.is_none());
        assert!(!opp.next_call_date_manually_set);
    }

    #[test]
    fn test_write_next_call_date_writes_nulls() {
        let db = seeded();
        let date = Utc::now() + Duration::days(3);
        let value = NextCallDate {
            date: Some(date),
            source: Some(MeetingSource::AutoCalendar),
            event_id: Some("e1".to_string()),
        };
        assert!(db
            .write_next_call_date("o1", &value, &Utc::now(), false)
            .unwrap());
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.next_call_date_source, Some(MeetingSource::AutoCalendar));

        db.write_next_call_date("o1", &NextCallDate::default(), &Utc::now(), false)
            .unwrap();
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert!(opp.next_call_date.is_none());
        assert!(opp.next_call_date_source.is_none());
        assert!(opp.next_call_date_last_calculated.is_some());
    }

    #[test]
    fn test_manual_flag_and_policy() {
        let db = seeded();
        let date = Utc::now() + Duration::days(10);
        assert!(db.set_manual_next_call_date("o1", Some(&date)).unwrap());
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert!(opp.next_call_date_manually_set);
        assert_eq!(opp.next_call_date_source, Some(MeetingSource::Manual));

        assert!(!db
            .write_next_call_date("o1", &NextCallDate::default(), &Utc::now(), true)
            .unwrap());
        assert!(db
            .write_next_call_date("o1", &NextCallDate::default(), &Utc::now(), false)
            .unwrap());
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert!(!opp.next_call_date_manually_set);

        assert!(!db.set_manual_next_call_date("missing", Some(&date)).unwrap());
    }

    #[test]
    fn test_consolidation_generation_guard() {
        let db = seeded();
        let first = db.begin_consolidation("o1").unwrap().unwrap();
        let second = db.begin_consolidation("o1").unwrap().unwrap();
        assert_eq!(second, first + 1);

        let insights = ConsolidatedInsights {
            pain_points: vec!["slow onboarding".to_string()],
            ..Default::default()
        };
        assert!(!db
            .complete_consolidation("o1", first, &insights, &Utc::now())
            .unwrap());
        assert!(db
            .complete_consolidation("o1", second, &insights, &Utc::now())
            .unwrap());
        assert!(db.list_processing_opportunities().unwrap().is_empty());
    }

    #[test]
    fn test_fail_consolidation_keeps_previous_arrays() {
        let db = seeded();
        let g = db.begin_consolidation("o1").unwrap().unwrap();
        let insights = ConsolidatedInsights {
            goals: vec!["expand".to_string()],
            ..Default::default()
        };
        db.complete_consolidation("o1", g, &insights, &Utc::now())
            .unwrap();

        let g = db.begin_consolidation("o1").unwrap().unwrap();
        assert_eq!(db.list_processing_opportunities().unwrap(), vec![("o1".to_string(), g)]);
        assert!(db.fail_consolidation("o1", g, "service down").unwrap());

        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.consolidation_status, ConsolidationStatus::Failed);
        assert_eq!(opp.consolidation_error.as_deref(), Some("service down"));
        assert_eq!(opp.consolidated_goals, vec!["expand"]);
    }
}
