use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::backfill::BackfillEngine;
use crate::calendar_sync::{run_calendar_poller, CalendarSyncEngine};
use crate::db::PipelineDb;
use crate::error::PipelineError;
use crate::google_api::token_store::{FileTokenStore, TokenProviderFactory};
use crate::google_api::ProviderFactory;
use crate::next_call::NextCallResolver;
use crate::processor::{
    ConsolidationProcessor, HttpInsightExtractor, InsightExtractor, TranscriptProcessor,
    UnconfiguredExtractor,
};
use crate::task_queue::{run_worker, JobHandlers, TaskQueue};
use crate::types::Config;

/// Engines and shared handles for one process.
pub struct PipelineState {
    pub config: Config,
    pub db: Arc<PipelineDb>,
    pub next_call: Arc<NextCallResolver>,
    pub calendar: Arc<CalendarSyncEngine>,
    pub backfill: Arc<BackfillEngine>,
    pub transcripts: Arc<TranscriptProcessor>,
    pub consolidation: Arc<ConsolidationProcessor>,
    pub queue: Arc<TaskQueue>,
    /// Signals the calendar poller to run now.
    pub calendar_wake: Arc<Notify>,
}

impl PipelineState {
    /// Wire the engines over one database and the given collaborators.
    pub fn new(
        config: Config,
        db: PipelineDb,
        providers: Arc<dyn ProviderFactory>,
        extractor: Arc<dyn InsightExtractor>,
    ) -> Self {
        let db = Arc::new(db);
        let next_call = Arc::new(NextCallResolver::new(
            db.clone(),
            db.clone(),
            config.next_call.manual_policy,
        ));
        let calendar = Arc::new(
            CalendarSyncEngine::new(
                db.clone(),
                db.clone(),
                db.clone(),
                providers,
                config.calendar.clone(),
            )
            .with_next_call(next_call.clone()),
        );
        let backfill =
            Arc::new(BackfillEngine::new(db.clone(), db.clone()).with_next_call(next_call.clone()));

        let timeout = Duration::from_secs(config.extraction.timeout_secs.max(1));
        let transcripts = Arc::new(
            TranscriptProcessor::new(db.clone(), extractor.clone()).with_timeout(timeout),
        );
        let consolidation = Arc::new(
            ConsolidationProcessor::new(db.clone(), db.clone(), extractor).with_timeout(timeout),
        );

        Self {
            config,
            db,
            next_call,
            calendar,
            backfill,
            transcripts,
            consolidation,
            queue: Arc::new(TaskQueue::new()),
            calendar_wake: Arc::new(Notify::new()),
        }
    }

    /// Production wiring: database from config, Google Calendar through the
    /// file token store, HTTP extraction when an endpoint is configured.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let db = PipelineDb::open(config.db_path.as_deref())?;

        let token_dir = match config.token_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => FileTokenStore::default_dir()
                .ok_or_else(|| PipelineError::Config("home directory not found".to_string()))?,
        };
        let providers = Arc::new(TokenProviderFactory::new(
            FileTokenStore::new(token_dir),
            config.calendar.retry.clone(),
        ));

        let extractor: Arc<dyn InsightExtractor> =
            match HttpInsightExtractor::from_config(&config.extraction) {
                Ok(http) => Arc::new(http),
                Err(e) => {
                    log::warn!("State: transcript parsing disabled: {}", e);
                    Arc::new(UnconfiguredExtractor)
                }
            };

        Ok(Self::new(config, db, providers, extractor))
    }

    pub fn job_handlers(&self) -> Arc<JobHandlers> {
        Arc::new(JobHandlers {
            transcripts: self.transcripts.clone(),
            consolidation: self.consolidation.clone(),
        })
    }

    /// Recover interrupted jobs, then start the queue worker and the
    /// calendar poller. Returns the worker's handle.
    pub fn spawn_background(&self) -> tokio::task::JoinHandle<()> {
        if let Err(e) = self.queue.recover(&*self.db, &*self.db) {
            log::warn!("State: job recovery failed: {}", e);
        }
        tokio::spawn(run_calendar_poller(
            self.calendar.clone(),
            self.calendar_wake.clone(),
        ));
        tokio::spawn(run_worker(
            self.queue.clone(),
            self.job_handlers(),
            self.config.workers.clone(),
        ))
    }
}

/// `~/.dealsync/config.json`
pub fn config_path() -> Result<PathBuf, PipelineError> {
    let home = dirs::home_dir()
        .ok_or_else(|| PipelineError::Config("Could not find home directory".to_string()))?;
    Ok(home.join(".dealsync").join("config.json"))
}

/// Load configuration from `~/.dealsync/config.json`. A missing file means
/// all defaults.
pub fn load_config() -> Result<Config, PipelineError> {
    load_config_from(&config_path()?)
}

pub fn load_config_from(path: &Path) -> Result<Config, PipelineError> {
    if !path.exists() {
        log::info!("State: no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }

    let content = fs::read_to_string(path)
        .map_err(|e| PipelineError::Config(format!("Failed to read config: {}", e)))?;

    let config: Config = serde_json::from_str(&content)
        .map_err(|e| PipelineError::Config(format!("Failed to parse config: {}", e)))?;

    if config.calendar.lookback_days < 0 || config.calendar.lookahead_days < 0 {
        return Err(PipelineError::Config(
            "calendar lookbackDays and lookaheadDays must not be negative".to_string(),
        ));
    }
    if let Some(window) = &config.calendar.window {
        if window.time_min >= window.time_max {
            return Err(PipelineError::Config(
                "calendar window timeMin must be before timeMax".to_string(),
            ));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualDatePolicy;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config.calendar.calendar_id, "primary");
        assert_eq!(config.calendar.lookback_days, 30);
        assert_eq!(config.calendar.lookahead_days, 60);
        assert_eq!(config.workers.max_concurrent_jobs, 4);
        assert_eq!(config.extraction.timeout_secs, 300);
    }

    #[test]
    fn test_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{
                "calendar": {"pageSize": 50, "retry": {"maxAttempts": 5}},
                "nextCall": {"manualPolicy": "respect_manual"}
            }"#,
        )
        .unwrap();

        let config = load_config_from(&path).unwrap();
        assert_eq!(config.calendar.page_size, 50);
        assert_eq!(config.calendar.lookahead_days, 60);
        assert_eq!(config.calendar.retry.max_attempts, 5);
        assert_eq!(config.next_call.manual_policy, ManualDatePolicy::RespectManual);
    }

    #[test]
    fn test_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config_from(&path), Err(PipelineError::Config(_))));

        fs::write(
            &path,
            r#"{"calendar": {"window": {"timeMin": "2026-03-01T00:00:00Z", "timeMax": "2026-02-01T00:00:00Z"}}}"#,
        )
        .unwrap();
        assert!(matches!(load_config_from(&path), Err(PipelineError::Config(_))));
    }
}
