//! Incremental calendar synchronization.
//!
//! One run per (user, provider): stamp the checkpoint `in_progress`, walk the
//! provider's pages, normalize and link every event, and upsert it on its
//! own. A stored sync token makes the walk incremental; without one (or once
//! the provider rejects it) the whole window is fetched and synced rows the
//! provider no longer lists are dropped. Nothing is held across pages, so a
//! crash mid-run leaves a valid partial state that the next run repairs
//! idempotently. The checkpoint is written once at the end, with the
//! provider's sync token on success and with the previous cursor untouched
//! on failure.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::db::{DbSyncState, DbUser, EventUpsert, SyncStateUpdate};
use crate::domain::is_external;
use crate::error::PipelineError;
use crate::google_api::calendar::parse_event_datetime;
use crate::google_api::{
    CalendarProvider, EventQuery, ProviderError, ProviderEvent, ProviderFactory,
};
use crate::matcher::DomainIndex;
use crate::next_call::NextCallResolver;
use crate::repository::{AccountRepository, EventRepository, SyncStateRepository};
use crate::types::{CalendarConfig, SyncStatus, SyncSummary, SyncWindow};

const UNTITLED: &str = "(No title)";

pub struct CalendarSyncEngine {
    accounts: Arc<dyn AccountRepository>,
    events: Arc<dyn EventRepository>,
    sync_state: Arc<dyn SyncStateRepository>,
    providers: Arc<dyn ProviderFactory>,
    next_call: Option<Arc<NextCallResolver>>,
    config: CalendarConfig,
}

/// Counters carried through one run.
struct RunProgress {
    summary: SyncSummary,
    cursor: Option<String>,
    /// Window of the last full fetch; what the stored cursor covers.
    window: SyncWindow,
    seen: HashSet<String>,
    touched: BTreeSet<String>,
}

impl RunProgress {
    fn new(window: SyncWindow) -> Self {
        Self {
            summary: SyncSummary::default(),
            cursor: None,
            window,
            seen: HashSet::new(),
            touched: BTreeSet::new(),
        }
    }
}

/// Where a run starts from.
enum RunStart {
    Full,
    Resume { cursor: String, covered: SyncWindow },
}

impl CalendarSyncEngine {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        events: Arc<dyn EventRepository>,
        sync_state: Arc<dyn SyncStateRepository>,
        providers: Arc<dyn ProviderFactory>,
        config: CalendarConfig,
    ) -> Self {
        Self {
            accounts,
            events,
            sync_state,
            providers,
            next_call: None,
            config,
        }
    }

    pub fn with_next_call(mut self, resolver: Arc<NextCallResolver>) -> Self {
        self.next_call = Some(resolver);
        self
    }

    pub fn user_ids(&self) -> Result<Vec<String>, PipelineError> {
        Ok(self.accounts.list_user_ids()?)
    }

    /// Synchronize one user's calendar.
    ///
    /// Auth and transport failures abort the run with `last_status = error`
    /// and the stored cursor/window unchanged. Per-event problems are
    /// collected in the summary instead.
    pub async fn sync(&self, user_id: &str) -> Result<SyncSummary, PipelineError> {
        let user = self
            .accounts
            .get_user(user_id)?
            .ok_or_else(|| PipelineError::not_found("user", user_id))?;
        let provider_key = self.providers.name().to_string();

        let previous = self.sync_state.get_sync_state(user_id, &provider_key)?;
        self.sync_state.mark_sync_started(user_id, &provider_key)?;
        let window = self.config.resolve_window(Utc::now());
        let start = self.run_start(previous.as_ref(), &window);

        match self.run(&user, &window, start).await {
            Ok(progress) => {
                self.sync_state.finish_sync(
                    user_id,
                    &provider_key,
                    &SyncStateUpdate {
                        status: SyncStatus::Success,
                        cursor: progress.cursor.clone(),
                        window_min: Some(progress.window.time_min),
                        window_max: Some(progress.window.time_max),
                        error: None,
                        created: progress.summary.created as i64,
                        updated: progress.summary.updated as i64,
                    },
                )?;

                if let Some(resolver) = &self.next_call {
                    resolver.recalculate_many(&progress.touched);
                }

                log::info!(
                    "CalendarSync: user {} created={} updated={} removed={} matched={} errors={}",
                    user_id,
                    progress.summary.created,
                    progress.summary.updated,
                    progress.summary.removed,
                    progress.summary.matched,
                    progress.summary.errors.len()
                );
                Ok(progress.summary)
            }
            Err(e) => {
                log::warn!("CalendarSync: run for user {} aborted: {}", user_id, e);
                let recorded = self.sync_state.finish_sync(
                    user_id,
                    &provider_key,
                    &SyncStateUpdate {
                        status: SyncStatus::Error,
                        cursor: None,
                        window_min: None,
                        window_max: None,
                        error: Some(e.to_string()),
                        created: 0,
                        updated: 0,
                    },
                );
                if let Err(db_err) = recorded {
                    log::warn!("CalendarSync: could not record failure for {}: {}", user_id, db_err);
                }
                Err(e)
            }
        }
    }

    /// Recalculate next call dates that point at meetings already over.
    pub fn refresh_elapsed_next_calls(&self) -> usize {
        let Some(resolver) = &self.next_call else {
            return 0;
        };
        resolver.refresh_elapsed().unwrap_or_else(|e| {
            log::warn!("CalendarSync: elapsed next call refresh failed: {}", e);
            0
        })
    }

    /// Resume from the stored cursor while the window it covers still lines
    /// up with this run's window (within `full_refresh_hours`).
    fn run_start(&self, previous: Option<&DbSyncState>, window: &SyncWindow) -> RunStart {
        let Some(state) = previous else {
            return RunStart::Full;
        };
        let (Some(cursor), Some(time_min), Some(time_max)) =
            (state.cursor.clone(), state.window_min, state.window_max)
        else {
            return RunStart::Full;
        };
        if self.config.full_refresh_hours <= 0 {
            return RunStart::Full;
        }

        let tolerance = chrono::Duration::hours(self.config.full_refresh_hours);
        let drift = |a: DateTime<Utc>, b: DateTime<Utc>| (a - b).abs() > tolerance;
        if drift(window.time_min, time_min) || drift(window.time_max, time_max) {
            log::debug!("CalendarSync: window moved, full refresh for {}", state.user_id);
            return RunStart::Full;
        }
        RunStart::Resume {
            cursor,
            covered: SyncWindow { time_min, time_max },
        }
    }

    async fn run(
        &self,
        user: &DbUser,
        window: &SyncWindow,
        start: RunStart,
    ) -> Result<RunProgress, PipelineError> {
        let provider = self.providers.for_user(&user.id).await?;
        let index = DomainIndex::build(
            self.accounts
                .get_accounts_with_opportunities(&user.organization_id)?,
        );
        log::debug!(
            "CalendarSync: {} indexed domains for org {}",
            index.len(),
            user.organization_id
        );

        if let RunStart::Resume { cursor, covered } = start {
            let mut progress = RunProgress::new(covered);
            match self
                .walk(provider.as_ref(), user, &index, window, Some(&cursor), &mut progress)
                .await
            {
                Ok(_) => return Ok(progress),
                Err(PipelineError::Provider(ProviderError::SyncTokenExpired)) => {
                    log::info!(
                        "CalendarSync: sync token for {} expired, refetching window",
                        user.id
                    );
                    // Counters and touched opportunities from the partial walk stay.
                    progress.window = window.clone();
                    progress.cursor = None;
                    progress.seen.clear();
                    self.full_walk(provider.as_ref(), user, &index, window, &mut progress)
                        .await?;
                    return Ok(progress);
                }
                Err(e) => return Err(e),
            }
        }

        let mut progress = RunProgress::new(window.clone());
        self.full_walk(provider.as_ref(), user, &index, window, &mut progress)
            .await?;
        Ok(progress)
    }

    /// Walk the whole window, then drop synced rows the provider no longer
    /// lists. Pruning only happens after a complete walk.
    async fn full_walk(
        &self,
        provider: &dyn CalendarProvider,
        user: &DbUser,
        index: &DomainIndex,
        window: &SyncWindow,
        progress: &mut RunProgress,
    ) -> Result<(), PipelineError> {
        if !self.walk(provider, user, index, window, None, progress).await? {
            return Ok(());
        }
        match self.events.remove_unseen_synced_events(
            &user.id,
            &window.time_min,
            &window.time_max,
            &progress.seen,
        ) {
            Ok(removed) => {
                for row in removed {
                    log::debug!("CalendarSync: {} no longer listed, removed", row.external_id);
                    progress.summary.removed += 1;
                    progress.touched.extend(row.opportunity_id);
                }
            }
            Err(e) => {
                log::warn!("CalendarSync: pruning for {} failed: {}", user.id, e);
                progress.summary.errors.push(format!("prune: {}", e));
            }
        }
        Ok(())
    }

    /// Follow page tokens to the end. Returns false when the provider
    /// repeated a page token and the walk stopped early.
    async fn walk(
        &self,
        provider: &dyn CalendarProvider,
        user: &DbUser,
        index: &DomainIndex,
        window: &SyncWindow,
        sync_token: Option<&str>,
        progress: &mut RunProgress,
    ) -> Result<bool, PipelineError> {
        let mut page_token: Option<String> = None;
        loop {
            let query = EventQuery {
                calendar_id: self.config.calendar_id.clone(),
                time_min: window.time_min,
                time_max: window.time_max,
                sync_token: sync_token.map(str::to_string),
                page_token: page_token.clone(),
                page_size: self.config.page_size,
            };
            let page = provider.list_events(&query).await?;

            for event in &page.events {
                self.apply_event(user, index, event, progress);
            }

            match page.next_page_token {
                Some(next) if Some(&next) == page_token.as_ref() => {
                    progress
                        .summary
                        .errors
                        .push(format!("provider repeated page token {}", next));
                    return Ok(false);
                }
                Some(next) => page_token = Some(next),
                None => {
                    progress.cursor = page.next_sync_token;
                    return Ok(true);
                }
            }
        }
    }

    fn apply_event(
        &self,
        user: &DbUser,
        index: &DomainIndex,
        event: &ProviderEvent,
        progress: &mut RunProgress,
    ) {
        if !event.id.trim().is_empty() {
            progress.seen.insert(event.id.clone());
        }
        if event.cancelled {
            self.remove_cancelled(user, event, progress);
            return;
        }
        let upsert = match normalize(user, index, event) {
            Ok(upsert) => upsert,
            Err(message) => {
                progress.summary.errors.push(message);
                return;
            }
        };

        match self.events.upsert_synced_event(&upsert) {
            Ok(outcome) if outcome.skipped => {
                log::debug!("CalendarSync: {} is user-owned, left alone", upsert.external_id);
            }
            Ok(outcome) => {
                if outcome.created {
                    progress.summary.created += 1;
                } else {
                    progress.summary.updated += 1;
                }
                if outcome.account_id.is_some() {
                    progress.summary.matched += 1;
                }

                let relinked = outcome.previous_opportunity_id != outcome.opportunity_id;
                let retimed = outcome.previous_start_time.map(|t| t.timestamp())
                    != Some(upsert.start_time.timestamp());
                if outcome.created || relinked || retimed {
                    progress.touched.extend(outcome.previous_opportunity_id);
                    progress.touched.extend(outcome.opportunity_id);
                }
            }
            Err(e) => {
                log::warn!("CalendarSync: upsert failed for {}: {}", upsert.external_id, e);
                progress
                    .summary
                    .errors
                    .push(format!("{}: {}", upsert.external_id, e));
            }
        }
    }

    fn remove_cancelled(&self, user: &DbUser, event: &ProviderEvent, progress: &mut RunProgress) {
        if event.id.trim().is_empty() {
            return;
        }
        match self.events.remove_synced_event(&user.id, &event.id) {
            Ok(Some(removed)) => {
                log::debug!("CalendarSync: {} cancelled, removed", event.id);
                progress.summary.removed += 1;
                progress.touched.extend(removed.opportunity_id);
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("CalendarSync: removing {} failed: {}", event.id, e);
                progress.summary.errors.push(format!("{}: {}", event.id, e));
            }
        }
    }
}

/// Turn a provider event into an upsert, or a per-event error message.
fn normalize(user: &DbUser, index: &DomainIndex, event: &ProviderEvent) -> Result<EventUpsert, String> {
    if event.id.trim().is_empty() {
        return Err("event without id skipped".to_string());
    }
    let start = event
        .start
        .as_deref()
        .and_then(parse_event_datetime)
        .ok_or_else(|| format!("{}: unparseable start time", event.id))?;
    let end: DateTime<Utc> = event
        .end
        .as_deref()
        .and_then(parse_event_datetime)
        .filter(|end| *end >= start)
        .unwrap_or(start);

    let title = event
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(UNTITLED)
        .to_string();
    let external = is_external(
        &event.attendees,
        &user.email,
        user.organization_domain.as_deref(),
    );
    let links = index.resolve(&event.attendees, &user.email, &title);

    Ok(EventUpsert {
        external_id: event.id.clone(),
        user_id: user.id.clone(),
        title,
        start_time: start,
        end_time: end,
        attendees: event.attendees.clone(),
        organizer: event.organizer.clone(),
        is_external: external,
        conference_link: event.conference_link.clone(),
        account_id: links.as_ref().map(|m| m.account_id.clone()),
        opportunity_id: links.and_then(|m| m.opportunity_id),
    })
}

/// Background poller: sync every user each `poll_interval_minutes`, or
/// immediately when woken, then refresh next call dates that have passed.
pub async fn run_calendar_poller(engine: Arc<CalendarSyncEngine>, wake: Arc<Notify>) {
    tokio::time::sleep(Duration::from_secs(10)).await;

    loop {
        match engine.user_ids() {
            Ok(users) => {
                for user_id in users {
                    if let Err(e) = engine.sync(&user_id).await {
                        if e.is_retryable() {
                            log::info!("CalendarSync: {} will retry next run: {}", user_id, e);
                        } else {
                            log::warn!("CalendarSync: {} failed: {}", user_id, e);
                        }
                    }
                }
            }
            Err(e) => log::warn!("CalendarSync: could not list users: {}", e),
        }
        engine.refresh_elapsed_next_calls();

        let minutes = engine.config.poll_interval_minutes.max(1);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(minutes * 60)) => {},
            _ = wake.notified() => {
                log::info!("CalendarSync: poller woken by manual sync signal");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use parking_lot::Mutex;

    use super::*;
    use crate::db::test_utils::{seed_account, seed_opportunity, seed_org, test_db};
    use crate::db::PipelineDb;
    use crate::google_api::{EventPage, ProviderError};
    use crate::types::{ManualDatePolicy, MeetingSource, NextCallDate};

    /// Serves window fetches from `pages` and token fetches from `delta`,
    /// each keyed by page token. Fails the next call when `fail` is set.
    struct FakeProvider {
        pages: Mutex<Vec<EventPage>>,
        delta: Mutex<Vec<EventPage>>,
        reject_sync_token: Mutex<bool>,
        fail: Mutex<Option<ProviderError>>,
        queries: Mutex<Vec<EventQuery>>,
    }

    #[async_trait]
    impl CalendarProvider for FakeProvider {
        async fn list_events(&self, query: &EventQuery) -> Result<EventPage, ProviderError> {
            self.queries.lock().push(query.clone());
            if let Some(err) = self.fail.lock().take() {
                return Err(err);
            }
            let idx = query
                .page_token
                .as_deref()
                .and_then(|t| t.strip_prefix("page-"))
                .and_then(|n| n.parse::<usize>().ok())
                .unwrap_or(0);
            if query.sync_token.is_some() {
                if *self.reject_sync_token.lock() {
                    return Err(ProviderError::SyncTokenExpired);
                }
                return Ok(self.delta.lock().get(idx).cloned().unwrap_or_default());
            }
            Ok(self.pages.lock().get(idx).cloned().unwrap_or_default())
        }
    }

    struct FakeFactory(Arc<FakeProvider>);

    #[async_trait]
    impl ProviderFactory for FakeFactory {
        fn name(&self) -> &str {
            "fake"
        }

        async fn for_user(&self, _user_id: &str) -> Result<Arc<dyn CalendarProvider>, ProviderError> {
            Ok(self.0.clone())
        }
    }

    fn event(id: &str, title: &str, attendees: &[&str], days_ahead: i64) -> ProviderEvent {
        let start = Utc::now() + ChronoDuration::days(days_ahead);
        ProviderEvent {
            id: id.to_string(),
            title: Some(title.to_string()),
            start: Some(start.to_rfc3339()),
            end: Some((start + ChronoDuration::minutes(30)).to_rfc3339()),
            attendees: attendees.iter().map(|s| s.to_string()).collect(),
            organizer: Some("me@seller.io".to_string()),
            conference_link: None,
            cancelled: false,
        }
    }

    fn two_pages() -> Vec<EventPage> {
        vec![
            EventPage {
                events: vec![
                    event("e1", "Acme renewal", &["me@seller.io", "jane@acme.com"], 3),
                    event("e2", "Team standup", &["me@seller.io", "bob@seller.io"], 1),
                ],
                next_page_token: Some("page-1".to_string()),
                next_sync_token: None,
            },
            EventPage {
                events: vec![
                    ProviderEvent {
                        id: "broken".to_string(),
                        start: Some("not a date".to_string()),
                        ..Default::default()
                    },
                    ProviderEvent {
                        id: "gone".to_string(),
                        cancelled: true,
                        ..Default::default()
                    },
                ],
                next_page_token: None,
                next_sync_token: Some("sync-1".to_string()),
            },
        ]
    }

    fn setup(pages: Vec<EventPage>) -> (Arc<PipelineDb>, Arc<FakeProvider>, CalendarSyncEngine) {
        setup_with(pages, CalendarConfig::default())
    }

    fn setup_with(
        pages: Vec<EventPage>,
        config: CalendarConfig,
    ) -> (Arc<PipelineDb>, Arc<FakeProvider>, CalendarSyncEngine) {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "a1", "Acme", Some("https://www.acme.com"));
        seed_opportunity(&db, "a1", "o1", "Acme Renewal");
        let db = Arc::new(db);
        let provider = Arc::new(FakeProvider {
            pages: Mutex::new(pages),
            delta: Mutex::new(Vec::new()),
            reject_sync_token: Mutex::new(false),
            fail: Mutex::new(None),
            queries: Mutex::new(Vec::new()),
        });
        let resolver = Arc::new(NextCallResolver::new(
            db.clone(),
            db.clone(),
            ManualDatePolicy::Overwrite,
        ));
        let engine = CalendarSyncEngine::new(
            db.clone(),
            db.clone(),
            db.clone(),
            Arc::new(FakeFactory(provider.clone())),
            config,
        )
        .with_next_call(resolver);
        (db, provider, engine)
    }

    fn window_only() -> CalendarConfig {
        CalendarConfig {
            full_refresh_hours: 0,
            ..CalendarConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sync_links_and_checkpoints() {
        let (db, provider, engine) = setup(two_pages());
        let summary = engine.sync("u1").await.unwrap();

        assert_eq!(summary.created, 2);
        assert_eq!(summary.updated, 0);
        assert_eq!(summary.matched, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(provider.queries.lock().len(), 2);
        assert_eq!(provider.queries.lock()[0].page_size, 250);

        let acme = db.get_event_by_external_id("u1", "e1").unwrap().unwrap();
        assert_eq!(acme.account_id.as_deref(), Some("a1"));
        assert_eq!(acme.opportunity_id.as_deref(), Some("o1"));
        assert!(acme.is_external);
        let internal = db.get_event_by_external_id("u1", "e2").unwrap().unwrap();
        assert!(!internal.is_external);
        assert!(internal.account_id.is_none());

        let state = db.get_sync_state("u1", "fake").unwrap().unwrap();
        assert_eq!(state.last_status, Some(SyncStatus::Success));
        assert_eq!(state.cursor.as_deref(), Some("sync-1"));
        assert_eq!(state.last_created, 2);

        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.next_call_date_source, Some(MeetingSource::AutoCalendar));
    }

    #[tokio::test]
    async fn test_resync_updates_instead_of_duplicating() {
        let (db, _provider, engine) = setup_with(two_pages(), window_only());
        engine.sync("u1").await.unwrap();
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 2);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM calendar_events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_second_run_resumes_from_cursor() {
        let (db, provider, engine) = setup(two_pages());
        engine.sync("u1").await.unwrap();
        let first = db.get_sync_state("u1", "fake").unwrap().unwrap();

        *provider.delta.lock() = vec![EventPage {
            events: vec![event("e3", "Acme pricing", &["me@seller.io", "jane@acme.com"], 2)],
            next_page_token: None,
            next_sync_token: Some("sync-2".to_string()),
        }];
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.updated, 0);

        let queries = provider.queries.lock();
        assert_eq!(queries.len(), 3);
        assert!(queries[0].sync_token.is_none());
        assert_eq!(queries[2].sync_token.as_deref(), Some("sync-1"));
        drop(queries);

        let state = db.get_sync_state("u1", "fake").unwrap().unwrap();
        assert_eq!(state.cursor.as_deref(), Some("sync-2"));
        assert_eq!(state.window_min, first.window_min);
        assert_eq!(state.window_max, first.window_max);

        // e3 is sooner than e1, so it becomes the next call.
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.next_call_date_event_id.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn test_expired_sync_token_falls_back_to_window() {
        let (db, provider, engine) = setup(two_pages());
        engine.sync("u1").await.unwrap();

        *provider.reject_sync_token.lock() = true;
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.created, 0);
        assert_eq!(summary.updated, 2);

        let queries = provider.queries.lock();
        assert_eq!(queries.len(), 5);
        assert_eq!(queries[2].sync_token.as_deref(), Some("sync-1"));
        assert!(queries[3].sync_token.is_none());
        assert!(queries[3].page_token.is_none());
        drop(queries);

        let state = db.get_sync_state("u1", "fake").unwrap().unwrap();
        assert_eq!(state.last_status, Some(SyncStatus::Success));
        assert_eq!(state.cursor.as_deref(), Some("sync-1"));
    }

    #[tokio::test]
    async fn test_cancelled_meeting_clears_next_call() {
        let (db, provider, engine) = setup(two_pages());
        engine.sync("u1").await.unwrap();
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.next_call_date_event_id.as_deref(), Some("e1"));

        *provider.delta.lock() = vec![EventPage {
            events: vec![ProviderEvent {
                id: "e1".to_string(),
                cancelled: true,
                ..Default::default()
            }],
            next_page_token: None,
            next_sync_token: Some("sync-2".to_string()),
        }];
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.removed, 1);

        assert!(db.get_event_by_external_id("u1", "e1").unwrap().is_none());
        assert!(db.get_event_by_external_id("u1", "e2").unwrap().is_some());
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert!(opp.next_call_date.is_none());
        assert!(opp.next_call_date_event_id.is_none());
    }

    #[tokio::test]
    async fn test_meeting_missing_from_window_is_removed() {
        let (db, provider, engine) = setup_with(two_pages(), window_only());
        engine.sync("u1").await.unwrap();

        *provider.pages.lock() = vec![EventPage {
            events: vec![event("e2", "Team standup", &["me@seller.io", "bob@seller.io"], 1)],
            next_page_token: None,
            next_sync_token: Some("sync-2".to_string()),
        }];
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.updated, 1);

        assert!(db.get_event_by_external_id("u1", "e1").unwrap().is_none());
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert!(opp.next_call_date.is_none());
    }

    #[tokio::test]
    async fn test_repeated_page_token_skips_pruning() {
        let (db, provider, engine) = setup_with(two_pages(), window_only());
        engine.sync("u1").await.unwrap();

        *provider.pages.lock() = vec![
            EventPage {
                events: vec![event("e2", "Team standup", &["me@seller.io"], 1)],
                next_page_token: Some("page-1".to_string()),
                next_sync_token: None,
            },
            EventPage {
                events: Vec::new(),
                next_page_token: Some("page-1".to_string()),
                next_sync_token: None,
            },
        ];
        let summary = engine.sync("u1").await.unwrap();
        assert_eq!(summary.removed, 0);
        assert!(db.get_event_by_external_id("u1", "e1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_elapsed_next_calls() {
        let (db, _provider, engine) = setup(two_pages());
        engine.sync("u1").await.unwrap();

        let now = Utc::now();
        let passed = NextCallDate {
            date: Some(now - ChronoDuration::hours(2)),
            source: Some(MeetingSource::AutoCalendar),
            event_id: Some("old".to_string()),
        };
        db.write_next_call_date("o1", &passed, &now, false).unwrap();

        assert_eq!(engine.refresh_elapsed_next_calls(), 1);
        let opp = db.get_opportunity("o1").unwrap().unwrap();
        assert_eq!(opp.next_call_date_event_id.as_deref(), Some("e1"));
        assert!(opp.next_call_date.unwrap() > now);
        assert_eq!(engine.refresh_elapsed_next_calls(), 0);
    }

    #[tokio::test]
    async fn test_auth_failure_keeps_cursor() {
        let (db, provider, engine) = setup(two_pages());
        engine.sync("u1").await.unwrap();

        *provider.fail.lock() = Some(ProviderError::AuthExpired);
        let err = engine.sync("u1").await.unwrap_err();
        assert!(err.requires_user_action());

        let state = db.get_sync_state("u1", "fake").unwrap().unwrap();
        assert_eq!(state.last_status, Some(SyncStatus::Error));
        assert_eq!(state.cursor.as_deref(), Some("sync-1"));
        assert!(state.last_error.unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_unknown_user_writes_nothing() {
        let (db, _provider, engine) = setup(two_pages());
        assert!(matches!(
            engine.sync("ghost").await,
            Err(PipelineError::NotFound { .. })
        ));
        assert!(db.get_sync_state("ghost", "fake").unwrap().is_none());
    }

    #[test]
    fn test_normalize_defaults() {
        let user = DbUser {
            id: "u1".to_string(),
            organization_id: "org1".to_string(),
            email: "me@seller.io".to_string(),
            organization_domain: Some("seller.io".to_string()),
        };
        let index = DomainIndex::build(Vec::new());
        let raw = ProviderEvent {
            id: "e1".to_string(),
            title: Some("  ".to_string()),
            start: Some("2026-05-01".to_string()),
            end: None,
            ..Default::default()
        };
        let upsert = normalize(&user, &index, &raw).unwrap();
        assert_eq!(upsert.title, UNTITLED);
        assert_eq!(upsert.end_time, upsert.start_time);
        assert!(!upsert.is_external);

        let missing_id = ProviderEvent::default();
        assert!(normalize(&user, &index, &missing_id).is_err());
    }
}
