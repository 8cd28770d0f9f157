//! In-process job queue for transcript parsing and consolidation.
//!
//! Triggers persist their state transition, then enqueue a [`Job`] carrying
//! the generation they produced. Jobs are deduplicated by kind, ID and
//! generation. Workers drain the queue under a semaphore so at most
//! `max_concurrent_jobs` extraction calls are in flight. Handlers are
//! idempotent: a job whose generation is no longer current does nothing,
//! which lets startup recovery re-enqueue freely.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::error::PipelineError;
use crate::processor::{ConsolidationProcessor, JobOutcome, TranscriptProcessor};
use crate::repository::{CallRepository, OpportunityRepository};
use crate::types::{CallRef, WorkerConfig};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Job {
    ParseTranscript { call: CallRef, generation: i64 },
    Consolidate { opportunity_id: String, generation: i64 },
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Job::ParseTranscript { call, generation } => write!(f, "parse {}#{}", call, generation),
            Job::Consolidate {
                opportunity_id,
                generation,
            } => write!(f, "consolidate {}#{}", opportunity_id, generation),
        }
    }
}

pub struct TaskQueue {
    queue: Mutex<VecDeque<Job>>,
    queued: Mutex<HashSet<Job>>,
    notify: Notify,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            queued: Mutex::new(HashSet::new()),
            notify: Notify::new(),
        }
    }

    /// Returns false when the same job is already waiting.
    pub fn enqueue(&self, job: Job) -> bool {
        {
            let mut queued = self.queued.lock();
            if !queued.insert(job.clone()) {
                log::debug!("TaskQueue: {} already queued", job);
                return false;
            }
            self.queue.lock().push_back(job.clone());
        }
        log::debug!("TaskQueue: enqueued {}", job);
        self.notify.notify_one();
        true
    }

    pub fn dequeue(&self) -> Option<Job> {
        let mut queued = self.queued.lock();
        let job = self.queue.lock().pop_front()?;
        queued.remove(&job);
        Some(job)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-enqueue work interrupted by a restart. Returns how many jobs were added.
    pub fn recover(
        &self,
        calls: &dyn CallRepository,
        opportunities: &dyn OpportunityRepository,
    ) -> Result<usize, PipelineError> {
        let mut added = 0;
        for (call, generation) in calls.list_parsing_calls()? {
            if self.enqueue(Job::ParseTranscript { call, generation }) {
                added += 1;
            }
        }
        for (opportunity_id, generation) in opportunities.list_processing_opportunities()? {
            if self.enqueue(Job::Consolidate {
                opportunity_id,
                generation,
            }) {
                added += 1;
            }
        }
        if added > 0 {
            log::info!("TaskQueue: recovered {} interrupted jobs", added);
        }
        Ok(added)
    }
}

/// Dispatches jobs to their processors.
pub struct JobHandlers {
    pub transcripts: Arc<TranscriptProcessor>,
    pub consolidation: Arc<ConsolidationProcessor>,
}

impl JobHandlers {
    pub async fn run(&self, job: &Job) -> Result<JobOutcome, PipelineError> {
        match job {
            Job::ParseTranscript { call, generation } => {
                self.transcripts.handle(call, *generation).await
            }
            Job::Consolidate {
                opportunity_id,
                generation,
            } => self.consolidation.handle(opportunity_id, *generation).await,
        }
    }
}

/// Drain the queue forever. Wakes on enqueue, or every
/// `poll_interval_secs` as a fallback.
pub async fn run_worker(queue: Arc<TaskQueue>, handlers: Arc<JobHandlers>, config: WorkerConfig) {
    let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
    let poll = Duration::from_secs(config.poll_interval_secs.max(1));
    log::info!(
        "TaskQueue: worker started ({} concurrent jobs)",
        config.max_concurrent_jobs.max(1)
    );

    loop {
        while !queue.is_empty() {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                log::error!("TaskQueue: semaphore closed, worker stopping");
                return;
            };
            let Some(job) = queue.dequeue() else {
                break;
            };
            let handlers = handlers.clone();
            tokio::spawn(async move {
                run_job(&handlers, &job).await;
                drop(permit);
            });
        }

        tokio::select! {
            _ = queue.notify.notified() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
}

async fn run_job(handlers: &JobHandlers, job: &Job) {
    match handlers.run(job).await {
        Ok(JobOutcome::Completed) => log::debug!("TaskQueue: {} completed", job),
        Ok(JobOutcome::Failed(reason)) => log::debug!("TaskQueue: {} failed: {}", job, reason),
        Ok(JobOutcome::Stale) => log::debug!("TaskQueue: {} was stale", job),
        // The row stays in its in-flight state and is picked up by the next
        // startup recovery.
        Err(e) => log::warn!("TaskQueue: {} errored: {}", job, e),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::db::test_utils::{seed_account, seed_opportunity, seed_org, test_db};
    use crate::db::PipelineDb;
    use crate::processor::test_support::FakeExtractor;
    use crate::types::{CallKind, ExtractedInsights, ParsingStatus};

    fn parse_job(id: &str, generation: i64) -> Job {
        Job::ParseTranscript {
            call: CallRef::new(CallKind::CallRecording, id),
            generation,
        }
    }

    #[test]
    fn test_dedup_by_generation() {
        let queue = TaskQueue::new();
        assert!(queue.enqueue(parse_job("c1", 1)));
        assert!(!queue.enqueue(parse_job("c1", 1)));
        assert!(queue.enqueue(parse_job("c1", 2)));
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.dequeue(), Some(parse_job("c1", 1)));
        // Once dequeued, the same job may be queued again.
        assert!(queue.enqueue(parse_job("c1", 1)));
    }

    #[test]
    fn test_fifo_order() {
        let queue = TaskQueue::new();
        queue.enqueue(parse_job("c1", 1));
        queue.enqueue(Job::Consolidate {
            opportunity_id: "deal".to_string(),
            generation: 1,
        });
        assert_eq!(queue.dequeue(), Some(parse_job("c1", 1)));
        assert!(matches!(queue.dequeue(), Some(Job::Consolidate { .. })));
        assert!(queue.dequeue().is_none());
    }

    fn seeded() -> Arc<PipelineDb> {
        let db = test_db();
        seed_org(&db, "org1", "seller.io", "u1");
        seed_account(&db, "org1", "acme", "Acme", Some("acme.com"));
        seed_opportunity(&db, "acme", "deal", "Acme Platform");
        Arc::new(db)
    }

    #[test]
    fn test_recover_interrupted_work() {
        let db = seeded();
        let call = db
            .insert_call(CallKind::MeetingNote, Some("deal"), "Notes", None)
            .unwrap();
        db.begin_parse(&call, "text").unwrap();
        db.begin_parse(&call, "text v2").unwrap();
        db.begin_consolidation("deal").unwrap();

        let queue = TaskQueue::new();
        assert_eq!(queue.recover(&*db, &*db).unwrap(), 2);
        assert_eq!(
            queue.dequeue(),
            Some(Job::ParseTranscript {
                call: call.clone(),
                generation: 2
            })
        );
        // Recovering again while jobs are queued adds nothing.
        assert_eq!(queue.recover(&*db, &*db).unwrap(), 1);
        assert_eq!(queue.recover(&*db, &*db).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_processes_enqueued_job() {
        let db = seeded();
        let extractor = Arc::new(FakeExtractor::returning(ExtractedInsights {
            goals: vec!["consolidate vendors".to_string()],
            ..Default::default()
        }));
        let transcripts = Arc::new(TranscriptProcessor::new(db.clone(), extractor.clone()));
        let handlers = Arc::new(JobHandlers {
            transcripts: transcripts.clone(),
            consolidation: Arc::new(ConsolidationProcessor::new(
                db.clone(),
                db.clone(),
                extractor,
            )),
        });
        let queue = Arc::new(TaskQueue::new());
        let worker = tokio::spawn(run_worker(
            queue.clone(),
            handlers,
            WorkerConfig::default(),
        ));

        let call = db
            .insert_call(CallKind::CallRecording, Some("deal"), "Discovery", Some(&Utc::now()))
            .unwrap();
        let accepted = transcripts.submit(&call, "We want fewer vendors.").unwrap();
        queue.enqueue(Job::ParseTranscript {
            call: call.clone(),
            generation: accepted.generation,
        });

        let mut status = ParsingStatus::Parsing;
        for _ in 0..100 {
            status = db.get_call(&call).unwrap().unwrap().parsing_status;
            if status != ParsingStatus::Parsing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.abort();
        assert_eq!(status, ParsingStatus::Completed);
    }
}
