//! # Background Enhancement
//!
//! Everything a vote triggers that the voter does not wait for.
//!
//! ## Flow
//! 1. The submission pipeline hands a job to [`EnhancementQueue::enqueue`], which never blocks
//! 2. A fixed pool of workers pulls jobs off a bounded channel
//! 3. Each job re-derives the voter's XP award from the ledger, folds the day into
//!    their streak, bumps aggregate counters and signals milestones
//!
//! ## Failure
//! - Nothing here reaches a caller, the HTTP response went out already
//! - Storage hiccups are retried a few times with a fixed backoff, then the job is logged and dropped
//! - A full channel drops the job at enqueue time, the vote itself is already durable
//!
//! ## Replays
//! Processing the same job twice is harmless. XP awards are idempotent per
//! (voter, question), streaks ignore same-day activity and counters are only
//! bumped by the first run to mark the vote as processed.
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc},
    task::JoinHandle,
    time::sleep,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    database::Store,
    error::AppError,
    milestones::{Milestone, MilestoneSink, is_milestone},
    models::{Streak, XpAward},
    stats::{MILESTONES_REACHED, StatsCache, TOTAL_VOTES, TOTAL_XP, UNIQUE_VOTERS, daily_key, question_key},
    xp::XpLedger,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnhancementJob {
    pub vote_id: Uuid,
    pub voter_identity_id: Uuid,
    pub question_id: String,
    pub is_new_voter: bool,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    Processed { award: XpAward, streak: Streak },
    Replayed { award: XpAward },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("enhancement queue is full")]
    Full,

    #[error("enhancement queue is shut down")]
    Closed,
}

#[derive(Clone, Copy, Debug)]
pub struct QueueConfig {
    pub capacity: usize,
    pub workers: usize,
    pub max_attempts: u32,
    pub retry: Duration,
}

impl From<&Config> for QueueConfig {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.queue_capacity.max(1),
            workers: config.queue_workers.max(1),
            max_attempts: config.job_max_attempts.max(1),
            retry: config.job_retry,
        }
    }
}

pub struct EnhancementProcessor {
    store: Arc<dyn Store>,
    ledger: Arc<XpLedger>,
    stats: Arc<StatsCache>,
    milestones: Arc<dyn MilestoneSink>,
}

impl EnhancementProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        ledger: Arc<XpLedger>,
        stats: Arc<StatsCache>,
        milestones: Arc<dyn MilestoneSink>,
    ) -> Self {
        Self {
            store,
            ledger,
            stats,
            milestones,
        }
    }

    pub async fn process(&self, job: &EnhancementJob) -> Result<JobOutcome, AppError> {
        let award = self
            .ledger
            .record_and_total(job.voter_identity_id, &job.question_id)
            .await?;

        let day = job.submitted_at.date_naive();
        let streak = self.store.record_activity(job.voter_identity_id, day).await?;

        if !self.store.mark_job_processed(job.vote_id).await? {
            debug!(vote = %job.vote_id, "job already processed, counters untouched");
            return Ok(JobOutcome::Replayed { award });
        }

        self.stats.increment(TOTAL_VOTES, 1);
        self.stats.increment(&question_key(&job.question_id), 1);
        self.stats.increment(&daily_key(day, "votes"), 1);
        self.stats.increment(TOTAL_XP, award.xp_awarded);
        self.stats.increment(&daily_key(day, "xp"), award.xp_awarded);

        if job.is_new_voter {
            self.stats.increment(UNIQUE_VOTERS, 1);
        }

        if is_milestone(award.vote_number) {
            self.milestones.notify(&Milestone {
                voter_identity_id: job.voter_identity_id,
                vote_number: award.vote_number,
                total_xp: award.total_xp,
                reached_at: job.submitted_at,
            });
            self.stats.increment(MILESTONES_REACHED, 1);
        }

        Ok(JobOutcome::Processed { award, streak })
    }

    /// Runs a job to completion or gives up, never returning the error.
    pub async fn process_with_retry(&self, job: &EnhancementJob, config: &QueueConfig) {
        for attempt in 1..=config.max_attempts {
            match self.process(job).await {
                Ok(outcome) => {
                    debug!(vote = %job.vote_id, ?outcome, "enhancement job done");
                    return;
                }
                Err(e) if e.is_transient() && attempt < config.max_attempts => {
                    warn!(vote = %job.vote_id, attempt, "enhancement job failed, retrying: {e}");
                    sleep(config.retry).await;
                }
                Err(e) => {
                    error!(vote = %job.vote_id, attempt, "dropping enhancement job: {e}");
                    return;
                }
            }
        }
    }
}

pub struct EnhancementQueue {
    sender: Mutex<Option<mpsc::Sender<EnhancementJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl EnhancementQueue {
    pub fn start(processor: Arc<EnhancementProcessor>, config: QueueConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity);
        let receiver = Arc::new(AsyncMutex::new(receiver));

        let workers = (0..config.workers)
            .map(|worker| {
                let receiver = receiver.clone();
                let processor = processor.clone();

                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };

                        processor.process_with_retry(&job, &config).await;
                    }

                    debug!(worker, "enhancement worker stopped");
                })
            })
            .collect();

        info!(
            "Enhancement queue started with {} workers, capacity {}",
            config.workers, config.capacity
        );

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            capacity: config.capacity,
        }
    }

    pub fn enqueue(&self, job: EnhancementJob) -> Result<(), EnqueueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(EnqueueError::Closed);
        };

        sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnqueueError::Full,
            mpsc::error::TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn depth(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|sender| self.capacity - sender.capacity())
            .unwrap_or(0)
    }

    /// Stops accepting jobs and waits for the workers to drain the channel.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!("Enhancement worker ended abnormally: {e}");
            }
        }

        info!("Enhancement queue drained");
    }
}
