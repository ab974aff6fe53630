//! # Aggregate Stats
//!
//! Named counters (total votes, unique voters, total XP, per-day and
//! per-question tallies) that are read far more often than they change.
//!
//! ## Reads
//! - Durable values are cached in process for a fixed TTL, e.g. 5 minutes
//! - Past the TTL an entry counts as absent and the next read goes to storage.
//!   Expired entries are dropped on that read or on the next flush
//! - A read that goes to storage holds the flush lock, so a flush never lands
//!   between the load and the cache insert
//! - Queued but unflushed updates are overlaid on the cached value, so readers
//!   see their own increments before they reach storage
//!
//! ## Writes
//! - Increments for the same key coalesce into one pending delta
//! - A set cancels whatever was pending for that key
//! - The pending batch is sealed once it holds `max_batch` queued updates,
//!   otherwise it flushes after `debounce` without new updates
//! - A failed flush goes back to the front of the queue and is retried after
//!   a fixed backoff
//!
//! The cache is eventually consistent with storage. Only one process-local
//! writer task owns flushing, started with [`StatsCache::start`] and stopped
//! with [`StatsCache::shutdown`], which flushes whatever is left.
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify, watch},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tracing::{debug, info, warn};

use crate::{clock::Clock, config::Config, database::Store, error::AppError};

pub const TOTAL_VOTES: &str = "total_votes";
pub const UNIQUE_VOTERS: &str = "unique_voters";
pub const TOTAL_XP: &str = "total_xp";
pub const MILESTONES_REACHED: &str = "milestones_reached";

pub const COUNTERS: [&str; 4] = [TOTAL_VOTES, UNIQUE_VOTERS, TOTAL_XP, MILESTONES_REACHED];
pub const DAILY_COUNTERS: [&str; 2] = ["votes", "xp"];

pub fn daily_key(day: NaiveDate, counter: &str) -> String {
    format!("daily:{}:{counter}", day.format("%Y-%m-%d"))
}

pub fn question_key(question_id: &str) -> String {
    format!("question:{question_id}:votes")
}

/// A pending change to one counter: an optional absolute value followed by a delta.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatUpdate {
    pub set: Option<i64>,
    pub delta: i64,
}

impl StatUpdate {
    pub fn increment(by: i64) -> Self {
        Self {
            set: None,
            delta: by,
        }
    }

    pub fn set(value: i64) -> Self {
        Self {
            set: Some(value),
            delta: 0,
        }
    }

    /// `self` happened first.
    pub fn merge(self, newer: StatUpdate) -> StatUpdate {
        match newer.set {
            Some(_) => newer,
            None => StatUpdate {
                set: self.set,
                delta: self.delta + newer.delta,
            },
        }
    }

    pub fn apply(&self, current: i64) -> i64 {
        self.set.unwrap_or(current) + self.delta
    }
}

type Batch = HashMap<String, StatUpdate>;

#[derive(Clone, Copy, Debug)]
pub struct StatsConfig {
    pub ttl: Duration,
    pub debounce: Duration,
    pub max_batch: usize,
    pub retry: Duration,
}

impl From<&Config> for StatsConfig {
    fn from(config: &Config) -> Self {
        Self {
            ttl: config.stats_ttl,
            debounce: config.stats_debounce,
            max_batch: config.stats_max_batch.max(1),
            retry: config.stats_retry,
        }
    }
}

struct CachedStat {
    value: i64,
    fetched_at: Instant,
}

#[derive(Default)]
struct Inner {
    cache: HashMap<String, CachedStat>,
    pending: Batch,
    pending_ops: usize,
    last_enqueue: Option<Instant>,
    // Sealed batches waiting to be written, oldest first.
    ready: VecDeque<Batch>,
    in_flight: Option<Batch>,
}

impl Inner {
    fn seal_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        self.pending_ops = 0;
        self.ready.push_back(batch);
    }

    /// Everything queued for `key` that storage has not seen yet, oldest first.
    fn unflushed(&self, key: &str) -> Option<StatUpdate> {
        self.in_flight
            .iter()
            .chain(self.ready.iter())
            .chain(std::iter::once(&self.pending))
            .filter_map(|batch| batch.get(key).copied())
            .reduce(StatUpdate::merge)
    }

    fn overlay(&self, key: &str, base: Option<i64>) -> Option<i64> {
        match self.unflushed(key) {
            Some(update) => Some(update.apply(base.unwrap_or(0))),
            None => base,
        }
    }

    fn next_deadline(&self, debounce: Duration) -> Option<Instant> {
        if !self.ready.is_empty() {
            return Some(Instant::now());
        }

        if self.pending.is_empty() {
            return None;
        }

        self.last_enqueue.map(|at| at + debounce)
    }
}

#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    #[serde(flatten)]
    pub counters: BTreeMap<String, i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily: Option<BTreeMap<String, i64>>,
}

pub struct StatsCache {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: StatsConfig,
    inner: Mutex<Inner>,
    wake: Notify,
    flush_lock: AsyncMutex<()>,
    stop: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StatsCache {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: StatsConfig) -> Arc<Self> {
        let (stop, _) = watch::channel(false);

        Arc::new(Self {
            store,
            clock,
            config,
            inner: Mutex::new(Inner::default()),
            wake: Notify::new(),
            flush_lock: AsyncMutex::new(()),
            stop,
            worker: Mutex::new(None),
        })
    }

    /// Spawns the writer task. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }

        let cache = self.clone();
        let stop = self.stop.subscribe();
        *worker = Some(tokio::spawn(async move { cache.run(stop).await }));
    }

    pub fn queue_update(&self, key: &str, update: StatUpdate) {
        let mut inner = self.inner.lock();

        let merged = match inner.pending.remove(key) {
            Some(existing) => existing.merge(update),
            None => update,
        };
        inner.pending.insert(key.to_string(), merged);
        inner.pending_ops += 1;
        inner.last_enqueue = Some(Instant::now());

        if inner.pending_ops >= self.config.max_batch {
            debug!("stats batch full, sealing {} keys", inner.pending.len());
            inner.seal_pending();
        }

        drop(inner);
        self.wake.notify_one();
    }

    pub fn increment(&self, key: &str, by: i64) {
        self.queue_update(key, StatUpdate::increment(by));
    }

    pub fn set_value(&self, key: &str, value: i64) {
        self.queue_update(key, StatUpdate::set(value));
    }

    /// Cached durable value with unflushed updates overlaid.
    pub async fn read(&self, key: &str) -> Result<Option<i64>, AppError> {
        if let Some(value) = self.read_cached(key) {
            return Ok(value);
        }

        let _guard = self.flush_lock.lock().await;
        if let Some(value) = self.read_cached(key) {
            return Ok(value);
        }

        let base = self.store.load_stat(key).await?.map(|stat| stat.value);

        let mut inner = self.inner.lock();
        if let Some(value) = base {
            inner.cache.insert(
                key.to_string(),
                CachedStat {
                    value,
                    fetched_at: Instant::now(),
                },
            );
        }

        Ok(inner.overlay(key, base))
    }

    /// `None` when storage has to be asked.
    fn read_cached(&self, key: &str) -> Option<Option<i64>> {
        let mut inner = self.inner.lock();
        let (value, fresh) = inner
            .cache
            .get(key)
            .map(|entry| (entry.value, entry.fetched_at.elapsed() < self.config.ttl))?;

        if !fresh {
            inner.cache.remove(key);
            return None;
        }

        Some(inner.overlay(key, Some(value)))
    }

    pub async fn summary(&self, include_daily: bool) -> Result<StatsSummary, AppError> {
        let mut counters = BTreeMap::new();
        for key in COUNTERS {
            counters.insert(key.to_string(), self.read(key).await?.unwrap_or(0));
        }

        let daily = if include_daily {
            let today = self.clock.now().date_naive();
            let mut daily = BTreeMap::new();

            for counter in DAILY_COUNTERS {
                let value = self.read(&daily_key(today, counter)).await?.unwrap_or(0);
                daily.insert(counter.to_string(), value);
            }

            Some(daily)
        } else {
            None
        };

        Ok(StatsSummary { counters, daily })
    }

    /// Writes every sealed batch, then whatever is pending, one batch per
    /// storage round trip. Stops at the first failure, leaving the failed
    /// batch at the front of the queue.
    pub async fn flush(&self) -> Result<usize, AppError> {
        let _guard = self.flush_lock.lock().await;
        let mut flushed = 0;

        loop {
            let batch = {
                let mut inner = self.inner.lock();
                if inner.ready.is_empty() {
                    inner.seal_pending();
                }

                let Some(batch) = inner.ready.pop_front() else {
                    break;
                };
                inner.in_flight = Some(batch.clone());
                batch
            };

            let entries: Vec<_> = batch.into_iter().collect();
            match self.store.apply_stats(&entries, self.clock.now()).await {
                Ok(applied) => {
                    let mut inner = self.inner.lock();
                    inner.in_flight = None;

                    let fetched_at = Instant::now();
                    for stat in applied {
                        inner.cache.insert(
                            stat.key,
                            CachedStat {
                                value: stat.value,
                                fetched_at,
                            },
                        );
                    }

                    let ttl = self.config.ttl;
                    inner
                        .cache
                        .retain(|_, entry| entry.fetched_at.elapsed() < ttl);

                    flushed += 1;
                }
                Err(e) => {
                    let mut inner = self.inner.lock();
                    inner.in_flight = None;
                    inner.ready.push_front(entries.into_iter().collect());

                    return Err(e.into());
                }
            }
        }

        Ok(flushed)
    }

    pub fn pending_len(&self) -> usize {
        let inner = self.inner.lock();
        inner.pending.len() + inner.ready.iter().map(HashMap::len).sum::<usize>()
    }

    /// Stops the writer task and makes one last attempt to persist everything.
    pub async fn shutdown(&self) -> Result<(), AppError> {
        let _ = self.stop.send(true);

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Stats writer task ended abnormally: {e}");
            }
        }

        let flushed = self.flush().await?;
        info!("Stats writer stopped after flushing {flushed} batches");
        Ok(())
    }

    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            if *stop.borrow() {
                break;
            }

            let deadline = self.inner.lock().next_deadline(self.config.debounce);

            tokio::select! {
                _ = stop.changed() => break,
                _ = self.wake.notified() => continue,
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    match self.flush().await {
                        Ok(flushed) => debug!("Flushed {flushed} stats batches"),
                        Err(e) => {
                            warn!("Stats flush failed, retrying in {:?}: {e}", self.config.retry);
                            tokio::select! {
                                _ = stop.changed() => break,
                                _ = sleep(self.config.retry) => {}
                            }
                        }
                    }
                }
            }
        }
    }
}
