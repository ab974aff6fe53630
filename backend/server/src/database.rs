//! # Storage
//!
//! Durable state behind one async trait so the core never cares which backend is running.
//!
//! ## Requirements
//!
//! - Fast single-key lookups (voter by token hash, vote by voter + question)
//! - Hard consistency for exactly two things: the per-IP rate window and vote uniqueness
//! - Linearizable XP accounting per voter
//! - Everything else (aggregate stats) is eventually consistent
//!
//! ## Backends
//!
//! - [`RedisStore`](crate::redis_store::RedisStore): production. Atomic operations are Lua scripts,
//!   Redis runs each one to completion before the next command.
//! - [`MemoryStore`](crate::memory::MemoryStore): single process, each operation is one critical section.
//!   Used for local runs and tests.
use std::{fs::read_to_string, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use redis::{
    Client,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tracing::info;
use uuid::Uuid;

use crate::{
    config::{Config, StoreBackend},
    error::StoreError,
    memory::MemoryStore,
    models::{
        AggregateStat, Question, RateLimitWindow, Streak, VoteResponse, VoterIdentity,
        XpAward, XpLedgerEntry,
    },
    rate_limit::RatePolicy,
    redis_store::RedisStore,
    stats::StatUpdate,
};

#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_question(&self, question_id: &str) -> Result<Option<Question>, StoreError>;

    async fn upsert_question(&self, question: &Question) -> Result<(), StoreError>;

    async fn find_voter_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<VoterIdentity>, StoreError>;

    async fn fetch_voter(&self, voter_id: Uuid) -> Result<Option<VoterIdentity>, StoreError>;

    async fn insert_voter(&self, voter: &VoterIdentity) -> Result<(), StoreError>;

    async fn touch_voter(
        &self,
        voter_id: Uuid,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn rate_window(&self, source_ip: &str) -> Result<Option<RateLimitWindow>, StoreError>;

    /// Rolls the window if expired and spends one request.
    /// Fails with [`StoreError::BudgetExhausted`] without spending anything.
    async fn consume_rate(
        &self,
        source_ip: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError>;

    async fn has_vote(&self, voter_id: Uuid, question_id: &str) -> Result<bool, StoreError>;

    /// Spends one request from the vote's source IP and writes the vote, as one unit.
    ///
    /// Fails with [`StoreError::Duplicate`] if (voter, question) already has a
    /// vote and with [`StoreError::BudgetExhausted`] if the window is spent.
    /// Neither failure consumes budget.
    async fn commit_vote(
        &self,
        vote: &VoteResponse,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError>;

    /// Bumps the voter's vote count, appends a ledger entry at the tier for the
    /// new count and returns the ledger sum, atomically.
    ///
    /// Idempotent per (voter, action, question): a repeat returns the original
    /// award with `newly_recorded == false`.
    async fn record_xp(
        &self,
        voter_id: Uuid,
        question_id: &str,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> Result<XpAward, StoreError>;

    async fn xp_entries(&self, voter_id: Uuid) -> Result<Vec<XpLedgerEntry>, StoreError>;

    /// Same-day activity is a no-op, so replays are harmless.
    async fn record_activity(&self, voter_id: Uuid, day: NaiveDate)
    -> Result<Streak, StoreError>;

    /// True the first time a vote's background job is marked, false afterwards.
    async fn mark_job_processed(&self, vote_id: Uuid) -> Result<bool, StoreError>;

    async fn load_stat(&self, key: &str) -> Result<Option<AggregateStat>, StoreError>;

    /// Applies a coalesced batch and returns the resulting values.
    async fn apply_stats(
        &self,
        batch: &[(String, StatUpdate)],
        now: DateTime<Utc>,
    ) -> Result<Vec<AggregateStat>, StoreError>;
}

pub async fn init_store(config: &Config) -> Result<Arc<dyn Store>, StoreError> {
    let store: Arc<dyn Store> = match config.store_backend {
        StoreBackend::Redis => {
            info!("Connecting to Redis...");
            Arc::new(RedisStore::new(init_redis(&config.redis_url).await?))
        }
        StoreBackend::Memory => {
            info!("Using in-memory store");
            Arc::new(MemoryStore::default())
        }
    };

    if let Some(path) = &config.questions_path {
        seed_questions(store.as_ref(), path).await?;
    }

    Ok(store)
}

pub async fn init_redis(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let config = ConnectionManagerConfig::new()
        .set_number_of_retries(1)
        .set_connection_timeout(Duration::from_millis(100));

    let client = Client::open(redis_url)?;
    let connection_manager = client.get_connection_manager_with_config(config).await?;

    Ok(connection_manager)
}

/// Publishes the question catalog from a JSON array of [`Question`]s.
pub async fn seed_questions(store: &dyn Store, path: &str) -> Result<usize, StoreError> {
    let raw = read_to_string(path)
        .map_err(|e| StoreError::Unavailable(format!("reading {path}: {e}")))?;
    let questions: Vec<Question> = serde_json::from_str(&raw)?;

    for question in &questions {
        store.upsert_question(question).await?;
    }

    info!("Loaded questions: {}", questions.len());
    Ok(questions.len())
}
