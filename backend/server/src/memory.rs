use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::{
    database::Store,
    error::StoreError,
    models::{
        AggregateStat, Question, RateLimitWindow, Streak, VoteResponse, VoterIdentity,
        XpAward, XpLedgerEntry,
    },
    rate_limit::RatePolicy,
    stats::StatUpdate,
    xp::tier_for,
};

type AwardKey = (Uuid, String, String);

#[derive(Default)]
struct MemoryState {
    questions: HashMap<String, Question>,
    voters: HashMap<Uuid, VoterIdentity>,
    token_index: HashMap<String, Uuid>,
    rate_windows: HashMap<String, RateLimitWindow>,
    votes: HashMap<Uuid, VoteResponse>,
    vote_index: HashMap<(Uuid, String), Uuid>,
    ledger: HashMap<Uuid, Vec<XpLedgerEntry>>,
    awards: HashMap<AwardKey, (i64, u64)>,
    streaks: HashMap<Uuid, Streak>,
    processed_jobs: HashSet<Uuid>,
    stats: HashMap<String, AggregateStat>,
}

/// Single-process store. Every operation holds one lock for its whole body,
/// which gives the same atomicity the Redis scripts give.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    #[cfg(any(test, feature = "test-util"))]
    faults: faults::Faults,
}

#[cfg(any(test, feature = "test-util"))]
mod faults {
    use std::{
        sync::atomic::{AtomicU32, Ordering},
        time::Duration,
    };

    use parking_lot::Mutex;

    use crate::{error::StoreError, stats::StatUpdate};

    #[derive(Default)]
    pub(super) struct Faults {
        pub(super) failing_stat_writes: AtomicU32,
        pub(super) failing_xp_writes: AtomicU32,
        pub(super) load_delay: Mutex<Option<Duration>>,
        pub(super) commit_delay: Mutex<Option<Duration>>,
        pub(super) applied_batches: Mutex<Vec<Vec<(String, StatUpdate)>>>,
    }

    pub(super) fn trip(counter: &AtomicU32) -> Result<(), StoreError> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if tripped {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    pub(super) async fn stall(delay: &Mutex<Option<Duration>>) {
        let delay = *delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MemoryStore {
    /// Makes the next `n` stat batch writes fail as if the datastore were down.
    pub fn fail_stat_writes(&self, n: u32) {
        self.faults
            .failing_stat_writes
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Makes the next `n` XP ledger writes fail as if the datastore were down.
    pub fn fail_xp_writes(&self, n: u32) {
        self.faults
            .failing_xp_writes
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    /// Every `load_stat` waits this long before reading.
    pub fn delay_loads(&self, delay: std::time::Duration) {
        *self.faults.load_delay.lock() = Some(delay);
    }

    /// Every `commit_vote` waits this long before writing.
    pub fn delay_commits(&self, delay: std::time::Duration) {
        *self.faults.commit_delay.lock() = Some(delay);
    }

    /// Every stat batch that reached storage, in order.
    pub fn applied_batches(&self) -> Vec<Vec<(String, StatUpdate)>> {
        self.faults.applied_batches.lock().clone()
    }

    pub fn vote_count(&self) -> usize {
        self.state.lock().votes.len()
    }

    pub fn votes_for(&self, question_id: &str) -> Vec<VoteResponse> {
        self.state
            .lock()
            .votes
            .values()
            .filter(|vote| vote.question_id == question_id)
            .cloned()
            .collect()
    }

    pub fn voter_ids(&self) -> Vec<Uuid> {
        self.state.lock().voters.keys().copied().collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn fetch_question(&self, question_id: &str) -> Result<Option<Question>, StoreError> {
        Ok(self.state.lock().questions.get(question_id).cloned())
    }

    async fn upsert_question(&self, question: &Question) -> Result<(), StoreError> {
        self.state
            .lock()
            .questions
            .insert(question.id.clone(), question.clone());
        Ok(())
    }

    async fn find_voter_by_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<VoterIdentity>, StoreError> {
        let state = self.state.lock();

        Ok(state
            .token_index
            .get(token_hash)
            .and_then(|id| state.voters.get(id))
            .cloned())
    }

    async fn fetch_voter(&self, voter_id: Uuid) -> Result<Option<VoterIdentity>, StoreError> {
        Ok(self.state.lock().voters.get(&voter_id).cloned())
    }

    async fn insert_voter(&self, voter: &VoterIdentity) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        state.token_index.insert(voter.token_hash.clone(), voter.id);
        state.voters.insert(voter.id, voter.clone());
        Ok(())
    }

    async fn touch_voter(
        &self,
        voter_id: Uuid,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let voter = state
            .voters
            .get_mut(&voter_id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown voter {voter_id}")))?;

        voter.last_active_at = now;
        voter.source_ip = source_ip.to_string();
        Ok(())
    }

    async fn rate_window(&self, source_ip: &str) -> Result<Option<RateLimitWindow>, StoreError> {
        Ok(self.state.lock().rate_windows.get(source_ip).cloned())
    }

    async fn consume_rate(
        &self,
        source_ip: &str,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError> {
        let mut state = self.state.lock();
        let current = state.rate_windows.get(source_ip).cloned();
        let window = policy.try_consume(current, source_ip, now)?;

        state
            .rate_windows
            .insert(source_ip.to_string(), window.clone());
        Ok(window)
    }

    async fn has_vote(&self, voter_id: Uuid, question_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .state
            .lock()
            .vote_index
            .contains_key(&(voter_id, question_id.to_string())))
    }

    async fn commit_vote(
        &self,
        vote: &VoteResponse,
        policy: &RatePolicy,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError> {
        #[cfg(any(test, feature = "test-util"))]
        faults::stall(&self.faults.commit_delay).await;

        let mut state = self.state.lock();
        let unique_key = (vote.voter_identity_id, vote.question_id.clone());

        if state.vote_index.contains_key(&unique_key) {
            return Err(StoreError::Duplicate);
        }

        let current = state.rate_windows.get(&vote.source_ip).cloned();
        let window = policy.try_consume(current, &vote.source_ip, now)?;

        state
            .rate_windows
            .insert(vote.source_ip.clone(), window.clone());
        state.vote_index.insert(unique_key, vote.id);
        state.votes.insert(vote.id, vote.clone());
        Ok(window)
    }

    async fn record_xp(
        &self,
        voter_id: Uuid,
        question_id: &str,
        action_type: &str,
        now: DateTime<Utc>,
    ) -> Result<XpAward, StoreError> {
        #[cfg(any(test, feature = "test-util"))]
        faults::trip(&self.faults.failing_xp_writes)?;

        let mut state = self.state.lock();
        let award_key = (voter_id, action_type.to_string(), question_id.to_string());

        if let Some(&(xp_awarded, vote_number)) = state.awards.get(&award_key) {
            return Ok(XpAward {
                xp_awarded,
                total_xp: ledger_sum(state.ledger.get(&voter_id)),
                vote_number,
                newly_recorded: false,
            });
        }

        let voter = state
            .voters
            .get_mut(&voter_id)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown voter {voter_id}")))?;
        voter.vote_count += 1;
        let vote_number = voter.vote_count;
        let xp_awarded = tier_for(vote_number as i64);

        let entries = state.ledger.entry(voter_id).or_default();
        entries.push(XpLedgerEntry {
            id: Uuid::new_v4(),
            voter_identity_id: voter_id,
            action_type: action_type.to_string(),
            xp_amount: xp_awarded,
            source_question_id: question_id.to_string(),
            created_at: now,
        });
        let total_xp = ledger_sum(Some(&*entries));

        state.awards.insert(award_key, (xp_awarded, vote_number));

        Ok(XpAward {
            xp_awarded,
            total_xp,
            vote_number,
            newly_recorded: true,
        })
    }

    async fn xp_entries(&self, voter_id: Uuid) -> Result<Vec<XpLedgerEntry>, StoreError> {
        Ok(self
            .state
            .lock()
            .ledger
            .get(&voter_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn record_activity(
        &self,
        voter_id: Uuid,
        day: NaiveDate,
    ) -> Result<Streak, StoreError> {
        let mut state = self.state.lock();
        let previous = state.streaks.get(&voter_id).cloned();
        let streak = Streak::advance(previous, voter_id, day);

        state.streaks.insert(voter_id, streak.clone());
        Ok(streak)
    }

    async fn mark_job_processed(&self, vote_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state.lock().processed_jobs.insert(vote_id))
    }

    async fn load_stat(&self, key: &str) -> Result<Option<AggregateStat>, StoreError> {
        #[cfg(any(test, feature = "test-util"))]
        faults::stall(&self.faults.load_delay).await;

        Ok(self.state.lock().stats.get(key).cloned())
    }

    async fn apply_stats(
        &self,
        batch: &[(String, StatUpdate)],
        now: DateTime<Utc>,
    ) -> Result<Vec<AggregateStat>, StoreError> {
        #[cfg(any(test, feature = "test-util"))]
        faults::trip(&self.faults.failing_stat_writes)?;

        let mut state = self.state.lock();
        let mut applied = Vec::with_capacity(batch.len());

        for (key, update) in batch {
            let stat = state
                .stats
                .entry(key.clone())
                .or_insert_with(|| AggregateStat {
                    key: key.clone(),
                    value: 0,
                    last_updated: now,
                });

            stat.value = update.apply(stat.value);
            stat.last_updated = now;
            applied.push(stat.clone());
        }

        #[cfg(any(test, feature = "test-util"))]
        self.faults.applied_batches.lock().push(batch.to_vec());

        Ok(applied)
    }
}

fn ledger_sum(entries: Option<&Vec<XpLedgerEntry>>) -> i64 {
    entries
        .map(|entries| entries.iter().map(|entry| entry.xp_amount).sum())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::models::ResponseData;

    fn vote(voter: Uuid, question: &str, ip: &str) -> VoteResponse {
        VoteResponse {
            id: Uuid::new_v4(),
            question_id: question.to_string(),
            voter_identity_id: voter,
            response_data: ResponseData::Text("yes".into()),
            source_ip: ip.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_commit_enforces_uniqueness_without_spending_budget() {
        let store = MemoryStore::default();
        let policy = RatePolicy::new(10, std::time::Duration::from_secs(60));
        let voter = Uuid::new_v4();
        let now = Utc::now();

        let window = store
            .commit_vote(&vote(voter, "q1", "ip"), &policy, now)
            .await
            .unwrap();
        assert_eq!(window.request_count, 1);

        assert!(matches!(
            store.commit_vote(&vote(voter, "q1", "ip"), &policy, now).await,
            Err(StoreError::Duplicate)
        ));
        assert_eq!(
            store.rate_window("ip").await.unwrap().unwrap().request_count,
            1
        );
        assert!(store.has_vote(voter, "q1").await.unwrap());
        assert!(!store.has_vote(voter, "q2").await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_refuses_spent_window() {
        let store = MemoryStore::default();
        let policy = RatePolicy::new(1, std::time::Duration::from_secs(60));
        let now = Utc::now();

        store
            .commit_vote(&vote(Uuid::new_v4(), "q1", "ip"), &policy, now)
            .await
            .unwrap();

        let refused = store
            .commit_vote(&vote(Uuid::new_v4(), "q1", "ip"), &policy, now)
            .await;
        assert!(matches!(refused, Err(StoreError::BudgetExhausted { .. })));
        assert_eq!(store.vote_count(), 1);

        let later = now + Duration::seconds(61);
        assert!(
            store
                .commit_vote(&vote(Uuid::new_v4(), "q1", "ip"), &policy, later)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_xp_for_unknown_voter_is_corrupt() {
        let store = MemoryStore::default();

        assert!(matches!(
            store
                .record_xp(Uuid::new_v4(), "q1", "vote", Utc::now())
                .await,
            Err(StoreError::Corrupt(_))
        ));
    }

    #[tokio::test]
    async fn test_jobs_are_marked_once() {
        let store = MemoryStore::default();
        let vote_id = Uuid::new_v4();

        assert!(store.mark_job_processed(vote_id).await.unwrap());
        assert!(!store.mark_job_processed(vote_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let store = MemoryStore::default();
        let batch = vec![("total_votes".to_string(), StatUpdate::increment(1))];

        store.fail_stat_writes(1);
        assert!(store.apply_stats(&batch, Utc::now()).await.is_err());

        let applied = store.apply_stats(&batch, Utc::now()).await.unwrap();
        assert_eq!(applied[0].value, 1);
    }
}
