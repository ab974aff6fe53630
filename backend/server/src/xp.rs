//! # XP
//!
//! Progressive reward by cumulative vote count, inclusive upper bounds:
//!
//! | votes     | xp  |
//! |-----------|-----|
//! | 1-5       | 5   |
//! | 6-10      | 10  |
//! | 11-25     | 15  |
//! | 26-50     | 20  |
//! | 51-100    | 25  |
//! | 101-250   | 50  |
//! | 251+      | 100 |
//!
//! The ledger is append-only and a voter's total is always its sum. There is
//! no separately mutated total to drift out of sync.
use std::sync::Arc;

use uuid::Uuid;

use crate::{clock::Clock, database::Store, error::AppError, models::XpAward};

pub const VOTE_ACTION: &str = "vote";

/// (inclusive upper bound, xp) per tier.
pub const XP_SCHEDULE: [(u64, i64); 6] = [(5, 5), (10, 10), (25, 15), (50, 20), (100, 25), (250, 50)];
pub const TOP_TIER_XP: i64 = 100;

pub fn tier_for(vote_number: i64) -> i64 {
    let vote_number = vote_number.max(1) as u64;

    XP_SCHEDULE
        .iter()
        .find(|(upper, _)| vote_number <= *upper)
        .map(|(_, xp)| *xp)
        .unwrap_or(TOP_TIER_XP)
}

pub struct XpLedger {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl XpLedger {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn record_and_total(
        &self,
        voter_id: Uuid,
        question_id: &str,
    ) -> Result<XpAward, AppError> {
        let award = self
            .store
            .record_xp(voter_id, question_id, VOTE_ACTION, self.clock.now())
            .await?;

        Ok(award)
    }

    pub async fn total_xp(&self, voter_id: Uuid) -> Result<i64, AppError> {
        let entries = self.store.xp_entries(voter_id).await?;

        Ok(entries.iter().map(|entry| entry.xp_amount).sum())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{clock::SystemClock, memory::MemoryStore, models::VoterIdentity};

    #[test]
    fn test_tier_boundaries() {
        let cases = [
            (1, 5),
            (5, 5),
            (6, 10),
            (10, 10),
            (11, 15),
            (25, 15),
            (26, 20),
            (50, 20),
            (51, 25),
            (100, 25),
            (101, 50),
            (250, 50),
            (251, 100),
            (10_000, 100),
        ];

        for (vote_number, xp) in cases {
            assert_eq!(tier_for(vote_number), xp, "vote {vote_number}");
        }
    }

    #[test]
    fn test_non_positive_votes_floor_to_first_tier() {
        assert_eq!(tier_for(0), 5);
        assert_eq!(tier_for(-42), 5);
    }

    #[test]
    fn test_tier_is_monotonic() {
        let mut previous = tier_for(1);

        for vote_number in 2..=600 {
            let xp = tier_for(vote_number);
            assert!(xp >= previous, "tier dropped at vote {vote_number}");
            previous = xp;
        }
    }

    async fn ledger_with_voter() -> (XpLedger, Uuid) {
        let store = Arc::new(MemoryStore::default());
        let voter = VoterIdentity {
            id: Uuid::new_v4(),
            token_hash: "hash".into(),
            created_at: Utc::now(),
            last_active_at: Utc::now(),
            source_ip: "127.0.0.1".into(),
            vote_count: 0,
        };
        store.insert_voter(&voter).await.unwrap();

        (XpLedger::new(store, Arc::new(SystemClock)), voter.id)
    }

    #[tokio::test]
    async fn test_totals_follow_the_schedule() {
        let (ledger, voter) = ledger_with_voter().await;

        let mut expected_total = 0;
        for n in 1..=12 {
            let award = ledger
                .record_and_total(voter, &format!("q{n}"))
                .await
                .unwrap();
            expected_total += tier_for(n);

            assert_eq!(award.vote_number, n as u64);
            assert_eq!(award.xp_awarded, tier_for(n));
            assert_eq!(award.total_xp, expected_total);
        }

        assert_eq!(ledger.total_xp(voter).await.unwrap(), expected_total);
    }

    #[tokio::test]
    async fn test_repeat_award_is_idempotent() {
        let (ledger, voter) = ledger_with_voter().await;

        let first = ledger.record_and_total(voter, "q1").await.unwrap();
        let replay = ledger.record_and_total(voter, "q1").await.unwrap();

        assert!(first.newly_recorded);
        assert!(!replay.newly_recorded);
        assert_eq!(replay.xp_awarded, first.xp_awarded);
        assert_eq!(replay.vote_number, 1);
        assert_eq!(ledger.total_xp(voter).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_concurrent_awards_get_distinct_vote_numbers() {
        let (ledger, voter) = ledger_with_voter().await;
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..30)
            .map(|n| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.record_and_total(voter, &format!("q{n}")).await })
            })
            .collect();

        let mut vote_numbers = Vec::new();
        for handle in handles {
            vote_numbers.push(handle.await.unwrap().unwrap().vote_number);
        }
        vote_numbers.sort_unstable();

        assert_eq!(vote_numbers, (1..=30).collect::<Vec<u64>>());
        let expected: i64 = (1..=30).map(tier_for).sum();
        assert_eq!(ledger.total_xp(voter).await.unwrap(), expected);
    }
}
