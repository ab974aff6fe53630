use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use server::{
    clock::{Clock, ManualClock},
    config::Config,
    database::Store,
    error::AppError,
    memory::MemoryStore,
    milestones::RecordingSink,
    models::{Question, ResponseData},
    pipeline::VoteSubmission,
    state::State,
    stats::{TOTAL_VOTES, TOTAL_XP, UNIQUE_VOTERS},
    xp::XpLedger,
};

const IP: &str = "203.0.113.7";

struct Harness {
    state: Arc<State>,
    store: Arc<MemoryStore>,
    clock: ManualClock,
    sink: Arc<RecordingSink>,
}

async fn harness(config: Config) -> Harness {
    let store = Arc::new(MemoryStore::default());
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap());
    let sink = Arc::new(RecordingSink::default());

    for id in ["q1", "q2", "q3", "q4"] {
        store
            .upsert_question(&Question {
                id: id.into(),
                active: true,
                starts_at: None,
                ends_at: None,
            })
            .await
            .unwrap();
    }
    store
        .upsert_question(&Question {
            id: "closed".into(),
            active: false,
            starts_at: None,
            ends_at: None,
        })
        .await
        .unwrap();

    let state = State::with_store(config, store.clone(), Arc::new(clock.clone()), sink.clone());

    Harness {
        state,
        store,
        clock,
        sink,
    }
}

fn vote(question_id: &str) -> VoteSubmission {
    VoteSubmission {
        question_id: question_id.into(),
        response: ResponseData::Text("yes".into()),
    }
}

#[tokio::test]
async fn test_vote_lifecycle() {
    let h = harness(Config::default()).await;

    let first = h.state.pipeline.submit(vote("q1"), None, IP).await.unwrap();
    assert!(first.success);
    assert_eq!(first.xp_awarded, 5);
    assert!(!first.voter_token.is_empty());

    let second = h
        .state
        .pipeline
        .submit(vote("q2"), Some(&first.voter_token), IP)
        .await
        .unwrap();
    assert_eq!(second.voter_token, first.voter_token);
    assert_eq!(second.xp_awarded, 5);

    let again = h
        .state
        .pipeline
        .submit(vote("q1"), Some(&first.voter_token), IP)
        .await;
    assert!(matches!(again, Err(AppError::DuplicateVote)));

    // A different voter on the same question is not a duplicate.
    let other = h.state.pipeline.submit(vote("q1"), None, IP).await.unwrap();
    assert_ne!(other.voter_token, first.voter_token);
    assert_eq!(other.xp_awarded, 5);

    h.state.shutdown().await;

    assert_eq!(h.store.vote_count(), 3);
    assert_eq!(h.store.votes_for("q1").len(), 2);
    assert_eq!(h.store.voter_ids().len(), 2);

    let ledger = XpLedger::new(h.store.clone(), Arc::new(h.clock.clone()));
    let mut totals = Vec::new();
    for voter in h.store.voter_ids() {
        totals.push(ledger.total_xp(voter).await.unwrap());
    }
    totals.sort();
    assert_eq!(totals, vec![5, 10]);

    let summary = h.state.stats.summary(true).await.unwrap();
    assert_eq!(summary.counters[TOTAL_VOTES], 3);
    assert_eq!(summary.counters[UNIQUE_VOTERS], 2);
    assert_eq!(summary.counters[TOTAL_XP], 15);
    assert_eq!(summary.daily.unwrap()["votes"], 3);

    // Each voter's first vote is a milestone.
    let milestones = h.sink.seen();
    assert_eq!(milestones.len(), 2);
    assert!(milestones.iter().all(|m| m.vote_number == 1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_store_exactly_one_vote() {
    let h = harness(Config::default()).await;

    let seed = h.state.pipeline.submit(vote("q1"), None, IP).await.unwrap();

    let attempts = (0..20).map(|_| {
        let state = h.state.clone();
        let token = seed.voter_token.clone();

        tokio::spawn(async move { state.pipeline.submit(vote("q2"), Some(&token), IP).await })
    });

    let mut accepted = 0;
    let mut duplicates = 0;
    for attempt in attempts.collect::<Vec<_>>() {
        match attempt.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(AppError::DuplicateVote) => duplicates += 1,
            Err(e) => panic!("unexpected rejection: {e}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 19);
    assert_eq!(h.store.votes_for("q2").len(), 1);

    h.state.shutdown().await;
}

#[tokio::test]
async fn test_rate_limit_through_pipeline() {
    let config = Config {
        rate_limit_budget: 3,
        ..Config::default()
    };
    let h = harness(config).await;

    for question in ["q1", "q2", "q3"] {
        h.state.pipeline.submit(vote(question), None, IP).await.unwrap();
    }

    let limited = h.state.pipeline.submit(vote("q4"), None, IP).await;
    let Err(AppError::RateLimitExceeded { reset_at }) = &limited else {
        panic!("expected rate limit, got {limited:?}");
    };
    assert_eq!(*reset_at, h.clock.now() + Duration::hours(24));
    assert!(h.store.votes_for("q4").is_empty());

    // Other IPs have their own budget.
    h.state
        .pipeline
        .submit(vote("q4"), None, "198.51.100.1")
        .await
        .unwrap();

    h.clock.advance(Duration::hours(24) + Duration::seconds(1));
    h.state.pipeline.submit(vote("q4"), None, IP).await.unwrap();

    h.state.shutdown().await;
}

#[tokio::test]
async fn test_rejections_do_not_spend_budget() {
    let config = Config {
        rate_limit_budget: 2,
        ..Config::default()
    };
    let h = harness(config).await;

    let first = h.state.pipeline.submit(vote("q1"), None, IP).await.unwrap();
    for _ in 0..3 {
        let duplicate = h
            .state
            .pipeline
            .submit(vote("q1"), Some(&first.voter_token), IP)
            .await;
        assert!(matches!(duplicate, Err(AppError::DuplicateVote)));
    }

    let closed = h.state.pipeline.submit(vote("closed"), None, IP).await;
    assert!(matches!(closed, Err(AppError::QuestionNotFound)));

    h.state
        .pipeline
        .submit(vote("q2"), Some(&first.voter_token), IP)
        .await
        .unwrap();

    h.state.shutdown().await;
}

#[tokio::test]
async fn test_unknown_question_mints_no_identity() {
    let h = harness(Config::default()).await;

    for question in ["missing", "closed"] {
        let rejected = h.state.pipeline.submit(vote(question), None, IP).await;
        assert!(matches!(rejected, Err(AppError::QuestionNotFound)));
    }

    assert!(h.store.voter_ids().is_empty());
    assert_eq!(h.store.vote_count(), 0);

    h.state.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_tokens() {
    let h = harness(Config::default()).await;

    let empty = VoteSubmission {
        question_id: "q1".into(),
        response: ResponseData::Ranking(vec![]),
    };
    assert!(matches!(
        h.state.pipeline.submit(empty, None, IP).await,
        Err(AppError::MalformedPayload)
    ));

    let oversized = "x".repeat(300);
    assert!(matches!(
        h.state.pipeline.submit(vote("q1"), Some(&oversized), IP).await,
        Err(AppError::InvalidIdentity)
    ));

    let fresh = h
        .state
        .pipeline
        .submit(vote("q1"), Some("never-issued"), IP)
        .await
        .unwrap();
    assert_ne!(fresh.voter_token, "never-issued");

    h.state.shutdown().await;
}

#[tokio::test]
async fn test_inline_xp_failure_is_recovered_in_background() {
    let h = harness(Config::default()).await;

    h.store.fail_xp_writes(1);
    let receipt = h.state.pipeline.submit(vote("q1"), None, IP).await.unwrap();
    assert_eq!(receipt.xp_awarded, 0);

    h.state.shutdown().await;

    let voter = h.store.voter_ids()[0];
    let ledger = XpLedger::new(h.store.clone(), Arc::new(h.clock.clone()));
    assert_eq!(ledger.total_xp(voter).await.unwrap(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_vote_landing_after_deadline_is_still_processed() {
    let config = Config {
        request_timeout: std::time::Duration::from_millis(50),
        ..Config::default()
    };
    let h = harness(config).await;
    h.store.delay_commits(std::time::Duration::from_millis(200));

    let late = h.state.pipeline.submit(vote("q1"), None, IP).await;
    assert!(matches!(late, Err(AppError::Timeout)));

    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    h.state.shutdown().await;

    assert_eq!(h.store.vote_count(), 1);

    let voter = h.store.voter_ids()[0];
    let ledger = XpLedger::new(h.store.clone(), Arc::new(h.clock.clone()));
    assert_eq!(ledger.total_xp(voter).await.unwrap(), 5);

    let summary = h.state.stats.summary(false).await.unwrap();
    assert_eq!(summary.counters[TOTAL_VOTES], 1);
    assert_eq!(summary.counters[TOTAL_XP], 5);
}
