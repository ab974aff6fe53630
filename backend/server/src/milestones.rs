use chrono::{DateTime, Utc};
#[cfg(any(test, feature = "test-util"))]
use parking_lot::Mutex;
use tracing::info;
use uuid::Uuid;

/// Cumulative vote counts worth celebrating.
pub const MILESTONES: [u64; 8] = [1, 10, 25, 50, 100, 250, 500, 1000];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Milestone {
    pub voter_identity_id: Uuid,
    pub vote_number: u64,
    pub total_xp: i64,
    pub reached_at: DateTime<Utc>,
}

pub fn is_milestone(vote_number: u64) -> bool {
    MILESTONES.contains(&vote_number)
}

/// Whoever tracks milestones downstream (badges, notifications).
pub trait MilestoneSink: Send + Sync {
    fn notify(&self, milestone: &Milestone);
}

pub struct LogSink;

impl MilestoneSink for LogSink {
    fn notify(&self, milestone: &Milestone) {
        info!(
            voter = %milestone.voter_identity_id,
            votes = milestone.vote_number,
            total_xp = milestone.total_xp,
            "milestone reached"
        );
    }
}

/// Keeps every milestone in memory so tests can assert on them.
#[cfg(any(test, feature = "test-util"))]
#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Milestone>>,
}

#[cfg(any(test, feature = "test-util"))]
impl RecordingSink {
    pub fn seen(&self) -> Vec<Milestone> {
        self.seen.lock().clone()
    }
}

#[cfg(any(test, feature = "test-util"))]
impl MilestoneSink for RecordingSink {
    fn notify(&self, milestone: &Milestone) {
        self.seen.lock().push(milestone.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestone_counts() {
        assert!(is_milestone(1));
        assert!(is_milestone(250));
        assert!(!is_milestone(2));
        assert!(!is_milestone(0));
    }

    #[test]
    fn test_recording_sink_keeps_order() {
        let sink = RecordingSink::default();
        let voter = Uuid::new_v4();

        for vote_number in [1, 10] {
            sink.notify(&Milestone {
                voter_identity_id: voter,
                vote_number,
                total_xp: 0,
                reached_at: Utc::now(),
            });
        }

        let seen: Vec<u64> = sink.seen().iter().map(|m| m.vote_number).collect();
        assert_eq!(seen, vec![1, 10]);
    }
}
