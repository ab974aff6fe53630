//! # Records
//!
//! Everything the core persists. Ids are UUID v4, timestamps are UTC.
//!
//! - Voter identities are addressed by the hash of their bearer token, never the token itself
//! - Vote responses are immutable, one per voter per question
//! - XP ledger entries are append-only, totals are always a sum over them
//! - Rate limit windows are one per source IP
//! - Aggregate stats are named counters mirrored by the stats cache
use std::collections::HashSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AppError;

pub const MAX_TEXT_LEN: usize = 2000;
pub const MAX_RANKING_LEN: usize = 50;
pub const MAX_STRUCTURED_KEYS: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoterIdentity {
    pub id: Uuid,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub source_ip: String,
    pub vote_count: u64,
}

/// Question-type-specific answer.
///
/// Untagged so the wire format stays the bare value the frontend sends:
/// `"yes"`, `4`, `["a", "b"]` or `{"rating": 3}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseData {
    Text(String),
    Number(f64),
    Ranking(Vec<String>),
    Structured(Map<String, Value>),
}

impl ResponseData {
    pub fn validate(&self) -> Result<(), AppError> {
        let valid = match self {
            ResponseData::Text(text) => {
                let text = text.trim();
                !text.is_empty() && text.chars().count() <= MAX_TEXT_LEN
            }
            ResponseData::Number(number) => number.is_finite(),
            ResponseData::Ranking(items) => {
                let mut seen = HashSet::with_capacity(items.len());

                !items.is_empty()
                    && items.len() <= MAX_RANKING_LEN
                    && items
                        .iter()
                        .all(|item| !item.trim().is_empty() && seen.insert(item.as_str()))
            }
            ResponseData::Structured(fields) => {
                !fields.is_empty() && fields.len() <= MAX_STRUCTURED_KEYS
            }
        };

        if valid {
            Ok(())
        } else {
            Err(AppError::MalformedPayload)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub id: Uuid,
    pub question_id: String,
    pub voter_identity_id: Uuid,
    pub response_data: ResponseData,
    pub source_ip: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XpLedgerEntry {
    pub id: Uuid,
    pub voter_identity_id: Uuid,
    pub action_type: String,
    pub xp_amount: i64,
    pub source_question_id: String,
    pub created_at: DateTime<Utc>,
}

/// Result of one ledger write. `newly_recorded` is false when the entry
/// already existed and the original award was returned instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct XpAward {
    pub xp_awarded: i64,
    pub total_xp: i64,
    pub vote_number: u64,
    pub newly_recorded: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    pub source_ip: String,
    pub request_count: u32,
    pub window_start: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStat {
    pub key: String,
    pub value: i64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub active: bool,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
}

impl Question {
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        self.active
            && self.starts_at.is_none_or(|start| start <= now)
            && self.ends_at.is_none_or(|end| now <= end)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub voter_identity_id: Uuid,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_active_day: NaiveDate,
}

impl Streak {
    /// Folds one day of activity into the previous streak.
    /// Same-day activity leaves the streak untouched.
    pub fn advance(previous: Option<Streak>, voter_identity_id: Uuid, day: NaiveDate) -> Streak {
        let Some(previous) = previous else {
            return Streak {
                voter_identity_id,
                current_streak: 1,
                longest_streak: 1,
                last_active_day: day,
            };
        };

        if day <= previous.last_active_day {
            return previous;
        }

        let current_streak = if previous.last_active_day.succ_opt() == Some(day) {
            previous.current_streak + 1
        } else {
            1
        };

        Streak {
            voter_identity_id,
            current_streak,
            longest_streak: previous.longest_streak.max(current_streak),
            last_active_day: day,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_response_data_shapes() {
        let parsed: Vec<ResponseData> =
            serde_json::from_value(json!(["yes", 4.5, ["a", "b"], {"rating": 3}])).unwrap();

        assert!(matches!(parsed[0], ResponseData::Text(_)));
        assert!(matches!(parsed[1], ResponseData::Number(_)));
        assert!(matches!(parsed[2], ResponseData::Ranking(_)));
        assert!(matches!(parsed[3], ResponseData::Structured(_)));
    }

    #[test]
    fn test_response_data_validation() {
        assert!(ResponseData::Text("yes".into()).validate().is_ok());
        assert!(ResponseData::Text("   ".into()).validate().is_err());
        assert!(ResponseData::Number(f64::NAN).validate().is_err());
        assert!(ResponseData::Ranking(vec![]).validate().is_err());
        assert!(
            ResponseData::Ranking(vec!["a".into(), "a".into()])
                .validate()
                .is_err()
        );
        assert!(ResponseData::Structured(Map::new()).validate().is_err());
    }

    #[test]
    fn test_question_window() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap();
        let mut question = Question {
            id: "q1".into(),
            active: true,
            starts_at: Some(now - Duration::hours(1)),
            ends_at: Some(now + Duration::hours(1)),
        };
        assert!(question.is_open(now));
        assert!(!question.is_open(now + Duration::hours(2)));
        assert!(!question.is_open(now - Duration::hours(2)));

        question.active = false;
        assert!(!question.is_open(now));
    }

    #[test]
    fn test_streak_progression() {
        let voter = Uuid::new_v4();

        let first = Streak::advance(None, voter, day(1));
        assert_eq!(first.current_streak, 1);

        let same_day = Streak::advance(Some(first.clone()), voter, day(1));
        assert_eq!(same_day, first);

        let second = Streak::advance(Some(first), voter, day(2));
        assert_eq!((second.current_streak, second.longest_streak), (2, 2));

        let broken = Streak::advance(Some(second), voter, day(5));
        assert_eq!((broken.current_streak, broken.longest_streak), (1, 2));
    }
}
