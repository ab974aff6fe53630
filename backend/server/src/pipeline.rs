//! # Vote Submission
//!
//! The only part of a vote the voter waits for.
//!
//! ## Critical Path
//! 1. Rate budget check, read-only
//! 2. Question exists, is active and inside its start/end window
//! 3. Voter identity resolved or minted
//! 4. Duplicate check
//! 5. + 6. Budget consumed and vote written as one storage operation
//! 7. Receipt returned with the vote id, the (maybe new) token and the XP earned
//!
//! Each step short-circuits on failure, nothing after it runs. Steps 1-6 share
//! one hard deadline. Because consumption and the write are a single storage
//! operation, hitting the deadline can never leave budget spent without a vote.
//!
//! Steps 1-6 run on their own task. When the deadline fires the caller gets a
//! timeout but the task carries on, so a write that was already on its way
//! still lands. Such a vote skips the inline award and goes straight to the
//! background queue, which records its XP and counters. A first-time voter in
//! that spot never sees the token that was minted for them.
//!
//! ## After the Response
//! 8. A job goes to the background queue. If it cannot be queued the vote still stands.
//!
//! XP is awarded inline on a best-effort basis so the receipt can show it. If
//! that write fails the background job awards it instead, the ledger makes the
//! second attempt a no-op when the first one did land.
use std::{fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::{sync::oneshot, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clock::Clock,
    database::Store,
    error::{AppError, StoreError},
    guard::DuplicateGuard,
    identity::IdentityManager,
    models::{ResponseData, VoteResponse},
    queue::{EnhancementJob, EnhancementQueue},
    rate_limit::RateLimiter,
    xp::XpLedger,
};

pub const MAX_QUESTION_ID_LEN: usize = 128;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteSubmission {
    pub question_id: String,
    pub response: ResponseData,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    pub success: bool,
    pub vote_id: Uuid,
    pub voter_token: String,
    pub xp_awarded: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Received,
    RateChecked,
    QuestionValidated,
    IdentityResolved,
    DuplicateChecked,
    Persisted,
    Enqueued,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::RateChecked => "rate_checked",
            Stage::QuestionValidated => "question_validated",
            Stage::IdentityResolved => "identity_resolved",
            Stage::DuplicateChecked => "duplicate_checked",
            Stage::Persisted => "persisted",
            Stage::Enqueued => "enqueued",
        };

        f.write_str(name)
    }
}

struct Committed {
    vote: VoteResponse,
    token: String,
    is_new_voter: bool,
}

#[derive(Clone)]
pub struct SubmissionPipeline {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    rate_limiter: Arc<RateLimiter>,
    identities: Arc<IdentityManager>,
    guard: Arc<DuplicateGuard>,
    ledger: Arc<XpLedger>,
    queue: Arc<EnhancementQueue>,
    deadline: Duration,
}

impl SubmissionPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        rate_limiter: Arc<RateLimiter>,
        identities: Arc<IdentityManager>,
        guard: Arc<DuplicateGuard>,
        ledger: Arc<XpLedger>,
        queue: Arc<EnhancementQueue>,
        deadline: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            rate_limiter,
            identities,
            guard,
            ledger,
            queue,
            deadline,
        }
    }

    pub async fn submit(
        &self,
        submission: VoteSubmission,
        token: Option<&str>,
        source_ip: &str,
    ) -> Result<VoteReceipt, AppError> {
        validate(&submission)?;

        let (landed_tx, mut landed) = oneshot::channel();
        let pipeline = self.clone();
        let token = token.map(str::to_string);
        let ip = source_ip.to_string();

        tokio::spawn(async move {
            let result = pipeline.commit(submission, token.as_deref(), &ip).await;

            if let Err(Ok(committed)) = landed_tx.send(result) {
                warn!(vote = %committed.vote.id, "vote stored after its deadline, finishing in background");
                pipeline.enqueue(&committed);
            }
        });

        let waited = timeout(self.deadline, &mut landed).await;
        let result = match waited {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                return Err(AppError::TransientStorageError(StoreError::Unavailable(
                    "vote task ended without a result".to_string(),
                )));
            }
            Err(_) => {
                // Once closed, a late result goes back to the task instead.
                landed.close();
                match landed.try_recv() {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(source_ip, "vote submission hit its deadline");
                        return Err(AppError::Timeout);
                    }
                }
            }
        };
        let committed = result?;

        let vote = &committed.vote;
        let xp_awarded = self.award_inline(vote).await;

        info!(
            vote = %vote.id,
            voter = %vote.voter_identity_id,
            question = %vote.question_id,
            xp_awarded,
            "vote accepted"
        );

        self.enqueue(&committed);

        Ok(VoteReceipt {
            success: true,
            vote_id: vote.id,
            voter_token: committed.token,
            xp_awarded,
        })
    }

    fn enqueue(&self, committed: &Committed) {
        let vote = &committed.vote;
        let job = EnhancementJob {
            vote_id: vote.id,
            voter_identity_id: vote.voter_identity_id,
            question_id: vote.question_id.clone(),
            is_new_voter: committed.is_new_voter,
            submitted_at: vote.created_at,
        };

        match self.queue.enqueue(job) {
            Ok(()) => debug!(vote = %vote.id, stage = %Stage::Enqueued, "enhancement queued"),
            Err(e) => warn!(vote = %vote.id, "vote stored but enhancement not queued: {e}"),
        }
    }

    async fn commit(
        &self,
        submission: VoteSubmission,
        token: Option<&str>,
        source_ip: &str,
    ) -> Result<Committed, AppError> {
        let mut stage = Stage::Received;

        let result = async {
            self.rate_limiter.ensure_budget(source_ip).await?;
            stage = Stage::RateChecked;

            let now = self.clock.now();
            let open = self
                .store
                .fetch_question(&submission.question_id)
                .await?
                .is_some_and(|question| question.is_open(now));
            if !open {
                return Err(AppError::QuestionNotFound);
            }
            stage = Stage::QuestionValidated;

            let resolved = self.identities.resolve_or_create(token, source_ip).await?;
            stage = Stage::IdentityResolved;

            self.guard
                .ensure_first_vote(resolved.identity.id, &submission.question_id)
                .await?;
            stage = Stage::DuplicateChecked;

            let vote = VoteResponse {
                id: Uuid::new_v4(),
                question_id: submission.question_id,
                voter_identity_id: resolved.identity.id,
                response_data: submission.response,
                source_ip: source_ip.to_string(),
                created_at: self.clock.now(),
            };

            // The losing side of a concurrent double vote ends up here with
            // StoreError::Duplicate, which maps to the same DuplicateVote.
            self.store
                .commit_vote(&vote, self.rate_limiter.policy(), vote.created_at)
                .await?;
            stage = Stage::Persisted;

            Ok::<_, AppError>(Committed {
                vote,
                token: resolved.token,
                is_new_voter: resolved.is_new,
            })
        }
        .await;

        if let Err(e) = &result {
            debug!(source_ip, after = %stage, kind = e.kind(), "vote rejected");
        }

        result
    }

    async fn award_inline(&self, vote: &VoteResponse) -> i64 {
        let award = timeout(
            self.deadline,
            self.ledger.record_and_total(vote.voter_identity_id, &vote.question_id),
        )
        .await;

        match award {
            Ok(Ok(award)) => award.xp_awarded,
            Ok(Err(e)) => {
                warn!(vote = %vote.id, "inline XP award failed, deferring to background: {e}");
                0
            }
            Err(_) => {
                warn!(vote = %vote.id, "inline XP award timed out, deferring to background");
                0
            }
        }
    }
}

fn validate(submission: &VoteSubmission) -> Result<(), AppError> {
    let question_id = submission.question_id.trim();

    if question_id.is_empty() || question_id.len() > MAX_QUESTION_ID_LEN {
        return Err(AppError::MalformedPayload);
    }

    submission.response.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_rejects_bad_question_ids() {
        let submission = |question_id: &str| VoteSubmission {
            question_id: question_id.to_string(),
            response: ResponseData::Text("yes".into()),
        };

        assert!(validate(&submission("q1")).is_ok());
        assert!(validate(&submission("  ")).is_err());
        assert!(validate(&submission(&"q".repeat(MAX_QUESTION_ID_LEN + 1))).is_err());
    }

    #[test]
    fn test_submission_wire_format() {
        let submission: VoteSubmission =
            serde_json::from_str(r#"{"questionId":"q1","response":["b","a"]}"#).unwrap();

        assert_eq!(submission.question_id, "q1");
        assert_eq!(
            submission.response,
            ResponseData::Ranking(vec!["b".into(), "a".into()])
        );

        let receipt = VoteReceipt {
            success: true,
            vote_id: Uuid::nil(),
            voter_token: "t".into(),
            xp_awarded: 5,
        };
        let json = serde_json::to_value(&receipt).unwrap();
        assert_eq!(json["voterToken"], "t");
        assert_eq!(json["xpAwarded"], 5);
    }
}
