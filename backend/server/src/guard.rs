use std::sync::Arc;

use uuid::Uuid;

use crate::{database::Store, error::AppError};

/// One response per voter per question.
///
/// This check is the fast rejection. The datastore re-checks uniqueness when
/// the vote is committed, so two racing requests that both pass here still
/// cannot both land.
pub struct DuplicateGuard {
    store: Arc<dyn Store>,
}

impl DuplicateGuard {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn has_voted(&self, voter_id: Uuid, question_id: &str) -> Result<bool, AppError> {
        Ok(self.store.has_vote(voter_id, question_id).await?)
    }

    pub async fn ensure_first_vote(&self, voter_id: Uuid, question_id: &str) -> Result<(), AppError> {
        if self.has_voted(voter_id, question_id).await? {
            return Err(AppError::DuplicateVote);
        }

        Ok(())
    }
}
