//! # Voter Identity
//!
//! Anonymous voters are addressed by an opaque bearer token the server hands out.
//!
//! ## Tokens
//! - 128 random bits, hex encoded, generated on first contact
//! - Only `sha256(pepper || token)` is persisted, the raw token never leaves the request
//! - The transport adapter decides how the browser keeps it (cookie, local storage)
//!
//! ## Resolution
//! - Known token: refresh last activity and source IP, hand back the same token
//! - Missing or unknown token: mint a new identity and token
//! - Absurdly long token: rejected as an invalid identity
use std::sync::Arc;

use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::{clock::Clock, database::Store, error::AppError, models::VoterIdentity};

pub const TOKEN_BYTES: usize = 16;
pub const MAX_TOKEN_LEN: usize = 256;

pub struct ResolvedIdentity {
    pub token: String,
    pub identity: VoterIdentity,
    pub is_new: bool,
}

pub struct IdentityManager {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    pepper: String,
}

impl IdentityManager {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, pepper: String) -> Self {
        Self {
            store,
            clock,
            pepper,
        }
    }

    pub fn hash_token(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.pepper.as_bytes());
        hasher.update(token.as_bytes());

        hex::encode(hasher.finalize())
    }

    pub async fn resolve_or_create(
        &self,
        token: Option<&str>,
        source_ip: &str,
    ) -> Result<ResolvedIdentity, AppError> {
        let token = token.map(str::trim).filter(|token| !token.is_empty());

        if let Some(token) = token {
            if token.len() > MAX_TOKEN_LEN {
                return Err(AppError::InvalidIdentity);
            }

            if let Some(mut identity) = self.store.find_voter_by_token(&self.hash_token(token)).await? {
                let now = self.clock.now();
                self.store.touch_voter(identity.id, source_ip, now).await?;

                identity.last_active_at = now;
                identity.source_ip = source_ip.to_string();
                debug!(voter = %identity.id, "resolved voter identity");

                return Ok(ResolvedIdentity {
                    token: token.to_string(),
                    identity,
                    is_new: false,
                });
            }
        }

        let token = generate_token();
        let now = self.clock.now();
        let identity = VoterIdentity {
            id: uuid::Uuid::new_v4(),
            token_hash: self.hash_token(&token),
            created_at: now,
            last_active_at: now,
            source_ip: source_ip.to_string(),
            vote_count: 0,
        };

        self.store.insert_voter(&identity).await?;
        info!(voter = %identity.id, "issued new voter identity");

        Ok(ResolvedIdentity {
            token,
            identity,
            is_new: true,
        })
    }
}

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);

    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::SystemClock, memory::MemoryStore};

    fn manager() -> (IdentityManager, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let manager = IdentityManager::new(store.clone(), Arc::new(SystemClock), "pepper".into());

        (manager, store)
    }

    #[test]
    fn test_tokens_are_128_bit_hex() {
        let token = generate_token();

        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
    }

    #[tokio::test]
    async fn test_new_voter_gets_token_and_only_hash_is_stored() {
        let (manager, store) = manager();

        let resolved = manager.resolve_or_create(None, "10.0.0.1").await.unwrap();
        assert!(resolved.is_new);

        let stored = store.fetch_voter(resolved.identity.id).await.unwrap().unwrap();
        assert_eq!(stored.token_hash, manager.hash_token(&resolved.token));
        assert_ne!(stored.token_hash, resolved.token);
        assert_eq!(stored.vote_count, 0);
    }

    #[tokio::test]
    async fn test_known_token_resolves_same_identity() {
        let (manager, store) = manager();

        let first = manager.resolve_or_create(None, "10.0.0.1").await.unwrap();
        let again = manager
            .resolve_or_create(Some(&first.token), "10.0.0.2")
            .await
            .unwrap();

        assert!(!again.is_new);
        assert_eq!(again.token, first.token);
        assert_eq!(again.identity.id, first.identity.id);

        let stored = store.fetch_voter(first.identity.id).await.unwrap().unwrap();
        assert_eq!(stored.source_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_unknown_token_mints_new_identity() {
        let (manager, _) = manager();

        let resolved = manager
            .resolve_or_create(Some("not-a-token-we-issued"), "10.0.0.1")
            .await
            .unwrap();

        assert!(resolved.is_new);
        assert_ne!(resolved.token, "not-a-token-we-issued");
    }

    #[tokio::test]
    async fn test_oversized_token_rejected() {
        let (manager, _) = manager();
        let token = "a".repeat(MAX_TOKEN_LEN + 1);

        assert!(matches!(
            manager.resolve_or_create(Some(&token), "10.0.0.1").await,
            Err(AppError::InvalidIdentity)
        ));
    }

    #[test]
    fn test_pepper_changes_hash() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let a = IdentityManager::new(store.clone(), Arc::new(SystemClock), "a".into());
        let b = IdentityManager::new(store, Arc::new(SystemClock), "b".into());

        assert_ne!(a.hash_token("token"), b.hash_token("token"));
    }
}
