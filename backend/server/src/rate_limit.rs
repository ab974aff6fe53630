//! # Rate Limiting
//!
//! Fixed window per source IP, e.g. 100 votes per 24 hours measured from the
//! first request of the window.
//!
//! - `check_budget` is read-only and runs before anything else touches storage
//! - Consumption happens only once a vote is about to be written
//! - Rollover is lazy: the first request after the window ends starts a new one
//!
//! The counter lives in the datastore, not in process memory, since several
//! server instances may share one budget.
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::{
    clock::Clock,
    database::Store,
    error::{AppError, StoreError},
    models::RateLimitWindow,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatePolicy {
    pub budget: u32,
    pub window: Duration,
}

impl RatePolicy {
    pub fn new(budget: u32, window: std::time::Duration) -> Self {
        Self {
            budget,
            window: Duration::from_std(window).unwrap_or(Duration::days(1)),
        }
    }

    pub fn is_expired(&self, window: &RateLimitWindow, now: DateTime<Utc>) -> bool {
        now > window.window_start + self.window
    }

    /// The window that applies at `now`, without persisting anything.
    pub fn roll(
        &self,
        current: Option<RateLimitWindow>,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> RateLimitWindow {
        match current {
            Some(window) if !self.is_expired(&window, now) => window,
            _ => RateLimitWindow {
                source_ip: source_ip.to_string(),
                request_count: 0,
                window_start: now,
            },
        }
    }

    pub fn remaining(&self, window: &RateLimitWindow) -> u32 {
        self.budget.saturating_sub(window.request_count)
    }

    pub fn reset_at(&self, window: &RateLimitWindow) -> DateTime<Utc> {
        window.window_start + self.window
    }

    /// Rolls the window and spends one request from it.
    pub fn try_consume(
        &self,
        current: Option<RateLimitWindow>,
        source_ip: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitWindow, StoreError> {
        let mut window = self.roll(current, source_ip, now);

        if self.remaining(&window) == 0 {
            return Err(StoreError::BudgetExhausted {
                reset_at: self.reset_at(&window),
            });
        }

        window.request_count += 1;
        Ok(window)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Budget {
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    policy: RatePolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, policy: RatePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &RatePolicy {
        &self.policy
    }

    pub async fn check_budget(&self, source_ip: &str) -> Result<Budget, AppError> {
        let now = self.clock.now();
        let current = self.store.rate_window(source_ip).await?;
        let window = self.policy.roll(current, source_ip, now);

        Ok(Budget {
            remaining: self.policy.remaining(&window),
            reset_at: self.policy.reset_at(&window),
        })
    }

    /// Fails fast once the budget is spent.
    pub async fn ensure_budget(&self, source_ip: &str) -> Result<Budget, AppError> {
        let budget = self.check_budget(source_ip).await?;

        if budget.remaining == 0 {
            debug!(source_ip, "rate budget exhausted");
            return Err(AppError::RateLimitExceeded {
                reset_at: budget.reset_at,
            });
        }

        Ok(budget)
    }

    pub async fn consume(&self, source_ip: &str) -> Result<Budget, AppError> {
        let window = self
            .store
            .consume_rate(source_ip, &self.policy, self.clock.now())
            .await?;

        Ok(Budget {
            remaining: self.policy.remaining(&window),
            reset_at: self.policy.reset_at(&window),
        })
    }
}
