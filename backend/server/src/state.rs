use std::sync::Arc;

use tracing::{info, warn};

use super::{
    clock::{Clock, SystemClock},
    config::Config,
    database::{Store, init_store},
    error::StoreError,
    guard::DuplicateGuard,
    identity::IdentityManager,
    milestones::{LogSink, MilestoneSink},
    pipeline::SubmissionPipeline,
    queue::{EnhancementProcessor, EnhancementQueue, QueueConfig},
    rate_limit::{RateLimiter, RatePolicy},
    stats::{StatsCache, StatsConfig},
    xp::XpLedger,
};

pub struct State {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub stats: Arc<StatsCache>,
    pub queue: Arc<EnhancementQueue>,
    pub pipeline: SubmissionPipeline,
}

impl State {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let store = init_store(&config).await?;

        Ok(Self::with_store(
            config,
            store,
            Arc::new(SystemClock),
            Arc::new(LogSink),
        ))
    }

    /// Wires every component around an existing store and starts the
    /// background workers. Must be called inside a tokio runtime.
    pub fn with_store(
        config: Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        milestones: Arc<dyn MilestoneSink>,
    ) -> Arc<Self> {
        let stats = StatsCache::new(store.clone(), clock.clone(), StatsConfig::from(&config));
        stats.start();

        let ledger = Arc::new(XpLedger::new(store.clone(), clock.clone()));

        let processor = Arc::new(EnhancementProcessor::new(
            store.clone(),
            ledger.clone(),
            stats.clone(),
            milestones,
        ));
        let queue = Arc::new(EnhancementQueue::start(processor, QueueConfig::from(&config)));

        let policy = RatePolicy::new(config.rate_limit_budget, config.rate_limit_window);
        let pipeline = SubmissionPipeline::new(
            store.clone(),
            clock.clone(),
            Arc::new(RateLimiter::new(store.clone(), clock.clone(), policy)),
            Arc::new(IdentityManager::new(
                store.clone(),
                clock.clone(),
                config.token_pepper.clone(),
            )),
            Arc::new(DuplicateGuard::new(store.clone())),
            ledger,
            queue.clone(),
            config.request_timeout,
        );

        Arc::new(Self {
            config,
            store,
            clock,
            stats,
            queue,
            pipeline,
        })
    }

    /// Drains background jobs first since they still feed the stats writer.
    pub async fn shutdown(&self) {
        info!("Draining enhancement queue...");
        self.queue.shutdown().await;

        info!("Flushing stats...");
        if let Err(e) = self.stats.shutdown().await {
            warn!("Stats left unflushed at shutdown: {e}");
        }
    }
}
