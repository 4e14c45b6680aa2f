//! Component wiring over one shared store.

use crate::batch::BatchCoordinator;
use crate::cache::ResultCache;
use crate::clock::{Clock, SystemClock};
use crate::config::QueueConfig;
use crate::lock::InFlightLock;
use crate::prefs::UserPrefs;
use crate::queue::JobQueue;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryOrchestrator, RetryPolicy};
use crate::store::SharedStore;
use std::sync::Arc;

/// Every core component, built from one store handle and one configuration.
///
/// Cheap to clone; producers, workers and admin tooling each take what they
/// need from it.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn SharedStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Arc<QueueConfig>,
    pub queue: JobQueue,
    pub cache: ResultCache,
    pub lock: InFlightLock,
    pub retry: RetryOrchestrator,
    pub rate_limiter: Arc<RateLimiter>,
    pub batches: BatchCoordinator,
    pub prefs: UserPrefs,
}

impl Services {
    pub fn new(store: Arc<dyn SharedStore>, config: QueueConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn SharedStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let queue = JobQueue::with_clock(store.clone(), clock.clone());
        let cache = ResultCache::with_clock(store.clone(), config.cache.ttl, clock.clone());
        let lock = InFlightLock::with_clock(
            store.clone(),
            cache.clone(),
            config.lock.poll_interval,
            clock.clone(),
        );
        let retry = RetryOrchestrator::new(RetryPolicy::from(&config.retry));
        let rate_limiter = Arc::new(RateLimiter::with_clock(
            store.clone(),
            config.rate_limit.clone(),
            config.penalty.clone(),
            clock.clone(),
        ));
        let batches = BatchCoordinator::with_clock(
            store.clone(),
            queue.clone(),
            config.batch.clone(),
            clock.clone(),
        );
        let prefs = UserPrefs::new(store.clone());

        Self {
            store,
            clock,
            config: Arc::new(config),
            queue,
            cache,
            lock,
            retry,
            rate_limiter,
            batches,
            prefs,
        }
    }
}
