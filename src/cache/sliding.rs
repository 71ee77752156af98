/// Sliding-expiration cache with an optional background sweeper
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{CacheCore, DisposalHooks, DEFAULT_SWEEP_INTERVAL};

/// Cache whose entries live `ttl` past their last successful read.
///
/// A hit renews the entry even when it has expired but has not been swept
/// yet; entries disappear only through a sweep, `remove` or `clear`.
pub struct SlidingExpirationCache<K, V> {
    core: CacheCore<K, V>,
    cleanup: CancellationToken,
}

impl<K, V> SlidingExpirationCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_hooks(DEFAULT_SWEEP_INTERVAL, DisposalHooks::default())
    }

    pub fn with_hooks(sweep_interval: Duration, hooks: DisposalHooks<V>) -> Self {
        Self {
            core: CacheCore::new(sweep_interval, hooks),
            cleanup: CancellationToken::new(),
        }
    }

    /// Cache swept every `period` by a background task, so disposal happens
    /// even when nobody touches the cache. The task holds a weak reference
    /// and ends when the cache is dropped or `stop_cleanup` is called.
    pub fn with_cleanup_task(period: Duration, hooks: DisposalHooks<V>) -> (Arc<Self>, JoinHandle<()>) {
        let cache = Arc::new(Self::with_hooks(period, hooks));
        let weak = Arc::downgrade(&cache);
        let token = cache.cleanup.clone();
        let handle = tokio::spawn(run_cleanup(weak, token, period));
        (cache, handle)
    }

    pub fn put(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        self.core.put(key, value, ttl)
    }

    /// Value for `key`, renewing its expiry to now + `ttl`
    pub fn get(&self, key: &K, ttl: Duration) -> Option<V> {
        self.core.get(key, Some(ttl), false)
    }

    /// Compute-once lookup; the factory runs under the cache lock and must
    /// not call back into this cache
    pub fn get_or_compute<F>(&self, key: K, factory: F, ttl: Duration) -> V
    where
        F: FnOnce(&K) -> V,
    {
        self.core.get_or_compute(key, factory, ttl, true)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.core.remove(key)
    }

    pub fn clear(&self) {
        self.core.clear()
    }

    pub fn size(&self) -> usize {
        self.core.len()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.core.contains_key(key)
    }

    pub fn values(&self) -> Vec<V> {
        self.core.values()
    }

    pub fn sweep(&self) -> usize {
        self.core.sweep()
    }

    pub fn stop_cleanup(&self) {
        self.cleanup.cancel();
    }
}

impl<K, V> Default for SlidingExpirationCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Drop for SlidingExpirationCache<K, V> {
    fn drop(&mut self) {
        self.cleanup.cancel();
    }
}

async fn run_cleanup<K, V>(cache: Weak<SlidingExpirationCache<K, V>>, token: CancellationToken, period: Duration)
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(cache) = cache.upgrade() else { break };
        let swept = cache.sweep();
        if swept > 0 {
            tracing::debug!("Cache cleanup removed {} expired entries", swept);
        }
    }
}
