/// Expiring key/value caches.
///
/// `ExpiringCache` keeps a fixed expiry per entry, `SlidingExpirationCache`
/// renews it on every hit. Both sweep expired entries lazily on access (at
/// most once per sweep interval); the sliding cache can also sweep eagerly
/// from a background task. Disposal hooks run outside the cache lock, once
/// per removed entry.
pub mod sliding;

pub use sliding::SlidingExpirationCache;

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default minimum time between two lazy sweeps
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Value plus the instant it expires at
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn extend(&mut self, ttl: Duration) {
        self.expires_at = Instant::now() + ttl;
    }
}

/// Predicate consulted before an expired entry is removed
pub type ShouldDispose<V> = Arc<dyn Fn(&V) -> bool + Send + Sync>;
/// Hook run once for every removed entry
pub type OnDispose<V> = Arc<dyn Fn(&V) + Send + Sync>;

/// Optional hooks shared by both cache flavours
pub struct DisposalHooks<V> {
    pub should_dispose: Option<ShouldDispose<V>>,
    pub on_dispose: Option<OnDispose<V>>,
}

impl<V> DisposalHooks<V> {
    fn allows(&self, value: &V) -> bool {
        self.should_dispose.as_ref().map_or(true, |f| f(value))
    }

    fn dispose(&self, values: Vec<V>) {
        if let Some(on_dispose) = &self.on_dispose {
            for value in &values {
                on_dispose(value);
            }
        }
    }
}

impl<V> Default for DisposalHooks<V> {
    fn default() -> Self {
        Self {
            should_dispose: None,
            on_dispose: None,
        }
    }
}

impl<V> Clone for DisposalHooks<V> {
    fn clone(&self) -> Self {
        Self {
            should_dispose: self.should_dispose.clone(),
            on_dispose: self.on_dispose.clone(),
        }
    }
}

struct Store<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    last_sweep: Instant,
}

/// Lock-guarded map shared by both caches
pub(crate) struct CacheCore<K, V> {
    store: Mutex<Store<K, V>>,
    sweep_interval: Duration,
    hooks: DisposalHooks<V>,
}

impl<K, V> CacheCore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub(crate) fn new(sweep_interval: Duration, hooks: DisposalHooks<V>) -> Self {
        Self {
            store: Mutex::new(Store {
                entries: HashMap::new(),
                last_sweep: Instant::now(),
            }),
            sweep_interval,
            hooks,
        }
    }

    pub(crate) fn put(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        self.lazy_sweep();
        self.store
            .lock()
            .entries
            .insert(key, CacheEntry::new(value, ttl))
            .map(|old| old.value)
    }

    /// Lookup. `renew` slides the expiry, `strict` hides expired entries that
    /// have not been swept yet.
    pub(crate) fn get(&self, key: &K, renew: Option<Duration>, strict: bool) -> Option<V> {
        self.lazy_sweep();
        let now = Instant::now();
        let mut store = self.store.lock();
        let entry = store.entries.get_mut(key)?;
        if strict && entry.is_expired(now) {
            return None;
        }
        if let Some(ttl) = renew {
            entry.extend(ttl);
        }
        Some(entry.value.clone())
    }

    /// At most one `factory` call per key while the entry is live. With
    /// `renew` an expired entry that was not swept yet is revived instead of
    /// replaced.
    pub(crate) fn get_or_compute<F>(&self, key: K, factory: F, ttl: Duration, renew: bool) -> V
    where
        F: FnOnce(&K) -> V,
    {
        self.lazy_sweep();
        let (value, replaced) = {
            let mut store = self.store.lock();
            if let Some(entry) = store.entries.get_mut(&key) {
                if renew {
                    entry.extend(ttl);
                    return entry.value.clone();
                }
                if !entry.is_expired(Instant::now()) {
                    return entry.value.clone();
                }
            }
            let value = factory(&key);
            let replaced = store
                .entries
                .insert(key, CacheEntry::new(value.clone(), ttl))
                .map(|old| old.value);
            (value, replaced)
        };
        if let Some(old) = replaced {
            self.hooks.dispose(vec![old]);
        }
        value
    }

    pub(crate) fn remove(&self, key: &K) -> bool {
        let removed = self.store.lock().entries.remove(key);
        match removed {
            Some(entry) => {
                self.hooks.dispose(vec![entry.value]);
                true
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        let values: Vec<V> = {
            let mut store = self.store.lock();
            store.entries.drain().map(|(_, entry)| entry.value).collect()
        };
        self.hooks.dispose(values);
    }

    pub(crate) fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.store.lock().entries.contains_key(key)
    }

    pub(crate) fn values(&self) -> Vec<V> {
        self.store
            .lock()
            .entries
            .values()
            .map(|entry| entry.value.clone())
            .collect()
    }

    fn lazy_sweep(&self) {
        let due = {
            let store = self.store.lock();
            store.last_sweep.elapsed() >= self.sweep_interval
        };
        if due {
            self.sweep();
        }
    }

    /// Remove every expired entry whose disposal is not vetoed
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<V> = {
            let mut store = self.store.lock();
            store.last_sweep = now;
            let keys: Vec<K> = store
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now) && self.hooks.allows(&entry.value))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| store.entries.remove(key))
                .map(|entry| entry.value)
                .collect()
        };
        let swept = expired.len();
        self.hooks.dispose(expired);
        swept
    }
}

/// Cache whose entries expire a fixed time after they were put
pub struct ExpiringCache<K, V> {
    core: CacheCore<K, V>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_hooks(DEFAULT_SWEEP_INTERVAL, DisposalHooks::default())
    }

    pub fn with_hooks(sweep_interval: Duration, hooks: DisposalHooks<V>) -> Self {
        Self {
            core: CacheCore::new(sweep_interval, hooks),
        }
    }

    /// Insert or replace, returning the replaced value
    pub fn put(&self, key: K, value: V, ttl: Duration) -> Option<V> {
        self.core.put(key, value, ttl)
    }

    /// Live value for `key`; expired entries are never returned
    pub fn get(&self, key: &K) -> Option<V> {
        self.core.get(key, None, true)
    }

    pub fn get_or_compute<F>(&self, key: K, factory: F, ttl: Duration) -> V
    where
        F: FnOnce(&K) -> V,
    {
        self.core.get_or_compute(key, factory, ttl, false)
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

    /// Force a sweep regardless of the sweep interval
    pub fn sweep(&self) -> usize {
        self.core.sweep()
    }
}

impl<K, V> Default for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
