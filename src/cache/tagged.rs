//! Tagged TTL cache with stampede coalescing
//!
//! Entries carry a set of tags; [`TaggedCache::invalidate_by_tags`] drops
//! every entry carrying any of the given tags. Expired entries are never
//! returned: reads drop them lazily and a periodic sweep removes the rest.
//!
//! ## Coalescing
//!
//! Concurrent [`wrap`](TaggedCache::wrap) misses on one key share a single
//! in-flight computation. The first caller (leader) computes and broadcasts
//! the value; the others wait on the broadcast. If the leader fails or is
//! dropped, waiters compute for themselves. Failures are never stored.
//!
//! ## Invalidation during a computation
//!
//! Invalidating a tag also detaches every in-flight computation carrying
//! it. Callers arriving afterwards start a fresh leader instead of joining
//! the stale one, and waiters already subscribed to it compute for
//! themselves. A detached leader returns its value but does not store it.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub inserts: AtomicU64,
    /// Entries dropped because their TTL ran out
    pub evictions: AtomicU64,
    /// Entries dropped by tag invalidation
    pub invalidations: AtomicU64,
    /// Misses served by another caller's in-flight computation
    pub coalesced: AtomicU64,
}

impl CacheStats {
    fn record(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub coalesced: u64,
}

impl CacheStatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// =============================================================================
// Internal state
// =============================================================================

/// Live while `now <= expires_at`
struct Entry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<String>,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

struct Flight<V> {
    id: u64,
    sender: broadcast::Sender<Option<V>>,
    tags: Vec<String>,
}

/// Entries, tag index and in-flight table change together under one lock.
struct Inner<V> {
    entries: HashMap<String, Entry<V>>,
    /// tag -> keys carrying it
    tag_index: HashMap<String, HashSet<String>>,
    in_flight: HashMap<String, Flight<V>>,
    next_flight: u64,
}

impl<V: Clone> Inner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tag_index: HashMap::new(),
            in_flight: HashMap::new(),
            next_flight: 0,
        }
    }

    fn unlink(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tag_index.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }

    fn insert(&mut self, key: String, entry: Entry<V>) {
        self.unlink(&key);
        for tag in &entry.tags {
            self.tag_index
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
        self.entries.insert(key, entry);
    }

    /// Live value for `key`; an expired entry is dropped on the way.
    fn lookup(&mut self, key: &str, now: Instant, stats: &CacheStats) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => {
                self.unlink(key);
                CacheStats::record(&stats.evictions, 1);
                None
            }
            None => None,
        }
    }

    /// Drop in-flight computations carrying any of `tags`. Their senders go
    /// with them, which wakes any waiters.
    fn detach_flights(&mut self, tags: &HashSet<&str>) -> usize {
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, flight| !flight.tags.iter().any(|t| tags.contains(t.as_str())));
        before - self.in_flight.len()
    }

    fn take_flight(&mut self, key: &str, id: u64) -> Option<Flight<V>> {
        match self.in_flight.get(key) {
            Some(flight) if flight.id == id => self.in_flight.remove(key),
            _ => None,
        }
    }
}

enum Role<V> {
    Leader { id: u64 },
    Waiter(broadcast::Receiver<Option<V>>),
}

/// Releases the leader's in-flight slot if its `wrap` future is dropped
/// before completing. Dropping the sender wakes the waiters.
struct FlightGuard<'a, V: Clone> {
    cache: &'a TaggedCache<V>,
    key: &'a str,
    id: u64,
}

impl<V: Clone> Drop for FlightGuard<'_, V> {
    fn drop(&mut self) {
        self.cache.lock().take_flight(self.key, self.id);
    }
}

fn owned_tags<T: AsRef<str>>(tags: &[T]) -> Vec<String> {
    let mut owned: Vec<String> = tags.iter().map(|t| t.as_ref().to_string()).collect();
    owned.sort();
    owned.dedup();
    owned
}

// =============================================================================
// Tagged Cache
// =============================================================================

/// Generic key/value memoization with TTL, tags and coalescing.
///
/// Construct one per process (or per test) and share it through an `Arc`.
pub struct TaggedCache<V> {
    inner: Mutex<Inner<V>>,
    stats: CacheStats,
}

impl<V> TaggedCache<V> {
    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // No critical section can panic halfway through a map update
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<V: Clone + Send + Sync + 'static> TaggedCache<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
            stats: CacheStats::default(),
        }
    }

    /// Live value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.lock().lookup(key, Instant::now(), &self.stats);
        match value {
            Some(_) => CacheStats::record(&self.stats.hits, 1),
            None => CacheStats::record(&self.stats.misses, 1),
        }
        value
    }

    /// Store `value` for `ttl`, replacing any previous entry and its tags.
    pub fn set<T: AsRef<str>>(&self, key: &str, value: V, ttl: Duration, tags: &[T]) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
            tags: owned_tags(tags),
        };
        self.lock().insert(key.to_string(), entry);
        CacheStats::record(&self.stats.inserts, 1);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().unlink(key).is_some()
    }

    /// Remove every entry carrying any of `tags` and detach in-flight
    /// computations carrying them; returns how many entries went.
    pub fn invalidate_by_tags<T: AsRef<str>>(&self, tags: &[T]) -> usize {
        let tags: HashSet<&str> = tags.iter().map(|t| t.as_ref()).collect();
        let mut inner = self.lock();

        let mut removed = 0;
        for tag in &tags {
            if let Some(keys) = inner.tag_index.remove(*tag) {
                for key in keys {
                    if inner.unlink(&key).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        let detached = inner.detach_flights(&tags);
        drop(inner);

        CacheStats::record(&self.stats.invalidations, removed as u64);
        debug!(tags = ?tags, removed, detached, "Invalidated cache entries");
        removed
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Errors from `compute` are returned to the caller and nothing is
    /// stored.
    pub async fn wrap<T, F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        tags: &[T],
        compute: F,
    ) -> Result<V, E>
    where
        T: AsRef<str>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let tags = owned_tags(tags);

        let role = {
            let mut inner = self.lock();
            if let Some(value) = inner.lookup(key, Instant::now(), &self.stats) {
                CacheStats::record(&self.stats.hits, 1);
                return Ok(value);
            }
            CacheStats::record(&self.stats.misses, 1);

            match inner.in_flight.get(key) {
                Some(flight) => Role::Waiter(flight.sender.subscribe()),
                None => {
                    let id = inner.next_flight;
                    inner.next_flight += 1;
                    let (sender, _) = broadcast::channel(1);
                    let flight = Flight {
                        id,
                        sender,
                        tags: tags.clone(),
                    };
                    inner.in_flight.insert(key.to_string(), flight);
                    Role::Leader { id }
                }
            }
        };

        match role {
            Role::Waiter(mut receiver) => {
                if let Ok(Some(value)) = receiver.recv().await {
                    CacheStats::record(&self.stats.coalesced, 1);
                    return Ok(value);
                }
                debug!(key, "Shared computation did not produce a value, computing directly");
                compute().await
            }
            Role::Leader { id } => {
                let guard = FlightGuard {
                    cache: self,
                    key,
                    id,
                };
                let result = compute().await;

                let flight = {
                    let mut inner = self.lock();
                    let flight = inner.take_flight(key, id);
                    match (&result, &flight) {
                        (Ok(value), Some(_)) => {
                            let entry = Entry {
                                value: value.clone(),
                                expires_at: Instant::now() + ttl,
                                tags,
                            };
                            inner.insert(key.to_string(), entry);
                            CacheStats::record(&self.stats.inserts, 1);
                        }
                        (Ok(_), None) => {
                            debug!(key, "Tags invalidated while computing, result not cached");
                        }
                        (Err(_), _) => {}
                    }
                    flight
                };
                drop(guard);

                if let Some(flight) = flight {
                    // No receivers is fine
                    let _ = flight.sender.send(result.as_ref().ok().cloned());
                }
                result
            }
        }
    }

    /// One sweep pass over expired entries; returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.unlink(key);
        }
        drop(inner);

        if !expired.is_empty() {
            CacheStats::record(&self.stats.evictions, expired.len() as u64);
            debug!(removed = expired.len(), "Swept expired cache entries");
        }
        expired.len()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.tag_index.clear();
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.stats.snapshot()
    }

    /// Spawn the periodic sweep. The task holds only a weak reference, so it
    /// also ends once the cache itself is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> CacheSweeper {
        let cache: Weak<Self> = Arc::downgrade(self);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            debug!("Cache dropped, sweeper exiting");
                            break;
                        };
                        cache.cleanup();
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Cache sweeper stopping");
                        break;
                    }
                }
            }
        });

        info!(interval_secs = interval.as_secs(), "Cache sweeper started");
        CacheSweeper {
            shutdown_tx,
            handle,
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for TaggedCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running sweep task
pub struct CacheSweeper {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    /// Stop the sweep and wait for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = self.handle.await;
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_get_set_and_lazy_expiry() {
        let cache: TaggedCache<u32> = TaggedCache::new();
        cache.set("a", 1, TTL, &["t1"]);
        assert_eq!(cache.get("a"), Some(1));

        // Still live at the expiry instant itself
        tokio::time::advance(TTL).await;
        assert_eq!(cache.get("a"), Some(1));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get("a"), None);
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[tokio::test]
    async fn test_replacing_entry_drops_old_tags() {
        let cache: TaggedCache<&'static str> = TaggedCache::new();
        cache.set("k", "old", TTL, &["old-tag"]);
        cache.set("k", "new", TTL, &["new-tag"]);

        assert_eq!(cache.invalidate_by_tags(&["old-tag"]), 0);
        assert_eq!(cache.get("k"), Some("new"));
        assert_eq!(cache.invalidate_by_tags(&["new-tag"]), 1);
        assert_eq!(cache.get("k"), None);
    }

    #[tokio::test]
    async fn test_invalidate_by_any_tag() {
        let cache: TaggedCache<u32> = TaggedCache::new();
        cache.set("w1", 1, TTL, &["worker:1", "fleet"]);
        cache.set("w2", 2, TTL, &["worker:2", "fleet"]);
        cache.set("other", 3, TTL, &["unrelated"]);

        assert_eq!(cache.invalidate_by_tags(&["worker:1"]), 1);
        assert_eq!(cache.get("w2"), Some(2));
        assert_eq!(cache.invalidate_by_tags(&["fleet", "nothing"]), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_only_expired() {
        let cache: TaggedCache<u32> = TaggedCache::new();
        cache.set("short", 1, Duration::from_secs(5), &["t"]);
        cache.set("long", 2, Duration::from_secs(50), &["t"]);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);

        // Index no longer references the swept key
        assert_eq!(cache.invalidate_by_tags(&["t"]), 1);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache: TaggedCache<u32> = TaggedCache::new();
        cache.set("a", 1, TTL, &["t"]);
        cache.set("b", 2, TTL, &["t"]);

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.invalidate_by_tags(&["t"]), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_when_cache_dropped() {
        let cache: Arc<TaggedCache<u32>> = Arc::new(TaggedCache::new());
        cache.set("a", 1, Duration::from_secs(1), &["t"]);

        let sweeper = cache.start_sweeper(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(sweeper.is_finished());
    }

    #[test]
    fn test_hit_rate() {
        let snapshot = CacheStatsSnapshot {
            hits: 3,
            misses: 1,
            ..Default::default()
        };
        assert!((snapshot.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(CacheStatsSnapshot::default().hit_rate(), 0.0);
    }
}
