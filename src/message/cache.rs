//! Duplicate suppression for received and originated messages.
//!
//! Uses a HashMap for O(1) membership checks and a time-ordered queue for
//! TTL eviction, so memory stays bounded by the retention window.
//!
//! Ids are only ever forgotten by age. The size limit is advisory: an id
//! inside the retention window is never dropped to make room, since a
//! replay of it would then be delivered a second time.

use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use super::MessageId;

/// Thread-safe record of message ids already delivered and relayed.
///
/// An id stays "seen" for `ttl` after its first observation. After that it
/// may be evicted and would be reported as novel again, so the TTL must be
/// longer than the time a broadcast can keep circulating in the cluster.
#[derive(Debug)]
pub struct SeenCache {
    inner: Mutex<SeenInner>,
    /// How long an id is remembered.
    ttl: Duration,
    /// Expected number of ids remembered at once.
    max_size: usize,
}

#[derive(Debug, Default)]
struct SeenInner {
    /// Map from message id to the instant it was first seen.
    entries: HashMap<MessageId, Instant>,
    /// First-seen order (oldest at the front).
    insertion_order: VecDeque<(MessageId, Instant)>,
    /// Ids recorded while the cache was at or above `max_size`.
    over_capacity: u64,
}

impl SeenCache {
    /// Create a new cache with the specified TTL and max size.
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(SeenInner {
                entries: HashMap::with_capacity(max_size.min(1024)),
                insertion_order: VecDeque::with_capacity(max_size.min(1024)),
                over_capacity: 0,
            }),
            ttl,
            max_size: max_size.max(1),
        }
    }

    /// Record `id` if it has not been seen.
    ///
    /// Returns `true` when the id is novel (and is now recorded), `false`
    /// when it is a duplicate. Concurrent callers racing on the same id see
    /// exactly one `true`.
    pub fn observe(&self, id: MessageId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        self.evict_expired_locked(&mut inner, now);

        if inner.entries.contains_key(&id) {
            return false;
        }

        if inner.entries.len() >= self.max_size {
            inner.over_capacity += 1;
            if inner.over_capacity.is_power_of_two() {
                tracing::warn!(
                    entries = inner.entries.len(),
                    max_size = self.max_size,
                    ttl = ?self.ttl,
                    "seen cache above its size limit; consider a shorter seen_ttl"
                );
            }
        }

        inner.entries.insert(id, now);
        inner.insertion_order.push_back((id, now));
        true
    }

    /// Check whether `id` is currently remembered.
    pub fn contains(&self, id: &MessageId) -> bool {
        let now = Instant::now();
        let inner = self.inner.lock();

        match inner.entries.get(id) {
            Some(first_seen) => now.duration_since(*first_seen) < self.ttl,
            None => false,
        }
    }

    /// When `id` was first seen, if still remembered.
    pub fn first_seen(&self, id: &MessageId) -> Option<Instant> {
        self.inner.lock().entries.get(id).copied()
    }

    /// Number of ids currently remembered.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Remove all expired ids. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.evict_expired_locked(&mut inner, now)
    }

    fn evict_expired_locked(&self, inner: &mut SeenInner, now: Instant) -> usize {
        let mut removed = 0;

        // insertion_order is sorted by time, so stop at the first live entry
        while let Some(&(id, first_seen)) = inner.insertion_order.front() {
            if now.duration_since(first_seen) < self.ttl {
                break;
            }
            inner.insertion_order.pop_front();
            inner.entries.remove(&id);
            removed += 1;
        }

        removed
    }

    /// Forget every id.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.insertion_order.clear();
    }

    /// Get cache statistics.
    pub fn stats(&self) -> SeenCacheStats {
        let inner = self.inner.lock();
        SeenCacheStats {
            entries: inner.entries.len(),
            capacity: self.max_size,
            ttl: self.ttl,
            over_capacity: inner.over_capacity,
        }
    }
}

/// Statistics about the duplicate-suppression cache.
#[derive(Debug, Clone, Copy)]
pub struct SeenCacheStats {
    /// Number of ids currently remembered.
    pub entries: usize,
    /// Advisory size limit.
    pub capacity: usize,
    /// Retention window.
    pub ttl: Duration,
    /// Ids recorded while the cache was already at its size limit.
    pub over_capacity: u64,
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(300), 100_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn id(n: u64) -> MessageId {
        MessageId::from_u64(n)
    }

    #[test]
    fn test_observe_novel_then_duplicate() {
        let cache = SeenCache::new(Duration::from_secs(60), 100);

        assert!(cache.observe(id(1)));
        assert!(!cache.observe(id(1)));
        assert!(cache.contains(&id(1)));
        assert!(cache.first_seen(&id(1)).is_some());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_concurrent_observe_single_winner() {
        let cache = Arc::new(SeenCache::new(Duration::from_secs(60), 1000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || (0..100).filter(|n| cache.observe(id(*n))).count())
            })
            .collect();

        let novel: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(novel, 100);
    }

    #[test]
    fn test_size_limit_keeps_live_ids() {
        let cache = SeenCache::new(Duration::from_secs(60), 3);

        for n in 0..5 {
            assert!(cache.observe(id(n)));
        }

        // Nothing inside the ttl is forgotten
        assert_eq!(cache.len(), 5);
        assert!(cache.contains(&id(0)));
        assert!(cache.contains(&id(1)));
        assert!(!cache.observe(id(0)));
        assert!(!cache.observe(id(1)));
        assert_eq!(cache.stats().over_capacity, 2);
    }

    #[test]
    fn test_size_limit_recovers_after_ttl() {
        let cache = SeenCache::new(Duration::from_millis(50), 2);

        for n in 0..4 {
            cache.observe(id(n));
        }
        assert_eq!(cache.len(), 4);

        std::thread::sleep(Duration::from_millis(100));

        assert!(cache.observe(id(10)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().over_capacity, 2);
    }

    #[test]
    fn test_ttl_expiration() {
        let cache = SeenCache::new(Duration::from_millis(50), 100);

        assert!(cache.observe(id(1)));
        assert!(cache.contains(&id(1)));

        std::thread::sleep(Duration::from_millis(100));

        assert!(!cache.contains(&id(1)));
        assert_eq!(cache.evict_expired(), 1);
        assert!(cache.is_empty());

        // Outside the retention window the id is novel again
        assert!(cache.observe(id(1)));
    }

    #[test]
    fn test_clear() {
        let cache = SeenCache::new(Duration::from_secs(60), 100);

        for n in 0..10 {
            cache.observe(id(n));
        }

        assert_eq!(cache.len(), 10);
        cache.clear();
        assert!(cache.is_empty());
    }
}
