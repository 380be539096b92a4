//! Process-wide size-weighted LRU (component B, §4.B). Bounds in-memory
//! cache size without ever touching persisted data: eviction only calls
//! [`Cacheable::clear_cache`], which drops deserialized state and leaves the
//! underlying row untouched.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use lru::LruCache;

use crate::entity::EntityId;

/// Anything the expiration strategy can evict.
pub trait Cacheable: Send + Sync {
    fn clear_cache(&self);
}

/// Identifies one cached entry across every registered class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub class: String,
    pub id: EntityId,
}

impl CacheKey {
    pub fn new(class: impl Into<String>, id: EntityId) -> Self {
        Self { class: class.into(), id }
    }
}

struct Entry {
    handle: Weak<dyn Cacheable>,
    weight: u64,
}

/// Tracks every live cache entry in one process-wide LRU, evicting the
/// least-recently-used ones once their combined weight exceeds `cap_bytes`.
pub struct ExpirationStrategy {
    cap_bytes: u64,
    used_bytes: AtomicU64,
    entries: Mutex<LruCache<CacheKey, Entry>>,
}

impl ExpirationStrategy {
    pub fn new(cap_bytes: u64) -> Self {
        Self {
            cap_bytes,
            used_bytes: AtomicU64::new(0),
            // Unbounded by entry count; eviction is driven by weight alone.
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    /// Marks `key` as recently used, registering `weight` bytes against it.
    /// If this pushes total usage over the cap, the least-recently-used
    /// entries are evicted (via `clear_cache`) until usage is back at or
    /// under the cap.
    pub fn use_entry(&self, key: CacheKey, handle: Weak<dyn Cacheable>, weight: u64) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(previous) = entries.put(key, Entry { handle, weight }) {
            self.used_bytes.fetch_sub(previous.weight, Ordering::SeqCst);
        }
        self.used_bytes.fetch_add(weight, Ordering::SeqCst);
        self.evict_over_cap(&mut entries);
    }

    pub fn delete(&self, key: &CacheKey) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(removed) = entries.pop(key) {
            self.used_bytes.fetch_sub(removed.weight, Ordering::SeqCst);
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn evict_over_cap(&self, entries: &mut LruCache<CacheKey, Entry>) {
        while self.used_bytes.load(Ordering::SeqCst) > self.cap_bytes {
            let Some((_, evicted)) = entries.pop_lru() else { break };
            self.used_bytes.fetch_sub(evicted.weight, Ordering::SeqCst);
            if let Some(handle) = evicted.handle.upgrade() {
                handle.clear_cache();
            }
        }
    }
}

const DEFAULT_CAP_BYTES: u64 = 64 * 1024 * 1024;

static GLOBAL_EXPIRATION: OnceLock<ExpirationStrategy> = OnceLock::new();

pub fn global_expiration() -> &'static ExpirationStrategy {
    GLOBAL_EXPIRATION.get_or_init(|| ExpirationStrategy::new(DEFAULT_CAP_BYTES))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    struct Probe {
        cleared: std::sync::atomic::AtomicBool,
    }

    impl Cacheable for Probe {
        fn clear_cache(&self) {
            self.cleared.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn evicts_least_recently_used_when_over_cap() {
        let strategy = ExpirationStrategy::new(150);
        let a = Arc::new(Probe { cleared: false.into() });
        let b = Arc::new(Probe { cleared: false.into() });
        let c = Arc::new(Probe { cleared: false.into() });

        strategy.use_entry(CacheKey::new("widgets", EntityId::num(1)), Arc::downgrade(&a) as Weak<dyn Cacheable>, 100);
        strategy.use_entry(CacheKey::new("widgets", EntityId::num(2)), Arc::downgrade(&b) as Weak<dyn Cacheable>, 100);
        // Pushes total to 300 > cap 150; "1" is least-recently-used and should be evicted.
        strategy.use_entry(CacheKey::new("widgets", EntityId::num(3)), Arc::downgrade(&c) as Weak<dyn Cacheable>, 100);

        assert!(a.cleared.load(Ordering::SeqCst));
        assert!(!b.cleared.load(Ordering::SeqCst) || !c.cleared.load(Ordering::SeqCst));
        assert!(strategy.used_bytes() <= 150);
    }

    #[test]
    fn refreshing_an_entry_protects_it_from_eviction() {
        let strategy = ExpirationStrategy::new(150);
        let a = Arc::new(Probe { cleared: false.into() });
        let b = Arc::new(Probe { cleared: false.into() });

        strategy.use_entry(CacheKey::new("widgets", EntityId::num(1)), Arc::downgrade(&a) as Weak<dyn Cacheable>, 100);
        strategy.use_entry(CacheKey::new("widgets", EntityId::num(2)), Arc::downgrade(&b) as Weak<dyn Cacheable>, 50);
        // Touch "1" again so "2" becomes the least-recently-used entry.
        strategy.use_entry(CacheKey::new("widgets", EntityId::num(1)), Arc::downgrade(&a) as Weak<dyn Cacheable>, 100);
        strategy.use_entry(CacheKey::new("widgets", EntityId::num(3)), Arc::downgrade(&a.clone()) as Weak<dyn Cacheable>, 60);

        assert!(!a.cleared.load(Ordering::SeqCst));
    }

    #[test]
    fn delete_removes_without_clearing() {
        let strategy = ExpirationStrategy::new(1000);
        let a = Arc::new(Probe { cleared: false.into() });
        let key = CacheKey::new("widgets", EntityId::num(1));
        strategy.use_entry(key.clone(), Arc::downgrade(&a) as Weak<dyn Cacheable>, 10);
        strategy.delete(&key);
        assert_eq!(strategy.used_bytes(), 0);
        assert!(!a.cleared.load(Ordering::SeqCst));
    }
}
