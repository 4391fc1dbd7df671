//! In-memory image cache with LRU eviction.

use crate::cache::ImageCache;
use crate::image::ImageContainer;
use crate::request::LoadKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// Default cost limit: 256 MB of decoded pixels.
pub const DEFAULT_COST_LIMIT: usize = 256 * 1024 * 1024;

/// Entry in the memory cache.
struct CacheEntry {
    image: ImageContainer,
    /// Cost in bytes, captured at insertion.
    cost: usize,
    /// Logical access tick for LRU eviction.
    last_accessed: u64,
}

struct Inner {
    entries: HashMap<LoadKey, CacheEntry>,
    total_cost: usize,
    tick: u64,
    stats: MemoryCacheStats,
}

/// Statistics for monitoring cache effectiveness.
#[derive(Debug, Default, Clone)]
pub struct MemoryCacheStats {
    /// Lookups that found an entry.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
}

impl MemoryCacheStats {
    /// Returns the hit ratio (0.0 to 1.0).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Size-bounded image cache evicting least-recently-used entries.
///
/// Cost is measured in bitmap bytes. Suitable as the default
/// [`ImageCache`] for callers that do not bring their own.
pub struct MemoryImageCache {
    inner: Mutex<Inner>,
    cost_limit: usize,
}

impl MemoryImageCache {
    /// Creates a cache with the given cost limit in bytes.
    pub fn new(cost_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total_cost: 0,
                tick: 0,
                stats: MemoryCacheStats::default(),
            }),
            cost_limit,
        }
    }

    /// Returns the configured cost limit in bytes.
    pub fn cost_limit(&self) -> usize {
        self.cost_limit
    }

    /// Returns the current number of cached images.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Returns the current total cost in bytes.
    pub fn total_cost(&self) -> usize {
        self.inner.lock().unwrap().total_cost
    }

    /// Returns a snapshot of the cache statistics.
    pub fn stats(&self) -> MemoryCacheStats {
        self.inner.lock().unwrap().stats.clone()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.total_cost = 0;
    }

    /// Removes the entry for a key, if present.
    pub fn remove(&self, key: &LoadKey) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            inner.total_cost -= entry.cost;
        }
    }
}

impl Inner {
    /// Evicts least-recently-used entries until `required` bytes fit under
    /// the limit.
    fn evict_until_fits(&mut self, required: usize, limit: usize) {
        let target = limit.saturating_sub(required);
        while self.total_cost > target {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(key, _)| key.clone());
            let Some(key) = oldest else { break };
            if let Some(entry) = self.entries.remove(&key) {
                self.total_cost -= entry.cost;
                self.stats.evictions += 1;
            }
        }
    }
}

impl ImageCache for MemoryImageCache {
    fn get(&self, key: &LoadKey) -> Option<ImageContainer> {
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed = tick;
                let image = entry.image.clone();
                inner.stats.hits += 1;
                Some(image)
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    fn set(&self, key: LoadKey, image: ImageContainer) {
        let cost = image.cost();
        let mut inner = self.inner.lock().unwrap();
        inner.tick += 1;
        let tick = inner.tick;
        if let Some(previous) = inner.entries.remove(&key) {
            inner.total_cost -= previous.cost;
        }
        if inner.total_cost + cost > self.cost_limit {
            inner.evict_until_fits(cost, self.cost_limit);
        }
        inner.entries.insert(
            key,
            CacheEntry {
                image,
                cost,
                last_accessed: tick,
            },
        );
        inner.total_cost += cost;
    }
}

impl Default for MemoryImageCache {
    fn default() -> Self {
        Self::new(DEFAULT_COST_LIMIT)
    }
}
