//! Bounded process-local cache in front of the store.
//!
//! Entries carry a use tick; once the cache holds more than `capacity`
//! entries, the least recently used tenth is evicted in one pass.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

pub const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct LocalCache<V> {
    entries: DashMap<String, (V, u64)>,
    tick: AtomicU64,
    capacity: usize,
}

impl<V: Clone> LocalCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            tick: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let tick = self.next_tick();
        self.entries.get_mut(key).map(|mut entry| {
            entry.1 = tick;
            entry.0.clone()
        })
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        let tick = self.next_tick();
        self.entries.insert(key.into(), (value, tick));
        self.evict();
    }

    /// Value already cached under `key`, or `value` once inserted.
    pub fn get_or_insert(&self, key: impl Into<String>, value: V) -> V {
        let tick = self.next_tick();
        let kept = {
            let mut entry = self.entries.entry(key.into()).or_insert((value, tick));
            entry.1 = tick;
            entry.0.clone()
        };
        self.evict();
        kept
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, (v, _))| v)
    }

    /// Drop every entry whose key satisfies `pred`.
    pub fn remove_where(&self, pred: impl Fn(&str) -> bool) {
        self.entries.retain(|k, _| !pred(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn evict(&self) {
        let len = self.entries.len();
        if len <= self.capacity {
            return;
        }
        let target = self.capacity - self.capacity / 10;
        let mut ages: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().1))
            .collect();
        ages.sort_unstable_by_key(|(_, tick)| *tick);
        let excess = len.saturating_sub(target);
        for (key, _) in ages.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        log::debug!("Local cache evicted {} entries (capacity {})", excess, self.capacity);
    }
}
