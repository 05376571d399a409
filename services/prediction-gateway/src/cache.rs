//! Process-wide prediction cache: (model version, feature row) -> score.
//!
//! Eviction follows ARC (Adaptive Replacement Cache). Resident entries live
//! in T1 (seen once) or T2 (seen again); B1/B2 remember keys recently
//! evicted from each. A hit in B1 grows the target size `p` of T1, a hit in
//! B2 shrinks it, so the split between recency and frequency follows the
//! workload. Entries also expire `ttl` after insertion, checked lazily.
//!
//! A capacity or ttl of zero disables the cache entirely.

use parking_lot::Mutex;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::engine::FeatureRow;
use crate::metrics::metrics;
use crate::registry::VersionTag;

/// Cache key: model version plus the exact row. Versions change on file
/// replacement, so a reloaded model never sees its predecessor's scores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model: VersionTag,
    row: FeatureRow,
}

impl CacheKey {
    pub fn new(model: VersionTag, row: FeatureRow) -> Self { Self { model, row } }
    pub fn row(&self) -> &FeatureRow { &self.row }
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    value: f64,
    inserted_at: Instant,
}

/// LRU-ordered key list; ticks are unique and increasing, so the smallest
/// tick is the least recently used key.
#[derive(Debug)]
struct RecencyList<K> {
    order: BTreeMap<u64, K>,
    index: HashMap<K, u64>,
}

impl<K: Hash + Eq + Clone> RecencyList<K> {
    fn new() -> Self { Self { order: BTreeMap::new(), index: HashMap::new() } }

    fn len(&self) -> usize { self.index.len() }

    fn contains<Q>(&self, key: &Q) -> bool
    where K: Borrow<Q>, Q: Hash + Eq + ?Sized {
        self.index.contains_key(key)
    }

    fn push_mru(&mut self, key: K, tick: u64) {
        if let Some(old) = self.index.insert(key.clone(), tick) { self.order.remove(&old); }
        self.order.insert(tick, key);
    }

    fn remove<Q>(&mut self, key: &Q) -> bool
    where K: Borrow<Q>, Q: Hash + Eq + ?Sized {
        match self.index.remove(key) {
            Some(tick) => { self.order.remove(&tick); true }
            None => false,
        }
    }

    fn pop_lru(&mut self) -> Option<K> {
        let (_, key) = self.order.pop_first()?;
        self.index.remove(&key);
        Some(key)
    }
}

#[derive(Debug)]
struct ArcState {
    capacity: usize,
    /// Target size of T1.
    p: usize,
    tick: u64,
    t1: RecencyList<Arc<CacheKey>>,
    t2: RecencyList<Arc<CacheKey>>,
    b1: RecencyList<Arc<CacheKey>>,
    b2: RecencyList<Arc<CacheKey>>,
    entries: HashMap<Arc<CacheKey>, CacheEntry>,
    evictions: u64,
}

impl ArcState {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            tick: 0,
            t1: RecencyList::new(),
            t2: RecencyList::new(),
            b1: RecencyList::new(),
            b2: RecencyList::new(),
            entries: HashMap::with_capacity(capacity.min(1 << 16)),
            evictions: 0,
        }
    }

    fn next_tick(&mut self) -> u64 { self.tick += 1; self.tick }

    fn get(&mut self, key: &CacheKey, now: Instant, ttl: Duration) -> Option<f64> {
        let (shared, entry) = self.entries.get_key_value(key).map(|(k, e)| (k.clone(), *e))?;
        if now.saturating_duration_since(entry.inserted_at) > ttl {
            self.entries.remove(key);
            self.t1.remove(key);
            self.t2.remove(key);
            return None;
        }
        self.t1.remove(key);
        let tick = self.next_tick();
        self.t2.push_mru(shared, tick);
        Some(entry.value)
    }

    fn insert(&mut self, key: CacheKey, value: f64, now: Instant) {
        let entry = CacheEntry { value, inserted_at: now };
        if let Some(shared) = self.entries.get_key_value(&key).map(|(k, _)| k.clone()) {
            self.t1.remove(&key);
            let tick = self.next_tick();
            self.t2.push_mru(shared.clone(), tick);
            self.entries.insert(shared, entry);
            return;
        }

        let key = Arc::new(key);
        if self.b1.contains(&key) {
            let delta = (self.b2.len() / self.b1.len()).max(1);
            self.p = (self.p + delta).min(self.capacity);
            self.b1.remove(&key);
            self.replace(false);
            let tick = self.next_tick();
            self.t2.push_mru(key.clone(), tick);
        } else if self.b2.contains(&key) {
            let delta = (self.b1.len() / self.b2.len()).max(1);
            self.p = self.p.saturating_sub(delta);
            self.b2.remove(&key);
            self.replace(true);
            let tick = self.next_tick();
            self.t2.push_mru(key.clone(), tick);
        } else {
            let l1 = self.t1.len() + self.b1.len();
            let total = l1 + self.t2.len() + self.b2.len();
            if l1 >= self.capacity {
                if self.t1.len() < self.capacity {
                    self.b1.pop_lru();
                    self.replace(false);
                } else if let Some(victim) = self.t1.pop_lru() {
                    self.entries.remove(&victim);
                    self.evictions += 1;
                }
            } else if total >= self.capacity {
                if total >= 2 * self.capacity { self.b2.pop_lru(); }
                self.replace(false);
            }
            let tick = self.next_tick();
            self.t1.push_mru(key.clone(), tick);
        }
        self.entries.insert(key, entry);
    }

    /// Demote one resident entry to its ghost list when the cache is full.
    fn replace(&mut self, hit_in_b2: bool) {
        if self.t1.len() + self.t2.len() < self.capacity { return; }
        let t1_len = self.t1.len();
        let from_t1 = t1_len > 0 && (t1_len > self.p || (hit_in_b2 && t1_len == self.p) || self.t2.len() == 0);
        let victim = if from_t1 { self.t1.pop_lru() } else { self.t2.pop_lru() };
        if let Some(victim) = victim {
            self.entries.remove(&victim);
            self.evictions += 1;
            let tick = self.next_tick();
            if from_t1 { self.b1.push_mru(victim, tick); } else { self.b2.push_mru(victim, tick); }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

/// Thread-safe ARC + TTL cache. All methods take `&self`.
#[derive(Debug)]
pub struct PredictionCache {
    ttl: Duration,
    state: Option<Mutex<ArcState>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PredictionCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let state = (capacity > 0 && !ttl.is_zero()).then(|| Mutex::new(ArcState::new(capacity)));
        Self { ttl, state, hits: AtomicU64::new(0), misses: AtomicU64::new(0) }
    }

    pub fn disabled() -> Self { Self::new(0, Duration::ZERO) }

    pub fn is_enabled(&self) -> bool { self.state.is_some() }

    pub fn get(&self, key: &CacheKey) -> Option<f64> {
        let state = self.state.as_ref()?;
        let found = state.lock().get(key, Instant::now(), self.ttl);
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics().cache_hits_total.add(1, &[]);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics().cache_misses_total.add(1, &[]);
        }
        found
    }

    pub fn insert(&self, key: CacheKey, value: f64) {
        let Some(state) = self.state.as_ref() else { return };
        let evicted = {
            let mut st = state.lock();
            let before = st.evictions;
            st.insert(key, value, Instant::now());
            st.evictions - before
        };
        if evicted > 0 { metrics().cache_evictions_total.add(evicted, &[]); }
    }

    pub fn len(&self) -> usize { self.state.as_ref().map(|s| s.lock().entries.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn stats(&self) -> CacheStats {
        let (len, capacity, evictions) = self.state.as_ref()
            .map(|s| { let st = s.lock(); (st.entries.len(), st.capacity, st.evictions) })
            .unwrap_or((0, 0, 0));
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions,
            len,
            capacity,
        }
    }
}
