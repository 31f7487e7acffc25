//! Bounded LRU store for precomputed artifacts

use crate::metrics;
use parking_lot::Mutex;
use prolepsis_core::{ArtifactBundle, StateKey, StateSnapshot};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A cached artifact bundle and the state it was built for
#[derive(Debug)]
pub struct CacheEntry<P> {
    /// Key of `source_state`
    pub key: StateKey,
    /// Precomputed artifacts
    pub artifacts: Arc<ArtifactBundle<P>>,
    /// When the entry was built
    pub created_at: Instant,
    /// State the artifacts were built from
    pub source_state: StateSnapshot,
}

impl<P> CacheEntry<P> {
    /// Create an entry stamped with the current time
    pub fn new(key: StateKey, artifacts: ArtifactBundle<P>, source_state: StateSnapshot) -> Self {
        Self {
            key,
            artifacts: Arc::new(artifacts),
            created_at: Instant::now(),
            source_state,
        }
    }
}

/// Result of an insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// New entry stored, possibly evicting the least recently used one
    Inserted {
        /// Key evicted to make room
        evicted: Option<StateKey>,
    },
    /// Existing entry for the key replaced
    Replaced,
    /// Key already present and left untouched
    Present,
    /// Cache full and every entry pinned; nothing stored
    Rejected,
}

impl PutOutcome {
    /// Whether the entry passed in is now resident
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Inserted { .. } | PutOutcome::Replaced)
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Resident entries
    pub entries: usize,
    /// Maximum entries
    pub capacity: usize,
    /// Entries pinned by open commitments
    pub pinned: usize,
    /// Successful inserts of new keys
    pub insertions: u64,
    /// LRU evictions
    pub evictions: u64,
    /// Explicit invalidations
    pub invalidations: u64,
    /// Inserts refused because every entry was pinned
    pub rejections: u64,
}

impl CacheStats {
    /// Fraction of capacity in use
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries as f64 / self.capacity as f64
        }
    }
}

struct Node<P> {
    entry: Arc<CacheEntry<P>>,
    pins: u32,
    /// Neighbour towards the most recently used end
    prev: Option<StateKey>,
    /// Neighbour towards the least recently used end
    next: Option<StateKey>,
}

/// Recency list threaded through the key map. Keys are `Copy`, so links are
/// stored as keys rather than pointers.
struct LruList<P> {
    nodes: HashMap<StateKey, Node<P>>,
    head: Option<StateKey>,
    tail: Option<StateKey>,
    pinned: usize,
}

impl<P> LruList<P> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            pinned: 0,
        }
    }

    fn len(&self) -> usize {
        self.nodes.len()
    }

    fn detach(&mut self, key: StateKey) {
        let (prev, next) = match self.nodes.get(&key) {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(&p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(&n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes.get_mut(&key) {
            node.prev = None;
            node.next = None;
        }
    }

    fn attach_front(&mut self, key: StateKey) {
        let old_head = self.head;
        match self.nodes.get_mut(&key) {
            Some(node) => {
                node.prev = None;
                node.next = old_head;
            }
            None => return,
        }
        if let Some(h) = old_head {
            if let Some(node) = self.nodes.get_mut(&h) {
                node.prev = Some(key);
            }
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn touch(&mut self, key: StateKey) {
        if self.head != Some(key) {
            self.detach(key);
            self.attach_front(key);
        }
    }

    fn insert_front(&mut self, key: StateKey, entry: Arc<CacheEntry<P>>, pins: u32) {
        if pins > 0 {
            self.pinned += 1;
        }
        self.nodes.insert(
            key,
            Node {
                entry,
                pins,
                prev: None,
                next: None,
            },
        );
        self.attach_front(key);
    }

    fn remove(&mut self, key: StateKey) -> Option<Node<P>> {
        if !self.nodes.contains_key(&key) {
            return None;
        }
        self.detach(key);
        let node = self.nodes.remove(&key)?;
        if node.pins > 0 {
            self.pinned -= 1;
        }
        Some(node)
    }

    /// Least recently used entry that is not pinned
    fn eviction_victim(&self) -> Option<StateKey> {
        let mut cursor = self.tail;
        while let Some(key) = cursor {
            let node = self.nodes.get(&key)?;
            if node.pins == 0 {
                return Some(key);
            }
            cursor = node.prev;
        }
        None
    }

    fn pin(&mut self, key: StateKey) -> bool {
        match self.nodes.get_mut(&key) {
            Some(node) => {
                if node.pins == 0 {
                    self.pinned += 1;
                }
                node.pins += 1;
                true
            }
            None => false,
        }
    }

    fn unpin(&mut self, key: StateKey) -> bool {
        match self.nodes.get_mut(&key) {
            Some(node) if node.pins > 0 => {
                node.pins -= 1;
                if node.pins == 0 {
                    self.pinned -= 1;
                }
                true
            }
            _ => false,
        }
    }

    fn keys_by_recency(&self) -> Vec<StateKey> {
        let mut keys = Vec::with_capacity(self.nodes.len());
        let mut cursor = self.head;
        while let Some(key) = cursor {
            keys.push(key);
            cursor = self.nodes.get(&key).and_then(|n| n.next);
        }
        keys
    }
}

#[derive(Default)]
struct CacheCounters {
    insertions: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
    rejections: AtomicU64,
}

/// Bounded key -> artifact store with LRU eviction.
///
/// All operations take one short lock; nothing is built while it is held.
/// Entries are handed out as `Arc`s, so a reader racing an invalidation sees
/// either the whole entry or a miss. Pinned entries (referenced by an open
/// commitment) are never evicted; when every resident entry is pinned and the
/// cache is full, new inserts are refused rather than exceeding capacity.
pub struct SpeculativeCache<P> {
    capacity: usize,
    inner: Mutex<LruList<P>>,
    counters: CacheCounters,
}

impl<P> SpeculativeCache<P> {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(LruList::with_capacity(capacity)),
            counters: CacheCounters::default(),
        }
    }

    /// Look up an entry and mark it most recently used
    pub fn get(&self, key: &StateKey) -> Option<Arc<CacheEntry<P>>> {
        let mut list = self.inner.lock();
        let entry = list.nodes.get(key).map(|n| Arc::clone(&n.entry))?;
        list.touch(*key);
        Some(entry)
    }

    /// Look up an entry without touching recency
    pub fn peek(&self, key: &StateKey) -> Option<Arc<CacheEntry<P>>> {
        self.inner.lock().nodes.get(key).map(|n| Arc::clone(&n.entry))
    }

    /// Whether a key is resident (recency untouched)
    pub fn contains(&self, key: &StateKey) -> bool {
        self.inner.lock().nodes.contains_key(key)
    }

    /// Insert or replace an entry, evicting the LRU unpinned entry if full
    pub fn put(&self, entry: CacheEntry<P>) -> PutOutcome {
        self.store(entry, StoreMode::Replace)
    }

    /// Insert only if the key is absent
    pub fn put_if_absent(&self, entry: CacheEntry<P>) -> PutOutcome {
        self.store(entry, StoreMode::IfAbsent)
    }

    /// Insert or replace unless the resident entry is pinned
    pub fn put_if_unpinned(&self, entry: CacheEntry<P>) -> PutOutcome {
        self.store(entry, StoreMode::IfUnpinned)
    }

    /// Insert or replace an entry and pin it in the same critical section
    pub fn put_pinned(&self, entry: CacheEntry<P>) -> PutOutcome {
        self.store(entry, StoreMode::Pinned)
    }

    fn store(&self, entry: CacheEntry<P>, mode: StoreMode) -> PutOutcome {
        let key = entry.key;
        let entry = Arc::new(entry);

        let outcome = {
            let mut list = self.inner.lock();
            let resident_pins = list.nodes.get(&key).map(|n| n.pins);

            match resident_pins {
                Some(_) if mode == StoreMode::IfAbsent => PutOutcome::Present,
                Some(pins) if pins > 0 && mode == StoreMode::IfUnpinned => PutOutcome::Present,
                Some(_) => {
                    if let Some(node) = list.nodes.get_mut(&key) {
                        node.entry = entry;
                    }
                    list.touch(key);
                    if mode == StoreMode::Pinned {
                        list.pin(key);
                    }
                    PutOutcome::Replaced
                }
                None => {
                    let mut evicted = None;
                    if list.len() >= self.capacity {
                        match list.eviction_victim() {
                            Some(victim) => {
                                list.remove(victim);
                                evicted = Some(victim);
                            }
                            None => {
                                drop(list);
                                self.counters.rejections.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    "Cache full with {} pinned entries, not storing {}",
                                    self.capacity, key
                                );
                                return PutOutcome::Rejected;
                            }
                        }
                    }
                    let pins = u32::from(mode == StoreMode::Pinned);
                    list.insert_front(key, entry, pins);
                    PutOutcome::Inserted { evicted }
                }
            }
        };

        if let PutOutcome::Inserted { evicted } = outcome {
            self.counters.insertions.fetch_add(1, Ordering::Relaxed);
            if let Some(victim) = evicted {
                self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                metrics::record_eviction();
                debug!("Evicted {} to make room for {}", victim, key);
            }
        }

        outcome
    }

    /// Remove an entry regardless of recency or pins
    pub fn invalidate(&self, key: &StateKey) -> Option<Arc<CacheEntry<P>>> {
        let removed = self.inner.lock().remove(*key).map(|n| n.entry);
        if removed.is_some() {
            self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!("Invalidated {}", key);
        }
        removed
    }

    /// Protect an entry from eviction. Pins are counted.
    pub fn pin(&self, key: &StateKey) -> bool {
        self.inner.lock().pin(*key)
    }

    /// Release one pin
    pub fn unpin(&self, key: &StateKey) -> bool {
        self.inner.lock().unpin(*key)
    }

    /// Whether an entry is pinned
    pub fn is_pinned(&self, key: &StateKey) -> bool {
        self.inner.lock().nodes.get(key).is_some_and(|n| n.pins > 0)
    }

    /// Resident entries
    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    /// Maximum entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Keys from most to least recently used
    pub fn keys_by_recency(&self) -> Vec<StateKey> {
        self.inner.lock().keys_by_recency()
    }

    /// Drop every unpinned entry
    pub fn clear(&self) -> usize {
        let mut list = self.inner.lock();
        let unpinned: Vec<StateKey> = list
            .nodes
            .iter()
            .filter(|(_, n)| n.pins == 0)
            .map(|(k, _)| *k)
            .collect();
        for key in &unpinned {
            list.remove(*key);
        }
        unpinned.len()
    }

    /// Cache statistics
    pub fn stats(&self) -> CacheStats {
        let (entries, pinned) = {
            let list = self.inner.lock();
            (list.len(), list.pinned)
        };

        CacheStats {
            entries,
            capacity: self.capacity,
            pinned,
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreMode {
    Replace,
    IfAbsent,
    IfUnpinned,
    Pinned,
}
