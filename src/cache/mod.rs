//! Time bounded caches
//!
//! Entries live for a fixed timespan after insertion. Expired entries are
//! purged lazily on `add` or explicitly with `sweep`; lookups ignore them even
//! before they are purged.

use std::borrow::Borrow;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

struct Entries<K, V> {
    /// Insertion order, newest at the front
    order: VecDeque<(K, Instant)>,
    values: HashMap<K, (V, Instant)>,
}

impl<K: Eq + Hash, V> Entries<K, V> {
    fn purge_expired(&mut self, timespan: Duration, now: Instant) {
        while let Some((_, inserted_at)) = self.order.back() {
            if now.duration_since(*inserted_at) <= timespan {
                break;
            }
            if let Some((key, _)) = self.order.pop_back() {
                self.values.remove(&key);
            }
        }
    }
}

/// Key/value cache whose entries expire `timespan` after insertion
pub struct GenericTimeCache<K, V> {
    timespan: Duration,
    entries: RwLock<Entries<K, V>>,
}

impl<K, V> GenericTimeCache<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new(timespan: Duration) -> Self {
        Self {
            timespan,
            entries: RwLock::new(Entries {
                order: VecDeque::new(),
                values: HashMap::new(),
            }),
        }
    }

    pub fn timespan(&self) -> Duration {
        self.timespan
    }

    /// Insert `key` unless it is already cached.
    ///
    /// Returns false for a key that is present; its value and insertion time
    /// stay unchanged.
    pub fn add(&self, key: K, value: V) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.purge_expired(self.timespan, now);

        if entries.values.contains_key(&key) {
            return false;
        }

        entries.order.push_front((key.clone(), now));
        entries.values.insert(key, (value, now));
        true
    }

    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .values
            .get(key)
            .is_some_and(|(_, inserted_at)| inserted_at.elapsed() <= self.timespan)
    }

    /// Number of stored entries, including expired ones not purged yet
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purge every expired entry
    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .purge_expired(self.timespan, now);
    }
}

impl<K, V> GenericTimeCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .values
            .get(key)
            .filter(|(_, inserted_at)| inserted_at.elapsed() <= self.timespan)
            .map(|(value, _)| value.clone())
    }
}

/// Set of string keys that expire `timespan` after insertion, e.g. to drop
/// duplicate notifications
pub struct TimeCache {
    inner: GenericTimeCache<String, ()>,
}

impl TimeCache {
    pub fn new(timespan: Duration) -> Self {
        Self {
            inner: GenericTimeCache::new(timespan),
        }
    }

    /// Returns false when `key` was already seen within the timespan
    pub fn add(&self, key: impl Into<String>) -> bool {
        self.inner.add(key.into(), ())
    }

    pub fn has(&self, key: &str) -> bool {
        self.inner.has(key)
    }

    pub fn timespan(&self) -> Duration {
        self.inner.timespan()
    }

    pub fn sweep(&self) {
        self.inner.sweep()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
