// Copyright 2024 The Basalt Authors
// SPDX-License-Identifier: Apache-2.0

//! Bounded least-frequently-used cache.
//!
//! Entries track an access count and the tick of their last access. When the
//! cache is full the entry with the lowest count is evicted; ties go to the
//! entry touched longest ago.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

struct Entry<V> {
    value: V,
    frequency: u64,
    tick: u64,
}

/// A bounded LFU cache.
pub struct LfuCache<K, V> {
    capacity: usize,
    entries: HashMap<K, Entry<V>>,
    order: BTreeSet<(u64, u64, K)>,
    tick: u64,
}

impl<K, V> LfuCache<K, V>
where
    K: Eq + Hash + Ord + Clone,
{
    /// Creates a cache holding at most `capacity` entries.
    ///
    /// A capacity of zero disables caching.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: HashMap::new(), order: BTreeSet::new(), tick: 0 }
    }

    /// Returns the number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `key` is cached, without counting an access.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Looks up `key`, counting an access on a hit.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.tick += 1;
        let tick = self.tick;
        let entry = self.entries.get_mut(key)?;
        self.order.remove(&(entry.frequency, entry.tick, key.clone()));
        entry.frequency += 1;
        entry.tick = tick;
        self.order.insert((entry.frequency, entry.tick, key.clone()));
        Some(&entry.value)
    }

    /// Inserts or replaces `key`, evicting if the cache is full.
    ///
    /// Returns the evicted key, if any.
    pub fn put(&mut self, key: K, value: V) -> Option<K> {
        if self.capacity == 0 {
            return None;
        }
        self.tick += 1;
        let tick = self.tick;

        if let Some(entry) = self.entries.get_mut(&key) {
            self.order.remove(&(entry.frequency, entry.tick, key.clone()));
            entry.value = value;
            entry.frequency += 1;
            entry.tick = tick;
            self.order.insert((entry.frequency, entry.tick, key));
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            if let Some((_, _, victim)) = self.order.pop_first() {
                self.entries.remove(&victim);
                evicted = Some(victim);
            }
        }

        self.order.insert((1, tick, key.clone()));
        self.entries.insert(key, Entry { value, frequency: 1, tick });
        evicted
    }

    /// Removes `key` from the cache.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&(entry.frequency, entry.tick, key.clone()));
        Some(entry.value)
    }

    /// Removes every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&K, &V) -> bool) {
        let doomed: Vec<K> =
            self.entries.iter().filter(|(k, e)| !keep(k, &e.value)).map(|(k, _)| k.clone()).collect();
        for key in doomed {
            self.remove(&key);
        }
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_slot_evicts_previous_entry() {
        let mut cache = LfuCache::new(1);
        assert_eq!(cache.put("a", 1), None);
        assert_eq!(cache.put("b", 2), Some("a"));

        assert!(cache.get(&"a").is_none());
        assert_eq!(cache.get(&"b"), Some(&2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_least_frequently_used() {
        let mut cache = LfuCache::new(2);
        cache.put(1u64, "one");
        cache.put(2u64, "two");

        // Key 1 is read twice, key 2 never.
        cache.get(&1);
        cache.get(&1);

        assert_eq!(cache.put(3, "three"), Some(2));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
    }

    #[test]
    fn test_frequency_tie_evicts_oldest() {
        let mut cache = LfuCache::new(2);
        cache.put(1u64, ());
        cache.put(2u64, ());
        cache.get(&1);
        cache.get(&2);

        // Both have frequency 2; key 1 was touched first.
        assert_eq!(cache.put(3, ()), Some(1));
    }

    #[test]
    fn test_replace_keeps_single_entry() {
        let mut cache = LfuCache::new(2);
        cache.put(1u64, "old");
        cache.put(1u64, "new");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some(&"new"));
    }

    #[test]
    fn test_retain_and_zero_capacity() {
        let mut cache = LfuCache::new(4);
        for k in 0u64..4 {
            cache.put(k, k * 10);
        }
        cache.retain(|k, _| k % 2 == 0);
        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&0) && cache.contains(&2));

        let mut disabled = LfuCache::new(0);
        assert_eq!(disabled.put(1u64, ()), None);
        assert!(disabled.is_empty());
    }
}
