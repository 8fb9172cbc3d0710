// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// A small least-recently-used cache: a stamp per entry, oldest stamp evicted
/// first. Reads refresh the stamp.
pub struct LruCache<K, V> {
    capacity: usize,
    next_stamp: u64,
    entries: HashMap<K, (u64, V)>,
    order: BTreeMap<u64, K>,
}

impl<K: Eq + Hash + Copy, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            capacity,
            next_stamp: 0,
            entries: HashMap::new(),
            order: BTreeMap::new(),
        }
    }

    fn stamp(&mut self) -> u64 {
        let s = self.next_stamp;
        self.next_stamp += 1;
        s
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let fresh = self.stamp();
        let (stamp, value) = self.entries.get_mut(key)?;
        let old = std::mem::replace(stamp, fresh);
        self.order.remove(&old);
        self.order.insert(fresh, *key);
        Some(value.clone())
    }

    pub fn put(&mut self, key: K, value: V) {
        let fresh = self.stamp();
        if let Some((old, _)) = self.entries.insert(key, (fresh, value)) {
            self.order.remove(&old);
        }
        self.order.insert(fresh, key);
        while self.entries.len() > self.capacity {
            let (&oldest, _) = match self.order.iter().next() {
                Some(entry) => entry,
                None => break,
            };
            if let Some(victim) = self.order.remove(&oldest) {
                self.entries.remove(&victim);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::LruCache;

    #[test]
    fn evicts_least_recently_used() {
        let mut cache = LruCache::new(2);
        cache.put(1u32, "a");
        cache.put(2, "b");
        assert_eq!(cache.get(&1), Some("a")); // refresh 1
        cache.put(3, "c"); // evicts 2
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&3), Some("c"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let mut cache = LruCache::new(2);
        cache.put(1u32, "a");
        cache.put(1, "b");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1), Some("b"));
    }
}
