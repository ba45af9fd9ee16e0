//! Bounded in-memory cache with max-size eviction.
//!
//! Used for burn-history records: on-chain burns are immutable facts, so a
//! process-lifetime cache amortizes provider RPC cost across payout rounds.
//! The size bound prevents unbounded growth under adversarial query volume.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Instant;

pub struct BoundedCache<K, V> {
    map: HashMap<K, (V, Instant)>,
    max_size: usize,
}

impl<K: Eq + Hash + Clone, V> BoundedCache<K, V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            map: HashMap::new(),
            max_size,
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key).map(|(v, _)| v)
    }

    pub fn insert(&mut self, key: K, value: V) {
        while self.map.len() >= self.max_size && !self.map.is_empty() {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, (_, t))| *t)
                .map(|(k, _)| k.clone());
            if let Some(k) = oldest {
                self.map.remove(&k);
            } else {
                break;
            }
        }
        self.map.insert(key, (value, Instant::now()));
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = BoundedCache::new(10);
        cache.insert(("a".to_string(), 1u64), "hello");
        assert_eq!(cache.get(&("a".to_string(), 1)), Some(&"hello"));
        assert!(cache.get(&("a".to_string(), 2)).is_none());
    }

    #[test]
    fn test_evicts_oldest_at_capacity() {
        let mut cache = BoundedCache::new(2);
        cache.insert(1u32, "a");
        cache.insert(2u32, "b");
        cache.insert(3u32, "c");
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&3), Some(&"c"));
        assert_eq!(cache.len(), 2);
    }
}
