use metrics::{counter, gauge, Counter, Gauge};
use parking_lot::Mutex;
use rivet_primitives::Hash256;
use schnellru::{LruMap, Unlimited};
use std::{fmt, hash::Hash};

/// Default byte budget of the merkle-node cache.
pub const DEFAULT_NODE_CACHE_BYTES: usize = 8 * 1024 * 1024;
/// Default byte budget of the value cache.
pub const DEFAULT_VALUE_CACHE_BYTES: usize = 2 * 1024 * 1024;

/// Keys whose resident size the cache can account for.
trait EntrySize: Hash + Eq {
    fn byte_len(&self) -> usize;
}

impl EntrySize for Hash256 {
    fn byte_len(&self) -> usize {
        32
    }
}

impl EntrySize for Vec<u8> {
    fn byte_len(&self) -> usize {
        self.len()
    }
}

/// An LRU map bounded by the approximate byte size of its entries.
struct BoundedCache<K: EntrySize> {
    map: LruMap<K, Vec<u8>, Unlimited>,
    budget: usize,
    used: usize,
}

impl<K: EntrySize> BoundedCache<K> {
    fn new(budget: usize) -> Self {
        Self { map: LruMap::new(Unlimited), budget, used: 0 }
    }

    fn get(&mut self, key: &K) -> Option<Vec<u8>> {
        self.map.get(key).map(|value| value.clone())
    }

    fn insert(&mut self, key: K, value: Vec<u8>) {
        let size = key.byte_len() + value.len();
        if let Some(old) = self.map.peek(&key) {
            self.used -= key.byte_len() + old.len();
        }
        self.used += size;
        let _ = self.map.insert(key, value);
        while self.used > self.budget {
            let Some((key, value)) = self.map.pop_oldest() else { break };
            self.used -= key.byte_len() + value.len();
        }
    }
}

struct CacheMetrics {
    hits: Counter,
    misses: Counter,
    resident_bytes: Gauge,
}

impl CacheMetrics {
    fn new(cache: &'static str) -> Self {
        Self {
            hits: counter!("trie_cache_hits", "cache" => cache),
            misses: counter!("trie_cache_misses", "cache" => cache),
            resident_bytes: gauge!("trie_cache_resident_bytes", "cache" => cache),
        }
    }
}

/// Shared cache of encoded merkle nodes and hot values.
///
/// One instance is shared by every [`TrieState`](crate::TrieState) of the node (wrap it
/// in an `Arc`). The node cache maps merkle hash to canonical node encoding and is fed
/// on every root computation; the pruner and the state backend resolve node hashes
/// through it. The value cache keeps hot lookups, currently the runtime code blob keyed
/// by its hash.
pub struct TrieCache {
    nodes: Mutex<BoundedCache<Hash256>>,
    values: Mutex<BoundedCache<Vec<u8>>>,
    node_metrics: CacheMetrics,
    value_metrics: CacheMetrics,
}

impl TrieCache {
    /// Creates a cache with the default byte budgets.
    pub fn new() -> Self {
        Self::with_budgets(DEFAULT_NODE_CACHE_BYTES, DEFAULT_VALUE_CACHE_BYTES)
    }

    /// Creates a cache with explicit byte budgets.
    pub fn with_budgets(node_bytes: usize, value_bytes: usize) -> Self {
        Self {
            nodes: Mutex::new(BoundedCache::new(node_bytes)),
            values: Mutex::new(BoundedCache::new(value_bytes)),
            node_metrics: CacheMetrics::new("nodes"),
            value_metrics: CacheMetrics::new("values"),
        }
    }

    /// Returns the canonical encoding of the node with the given merkle hash.
    pub fn node(&self, hash: &Hash256) -> Option<Vec<u8>> {
        let found = self.nodes.lock().get(hash);
        match &found {
            Some(_) => self.node_metrics.hits.increment(1),
            None => self.node_metrics.misses.increment(1),
        }
        found
    }

    /// Caches the canonical encoding of a node.
    pub fn insert_node(&self, hash: Hash256, encoded: Vec<u8>) {
        let mut nodes = self.nodes.lock();
        nodes.insert(hash, encoded);
        self.node_metrics.resident_bytes.set(nodes.used as f64);
    }

    /// Returns the cached value under `key`.
    pub fn value(&self, key: &[u8]) -> Option<Vec<u8>> {
        let found = self.values.lock().get(&key.to_vec());
        match &found {
            Some(_) => self.value_metrics.hits.increment(1),
            None => self.value_metrics.misses.increment(1),
        }
        found
    }

    /// Caches a value under `key`.
    pub fn insert_value(&self, key: Vec<u8>, value: Vec<u8>) {
        let mut values = self.values.lock();
        values.insert(key, value);
        self.value_metrics.resident_bytes.set(values.used as f64);
    }
}

impl Default for TrieCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrieCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrieCache")
            .field("node_bytes", &self.nodes.lock().used)
            .field("value_bytes", &self.values.lock().used)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_honors_byte_budget() {
        // Each entry is 32 (key) + 16 (value) bytes; three of them exceed the budget.
        let cache = TrieCache::with_budgets(2 * 48, 64);
        let hashes: Vec<Hash256> = (1u8..=3).map(Hash256::repeat_byte).collect();
        for hash in &hashes {
            cache.insert_node(*hash, vec![0; 16]);
        }

        assert_eq!(cache.node(&hashes[0]), None);
        assert_eq!(cache.node(&hashes[1]), Some(vec![0; 16]));
        assert_eq!(cache.node(&hashes[2]), Some(vec![0; 16]));
    }

    #[test]
    fn reinsert_replaces_accounting() {
        let cache = TrieCache::with_budgets(1024, 1024);
        let hash = Hash256::repeat_byte(9);
        cache.insert_node(hash, vec![0; 100]);
        cache.insert_node(hash, vec![1; 10]);
        assert_eq!(cache.node(&hash), Some(vec![1; 10]));
        assert_eq!(cache.nodes.lock().used, 42);
    }

    #[test]
    fn value_cache_round_trip() {
        let cache = TrieCache::with_budgets(64, 1024);
        assert_eq!(cache.value(b"missing"), None);
        cache.insert_value(b"code-hash".to_vec(), b"wasm".to_vec());
        assert_eq!(cache.value(b"code-hash"), Some(b"wasm".to_vec()));
    }
}
