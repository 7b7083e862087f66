//! In-memory cache implementation, used by the test suite.

use anyhow::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::Cache;

/// A `Cache` kept entirely in memory.
///
/// Keys are held in a `BTreeMap` per namespace so iteration order matches
/// the sorted order of the persistent backend.
#[derive(Default)]
pub struct InMemoryCache {
    namespaces: RwLock<HashMap<String, BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Cache for InMemoryCache {
    fn set(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap();
        namespaces
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let namespaces = self.namespaces.read().unwrap();
        Ok(namespaces.get(ns).and_then(|m| m.get(key)).cloned())
    }

    fn del(&self, ns: &str, key: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write().unwrap();
        if let Some(m) = namespaces.get_mut(ns) {
            m.remove(key);
        }
        Ok(())
    }

    fn keys(&self, ns: &str) -> Result<Vec<String>> {
        let namespaces = self.namespaces.read().unwrap();
        Ok(namespaces
            .get(ns)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let cache = InMemoryCache::new();

        assert_eq!(cache.get("ns", "k").unwrap(), None);
        cache.set("ns", "k", b"v").unwrap();
        assert_eq!(cache.get("ns", "k").unwrap(), Some(b"v".to_vec()));
        cache.del("ns", "k").unwrap();
        assert_eq!(cache.get("ns", "k").unwrap(), None);
        cache.del("ns", "k").unwrap();
    }

    #[test]
    fn test_keys_are_sorted() {
        let cache = InMemoryCache::new();
        cache.set("ns", "b", b"").unwrap();
        cache.set("ns", "a", b"").unwrap();
        cache.set("ns", "c", b"").unwrap();
        assert_eq!(cache.keys("ns").unwrap(), vec!["a", "b", "c"]);
    }
}
