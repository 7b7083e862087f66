//! Persistent cache implementation using redb.
//!
//! A single database file holds one redb table per namespace. Tables are
//! created lazily on first write, and reads tolerate namespaces that have
//! never been written.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition, TableError};
use std::path::Path;

use super::Cache;

fn table(ns: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
    TableDefinition::new(ns)
}

/// On-disk cache backed by a single redb database file.
pub struct RedbCache {
    db: Database,
}

impl RedbCache {
    /// Open the database at `path`, creating it if it does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = Database::create(path)
            .with_context(|| format!("failed to open cache database at {}", path.display()))?;
        Ok(Self { db })
    }
}

impl Cache for RedbCache {
    fn set(&self, ns: &str, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = write_txn.open_table(table(ns))?;
            t.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let t = match read_txn.open_table(table(ns)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(t.get(key)?.map(|v| v.value().to_vec()))
    }

    fn del(&self, ns: &str, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut t = match write_txn.open_table(table(ns)) {
                Ok(t) => t,
                Err(TableError::TableDoesNotExist(_)) => return Ok(()),
                Err(e) => return Err(e.into()),
            };
            t.remove(key)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn keys(&self, ns: &str) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let t = match read_txn.open_table(table(ns)) {
            Ok(t) => t,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut keys = Vec::new();
        for entry in t.iter()? {
            let (k, _) = entry?;
            keys.push(k.value().to_string());
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_set_get_roundtrip() {
        let dir = tempdir().unwrap();
        let cache = RedbCache::open(dir.path().join("cache")).unwrap();

        assert_eq!(cache.get("ns", "k").unwrap(), None);
        cache.set("ns", "k", b"value").unwrap();
        assert_eq!(cache.get("ns", "k").unwrap(), Some(b"value".to_vec()));

        // Absent namespace reads as absent key.
        assert_eq!(cache.get("other", "k").unwrap(), None);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cache");

        let cache = RedbCache::open(&path).unwrap();
        cache.set("ns", "k", b"v").unwrap();
        drop(cache);

        let cache = RedbCache::open(&path).unwrap();
        assert_eq!(cache.get("ns", "k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_del_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = RedbCache::open(dir.path().join("cache")).unwrap();

        cache.del("ns", "missing").unwrap();
        cache.set("ns", "k", b"v").unwrap();
        cache.del("ns", "k").unwrap();
        cache.del("ns", "k").unwrap();
        assert_eq!(cache.get("ns", "k").unwrap(), None);
    }

    #[test]
    fn test_keys_sorted_per_namespace() {
        let dir = tempdir().unwrap();
        let cache = RedbCache::open(dir.path().join("cache")).unwrap();

        cache.set("a", "2", b"").unwrap();
        cache.set("a", "1", b"").unwrap();
        cache.set("b", "3", b"").unwrap();

        assert_eq!(cache.keys("a").unwrap(), vec!["1", "2"]);
        assert_eq!(cache.keys("b").unwrap(), vec!["3"]);
        assert!(cache.keys("c").unwrap().is_empty());
    }
}
