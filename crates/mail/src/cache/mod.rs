//! Durable cache abstraction.
//!
//! The cache is a namespaced byte-store: `(namespace, key) -> bytes`. The
//! trait-based design allows swapping the on-disk `redb` backend for an
//! in-memory implementation in tests. Encoding of typed values is the
//! caller's responsibility and must be deterministic.

mod memory;
mod persistent;

pub use memory::InMemoryCache;
pub use persistent::RedbCache;

use anyhow::Result;

/// A namespaced key/value byte-store.
///
/// `set` and `del` are durable once they return. There is no atomicity
/// across namespaces; callers that need it must sequence operations
/// themselves.
pub trait Cache: Send + Sync {
    /// Store `value` under `(ns, key)`, committing before returning.
    fn set(&self, ns: &str, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value under `(ns, key)`. Returns `None` when either the
    /// namespace or the key is absent.
    fn get(&self, ns: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `(ns, key)`. Deleting an absent key is a no-op.
    fn del(&self, ns: &str, key: &str) -> Result<()>;

    /// All keys currently present in `ns`, in stable (sorted) order.
    fn keys(&self, ns: &str) -> Result<Vec<String>>;
}
