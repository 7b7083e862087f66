//! Label delta computation.
//!
//! Pure decisions over the cached label set. Both functions sort their
//! inputs in place for comparison; callers must not rely on post-call
//! ordering.

use anyhow::Result;
use log::warn;
use std::collections::BTreeSet;

use crate::gmail::MailCache;
use crate::models::MessageId;

/// Fold an `(added, removed)` pair from a history record into the cached
/// label set: `(cached ∪ added) \ removed`, returned sorted.
///
/// When the cache holds nothing for `mid` — a message whose Add we never
/// saw, e.g. a chat — `added` is returned unchanged.
pub fn compute_labels(
    cache: &MailCache,
    mid: &MessageId,
    added: Vec<String>,
    removed: Vec<String>,
) -> Result<Vec<String>> {
    let Some(cached) = cache.msg_labels(mid)? else {
        warn!("No cached labels for {mid}; applying label change as-is");
        return Ok(added);
    };
    let mut labels: BTreeSet<String> = cached.into_iter().chain(added).collect();
    for label in &removed {
        labels.remove(label);
    }
    Ok(labels.into_iter().collect())
}

/// Whether `new_labels` differs from the cached set for `mid`, compared as
/// sorted sequences. An uncached `mid` always counts as changed.
pub fn labels_changed(
    cache: &MailCache,
    mid: &MessageId,
    new_labels: &mut [String],
) -> Result<bool> {
    let Some(mut cached) = cache.msg_labels(mid)? else {
        return Ok(true);
    };
    cached.sort_unstable();
    new_labels.sort_unstable();
    Ok(cached.len() != new_labels.len()
        || cached.iter().zip(new_labels.iter()).any(|(a, b)| a != b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCache;
    use std::sync::Arc;

    fn cache_with(mid: &str, labels: &[&str]) -> MailCache {
        let cache = MailCache::new(Arc::new(InMemoryCache::new()));
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        cache.set_msg_labels(&MessageId::new(mid), &labels).unwrap();
        cache
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compute_labels_folds_changes() {
        let cache = cache_with("id", &["a", "b"]);
        let labels = compute_labels(
            &cache,
            &MessageId::new("id"),
            strings(&["c"]),
            strings(&["b"]),
        )
        .unwrap();
        assert_eq!(labels, strings(&["a", "c"]));
    }

    #[test]
    fn test_compute_labels_empty_delta_is_identity() {
        let cache = cache_with("id", &["a", "b"]);
        let labels =
            compute_labels(&cache, &MessageId::new("id"), Vec::new(), Vec::new()).unwrap();
        assert_eq!(labels, strings(&["a", "b"]));
    }

    #[test]
    fn test_compute_labels_miss_returns_added() {
        let cache = MailCache::new(Arc::new(InMemoryCache::new()));
        let labels = compute_labels(
            &cache,
            &MessageId::new("unknown"),
            strings(&["x"]),
            strings(&["y"]),
        )
        .unwrap();
        assert_eq!(labels, strings(&["x"]));
    }

    #[test]
    fn test_labels_changed_detects_differences() {
        let cache = cache_with("id", &["a", "b"]);
        let mid = MessageId::new("id");

        assert!(labels_changed(&cache, &mid, &mut strings(&["a"])).unwrap());
        assert!(!labels_changed(&cache, &mid, &mut strings(&["a", "b"])).unwrap());
        assert!(labels_changed(&cache, &mid, &mut strings(&[])).unwrap());
        assert!(labels_changed(&cache, &mid, &mut strings(&["a", "b", "c"])).unwrap());
    }

    #[test]
    fn test_labels_changed_ignores_ordering() {
        let cache = cache_with("id", &["b", "a"]);
        let mid = MessageId::new("id");
        assert!(!labels_changed(&cache, &mid, &mut strings(&["a", "b"])).unwrap());
        assert!(!labels_changed(&cache, &mid, &mut strings(&["b", "a"])).unwrap());
    }

    #[test]
    fn test_labels_changed_for_unknown_mid() {
        let cache = MailCache::new(Arc::new(InMemoryCache::new()));
        assert!(labels_changed(&cache, &MessageId::new("nope"), &mut strings(&[])).unwrap());
    }
}
