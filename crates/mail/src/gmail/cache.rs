//! Typed facade over the durable cache.
//!
//! Four namespaces back the syncer's bookkeeping:
//!
//! | namespace       | key   | value                                  |
//! |-----------------|-------|----------------------------------------|
//! | `mid_to_key`    | mid   | maildir key, raw bytes                 |
//! | `mid_to_label`  | mid   | JSON list of label names               |
//! | `history_index` | `"0"` | u64, big-endian                        |
//! | `oauth_token`   | `"0"` | JSON [`StoredToken`]                   |

use anyhow::{Context, Result};
use std::sync::Arc;

use super::auth::StoredToken;
use crate::cache::Cache;
use crate::maildir::Key;
use crate::models::MessageId;

const MID_TO_KEY: &str = "mid_to_key";
const MID_TO_LABEL: &str = "mid_to_label";
const HISTORY_INDEX: &str = "history_index";
const OAUTH_TOKEN: &str = "oauth_token";

/// Key used by the singleton namespaces.
const SINGLETON: &str = "0";

/// A cheaply cloneable handle to the syncer's cache.
#[derive(Clone)]
pub struct MailCache {
    inner: Arc<dyn Cache>,
}

impl MailCache {
    pub fn new(inner: Arc<dyn Cache>) -> Self {
        Self { inner }
    }

    /// Maildir key of a downloaded message, if we have it.
    pub fn msg_key(&self, mid: &MessageId) -> Result<Option<Key>> {
        let bytes = self.inner.get(MID_TO_KEY, mid.as_str())?;
        Ok(bytes.map(|b| Key::new(String::from_utf8_lossy(&b).into_owned())))
    }

    pub fn set_msg_key(&self, mid: &MessageId, key: &Key) -> Result<()> {
        self.inner
            .set(MID_TO_KEY, mid.as_str(), key.as_str().as_bytes())
    }

    /// Every message id currently tracked by the cache.
    pub fn msg_ids(&self) -> Result<Vec<String>> {
        self.inner.keys(MID_TO_KEY)
    }

    /// Forget a message entirely (key and labels).
    pub fn del_msg(&self, mid: &MessageId) -> Result<()> {
        self.inner.del(MID_TO_KEY, mid.as_str())?;
        self.inner.del(MID_TO_LABEL, mid.as_str())
    }

    /// Label set most recently delivered for a message.
    pub fn msg_labels(&self, mid: &MessageId) -> Result<Option<Vec<String>>> {
        match self.inner.get(MID_TO_LABEL, mid.as_str())? {
            Some(bytes) => {
                let labels = serde_json::from_slice(&bytes)
                    .with_context(|| format!("malformed cached labels for {mid}"))?;
                Ok(Some(labels))
            }
            None => Ok(None),
        }
    }

    pub fn set_msg_labels(&self, mid: &MessageId, labels: &[String]) -> Result<()> {
        let bytes = serde_json::to_vec(labels)?;
        self.inner.set(MID_TO_LABEL, mid.as_str(), &bytes)
    }

    /// The persisted change-journal high-water mark; zero when never synced.
    pub fn history_idx(&self) -> Result<u64> {
        match self.inner.get(HISTORY_INDEX, SINGLETON)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .ok()
                    .context("malformed history index in cache")?;
                Ok(u64::from_be_bytes(arr))
            }
            None => Ok(0),
        }
    }

    pub fn set_history_idx(&self, idx: u64) -> Result<()> {
        self.inner
            .set(HISTORY_INDEX, SINGLETON, &idx.to_be_bytes())
    }

    /// The stored OAuth token blob, if any.
    pub fn oauth_token(&self) -> Result<Option<StoredToken>> {
        match self.inner.get(OAUTH_TOKEN, SINGLETON)? {
            Some(bytes) => {
                let token =
                    serde_json::from_slice(&bytes).context("malformed stored oauth token")?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    pub fn set_oauth_token(&self, token: &StoredToken) -> Result<()> {
        let bytes = serde_json::to_vec(token)?;
        self.inner.set(OAUTH_TOKEN, SINGLETON, &bytes)
    }
}
