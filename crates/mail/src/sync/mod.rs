//! The synchronization engine.
//!
//! Synchronization happens one of two ways: full, or incremental. With a
//! persisted history index the change journal tells us exactly which
//! messages were added, deleted or relabeled since the last run. A full
//! sync instead lists every message on the server, computes label changes
//! against the cache, and deduces deletions by comparing the cached message
//! set with the listing.
//!
//! To parallelize the slow network operations while keeping per-message
//! causal order, the flow looks like this:
//!
//! ```text
//! full:        list pages ──> worker pool ──> apply stage ──> maildir+cache
//! incremental: journal pages ──> shard[hash(mid) % N] ──> worker per shard
//!                                                     ──> apply stage
//! ```
//!
//! Workers only read; the single-threaded apply stage is the sole writer to
//! the Maildir and the cache.

mod engine;
mod labels;

pub use engine::{GmailSync, SyncOptions};
pub use labels::{compute_labels, labels_changed};

use crate::message::ParsedMessage;
use crate::models::MessageId;

/// What a pipeline record asks the apply stage to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    None,
    Add,
    Delete,
    WriteLabels,
}

/// A message operation flowing from the producers, through the workers, to
/// the apply stage.
pub(crate) struct MsgOp {
    pub mid: MessageId,
    pub kind: OpKind,
    pub labels: Vec<String>,
    pub msg: Option<ParsedMessage>,
    pub history_id: u64,
    pub error: Option<anyhow::Error>,
}

impl MsgOp {
    pub fn new(mid: MessageId) -> Self {
        Self {
            mid,
            kind: OpKind::None,
            labels: Vec::new(),
            msg: None,
            history_id: 0,
            error: None,
        }
    }

    pub fn event(mid: MessageId, kind: OpKind, history_id: u64) -> Self {
        Self {
            kind,
            history_id,
            ..Self::new(mid)
        }
    }

    /// A record that aborts the sync when the apply stage sees it.
    pub fn failed(err: anyhow::Error) -> Self {
        Self {
            error: Some(err),
            ..Self::new(MessageId::new(""))
        }
    }

    pub fn fail(mut self, err: anyhow::Error) -> Self {
        self.error = Some(err);
        self
    }
}
