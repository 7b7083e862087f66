//! Mail crate - Gmail to Maildir synchronization.
//!
//! This crate provides everything behind the `outtake` binary:
//! - A durable, namespaced cache over an embedded KV file
//! - Token-bucket rate limiting with retry-and-backoff
//! - Atomic Maildir delivery
//! - The Gmail REST service port, OAuth flow and response models
//! - The sync engine: full and incremental modes, per-message sharding,
//!   and a single-writer apply stage
//!
//! The engine is head-of-the-pipeline: everything else exists so that
//! [`GmailSync::sync`] can decide what work to do and apply it crash-safely.

pub mod cache;
pub mod config;
pub mod gmail;
pub mod maildir;
pub mod message;
pub mod models;
pub mod ratelimit;
pub mod sync;

pub use cache::{Cache, InMemoryCache, RedbCache};
pub use config::GmailCredentials;
pub use gmail::{
    GmailAuth, GmailService, HistoryExpired, MailCache, MessageNotFound, RestGmailService,
};
pub use maildir::{Key, Maildir};
pub use message::{LABELS_HEADER, ParsedMessage};
pub use models::{MessageId, Progress};
pub use ratelimit::RateLimit;
pub use sync::{GmailSync, SyncOptions, compute_labels, labels_changed};
