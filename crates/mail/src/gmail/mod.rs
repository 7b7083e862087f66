//! Gmail API integration.
//!
//! This module provides:
//! - serde models for the REST responses the syncer consumes
//! - the OAuth2 authorization-code flow
//! - the [`GmailService`] port and its REST implementation
//! - a typed facade over the durable cache

mod auth;
pub mod cache;
mod client;

pub use auth::{GmailAuth, StoredToken};
pub use cache::MailCache;
pub use client::{ApiError, GmailService, HistoryExpired, MessageNotFound, RestGmailService};

/// Gmail API response types.
///
/// History ids cross the wire as decimal strings; they deserialize straight
/// into `u64` so the engine can compare them numerically.
pub mod api {
    use serde::{Deserialize, Deserializer};

    fn u64_str<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }

    /// Response from listing messages.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePage {
        #[serde(default)]
        pub messages: Vec<MessageRef>,
        #[serde(default)]
        pub result_size_estimate: u32,
        #[serde(default)]
        pub next_page_token: Option<String>,
    }

    /// Reference to a message (just its id).
    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageRef {
        pub id: String,
    }

    /// The metadata projection of a message.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageMeta {
        #[serde(default)]
        pub label_ids: Vec<String>,
        #[serde(default, deserialize_with = "u64_str")]
        pub history_id: u64,
    }

    /// The raw projection of a message: base64url-encoded RFC 5322 bytes.
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct RawMessage {
        #[serde(default)]
        pub raw: Option<String>,
    }

    /// Response from the labels listing.
    #[derive(Debug, Clone, Default, Deserialize)]
    pub struct LabelPage {
        #[serde(default)]
        pub labels: Vec<GmailLabel>,
    }

    /// A Gmail label.
    #[derive(Debug, Clone, Deserialize)]
    pub struct GmailLabel {
        pub id: String,
        pub name: String,
    }

    /// One page of the account's change journal.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryPage {
        #[serde(default)]
        pub history: Vec<HistoryRecord>,
        #[serde(default)]
        pub next_page_token: Option<String>,
    }

    /// A single history record and its four event lists.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        #[serde(default, deserialize_with = "u64_str")]
        pub id: u64,
        #[serde(default)]
        pub messages_added: Vec<MessageChange>,
        #[serde(default)]
        pub messages_deleted: Vec<MessageChange>,
        #[serde(default)]
        pub labels_added: Vec<LabelChange>,
        #[serde(default)]
        pub labels_removed: Vec<LabelChange>,
    }

    /// A message added to or deleted from the mailbox.
    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageChange {
        pub message: MessageRef,
    }

    /// Labels added to or removed from a message.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LabelChange {
        pub message: MessageRef,
        #[serde(default)]
        pub label_ids: Vec<String>,
    }

    /// Error envelope the API wraps non-2xx responses in.
    #[derive(Debug, Deserialize)]
    pub struct ErrorResponse {
        pub error: ErrorBody,
    }

    #[derive(Debug, Deserialize)]
    pub struct ErrorBody {
        #[serde(default)]
        pub code: u16,
        #[serde(default)]
        pub message: String,
    }
}
