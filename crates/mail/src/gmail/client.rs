//! The mail-service port and its Gmail REST implementation.
//!
//! [`GmailService`] is the abstraction the sync engine talks to; the test
//! suite substitutes a scripted stub. [`RestGmailService`] implements it
//! over HTTPS with every call wrapped in the rate limiter's backoff, so
//! quota errors (429, or 403 mentioning rate limits) are retried and
//! everything else surfaces immediately.

use anyhow::{Context, Result};
use log::debug;
use serde::de::DeserializeOwned;
use ureq::Agent;

use super::api::{
    ErrorResponse, GmailLabel, HistoryPage, LabelPage, MessageMeta, MessagePage, RawMessage,
};
use super::auth::GmailAuth;
use crate::models::MessageId;
use crate::ratelimit::RateLimit;

const BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

/// Sentinel: the requested history position has fallen out of the server's
/// change journal and a full sync is required.
#[derive(Debug, thiserror::Error)]
#[error("history index expired or invalid")]
pub struct HistoryExpired;

/// Sentinel: the requested message no longer exists on the server.
#[derive(Debug, thiserror::Error)]
#[error("message {0} not found")]
pub struct MessageNotFound(pub String);

/// A non-2xx response from the REST endpoint.
#[derive(Debug, thiserror::Error)]
#[error("gmail api error {status}: {message}")]
pub struct ApiError {
    pub status: u16,
    pub message: String,
}

/// Abstract interface to the remote mailbox. All operations are stateless
/// from the caller's perspective.
pub trait GmailService: Send + Sync {
    /// Fetch a message's base64url-encoded RFC 5322 bytes.
    fn get_raw_message(&self, mid: &MessageId) -> Result<String>;

    /// Fetch a message's labels and history position.
    fn get_metadata(&self, mid: &MessageId) -> Result<MessageMeta>;

    /// The account's label catalog.
    fn get_labels(&self) -> Result<Vec<GmailLabel>>;

    /// One page of the change journal since `since`.
    fn get_history(
        &self,
        since: u64,
        label_id: Option<&str>,
        page: Option<&str>,
    ) -> Result<HistoryPage>;

    /// One page of the full message listing.
    fn get_messages(&self, label_id: Option<&str>, page: Option<&str>) -> Result<MessagePage>;
}

/// Whether an error is a quota signal worth retrying.
///
/// Per <https://developers.google.com/gmail/api/guides/handle-errors>: 429,
/// or a 403 whose message mentions rate limiting.
fn is_rate_limited(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ApiError>() {
        Some(e) => e.status == 429 || (e.status == 403 && e.message.contains("Rate Limit")),
        None => false,
    }
}

fn status_of(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<ApiError>().map(|e| e.status)
}

/// [`GmailService`] implementation over the Gmail REST API.
pub struct RestGmailService {
    agent: Agent,
    auth: GmailAuth,
    limiter: RateLimit,
}

impl RestGmailService {
    pub fn new(auth: GmailAuth, limiter: RateLimit) -> Self {
        // Statuses are handled here, not turned into transport errors, so
        // the quota classification can see the response body.
        let agent = Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();
        Self {
            agent,
            auth,
            limiter,
        }
    }

    /// Rate-limited, retrying GET of a JSON resource.
    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.limiter
            .do_with_backoff(|| self.fetch(url), is_rate_limited)
    }

    fn fetch<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        debug!("GET {url}");
        let token = self.auth.access_token()?;
        let mut response = self
            .agent
            .get(url)
            .header("Authorization", &format!("Bearer {token}"))
            .call()
            .with_context(|| format!("request failed: {url}"))?;
        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.body_mut().read_to_string().unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ApiError { status, message }.into());
        }
        response
            .body_mut()
            .read_json()
            .with_context(|| format!("failed to parse response from {url}"))
    }
}

impl GmailService for RestGmailService {
    fn get_raw_message(&self, mid: &MessageId) -> Result<String> {
        let url = format!("{BASE_URL}/users/me/messages/{mid}?format=raw");
        let msg: RawMessage = match self.get_json(&url) {
            Err(e) if status_of(&e) == Some(404) => {
                return Err(MessageNotFound(mid.as_str().to_string()).into());
            }
            r => r?,
        };
        msg.raw
            .with_context(|| format!("no raw payload for message {mid}"))
    }

    fn get_metadata(&self, mid: &MessageId) -> Result<MessageMeta> {
        let url = format!("{BASE_URL}/users/me/messages/{mid}?format=metadata");
        match self.get_json(&url) {
            Err(e) if status_of(&e) == Some(404) => {
                Err(MessageNotFound(mid.as_str().to_string()).into())
            }
            r => r,
        }
    }

    fn get_labels(&self) -> Result<Vec<GmailLabel>> {
        let url = format!("{BASE_URL}/users/me/labels");
        let page: LabelPage = self.get_json(&url)?;
        Ok(page.labels)
    }

    fn get_history(
        &self,
        since: u64,
        label_id: Option<&str>,
        page: Option<&str>,
    ) -> Result<HistoryPage> {
        let mut url = format!("{BASE_URL}/users/me/history?startHistoryId={since}");
        if let Some(label) = label_id {
            url.push_str(&format!("&labelId={}", urlencoding::encode(label)));
        }
        if let Some(token) = page {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        match self.get_json(&url) {
            // The journal has been truncated past our position.
            Err(e) if status_of(&e) == Some(404) => Err(HistoryExpired.into()),
            r => r,
        }
    }

    fn get_messages(&self, label_id: Option<&str>, page: Option<&str>) -> Result<MessagePage> {
        // -in:chats skips the non-MIME items the API otherwise returns.
        let mut url = format!("{BASE_URL}/users/me/messages?q=-in%3Achats");
        if let Some(label) = label_id {
            url.push_str(&format!("&labelIds={}", urlencoding::encode(label)));
        }
        if let Some(token) = page {
            url.push_str(&format!("&pageToken={}", urlencoding::encode(token)));
        }
        self.get_json(&url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_rate_limit_classification() {
        let quota: anyhow::Error = ApiError {
            status: 429,
            message: "Too many requests".into(),
        }
        .into();
        assert!(is_rate_limited(&quota));

        let forbidden: anyhow::Error = ApiError {
            status: 403,
            message: "User Rate Limit Exceeded".into(),
        }
        .into();
        assert!(is_rate_limited(&forbidden));

        let denied: anyhow::Error = ApiError {
            status: 403,
            message: "Forbidden".into(),
        }
        .into();
        assert!(!is_rate_limited(&denied));

        assert!(!is_rate_limited(&anyhow!("socket closed")));
    }

    #[test]
    fn test_sentinels_downcast_through_anyhow() {
        let err: anyhow::Error = HistoryExpired.into();
        assert!(err.downcast_ref::<HistoryExpired>().is_some());

        let err: anyhow::Error = MessageNotFound("abc".into()).into();
        assert!(err.downcast_ref::<MessageNotFound>().is_some());
        assert!(err.downcast_ref::<HistoryExpired>().is_none());
    }
}
