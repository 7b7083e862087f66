//! Parsed message representation.
//!
//! A [`ParsedMessage`] is the unit the Maildir sink writes: an ordered
//! sequence of header name/value pairs plus the body bytes, kept verbatim.
//! Parsing leans on `mailparse` for header scanning only; the body is never
//! decoded or re-encoded.

use anyhow::{Context, Result};
use std::io::Write;

/// The synthetic header that carries the server-side label set. One header
/// line is emitted per label.
pub const LABELS_HEADER: &str = "X-Keywords";

/// An RFC 5322 message split into headers and a verbatim body.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ParsedMessage {
    /// Parse raw message bytes.
    ///
    /// Fails on input that does not look like a header block at all (the
    /// server occasionally returns non-MIME items such as chats; callers
    /// treat that as benign).
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (headers, body_offset) =
            mailparse::parse_headers(raw).context("failed to parse message headers")?;
        let headers = headers
            .iter()
            .map(|h| {
                let value = String::from_utf8_lossy(h.get_value_raw()).into_owned();
                (h.get_key(), value)
            })
            .collect();
        Ok(Self {
            headers,
            body: raw[body_offset..].to_vec(),
        })
    }

    /// All values of the labels header, in file order.
    pub fn labels(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(LABELS_HEADER))
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Replace the labels header with one line per entry in `labels`.
    pub fn set_labels(&mut self, labels: &[String]) {
        self.headers
            .retain(|(k, _)| !k.eq_ignore_ascii_case(LABELS_HEADER));
        for label in labels {
            self.headers.push((LABELS_HEADER.to_string(), label.clone()));
        }
    }

    /// First value of the named header, if present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Serialize the message: one `Name: value` line per header, a blank
    /// CRLF separator, then the body copied verbatim.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        for (name, value) in &self.headers {
            write!(w, "{name}: {value}\n")?;
        }
        w.write_all(b"\r\n")?;
        w.write_all(&self.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: billg@microsoft.com\nTo: page@google.com\nSubject: Doodle!\n\nasdf";

    #[test]
    fn test_parse_splits_headers_and_body() {
        let msg = ParsedMessage::parse(RAW).unwrap();
        assert_eq!(msg.header("Subject"), Some("Doodle!"));
        assert_eq!(msg.header("from"), Some("billg@microsoft.com"));
        assert_eq!(msg.body, b"asdf");
    }

    #[test]
    fn test_set_labels_replaces_existing() {
        let mut msg = ParsedMessage::parse(RAW).unwrap();
        msg.set_labels(&["INBOX".to_string(), "STARRED".to_string()]);
        assert_eq!(msg.labels(), vec!["INBOX", "STARRED"]);

        msg.set_labels(&["IMPORTANT".to_string()]);
        assert_eq!(msg.labels(), vec!["IMPORTANT"]);

        msg.set_labels(&[]);
        assert!(msg.labels().is_empty());
    }

    #[test]
    fn test_write_emits_labels_and_separator() {
        let mut msg = ParsedMessage::parse(RAW).unwrap();
        msg.set_labels(&["LABEL_3".to_string()]);
        let mut out = Vec::new();
        msg.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("X-Keywords: LABEL_3\n"));
        assert!(text.contains("\r\n"));
        assert!(text.ends_with("asdf"));
    }

    #[test]
    fn test_roundtrip_through_serialization() {
        let mut msg = ParsedMessage::parse(RAW).unwrap();
        msg.set_labels(&["A".to_string()]);
        let mut out = Vec::new();
        msg.write_to(&mut out).unwrap();

        let reparsed = ParsedMessage::parse(&out).unwrap();
        assert_eq!(reparsed.labels(), vec!["A"]);
        assert_eq!(reparsed.header("Subject"), Some("Doodle!"));
        assert_eq!(reparsed.body, b"asdf");
    }
}
