//! Gmail OAuth2 authentication.
//!
//! Implements the authorization-code flow: a local loopback listener
//! receives the consent callback, the code is exchanged for tokens, and the
//! result is persisted in the cache under the `oauth_token` namespace so
//! later runs only need the refresh grant.

use anyhow::{Context, Result, bail};
use log::info;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;

use super::MailCache;
use crate::config::GmailCredentials;

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Read-only mailbox access is all the exporter needs.
const SCOPE: &str = "https://www.googleapis.com/auth/gmail.readonly";

/// Ports probed for the loopback callback listener.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 8080..=8090;

/// Seconds of remaining validity below which a token is refreshed early.
const EXPIRY_SLACK: i64 = 300;

/// The credential blob persisted in the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

/// Token response from Google's token endpoint.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// OAuth2 token management for the Gmail API.
pub struct GmailAuth {
    creds: GmailCredentials,
    cache: MailCache,
}

impl GmailAuth {
    pub fn new(creds: GmailCredentials, cache: MailCache) -> Self {
        Self { creds, cache }
    }

    /// Produce a valid access token, refreshing or re-running the consent
    /// flow as needed.
    pub fn access_token(&self) -> Result<String> {
        if let Some(token) = self.cache.oauth_token()? {
            let now = chrono::Utc::now().timestamp();
            if let Some(expires_at) = token.expires_at
                && expires_at > now + EXPIRY_SLACK
            {
                return Ok(token.access_token);
            }
            if let Some(refresh_token) = token.refresh_token
                && let Ok(renewed) = self.refresh(&refresh_token)
            {
                return Ok(self.store(renewed)?);
            }
        }
        let token = self.consent_flow()?;
        self.store(token)
    }

    /// Exchange a refresh token for a fresh access token.
    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut response = ureq::post(TOKEN_URL)
            .send_form([
                ("client_id", self.creds.client_id.as_str()),
                ("client_secret", self.creds.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("failed to refresh access token")?;
        let mut token: TokenResponse = response
            .body_mut()
            .read_json()
            .context("failed to parse refresh response")?;
        // Google omits the refresh token on renewal; keep the old one.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_string());
        }
        Ok(token)
    }

    /// Run the interactive authorization-code flow.
    fn consent_flow(&self) -> Result<TokenResponse> {
        let (listener, port) = bind_loopback()?;
        let redirect_uri = format!("http://localhost:{port}");

        let auth_url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&access_type=offline&prompt=consent",
            AUTH_URL,
            urlencoding::encode(&self.creds.client_id),
            urlencoding::encode(&redirect_uri),
            urlencoding::encode(SCOPE),
        );

        info!("Launching browser for the OAuth consent exchange");
        if open::that(&auth_url).is_err() {
            eprintln!("Could not open a browser; authorize this app at:\n{auth_url}");
        }

        let code = wait_for_callback(listener)?;

        let mut response = ureq::post(TOKEN_URL)
            .send_form([
                ("client_id", self.creds.client_id.as_str()),
                ("client_secret", self.creds.client_secret.as_str()),
                ("code", code.as_str()),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri.as_str()),
            ])
            .context("failed to exchange authorization code")?;
        response
            .body_mut()
            .read_json()
            .context("failed to parse token response")
    }

    /// Persist a token response and hand back the access token.
    fn store(&self, token: TokenResponse) -> Result<String> {
        let stored = StoredToken {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| chrono::Utc::now().timestamp() + secs as i64),
        };
        self.cache.set_oauth_token(&stored)?;
        Ok(token.access_token)
    }
}

fn bind_loopback() -> Result<(TcpListener, u16)> {
    for port in PORT_RANGE {
        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            return Ok((listener, port));
        }
    }
    bail!("could not bind any port in {:?} for the OAuth callback", PORT_RANGE)
}

/// Accept one request on `listener` and pull the `code` query parameter out
/// of its request line.
fn wait_for_callback(listener: TcpListener) -> Result<String> {
    let (mut stream, _) = listener
        .accept()
        .context("failed to accept OAuth callback connection")?;

    let mut request_line = String::new();
    BufReader::new(&stream)
        .read_line(&mut request_line)
        .context("failed to read OAuth callback request")?;

    // Request line shape: GET /?code=...&scope=... HTTP/1.1
    let code = query_param(&request_line, "code");
    let error = query_param(&request_line, "error");

    let (status, body) = if code.is_some() {
        ("200 OK", "Authorized. You can close this window.")
    } else {
        ("400 Bad Request", "Authorization failed; please retry.")
    };
    let response = format!(
        "HTTP/1.1 {status}\r\nContent-Type: text/html\r\nConnection: close\r\n\r\n<html><body><h1>{body}</h1></body></html>"
    );
    stream.write_all(response.as_bytes()).ok();

    if let Some(err) = error {
        bail!("OAuth consent rejected: {err}");
    }
    code.context("no authorization code in OAuth callback")
}

fn query_param(request_line: &str, name: &str) -> Option<String> {
    let path = request_line.split_whitespace().nth(1)?;
    let query = path.split('?').nth(1)?;
    query.split('&').find_map(|param| {
        let (k, v) = param.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_extraction() {
        let line = "GET /?code=4%2FabcDEF&scope=email HTTP/1.1\r\n";
        assert_eq!(query_param(line, "code").as_deref(), Some("4%2FabcDEF"));
        assert_eq!(query_param(line, "error"), None);

        let err = "GET /?error=access_denied HTTP/1.1\r\n";
        assert_eq!(query_param(err, "error").as_deref(), Some("access_denied"));
    }

    #[test]
    fn test_stored_token_roundtrip() {
        let token = StoredToken {
            access_token: "at".into(),
            refresh_token: Some("rt".into()),
            expires_at: Some(1_700_000_000),
        };
        let json = serde_json::to_string(&token).unwrap();
        let back: StoredToken = serde_json::from_str(&json).unwrap();
        assert_eq!(back.access_token, "at");
        assert_eq!(back.refresh_token.as_deref(), Some("rt"));
    }
}
