//! OAuth client credential loading.
//!
//! Credentials come from `~/.config/outtake/google-credentials.json` (the
//! Google Cloud Console download, `installed` or `web` section) or, failing
//! that, the `GMAIL_CLIENT_ID` / `GMAIL_CLIENT_SECRET` environment
//! variables.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

const CREDENTIALS_FILE: &str = "google-credentials.json";

/// OAuth client id and secret for the Gmail API.
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format.
#[derive(Deserialize)]
struct CredentialFile {
    installed: Option<CredentialSection>,
    web: Option<CredentialSection>,
}

#[derive(Deserialize)]
struct CredentialSection {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Load credentials from the config file, falling back to the
    /// environment.
    pub fn load() -> Result<Self> {
        if config::config_exists(CREDENTIALS_FILE) {
            let file: CredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(file);
        }
        Self::from_env()
    }

    /// Load credentials from a specific JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_credential_file(config::load_json_file(path)?)
    }

    /// Parse credentials from a JSON string in the Cloud Console format.
    pub fn from_json(json: &str) -> Result<Self> {
        let file = serde_json::from_str(json).context("failed to parse credentials JSON")?;
        Self::from_credential_file(file)
    }

    fn from_credential_file(file: CredentialFile) -> Result<Self> {
        let section = file
            .installed
            .or(file.web)
            .context("credentials file has neither an 'installed' nor a 'web' section")?;
        Ok(Self {
            client_id: section.client_id,
            client_secret: section.client_secret,
        })
    }

    fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: std::env::var("GMAIL_CLIENT_ID")
                .context("GMAIL_CLIENT_ID environment variable not set")?,
            client_secret: std::env::var("GMAIL_CLIENT_SECRET")
                .context("GMAIL_CLIENT_SECRET environment variable not set")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_installed_credentials() {
        let json = r#"{
            "installed": {
                "client_id": "id.apps.googleusercontent.com",
                "client_secret": "secret",
                "token_uri": "https://oauth2.googleapis.com/token"
            }
        }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "id.apps.googleusercontent.com");
        assert_eq!(creds.client_secret, "secret");
    }

    #[test]
    fn test_parse_web_credentials() {
        let json = r#"{ "web": { "client_id": "web-id", "client_secret": "web-secret" } }"#;
        let creds = GmailCredentials::from_json(json).unwrap();
        assert_eq!(creds.client_id, "web-id");
    }

    #[test]
    fn test_rejects_unknown_shape() {
        assert!(GmailCredentials::from_json(r#"{ "other": {} }"#).is_err());
    }
}
