//! Secret store client.
//!
//! Credentials are fetched on every mount and never cached; the secret
//! store stays the single source of truth and revocation takes effect on
//! the next mount.

use serde::Deserialize;
use url::Url;

const RESOLVE_PATH: &str = "v1/secrets/resolve";

/// Credentials for one backup target. `Debug` redacts key material so a
/// stray `{:?}` in a log line cannot leak it.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    #[serde(alias = "accessKey")]
    pub access_key: String,
    #[serde(alias = "secretKey")]
    pub secret_key: String,
    #[serde(default, alias = "sessionToken")]
    pub session_token: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default, alias = "noSsl")]
    pub no_ssl: bool,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &"<redacted>")
            .field("secret_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("no_ssl", &self.no_ssl)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("secret store denied access to {0}")]
    Denied(String),

    #[error("secret store returned {status} for {secret_ref}")]
    Status {
        secret_ref: String,
        status: reqwest::StatusCode,
    },

    #[error("secret store returned malformed credentials for {0}: {1}")]
    Malformed(String, #[source] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct SecretClient {
    http: reqwest::Client,
    auth_url: Url,
}

impl SecretClient {
    pub fn new(auth_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            auth_url,
        }
    }

    /// Resolve a secret reference with the caller's bearer token.
    pub async fn fetch(&self, secret_ref: &str, token: &str) -> Result<Credentials, SecretError> {
        let endpoint = self
            .auth_url
            .join(RESOLVE_PATH)
            .map_err(|_| SecretError::Denied(secret_ref.to_string()))?;

        tracing::debug!(secret_ref, "resolving credentials");

        let response = self
            .http
            .post(endpoint)
            .bearer_auth(token)
            .json(&serde_json::json!({ "ref": secret_ref }))
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SecretError::Denied(secret_ref.to_string()));
        }
        if !status.is_success() {
            return Err(SecretError::Status {
                secret_ref: secret_ref.to_string(),
                status,
            });
        }

        response
            .json::<Credentials>()
            .await
            .map_err(|e| SecretError::Malformed(secret_ref.to_string(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_redacts_key_material() {
        let creds: Credentials = serde_json::from_str(
            r#"{"accessKey": "AKIAXXXX", "secretKey": "sup3rs3cret", "sessionToken": "tok"}"#,
        )
        .unwrap();

        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("AKIAXXXX"));
        assert!(!rendered.contains("sup3rs3cret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn accepts_snake_case_and_camel_case_fields() {
        let camel: Credentials =
            serde_json::from_str(r#"{"accessKey": "a", "secretKey": "b"}"#).unwrap();
        assert_eq!(camel.access_key, "a");

        let snake: Credentials = serde_json::from_str(
            r#"{"access_key": "a", "secret_key": "b", "endpoint": "https://s3.local", "no_ssl": true}"#,
        )
        .unwrap();
        assert_eq!(snake.endpoint.as_deref(), Some("https://s3.local"));
        assert!(snake.no_ssl);
    }
}
