//! Installation token minting for GitHub App authentication.
//!
//! ```text
//! TokenMinter (trait)
//!     |
//!     +-- GitHubAppTokenMinter
//!     |       signs an RS256 app assertion, exchanges it at
//!     |       POST /app/installations/{id}/access_tokens
//!     |
//!     +-- FakeTokenMinter (fake module, for testing)
//! ```
//!
//! Tokens are never cached: every call mints a fresh one, so concurrent
//! commits on the same installation never share a token that might expire
//! or be revoked mid-run. Raw tokens and the private key stay inside
//! `SecretString` and are never logged.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::GitHubError;

pub(crate) const DEFAULT_GITHUB_API_BASE_URL: &str = "https://api.github.com";
pub(crate) const GITHUB_API_VERSION: &str = "2022-11-28";

/// Backdate `iat` to tolerate clock drift between us and the host.
const ASSERTION_BACKDATE_SECS: i64 = 60;
/// The host rejects assertions valid for longer than ten minutes.
const ASSERTION_TTL_SECS: i64 = 540;

/// A short-lived, installation-scoped access token.
#[derive(Debug, Clone)]
pub struct InstallationToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
    pub installation_id: u64,
}

/// Mints installation tokens.
#[async_trait]
pub trait TokenMinter: Send + Sync {
    /// Mint a fresh token for `installation_id`.
    ///
    /// Fails if the installation is unknown or revoked, or the app key is
    /// unusable. Callers must not retry automatically.
    async fn mint(&self, installation_id: u64) -> Result<InstallationToken, GitHubError>;
}

/// Durable application identity.
#[derive(Debug, Clone)]
pub struct AppCredentials {
    pub app_id: String,
    /// PEM-encoded RSA private key
    pub private_key: SecretString,
}

impl AppCredentials {
    pub fn new(app_id: impl Into<String>, private_key: SecretString) -> Self {
        Self {
            app_id: app_id.into(),
            private_key,
        }
    }
}

/// Production minter using the GitHub App JWT exchange.
pub struct GitHubAppTokenMinter {
    credentials: AppCredentials,
    api_base_url: String,
    http_client: reqwest::Client,
}

impl GitHubAppTokenMinter {
    /// Creates a minter with the default GitHub API base URL.
    pub fn new(credentials: AppCredentials, timeout: Duration) -> Result<Self, GitHubError> {
        Self::new_with_api_base_url(credentials, DEFAULT_GITHUB_API_BASE_URL, timeout)
    }

    /// Creates a minter with an explicit API base URL (GitHub Enterprise,
    /// or a local stub).
    pub fn new_with_api_base_url(
        credentials: AppCredentials,
        api_base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GitHubError> {
        if credentials.app_id.trim().is_empty() {
            return Err(GitHubError::InvalidInput {
                field: "app_id".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        if credentials.private_key.expose_secret().trim().is_empty() {
            return Err(GitHubError::InvalidInput {
                field: "private_key".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let api_base_url = api_base_url.into();
        if api_base_url.trim().is_empty() {
            return Err(GitHubError::InvalidInput {
                field: "api_base_url".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15).min(timeout))
            .timeout(timeout)
            .build()
            .map_err(|e| GitHubError::from_reqwest("build http client", e))?;

        Ok(Self {
            credentials,
            api_base_url,
            http_client,
        })
    }

    fn generate_jwt(&self, now: i64) -> Result<String, GitHubError> {
        #[derive(Debug, Serialize)]
        struct Claims {
            iat: i64,
            exp: i64,
            iss: String,
        }

        let claims = Claims {
            iat: now - ASSERTION_BACKDATE_SECS,
            exp: now + ASSERTION_TTL_SECS,
            iss: self.credentials.app_id.clone(),
        };
        let key = EncodingKey::from_rsa_pem(self.credentials.private_key.expose_secret().as_bytes())
            .map_err(|e| GitHubError::Jwt {
                message: e.to_string(),
            })?;

        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).map_err(|e| {
            GitHubError::Jwt {
                message: e.to_string(),
            }
        })
    }
}

#[async_trait]
impl TokenMinter for GitHubAppTokenMinter {
    #[instrument(skip(self))]
    async fn mint(&self, installation_id: u64) -> Result<InstallationToken, GitHubError> {
        #[derive(Debug, Deserialize)]
        struct AccessTokenResponse {
            token: String,
            expires_at: DateTime<Utc>,
        }

        if installation_id == 0 {
            return Err(GitHubError::InvalidInput {
                field: "installation_id".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let jwt = self.generate_jwt(Utc::now().timestamp())?;
        let endpoint = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base_url.trim_end_matches('/'),
            installation_id
        );

        let response = self
            .http_client
            .post(endpoint)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", concat!("batchpub/", env!("CARGO_PKG_VERSION")))
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .bearer_auth(jwt)
            .send()
            .await
            .map_err(|e| GitHubError::from_reqwest("mint installation token", e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read token response body".to_string());
            return Err(GitHubError::Http {
                status: Some(status.as_u16()),
                message,
            });
        }

        let payload: AccessTokenResponse =
            response.json().await.map_err(|e| GitHubError::Decode {
                operation: "mint installation token".to_string(),
                message: e.to_string(),
            })?;
        debug!(expires_at = %payload.expires_at, "installation token minted");

        Ok(InstallationToken {
            token: SecretString::from(payload.token),
            expires_at: payload.expires_at,
            installation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minter(key: &str) -> Result<GitHubAppTokenMinter, GitHubError> {
        GitHubAppTokenMinter::new(
            AppCredentials::new("12345", SecretString::from(key)),
            Duration::from_secs(5),
        )
    }

    #[test]
    fn rejects_empty_credentials() {
        assert!(matches!(
            minter("   ").err(),
            Some(GitHubError::InvalidInput { field, .. }) if field == "private_key"
        ));
        let err = GitHubAppTokenMinter::new(
            AppCredentials::new("", SecretString::from("pem")),
            Duration::from_secs(5),
        )
        .err();
        assert!(matches!(err, Some(GitHubError::InvalidInput { field, .. }) if field == "app_id"));
    }

    #[test]
    fn malformed_key_fails_jwt_generation() {
        let minter = minter("not-a-pem-key").unwrap();
        let err = minter.generate_jwt(1_700_000_000).unwrap_err();
        assert!(matches!(err, GitHubError::Jwt { .. }));
    }

    #[tokio::test]
    async fn malformed_key_fails_mint_before_any_request() {
        // Unroutable base URL: reaching the network would fail differently.
        let minter = GitHubAppTokenMinter::new_with_api_base_url(
            AppCredentials::new("12345", SecretString::from("not-a-pem-key")),
            "http://127.0.0.1:9",
            Duration::from_secs(1),
        )
        .unwrap();
        let err = minter.mint(42).await.unwrap_err();
        assert!(matches!(err, GitHubError::Jwt { .. }));
    }

    #[tokio::test]
    async fn zero_installation_id_is_rejected() {
        let minter = minter("pem").unwrap();
        assert!(matches!(
            minter.mint(0).await.unwrap_err(),
            GitHubError::InvalidInput { .. }
        ));
    }

    #[test]
    fn debug_output_redacts_token() {
        let token = InstallationToken {
            token: SecretString::from("ghs_supersecret"),
            expires_at: Utc::now(),
            installation_id: 1,
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("ghs_supersecret"));
    }
}
