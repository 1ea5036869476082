//! Outbound OAuth client-credentials tokens for agent runtimes
//!
//! Some agent runtimes only accept tokens from their own identity pool. For
//! those the relay mints a token with the client-credentials grant and caches
//! it until shortly before it expires.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RelayError, Result};

/// Tokens are refreshed this long before the issuer says they expire
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    /// Prefix applied to every scope (`<resource_server>/<scope>`)
    #[serde(default)]
    pub resource_server: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    pub fn scope_string(&self) -> String {
        self.scopes
            .iter()
            .map(|scope| match &self.resource_server {
                Some(rs) => format!("{}/{}", rs, scope),
                None => scope.clone(),
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct OAuthTokenSource {
    http: Client,
    config: OAuthClientConfig,
    cached: Mutex<Option<CachedToken>>,
}

impl OAuthTokenSource {
    pub fn new(http: Client, config: OAuthClientConfig) -> Self {
        Self {
            http,
            config,
            cached: Mutex::new(None),
        }
    }

    /// Current access token, fetching a new one when missing or near expiry.
    pub async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        debug!("Requesting client-credentials token from {}", self.config.token_url);
        let scope = self.config.scope_string();
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let resp = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                RelayError::AgentUnreachable(format!(
                    "token endpoint {} unreachable: {}",
                    self.config.token_url, e
                ))
            })?;

        if !resp.status().is_success() {
            return Err(RelayError::AgentUnreachable(format!(
                "token endpoint returned HTTP {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Internal(format!("malformed token response: {}", e)))?;

        let lifetime = Duration::from_secs(body.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(EXPIRY_SKEW);
        info!(
            "Obtained access token for client {} (expires in {:?})",
            self.config.client_id, lifetime
        );

        *cached = Some(CachedToken {
            value: body.access_token.clone(),
            refresh_at,
        });
        Ok(body.access_token)
    }
}
