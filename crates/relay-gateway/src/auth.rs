//! Auth gatekeeper: authenticate inbound calls and tag them with a session
//!
//! Two schemes, one per deployment: bearer JWTs checked against a published
//! key set, or HMAC-signed requests with a bounded clock skew. Failures split
//! into `Unauthenticated` (fix the credential and retry) and `Forbidden`
//! (valid credential, not allowed).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use jsonwebtoken::{DecodingKey, Validation};
use relay_a2a::RelayError;
use ring::hmac;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{AuthConfig, BearerAuthConfig, SignedAuthConfig};
use crate::session::SessionManager;

/// Header carrying the signing time (unix seconds)
pub const DATE_HEADER: &str = "x-relay-date";
pub const SIGNATURE_HEADER: &str = "x-relay-signature";

/// Minimum spacing between key set refreshes triggered by unknown key ids
const FORCED_REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// The credential a caller presented, kept for outbound propagation
#[derive(Debug, Clone, PartialEq)]
pub enum Credential {
    Bearer(String),
    Signed { key_id: String },
}

/// What an authenticator learned about the caller
#[derive(Debug, Clone)]
pub struct Identity {
    pub caller: Option<String>,
    pub credential: Credential,
}

#[derive(Debug, Clone)]
pub struct AuthContext {
    pub caller: Option<String>,
    pub session_id: String,
    pub credential: Credential,
}

impl AuthContext {
    /// `Authorization` value to forward, if the credential is forwardable
    pub fn forward_authorization(&self) -> Option<String> {
        match &self.credential {
            Credential::Bearer(token) => Some(format!("Bearer {}", token)),
            Credential::Signed { .. } => None,
        }
    }

    /// Caller identity to forward when no token travels with the call
    pub fn forward_caller(&self) -> Option<String> {
        match &self.credential {
            Credential::Bearer(_) => None,
            Credential::Signed { key_id } => Some(key_id.clone()),
        }
    }
}

/// The parts of an inbound HTTP request a credential can cover
pub struct InboundRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub body: &'a [u8],
    /// Agent the request is addressed to, if any
    pub agent: Option<&'a str>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    fn scheme(&self) -> &'static str;

    /// `WWW-Authenticate` challenge returned with 401 responses
    fn challenge(&self) -> String;

    async fn authenticate(&self, request: &InboundRequest<'_>) -> Result<Identity, RelayError>;
}

/// Runs the deployment's authenticator and resolves the caller's session.
#[derive(Clone)]
pub struct Gatekeeper {
    authenticator: Arc<dyn Authenticator>,
    sessions: SessionManager,
    session_header: String,
}

impl Gatekeeper {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        sessions: SessionManager,
        session_header: impl Into<String>,
    ) -> Self {
        Self {
            authenticator,
            sessions,
            session_header: session_header.into().to_ascii_lowercase(),
        }
    }

    pub fn from_config(config: &AuthConfig, http: reqwest::Client, sessions: SessionManager, session_header: &str) -> Self {
        let authenticator: Arc<dyn Authenticator> = match config {
            AuthConfig::Bearer(bearer) => Arc::new(BearerAuthenticator::new(http, bearer.clone())),
            AuthConfig::Signed(signed) => Arc::new(SignedRequestAuthenticator::new(signed)),
        };
        Self::new(authenticator, sessions, session_header)
    }

    pub fn session_header(&self) -> &str {
        &self.session_header
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn challenge(&self) -> String {
        self.authenticator.challenge()
    }

    pub async fn authenticate(&self, request: &InboundRequest<'_>) -> Result<AuthContext, RelayError> {
        let identity = self.authenticator.authenticate(request).await.inspect_err(|e| {
            debug!("{} authentication failed: {}", self.authenticator.scheme(), e);
        })?;

        let supplied = request
            .headers
            .get(self.session_header.as_str())
            .and_then(|v| v.to_str().ok());
        let session_id = self.sessions.resolve(supplied)?;

        Ok(AuthContext {
            caller: identity.caller,
            session_id,
            credential: identity.credential,
        })
    }
}

// ── Bearer tokens ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenClaims {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    aud: Option<Value>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    scp: Option<Value>,
}

impl TokenClaims {
    fn audiences(&self) -> Vec<&str> {
        let mut out: Vec<&str> = match &self.aud {
            Some(Value::String(s)) => vec![s.as_str()],
            Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        out.extend(self.client_id.as_deref());
        out
    }

    fn scopes(&self) -> HashSet<&str> {
        let mut out: HashSet<&str> = self
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().collect())
            .unwrap_or_default();
        match &self.scp {
            Some(Value::String(s)) => out.extend(s.split_whitespace()),
            Some(Value::Array(items)) => out.extend(items.iter().filter_map(Value::as_str)),
            _ => {}
        }
        out
    }

    fn caller(&self) -> Option<String> {
        self.sub
            .clone()
            .or_else(|| self.username.clone())
            .or_else(|| self.client_id.clone())
    }
}

#[derive(Debug, Deserialize)]
struct OidcDiscovery {
    jwks_uri: String,
}

#[derive(Default)]
struct KeyCache {
    jwks_uri: Option<String>,
    keys: Option<JwkSet>,
    fetched_at: Option<Instant>,
    last_forced: Option<Instant>,
}

pub struct BearerAuthenticator {
    http: reqwest::Client,
    config: BearerAuthConfig,
    cache: Mutex<KeyCache>,
}

impl BearerAuthenticator {
    pub fn new(http: reqwest::Client, config: BearerAuthConfig) -> Self {
        let cache = KeyCache {
            jwks_uri: config.jwks_url.clone(),
            ..KeyCache::default()
        };
        Self {
            http,
            config,
            cache: Mutex::new(cache),
        }
    }

    fn cache(&self) -> MutexGuard<'_, KeyCache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Key for `kid`, refreshing the set once when the id is unknown.
    /// The lock is never held across a fetch.
    async fn key_for(&self, kid: Option<&str>) -> Result<Jwk, RelayError> {
        let ttl = Duration::from_secs(self.config.jwks_ttl_secs);
        let jwks_uri = {
            let mut cache = self.cache();
            let stale = cache.fetched_at.is_none_or(|at| at.elapsed() > ttl);
            if !stale {
                if let Some(jwk) = find_key(cache.keys.as_ref(), kid) {
                    return Ok(jwk);
                }
                let may_force = cache
                    .last_forced
                    .is_none_or(|at| at.elapsed() > FORCED_REFRESH_COOLDOWN);
                if !may_force {
                    return Err(RelayError::Unauthenticated("token signed by unknown key".into()));
                }
                debug!("Unknown key id {:?}; refreshing key set", kid);
                cache.last_forced = Some(Instant::now());
            }
            cache.jwks_uri.clone()
        };

        let keys = self.fetch_key_set(jwks_uri).await?;
        let found = find_key(Some(&keys), kid);
        {
            let mut cache = self.cache();
            cache.keys = Some(keys);
            cache.fetched_at = Some(Instant::now());
        }
        found.ok_or_else(|| RelayError::Unauthenticated("token signed by unknown key".into()))
    }

    async fn fetch_key_set(&self, jwks_uri: Option<String>) -> Result<JwkSet, RelayError> {
        let jwks_uri = match jwks_uri {
            Some(uri) => uri,
            None => {
                let discovery_url = self.config.discovery_url.as_deref().ok_or_else(|| {
                    RelayError::Internal("bearer auth has no key set location".into())
                })?;
                let doc: OidcDiscovery = self.fetch_json(discovery_url).await?;
                self.cache().jwks_uri = Some(doc.jwks_uri.clone());
                doc.jwks_uri
            }
        };

        let keys: JwkSet = self.fetch_json(&jwks_uri).await?;
        debug!("Loaded {} signing key(s) from {}", keys.keys.len(), jwks_uri);
        Ok(keys)
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, RelayError> {
        let resp = self.http.get(url).send().await.map_err(|e| {
            warn!("Key set fetch from {} failed: {}", url, e);
            RelayError::Internal(format!("key set unavailable: {}", e))
        })?;
        if !resp.status().is_success() {
            warn!("Key set fetch from {} returned HTTP {}", url, resp.status());
            return Err(RelayError::Internal(format!(
                "key set unavailable: HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| RelayError::Internal(format!("malformed key set document: {}", e)))
    }

    fn validation(&self, alg: jsonwebtoken::Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.config.leeway_secs;
        validation.validate_aud = false;
        validation.set_required_spec_claims(&["exp"]);
        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        validation
    }
}

fn find_key(keys: Option<&JwkSet>, kid: Option<&str>) -> Option<Jwk> {
    let keys = keys?;
    match kid {
        Some(kid) => keys.find(kid).cloned(),
        None if keys.keys.len() == 1 => keys.keys.first().cloned(),
        None => None,
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, RelayError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| RelayError::Unauthenticated("missing bearer token".into()))?
        .to_str()
        .map_err(|_| RelayError::Unauthenticated("malformed authorization header".into()))?;
    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(RelayError::Unauthenticated("expected a bearer token".into())),
    }
}

#[async_trait]
impl Authenticator for BearerAuthenticator {
    fn scheme(&self) -> &'static str {
        "bearer"
    }

    fn challenge(&self) -> String {
        "Bearer realm=\"a2a-relay\"".to_string()
    }

    async fn authenticate(&self, request: &InboundRequest<'_>) -> Result<Identity, RelayError> {
        let token = bearer_token(request.headers)?;

        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| RelayError::Unauthenticated(format!("malformed token: {}", e)))?;
        if !self.config.algorithms.contains(&header.alg) {
            return Err(RelayError::Unauthenticated(format!(
                "token algorithm {:?} not accepted",
                header.alg
            )));
        }

        let jwk = self.key_for(header.kid.as_deref()).await?;
        let key = DecodingKey::from_jwk(&jwk)
            .map_err(|e| RelayError::Unauthenticated(format!("unusable signing key: {}", e)))?;

        let data = jsonwebtoken::decode::<TokenClaims>(token, &key, &self.validation(header.alg))
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => RelayError::Unauthenticated("token expired".into()),
                ErrorKind::InvalidIssuer => RelayError::Unauthenticated("token issuer not accepted".into()),
                ErrorKind::InvalidSignature => RelayError::Unauthenticated("invalid token signature".into()),
                _ => RelayError::Unauthenticated(format!("invalid token: {}", e)),
            })?;
        let claims = data.claims;

        if !self.config.audiences.is_empty() {
            let accepted = claims
                .audiences()
                .iter()
                .any(|aud| self.config.audiences.iter().any(|a| a == aud));
            if !accepted {
                return Err(RelayError::Unauthenticated("token audience not accepted".into()));
            }
        }

        let granted = claims.scopes();
        let missing: Vec<&str> = self
            .config
            .required_scopes
            .iter()
            .map(String::as_str)
            .filter(|s| !granted.contains(s))
            .collect();
        if !missing.is_empty() {
            return Err(RelayError::Forbidden(format!(
                "token lacks scope(s): {}",
                missing.join(", ")
            )));
        }

        Ok(Identity {
            caller: claims.caller(),
            credential: Credential::Bearer(token.to_string()),
        })
    }
}

// ── Signed requests ─────────────────────────────────────────────

struct SigningKey {
    key: hmac::Key,
    agents: Vec<String>,
}

pub struct SignedRequestAuthenticator {
    keys: HashMap<String, SigningKey>,
    max_skew: Duration,
}

struct SignatureHeader<'a> {
    key_id: &'a str,
    signed_headers: Vec<&'a str>,
    signature: &'a str,
}

fn parse_signature_header(value: &str) -> Option<SignatureHeader<'_>> {
    let mut key_id = None;
    let mut signed_headers = None;
    let mut signature = None;
    for part in value.split(',') {
        let (name, val) = part.trim().split_once('=')?;
        match name.trim() {
            "keyId" => key_id = Some(val.trim()),
            "signedHeaders" => signed_headers = Some(val.trim().split(';').collect()),
            "signature" => signature = Some(val.trim()),
            _ => {}
        }
    }
    Some(SignatureHeader {
        key_id: key_id?,
        signed_headers: signed_headers?,
        signature: signature?,
    })
}

/// `METHOD\nPATH\n` + `name:value\n` per signed header + hex SHA-256 of the body.
pub fn canonical_request(method: &str, path: &str, headers: &[(&str, &str)], body: &[u8]) -> String {
    let mut canonical = format!("{}\n{}\n", method.to_ascii_uppercase(), path);
    for (name, value) in headers {
        canonical.push_str(&name.to_ascii_lowercase());
        canonical.push(':');
        canonical.push_str(value.trim());
        canonical.push('\n');
    }
    canonical.push_str(&hex::encode(Sha256::digest(body)));
    canonical
}

/// Value for the signature header of a request signed with `secret`.
pub fn sign_request(
    key_id: &str,
    secret: &str,
    method: &str,
    path: &str,
    headers: &[(&str, &str)],
    body: &[u8],
) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let canonical = canonical_request(method, path, headers, body);
    let mac = hmac::sign(&key, canonical.as_bytes());
    let names: Vec<String> = headers.iter().map(|(n, _)| n.to_ascii_lowercase()).collect();
    format!(
        "keyId={},signedHeaders={},signature={}",
        key_id,
        names.join(";"),
        hex::encode(mac.as_ref())
    )
}

impl SignedRequestAuthenticator {
    pub fn new(config: &SignedAuthConfig) -> Self {
        let keys = config
            .keys
            .iter()
            .map(|k| {
                (
                    k.key_id.clone(),
                    SigningKey {
                        key: hmac::Key::new(hmac::HMAC_SHA256, k.secret.as_bytes()),
                        agents: k.agents.clone(),
                    },
                )
            })
            .collect();
        Self {
            keys,
            max_skew: Duration::from_secs(config.max_skew_secs),
        }
    }

    fn verify(&self, request: &InboundRequest<'_>, now: i64) -> Result<Identity, RelayError> {
        let header = request
            .headers
            .get(SIGNATURE_HEADER)
            .ok_or_else(|| RelayError::Unauthenticated("missing request signature".into()))?
            .to_str()
            .map_err(|_| RelayError::Unauthenticated("malformed signature header".into()))?;
        let sig = parse_signature_header(header)
            .ok_or_else(|| RelayError::Unauthenticated("malformed signature header".into()))?;

        let key = self
            .keys
            .get(sig.key_id)
            .ok_or_else(|| RelayError::Unauthenticated(format!("unknown key id '{}'", sig.key_id)))?;

        if !sig.signed_headers.iter().any(|h| h.eq_ignore_ascii_case(DATE_HEADER)) {
            return Err(RelayError::Unauthenticated(format!("{} must be signed", DATE_HEADER)));
        }

        let mut signed = Vec::with_capacity(sig.signed_headers.len());
        for name in &sig.signed_headers {
            let value = request
                .headers
                .get(*name)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| RelayError::Unauthenticated(format!("signed header '{}' missing", name)))?;
            signed.push((*name, value));
        }

        let date: i64 = request
            .headers
            .get(DATE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse().ok())
            .ok_or_else(|| RelayError::Unauthenticated("invalid request date".into()))?;
        if now.abs_diff(date) > self.max_skew.as_secs() {
            return Err(RelayError::Unauthenticated("request date outside allowed skew".into()));
        }

        let provided = hex::decode(sig.signature)
            .map_err(|_| RelayError::Unauthenticated("malformed signature".into()))?;
        let canonical = canonical_request(request.method, request.path, &signed, request.body);
        hmac::verify(&key.key, canonical.as_bytes(), &provided)
            .map_err(|_| RelayError::Unauthenticated("signature mismatch".into()))?;

        if let Some(agent) = request.agent {
            if !key.agents.is_empty() && !key.agents.iter().any(|a| a == agent) {
                return Err(RelayError::Forbidden(format!(
                    "key '{}' may not address agent '{}'",
                    sig.key_id, agent
                )));
            }
        }

        Ok(Identity {
            caller: Some(sig.key_id.to_string()),
            credential: Credential::Signed {
                key_id: sig.key_id.to_string(),
            },
        })
    }
}

#[async_trait]
impl Authenticator for SignedRequestAuthenticator {
    fn scheme(&self) -> &'static str {
        "signed"
    }

    fn challenge(&self) -> String {
        format!("RelaySignature headers=\"{}\"", DATE_HEADER)
    }

    async fn authenticate(&self, request: &InboundRequest<'_>) -> Result<Identity, RelayError> {
        self.verify(request, chrono::Utc::now().timestamp())
    }
}
