//! Relay configuration: one TOML file, `${VAR}` expanded from the environment

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jsonwebtoken::Algorithm;
use relay_a2a::protocol::headers;
use relay_a2a::{OAuthClientConfig, runtime_invocation_url};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally visible base URL; rewrites the `url` of the served agent card
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_bind() -> String {
    "0.0.0.0:9000".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: None,
        }
    }
}

/// Exactly one credential scheme per deployment
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthConfig {
    Bearer(BearerAuthConfig),
    Signed(SignedAuthConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BearerAuthConfig {
    /// OIDC discovery document publishing `jwks_uri`
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
    /// Accepted `aud` values; Cognito access tokens carry `client_id` instead
    #[serde(default)]
    pub audiences: Vec<String>,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default = "default_algorithms")]
    pub algorithms: Vec<Algorithm>,
    #[serde(default = "default_leeway")]
    pub leeway_secs: u64,
    #[serde(default = "default_jwks_ttl")]
    pub jwks_ttl_secs: u64,
}

fn default_algorithms() -> Vec<Algorithm> {
    vec![Algorithm::RS256]
}
fn default_leeway() -> u64 {
    60
}
fn default_jwks_ttl() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignedAuthConfig {
    pub keys: Vec<SigningKeyConfig>,
    #[serde(default = "default_max_skew")]
    pub max_skew_secs: u64,
}

fn default_max_skew() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeyConfig {
    pub key_id: String,
    pub secret: String,
    /// Agents this key may address; empty means all
    #[serde(default)]
    pub agents: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_session_header")]
    pub header: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_session_header() -> String {
    headers::SESSION_ID.to_string()
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_max_sessions() -> usize {
    10_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            header: default_session_header(),
            idle_timeout_secs: default_idle_timeout(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_card_ttl")]
    pub card_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

fn default_card_ttl() -> u64 {
    300
}
fn default_cache_capacity() -> usize {
    256
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            card_ttl_secs: default_card_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

/// Per-method deadlines
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_send_timeout")]
    pub send_secs: u64,
    #[serde(default = "default_first_event_timeout")]
    pub stream_first_event_secs: u64,
    #[serde(default = "default_task_call_timeout")]
    pub task_call_secs: u64,
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_secs: u64,
}

fn default_send_timeout() -> u64 {
    300
}
fn default_first_event_timeout() -> u64 {
    60
}
fn default_task_call_timeout() -> u64 {
    30
}
fn default_stream_idle_timeout() -> u64 {
    300
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            send_secs: default_send_timeout(),
            stream_first_event_secs: default_first_event_timeout(),
            task_call_secs: default_task_call_timeout(),
            stream_idle_secs: default_stream_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Bounded queue length per subscription
    #[serde(default = "default_stream_buffer")]
    pub buffer: usize,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
}

fn default_stream_buffer() -> usize {
    64
}
fn default_keepalive() -> u64 {
    15
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer: default_stream_buffer(),
            keepalive_secs: default_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    /// How long a terminal task stays observable
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
    /// An unfinished task with no event for this long is given up on
    #[serde(default = "default_stale")]
    pub stale_secs: u64,
}

fn default_retention() -> u64 {
    3600
}
fn default_max_events() -> usize {
    1024
}
fn default_janitor_interval() -> u64 {
    60
}
fn default_stale() -> u64 {
    86_400
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention(),
            max_events: default_max_events(),
            janitor_interval_secs: default_janitor_interval(),
            stale_secs: default_stale(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub runtime_arn: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub default: bool,
    /// Post to the `url` advertised by the agent's card rather than the configured base
    #[serde(default)]
    pub resolve_card: bool,
    #[serde(default)]
    pub oauth: Option<OAuthClientConfig>,
}

impl AgentConfig {
    /// Service root the relay posts to (and resolves discovery under).
    pub fn endpoint(&self) -> Option<String> {
        match (&self.url, &self.runtime_arn, &self.region) {
            (Some(url), None, _) => Some(url.clone()),
            (None, Some(arn), Some(region)) => Some(runtime_invocation_url(region, arn)),
            _ => None,
        }
    }
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut raw: toml::Value = toml::from_str(content).context("Failed to parse TOML")?;
        expand_env(&mut raw)?;
        let config: RelayConfig = raw.try_into().context("Failed to decode relay config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.agents.is_empty() {
            bail!("At least one [[agents]] entry is required");
        }

        let mut names = HashSet::new();
        for agent in &self.agents {
            if agent.name.trim().is_empty() {
                bail!("Agent name cannot be empty");
            }
            if !names.insert(agent.name.as_str()) {
                bail!("Duplicate agent name '{}'", agent.name);
            }
            if agent.endpoint().is_none() {
                bail!(
                    "Agent '{}' needs either `url` or both `runtime_arn` and `region`",
                    agent.name
                );
            }
        }
        if self.agents.iter().filter(|a| a.default).count() > 1 {
            bail!("At most one agent may be marked default");
        }

        match &self.auth {
            AuthConfig::Bearer(bearer) => {
                if bearer.discovery_url.is_none() && bearer.jwks_url.is_none() {
                    bail!("Bearer auth needs `discovery_url` or `jwks_url`");
                }
                if bearer.algorithms.is_empty() {
                    bail!("Bearer auth needs at least one accepted algorithm");
                }
            }
            AuthConfig::Signed(signed) => {
                if signed.keys.is_empty() {
                    bail!("Signed auth needs at least one key");
                }
                let mut ids = HashSet::new();
                for key in &signed.keys {
                    if key.secret.is_empty() {
                        bail!("Signing key '{}' has an empty secret", key.key_id);
                    }
                    if !ids.insert(key.key_id.as_str()) {
                        bail!("Duplicate signing key id '{}'", key.key_id);
                    }
                    if let Some(unknown) = key.agents.iter().find(|a| !names.contains(a.as_str())) {
                        bail!("Signing key '{}' names unknown agent '{}'", key.key_id, unknown);
                    }
                }
            }
        }

        if self.streaming.buffer < 2 {
            bail!("streaming.buffer must be at least 2");
        }
        if self.session.header.trim().is_empty() {
            bail!("session.header cannot be empty");
        }
        Ok(())
    }

    /// The agent addressed when a request names none.
    pub fn default_agent(&self) -> Option<&AgentConfig> {
        self.agents
            .iter()
            .find(|a| a.default)
            .or_else(|| self.agents.first())
    }
}

/// Replace `${VAR}` in every string value with the environment variable's value.
fn expand_env(value: &mut toml::Value) -> Result<()> {
    match value {
        toml::Value::String(s) => {
            if s.contains("${") {
                *s = expand_str(s)?;
            }
        }
        toml::Value::Array(items) => {
            for item in items {
                expand_env(item)?;
            }
        }
        toml::Value::Table(table) => {
            for (_, item) in table.iter_mut() {
                expand_env(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn expand_str(input: &str) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            bail!("Unterminated ${{...}} in config value");
        };
        let name = &after[..end];
        let value = std::env::var(name)
            .with_context(|| format!("Environment variable {} is not set", name))?;
        out.push_str(&value);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[auth]
scheme = "signed"
keys = [{ key_id = "ops", secret = "s3cret" }]

[[agents]]
name = "monitoring"
url = "http://127.0.0.1:9001/"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = RelayConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.session.header, headers::SESSION_ID);
        assert_eq!(config.timeouts.send_secs, 300);
        assert_eq!(config.tasks.max_events, 1024);
        assert_eq!(config.tasks.stale_secs, 86_400);
        assert_eq!(config.default_agent().unwrap().name, "monitoring");
        assert!(matches!(config.auth, AuthConfig::Signed(ref s) if s.max_skew_secs == 300));
    }

    #[test]
    fn test_bearer_config() {
        let toml = r#"
[auth]
scheme = "bearer"
discovery_url = "https://cognito-idp.us-east-1.amazonaws.com/pool/.well-known/openid-configuration"
audiences = ["client-1"]
required_scopes = ["relay/invoke"]

[[agents]]
name = "ops"
runtime_arn = "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/ops-abc"
region = "us-east-1"
"#;
        let config = RelayConfig::parse(toml).unwrap();
        let AuthConfig::Bearer(bearer) = &config.auth else {
            panic!("expected bearer");
        };
        assert_eq!(bearer.algorithms, vec![Algorithm::RS256]);
        let endpoint = config.agents[0].endpoint().unwrap();
        assert!(endpoint.starts_with("https://bedrock-agentcore.us-east-1.amazonaws.com/runtimes/arn%3A"));
    }

    #[test]
    fn test_missing_auth_is_rejected() {
        let toml = r#"
[[agents]]
name = "a"
url = "http://x/"
"#;
        assert!(RelayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_agent_needs_one_address() {
        let toml = MINIMAL.replace("url = \"http://127.0.0.1:9001/\"", "region = \"us-east-1\"");
        let err = RelayConfig::parse(&toml).unwrap_err();
        assert!(format!("{:#}", err).contains("runtime_arn"));
    }

    #[test]
    fn test_duplicate_agents_rejected() {
        let toml = format!("{}\n[[agents]]\nname = \"monitoring\"\nurl = \"http://y/\"\n", MINIMAL);
        let err = RelayConfig::parse(&toml).unwrap_err();
        assert!(format!("{:#}", err).contains("Duplicate agent"));
    }

    #[test]
    fn test_two_defaults_rejected() {
        let toml = r#"
[auth]
scheme = "signed"
keys = [{ key_id = "ops", secret = "s" }]

[[agents]]
name = "a"
url = "http://a/"
default = true

[[agents]]
name = "b"
url = "http://b/"
default = true
"#;
        assert!(RelayConfig::parse(toml).is_err());
    }

    #[test]
    fn test_key_allow_list_must_name_known_agents() {
        let toml = MINIMAL.replace(
            "{ key_id = \"ops\", secret = \"s3cret\" }",
            "{ key_id = \"ops\", secret = \"s3cret\", agents = [\"billing\"] }",
        );
        let err = RelayConfig::parse(&toml).unwrap_err();
        assert!(format!("{:#}", err).contains("billing"));
    }

    #[test]
    fn test_env_expansion() {
        // SAFETY: test-only variable with a unique name
        unsafe { std::env::set_var("RELAY_TEST_SIGNING_SECRET", "from-env") };
        let toml = MINIMAL.replace("s3cret", "${RELAY_TEST_SIGNING_SECRET}");
        let config = RelayConfig::parse(&toml).unwrap();
        let AuthConfig::Signed(signed) = &config.auth else {
            panic!("expected signed");
        };
        assert_eq!(signed.keys[0].secret, "from-env");
    }

    #[test]
    fn test_missing_env_var_fails() {
        let toml = MINIMAL.replace("s3cret", "${RELAY_TEST_DEFINITELY_UNSET_VAR}");
        assert!(RelayConfig::parse(&toml).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();
        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.agents.len(), 1);

        assert!(RelayConfig::load(Path::new("/nonexistent/relay.toml")).is_err());
    }
}
