//! Proxy front door powered by axum
//!
//! Serves:
//! - `GET  /ping`                         liveness, no auth
//! - `GET  /.well-known/agent-card.json`  the hosted agent's card (also `agent.json`)
//! - `POST /`, `POST /invocations`        JSON-RPC to the default agent
//! - `POST /agents/{agent}`               JSON-RPC to a named agent
//! - `GET  /agents`                       configured agents
//! - anything else                        forwarded unchanged to the default agent

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::{CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures_util::StreamExt;
use relay_a2a::protocol::headers;
use relay_a2a::{AgentClient, CardResolver, JsonRpcResponse, RelayError};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::auth::{AuthContext, DATE_HEADER, Gatekeeper, InboundRequest, SIGNATURE_HEADER};
use crate::config::RelayConfig;
use crate::router::{AgentDirectory, AgentRoute, Deadlines, MessageRouter, RouteOutcome, RouteRequest};
use crate::session::SessionManager;
use crate::stream::StreamManager;
use crate::tasks::TaskTracker;

/// Request headers never forwarded on passthrough: hop-by-hop headers and
/// the caller's own credentials
const NOT_FORWARDED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "authorization",
    SIGNATURE_HEADER,
    DATE_HEADER,
];

/// Shared state for the front door.
#[derive(Clone)]
pub struct RelayState {
    pub gatekeeper: Gatekeeper,
    pub router: MessageRouter,
    pub resolver: Arc<CardResolver>,
    pub streams: StreamManager,
    pub public_url: Option<String>,
    pub keepalive: Duration,
    pub started_at: Instant,
}

impl RelayState {
    /// Wire every component from configuration. Nothing is fetched yet.
    pub fn from_config(config: &RelayConfig, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let resolver = Arc::new(CardResolver::new(
            http.clone(),
            Duration::from_secs(config.discovery.card_ttl_secs),
            config.discovery.cache_capacity,
        ));
        let directory = Arc::new(
            AgentDirectory::from_config(&config.agents, &http).context("Invalid agent directory")?,
        );
        let tracker = TaskTracker::new(config.tasks.max_events);
        let deadlines = Deadlines::from(&config.timeouts);
        let streams = StreamManager::new(
            tracker.clone(),
            config.streaming.buffer,
            deadlines.stream_idle,
            shutdown.clone(),
        );
        let router = MessageRouter::new(
            AgentClient::from_client(http.clone()),
            resolver.clone(),
            directory,
            tracker,
            streams.clone(),
            deadlines,
            config.session.header.clone(),
            shutdown,
        );
        let sessions = SessionManager::new(config.session.max_sessions, config.session.idle_timeout());
        let gatekeeper = Gatekeeper::from_config(&config.auth, http, sessions, &config.session.header);

        Ok(Self {
            gatekeeper,
            router,
            resolver,
            streams,
            public_url: config.server.public_url.clone(),
            keepalive: Duration::from_secs(config.streaming.keepalive_secs),
            started_at: Instant::now(),
        })
    }
}

/// Build the axum router for the relay.
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/.well-known/agent-card.json", get(agent_card))
        .route("/.well-known/agent.json", get(agent_card))
        .route("/agents", get(list_agents).fallback(passthrough))
        .route("/", post(invoke_default).fallback(passthrough))
        .route("/invocations", post(invoke_default).fallback(passthrough))
        .route("/agents/{agent}", post(invoke_agent).fallback(passthrough))
        .fallback(passthrough)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the relay until `shutdown` fires.
pub async fn serve(config: RelayConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    let state = RelayState::from_config(&config, shutdown.clone())?;
    let janitor = spawn_janitor(&state, &config, shutdown.clone());

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("A2A relay listening on http://{}", addr);
    for agent in state.router.directory().list() {
        info!(
            "   agent '{}' -> {}{}",
            agent.name,
            agent.endpoint,
            if agent.default { " (default)" } else { "" }
        );
    }

    let app = build_router(state);
    let token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await
        .context("Relay server failed")?;

    shutdown.cancel();
    let _ = janitor.await;
    info!("A2A relay stopped");
    Ok(())
}

/// Periodically evict finished or abandoned tasks and idle sessions.
fn spawn_janitor(
    state: &RelayState,
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let tracker = state.router.tracker().clone();
    let sessions = state.gatekeeper.sessions().clone();
    let retention = Duration::from_secs(config.tasks.retention_secs);
    let stale_after = Duration::from_secs(config.tasks.stale_secs);
    let period = Duration::from_secs(config.tasks.janitor_interval_secs.max(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let tasks = tracker.evict_expired(retention, stale_after);
                    let idle = sessions.sweep_idle();
                    debug!("Janitor pass: {} task(s), {} session(s) removed", tasks, idle);
                }
            }
        }
    })
}

/// GET /ping: liveness, independent of the JSON-RPC path.
async fn ping(State(state): State<RelayState>) -> Json<Value> {
    Json(json!({
        "status": "Healthy",
        "time_of_last_update": chrono::Utc::now().timestamp(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "tracked_tasks": state.router.tracker().len(),
        "active_streams": state.streams.active(),
        "sessions": state.gatekeeper.sessions().count(),
    }))
}

/// GET /.well-known/agent-card.json: card of the locally hosted (default) agent.
async fn agent_card(State(state): State<RelayState>) -> Response {
    let agent = state.router.directory().default_agent().clone();
    match state.resolver.resolve(&agent.endpoint).await {
        Ok(card) => {
            let mut card = card.as_ref().clone();
            if let Some(public_url) = &state.public_url {
                card.url = public_url.clone();
            }
            Json(card).into_response()
        }
        Err(e) => {
            warn!("Cannot serve agent card for '{}': {}", agent.name, e);
            (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}

/// GET /agents: the agent directory.
async fn list_agents(State(state): State<RelayState>, headers: HeaderMap) -> Response {
    let request = InboundRequest {
        method: "GET",
        path: "/agents",
        headers: &headers,
        body: &[],
        agent: None,
    };
    if let Err(e) = state.gatekeeper.authenticate(&request).await {
        return auth_failure(&state.gatekeeper, &e, Value::Null, false);
    }
    let agents: Vec<&AgentRoute> = state.router.directory().list().iter().map(Arc::as_ref).collect();
    Json(json!({ "agents": agents })).into_response()
}

/// POST / and /invocations: JSON-RPC to the default agent or the one named by header.
async fn invoke_default(State(state): State<RelayState>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let key = headers
        .get(headers::ROUTING_KEY)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    handle_rpc(state, key, uri, headers, body).await
}

/// POST /agents/{agent}: JSON-RPC to a named agent.
async fn invoke_agent(
    State(state): State<RelayState>,
    Path(agent): Path<String>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle_rpc(state, Some(agent), uri, headers, body).await
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(headers::CORRELATION_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

/// Best-effort request id for errors raised before routing
fn peek_id(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("id").cloned())
        .filter(|id| matches!(id, Value::String(_) | Value::Number(_)))
        .unwrap_or(Value::Null)
}

async fn handle_rpc(state: RelayState, key: Option<String>, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let correlation_id = correlation_id(&headers);
    let directory = state.router.directory();
    let resolved = directory.resolve(key.as_deref());
    let agent_name = match &resolved {
        Ok(route) => Some(route.name.clone()),
        Err(_) => key.clone(),
    };

    let request = InboundRequest {
        method: "POST",
        path: uri.path(),
        headers: &headers,
        body: &body,
        agent: agent_name.as_deref(),
    };
    let auth = match state.gatekeeper.authenticate(&request).await {
        Ok(ctx) => ctx,
        Err(e) => return auth_failure(&state.gatekeeper, &e, peek_id(&body), true),
    };

    let agent = match resolved {
        Ok(agent) => agent,
        Err(e) => {
            let reply = JsonRpcResponse::from_error(peek_id(&body), &e);
            return with_correlation(Json(reply).into_response(), &state, &auth, &correlation_id);
        }
    };

    let last_event_id = headers
        .get(headers::LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok());

    let outcome = state
        .router
        .route(
            RouteRequest {
                body,
                agent,
                correlation_id: correlation_id.clone(),
                last_event_id,
            },
            &auth,
        )
        .await;

    let response = match outcome {
        RouteOutcome::Reply {
            body,
            transport_failure,
        } => {
            let status = if transport_failure {
                StatusCode::BAD_GATEWAY
            } else {
                StatusCode::OK
            };
            (status, [(CONTENT_TYPE, "application/json")], body).into_response()
        }
        RouteOutcome::Events(frames) => {
            let events = frames.map(|frame| {
                let mut event = Event::default().data(frame.data);
                if let Some(seq) = frame.id {
                    event = event.id(seq.to_string());
                }
                Ok::<Event, Infallible>(event)
            });
            Sse::new(events)
                .keep_alive(KeepAlive::new().interval(state.keepalive))
                .into_response()
        }
    };
    with_correlation(response, &state, &auth, &correlation_id)
}

/// Echo the session and trace ids on a response.
fn with_correlation(mut response: Response, state: &RelayState, auth: &AuthContext, correlation_id: &str) -> Response {
    let headers = response.headers_mut();
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(state.gatekeeper.session_header().as_bytes()),
        HeaderValue::from_str(&auth.session_id),
    ) {
        headers.insert(name, value);
    }
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        headers.insert(headers::CORRELATION_ID, value);
    }
    response
}

fn auth_failure(gatekeeper: &Gatekeeper, err: &RelayError, id: Value, jsonrpc: bool) -> Response {
    let status = match err {
        RelayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
        RelayError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_REQUEST,
    };
    let body = if jsonrpc {
        serde_json::to_value(JsonRpcResponse::from_error(id, err)).unwrap_or(Value::Null)
    } else {
        json!({ "error": err.to_string() })
    };
    let mut response = (status, Json(body)).into_response();
    if status == StatusCode::UNAUTHORIZED {
        if let Ok(value) = HeaderValue::from_str(&gatekeeper.challenge()) {
            response.headers_mut().insert(WWW_AUTHENTICATE, value);
        }
    }
    response
}

/// Anything else: forwarded unchanged to the default agent after authentication.
async fn passthrough(State(state): State<RelayState>, method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Response {
    let correlation_id = correlation_id(&headers);
    let agent = state.router.directory().default_agent().clone();
    let request = InboundRequest {
        method: method.as_str(),
        path: uri.path(),
        headers: &headers,
        body: &body,
        agent: Some(agent.name.as_str()),
    };
    let auth = match state.gatekeeper.authenticate(&request).await {
        Ok(ctx) => ctx,
        Err(e) => return auth_failure(&state.gatekeeper, &e, Value::Null, false),
    };

    let outbound = match state.router.outbound_headers(&agent, &auth, &correlation_id).await {
        Ok(h) => h,
        Err(e) => return (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response(),
    };
    let mut forward = HeaderMap::new();
    for (name, value) in headers.iter() {
        if !NOT_FORWARDED.contains(&name.as_str()) {
            forward.append(name.clone(), value.clone());
        }
    }
    match outbound.to_header_map() {
        Ok(extra) => forward.extend(extra),
        Err(e) => return (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response(),
    }

    let target = format!(
        "{}{}",
        agent.endpoint.trim_end_matches('/'),
        uri.path_and_query().map(|p| p.as_str()).unwrap_or("/")
    );
    debug!("Passthrough {} {} -> {}", method, uri, target);

    let upstream = match state.router.client().passthrough(method, &target, forward, body).await {
        Ok(resp) => resp,
        Err(e) => {
            warn!("Passthrough to '{}' failed: {}", agent.name, e);
            return (StatusCode::BAD_GATEWAY, Json(json!({ "error": e.to_string() }))).into_response();
        }
    };

    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        let name_str = name.as_str();
        if name_str != "transfer-encoding" && name_str != "connection" && name_str != "content-length" {
            builder = builder.header(name.clone(), value.clone());
        }
    }
    let response = builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    with_correlation(response, &state, &auth, &correlation_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DATE_HEADER, SIGNATURE_HEADER, sign_request};
    use axum::http::Request;
    use relay_a2a::protocol::error_codes;
    use tower::ServiceExt;
    use wiremock::matchers::{method as http_method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(agent_url: &str) -> RelayConfig {
        let toml = format!(
            r#"
[server]
public_url = "https://relay.example/"

[auth]
scheme = "signed"
keys = [
    {{ key_id = "ops", secret = "s3cret" }},
    {{ key_id = "billing-only", secret = "other", agents = ["billing"] }},
]

[[agents]]
name = "ops"
url = "{agent_url}"
default = true

[[agents]]
name = "billing"
url = "http://127.0.0.1:1/"
"#
        );
        RelayConfig::parse(&toml).unwrap()
    }

    fn app(config: &RelayConfig) -> Router {
        build_router(RelayState::from_config(config, CancellationToken::new()).unwrap())
    }

    fn signed(key_id: &str, secret: &str, method: &str, uri: &str, body: &str) -> Request<Body> {
        let date = chrono::Utc::now().timestamp().to_string();
        let path = uri.split('?').next().unwrap_or(uri);
        let signature = sign_request(key_id, secret, method, path, &[(DATE_HEADER, date.as_str())], body.as_bytes());
        Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .header(DATE_HEADER, date)
            .header(SIGNATURE_HEADER, signature)
            .header(headers::SESSION_ID, "conversation-1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const SEND: &str = r#"{"jsonrpc":"2.0","id":1,"method":"message/send","params":{}}"#;

    #[tokio::test]
    async fn test_ping_needs_no_auth() {
        let app = app(&config("http://127.0.0.1:1/"));
        let req = Request::builder().uri("/ping").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "Healthy");
    }

    #[tokio::test]
    async fn test_agent_card_served_with_public_url() {
        let agent = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/.well-known/agent-card.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "ops",
                "version": "1.0.0",
                "url": agent.uri(),
                "preferredTransport": "JSONRPC",
                "capabilities": {"streaming": true}
            })))
            .expect(1)
            .mount(&agent)
            .await;

        let app = app(&config(&format!("{}/", agent.uri())));
        for uri in ["/.well-known/agent-card.json", "/.well-known/agent.json"] {
            let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let resp = app.clone().oneshot(req).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let card = body_json(resp).await;
            assert_eq!(card["url"], "https://relay.example/");
            assert_eq!(card["name"], "ops");
        }
    }

    #[tokio::test]
    async fn test_missing_credentials_get_401() {
        let app = app(&config("http://127.0.0.1:1/"));
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::from(SEND))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert!(resp.headers().contains_key(WWW_AUTHENTICATE));
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], error_codes::UNAUTHENTICATED);
        assert_eq!(body["id"], 1);
    }

    #[tokio::test]
    async fn test_key_outside_allow_list_gets_403() {
        let app = app(&config("http://127.0.0.1:1/"));
        let resp = app
            .oneshot(signed("billing-only", "other", "POST", "/agents/ops", SEND))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_json(resp).await["error"]["code"], error_codes::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_signed_call_is_relayed_with_session() {
        let agent = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(wiremock::matchers::header(headers::SESSION_ID, "conversation-1"))
            .and(wiremock::matchers::header(headers::CALLER, "ops"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw(r#"{"jsonrpc":"2.0","id":1,"result":"4"}"#, "application/json"),
            )
            .expect(2)
            .mount(&agent)
            .await;

        let app = app(&config(&format!("{}/", agent.uri())));
        for uri in ["/agents/ops", "/invocations"] {
            let resp = app
                .clone()
                .oneshot(signed("ops", "s3cret", "POST", uri, SEND))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers().get(headers::SESSION_ID).unwrap(), "conversation-1");
            assert!(resp.headers().contains_key(headers::CORRELATION_ID));
            assert_eq!(body_json(resp).await["result"], "4");
        }
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let app = app(&config("http://127.0.0.1:1/"));
        let resp = app
            .oneshot(signed("ops", "s3cret", "POST", "/agents/nobody", SEND))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["error"]["code"], error_codes::UNKNOWN_AGENT);
    }

    #[tokio::test]
    async fn test_unreachable_agent_is_bad_gateway() {
        let app = app(&config("http://127.0.0.1:1/"));
        let resp = app
            .oneshot(signed("ops", "s3cret", "POST", "/", SEND))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(resp).await;
        assert_eq!(body["error"]["code"], error_codes::AGENT_UNREACHABLE);
        assert_eq!(body["id"], 1);
    }

    #[tokio::test]
    async fn test_stream_is_served_as_sse() {
        let agent = MockServer::start().await;
        let sse = concat!(
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"kind\":\"task\",\"id\":\"t-1\",\"status\":{\"state\":\"submitted\"}}}\n\n",
            "data: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"kind\":\"status-update\",\"taskId\":\"t-1\",\"status\":{\"state\":\"completed\"},\"final\":true}}\n\n",
        );
        Mock::given(http_method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&agent)
            .await;

        let app = app(&config(&format!("{}/", agent.uri())));
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"message/stream","params":{}}"#;
        let resp = app.oneshot(signed("ops", "s3cret", "POST", "/", body)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(
            resp.headers()
                .get(CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/event-stream")
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("id: 1\n"));
        assert!(text.contains("id: 2\n"));
        assert!(text.contains("\"completed\""));
    }

    #[tokio::test]
    async fn test_list_agents_requires_auth() {
        let app = app(&config("http://127.0.0.1:1/"));
        let req = Request::builder().uri("/agents").body(Body::empty()).unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = app.oneshot(signed("ops", "s3cret", "GET", "/agents", "")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        let names: Vec<&str> = body["agents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|a| a["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["ops", "billing"]);
        assert_eq!(body["agents"][0]["default"], true);
    }

    #[tokio::test]
    async fn test_other_paths_pass_through() {
        let agent = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/status/detail"))
            .and(wiremock::matchers::query_param("verbose", "1"))
            .and(wiremock::matchers::header(headers::CALLER, "ops"))
            .respond_with(ResponseTemplate::new(202).set_body_string("fine"))
            .expect(1)
            .mount(&agent)
            .await;

        let app = app(&config(&format!("{}/", agent.uri())));
        let resp = app
            .oneshot(signed("ops", "s3cret", "GET", "/status/detail?verbose=1", ""))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"fine");

        // The caller's signature stays at the relay
        let received = agent.received_requests().await.unwrap();
        let forwarded = &received[0].headers;
        assert!(!forwarded.contains_key(SIGNATURE_HEADER));
        assert!(!forwarded.contains_key(DATE_HEADER));
        assert_eq!(forwarded.get(headers::SESSION_ID).unwrap(), "conversation-1");
    }
}
