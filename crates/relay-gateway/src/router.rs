//! Message router
//!
//! Takes one authenticated JSON-RPC envelope, decides what to do from its
//! `method` alone and carries it to the addressed agent. Payloads travel
//! byte-identical; only transport headers are added. Agent answers come back
//! either as a single JSON-RPC response or as a task that is then tracked and,
//! for streaming calls, delivered through a subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use relay_a2a::protocol::TaskIdParams;
use relay_a2a::{
    AgentClient, AgentReply, CardResolver, JsonRpcRequest, JsonRpcResponse, Method,
    OAuthTokenSource, OutboundHeaders, RelayError, ResultShape, UpstreamFrames,
};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::auth::AuthContext;
use crate::config::{AgentConfig, TimeoutConfig};
use crate::stream::{StreamItem, StreamManager};
use crate::tasks::{AppendOutcome, CancelOutcome, EventKind, TaskSnapshot, TaskTracker};

const FALLBACK_ERROR_BODY: &[u8] =
    br#"{"jsonrpc":"2.0","id":null,"error":{"code":-32603,"message":"internal error"}}"#;

/// One addressable agent
#[derive(Serialize)]
pub struct AgentRoute {
    pub name: String,
    pub endpoint: String,
    pub default: bool,
    #[serde(skip)]
    pub resolve_card: bool,
    #[serde(skip)]
    pub oauth: Option<Arc<OAuthTokenSource>>,
}

/// Routing key → agent
pub struct AgentDirectory {
    agents: HashMap<String, Arc<AgentRoute>>,
    order: Vec<Arc<AgentRoute>>,
    default: Arc<AgentRoute>,
}

impl AgentDirectory {
    pub fn from_config(agents: &[AgentConfig], http: &reqwest::Client) -> Result<Self, RelayError> {
        let default_name = agents
            .iter()
            .find(|a| a.default)
            .or_else(|| agents.first())
            .map(|a| a.name.clone())
            .ok_or_else(|| RelayError::Internal("no agents configured".into()))?;

        let mut map = HashMap::new();
        let mut order = Vec::with_capacity(agents.len());
        for agent in agents {
            let endpoint = agent.endpoint().ok_or_else(|| {
                RelayError::Internal(format!("agent '{}' has no endpoint", agent.name))
            })?;
            let route = Arc::new(AgentRoute {
                name: agent.name.clone(),
                endpoint,
                default: agent.name == default_name,
                resolve_card: agent.resolve_card,
                oauth: agent
                    .oauth
                    .clone()
                    .map(|cfg| Arc::new(OAuthTokenSource::new(http.clone(), cfg))),
            });
            map.insert(agent.name.clone(), route.clone());
            order.push(route);
        }

        let default = map
            .get(&default_name)
            .cloned()
            .ok_or_else(|| RelayError::Internal("default agent missing".into()))?;
        Ok(Self {
            agents: map,
            order,
            default,
        })
    }

    /// The agent named by `key`, or the default agent when there is no key.
    pub fn resolve(&self, key: Option<&str>) -> Result<Arc<AgentRoute>, RelayError> {
        match key {
            None => Ok(self.default.clone()),
            Some(name) => self
                .agents
                .get(name)
                .cloned()
                .ok_or_else(|| RelayError::UnknownAgent(name.to_string())),
        }
    }

    pub fn default_agent(&self) -> &Arc<AgentRoute> {
        &self.default
    }

    pub fn list(&self) -> &[Arc<AgentRoute>] {
        &self.order
    }
}

/// Per-method deadlines
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub send: Duration,
    pub stream_first_event: Duration,
    pub task_call: Duration,
    pub stream_idle: Duration,
}

impl From<&TimeoutConfig> for Deadlines {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            send: Duration::from_secs(config.send_secs),
            stream_first_event: Duration::from_secs(config.stream_first_event_secs),
            task_call: Duration::from_secs(config.task_call_secs),
            stream_idle: Duration::from_secs(config.stream_idle_secs),
        }
    }
}

/// A caller-visible server-sent event
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub id: Option<u64>,
    pub data: String,
}

pub type EventStream = BoxStream<'static, SseFrame>;

pub enum RouteOutcome {
    Reply {
        body: Bytes,
        /// The agent could not be reached; surfaced as a gateway error
        transport_failure: bool,
    },
    Events(EventStream),
}

impl RouteOutcome {
    fn error(id: Value, err: &RelayError) -> Self {
        Self::Reply {
            body: encode(&JsonRpcResponse::from_error(id, err)),
            transport_failure: err.is_transport(),
        }
    }

    fn success(id: Value, result: Value) -> Self {
        Self::Reply {
            body: encode(&JsonRpcResponse::success(id, result)),
            transport_failure: false,
        }
    }
}

pub struct RouteRequest {
    pub body: Bytes,
    pub agent: Arc<AgentRoute>,
    pub correlation_id: String,
    /// `Last-Event-ID` of a reattaching stream
    pub last_event_id: Option<u64>,
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .unwrap_or_else(|_| Bytes::from_static(FALLBACK_ERROR_BODY))
}

/// Keeps a request id outstanding for its session until dropped
struct OutstandingGuard {
    table: Arc<DashMap<(String, String), ()>>,
    key: (String, String),
}

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.table.remove(&self.key);
    }
}

/// Everything a method handler needs about the current call
struct Call {
    id: Value,
    method: Method,
    params: Value,
    body: Bytes,
    agent: Arc<AgentRoute>,
    session_id: String,
    outbound: OutboundHeaders,
    last_event_id: Option<u64>,
}

#[derive(Clone)]
pub struct MessageRouter {
    client: AgentClient,
    resolver: Arc<CardResolver>,
    directory: Arc<AgentDirectory>,
    tracker: TaskTracker,
    streams: StreamManager,
    outstanding: Arc<DashMap<(String, String), ()>>,
    deadlines: Deadlines,
    session_header: String,
    shutdown: CancellationToken,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: AgentClient,
        resolver: Arc<CardResolver>,
        directory: Arc<AgentDirectory>,
        tracker: TaskTracker,
        streams: StreamManager,
        deadlines: Deadlines,
        session_header: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            resolver,
            directory,
            tracker,
            streams,
            outstanding: Arc::new(DashMap::new()),
            deadlines,
            session_header: session_header.into(),
            shutdown,
        }
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn client(&self) -> &AgentClient {
        &self.client
    }

    /// Requests currently holding an id slot
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Route one envelope. Every failure becomes a JSON-RPC error reply.
    pub async fn route(&self, request: RouteRequest, auth: &AuthContext) -> RouteOutcome {
        let envelope: Value = match serde_json::from_slice(&request.body) {
            Ok(v) => v,
            Err(e) => return RouteOutcome::error(Value::Null, &RelayError::Parse(e.to_string())),
        };
        let raw_id = envelope.get("id").cloned().unwrap_or(Value::Null);
        let rpc: JsonRpcRequest = match serde_json::from_value(envelope) {
            Ok(r) => r,
            Err(e) => return RouteOutcome::error(raw_id, &RelayError::InvalidRequest(e.to_string())),
        };
        let id = rpc.id_or_null();
        if rpc.jsonrpc != "2.0" {
            return RouteOutcome::error(id, &RelayError::InvalidRequest("jsonrpc must be \"2.0\"".into()));
        }
        if !matches!(id, Value::Null | Value::String(_) | Value::Number(_)) {
            return RouteOutcome::error(
                Value::Null,
                &RelayError::InvalidRequest("id must be a string, number or null".into()),
            );
        }
        let method: Method = match rpc.method.parse() {
            Ok(m) => m,
            Err(e) => return RouteOutcome::error(id, &e),
        };

        let span = info_span!(
            "route",
            session_id = %auth.session_id,
            trace_id = %request.correlation_id,
            method = %method,
            agent = %request.agent.name,
        );

        async move {
            let guard = match self.claim(&auth.session_id, &id) {
                Ok(guard) => guard,
                Err(e) => return RouteOutcome::error(id, &e),
            };
            let outbound = match self.outbound_headers(&request.agent, auth, &request.correlation_id).await {
                Ok(h) => h,
                Err(e) => return RouteOutcome::error(id, &e),
            };

            let call = Call {
                id,
                method,
                params: rpc.params,
                body: request.body,
                agent: request.agent,
                session_id: auth.session_id.clone(),
                outbound,
                last_event_id: request.last_event_id,
            };
            debug!("Dispatching {}", call.method);

            match call.method {
                Method::MessageSend => self.send(call).await,
                Method::MessageStream => self.stream(call, guard).await,
                Method::TasksGet => self.get_task(call).await,
                Method::TasksCancel => self.cancel_task(call).await,
                Method::TasksResubscribe => self.resubscribe(call, guard),
            }
        }
        .instrument(span)
        .await
    }

    fn claim(&self, session_id: &str, id: &Value) -> Result<Option<OutstandingGuard>, RelayError> {
        if id.is_null() {
            return Ok(None);
        }
        let key = (session_id.to_string(), id.to_string());
        match self.outstanding.entry(key.clone()) {
            Entry::Occupied(_) => Err(RelayError::DuplicateRequestId(id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(Some(OutstandingGuard {
                    table: self.outstanding.clone(),
                    key,
                }))
            }
        }
    }

    /// Transport headers for a call to `agent` on behalf of `auth`.
    pub async fn outbound_headers(
        &self,
        agent: &AgentRoute,
        auth: &AuthContext,
        correlation_id: &str,
    ) -> Result<OutboundHeaders, RelayError> {
        let (authorization, caller) = match &agent.oauth {
            Some(source) => (Some(format!("Bearer {}", source.token().await?)), auth.caller.clone()),
            None => (auth.forward_authorization(), auth.forward_caller()),
        };
        Ok(OutboundHeaders {
            session_header: self.session_header.clone(),
            session_id: auth.session_id.clone(),
            correlation_id: correlation_id.to_string(),
            authorization,
            caller,
        })
    }

    /// Where to post: the configured endpoint, or the card's when card-driven.
    async fn endpoint(&self, agent: &AgentRoute, method: Method) -> Result<String, RelayError> {
        if !agent.resolve_card {
            return Ok(agent.endpoint.clone());
        }
        let card = self.resolver.resolve(&agent.endpoint).await?;
        if method == Method::MessageStream && !card.supports_streaming() {
            return Err(RelayError::UnsupportedOperation(format!(
                "agent '{}' does not support streaming",
                agent.name
            )));
        }
        card.primary_endpoint()
            .map(String::from)
            .ok_or_else(|| RelayError::InvalidCard(format!("card '{}' has no endpoint", card.name)))
    }

    async fn invoke(&self, call: &Call, deadline: Duration, want_stream: bool) -> Result<AgentReply, RelayError> {
        let endpoint = self.endpoint(&call.agent, call.method).await?;
        tokio::time::timeout(
            deadline,
            self.client.invoke(&endpoint, call.body.clone(), &call.outbound, want_stream),
        )
        .await
        .map_err(|_| {
            warn!("{} to agent '{}' timed out after {:?}", call.method, call.agent.name, deadline);
            RelayError::Timeout {
                method: call.method.to_string(),
                after: deadline,
            }
        })?
    }

    /// Relay a single agent response, registering any task it announces.
    fn relay_json(&self, call: &Call, bytes: Bytes) -> RouteOutcome {
        let response: Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                warn!("Agent '{}' answered with invalid JSON: {}", call.agent.name, e);
                return RouteOutcome::error(
                    call.id.clone(),
                    &RelayError::Internal("agent answered with invalid JSON".into()),
                );
            }
        };
        let agent_id = response.get("id").cloned().unwrap_or(Value::Null);
        if agent_id != call.id {
            warn!("Agent '{}' answered id {} for request {}", call.agent.name, agent_id, call.id);
            return RouteOutcome::error(
                call.id.clone(),
                &RelayError::Internal(format!("agent answered with mismatched id {}", agent_id)),
            );
        }

        if let Some(result) = response.get("result") {
            self.observe(call, result);
        }
        RouteOutcome::Reply {
            body: bytes,
            transport_failure: false,
        }
    }

    /// Register a task descriptor, or fold a task-related result into the tracker.
    fn observe(&self, call: &Call, result: &Value) -> Option<String> {
        match ResultShape::classify(result) {
            ResultShape::Task { id, .. } => {
                if self.tracker.get(&id).is_some() {
                    self.log_outcome(&id, self.tracker.apply_result(result));
                } else {
                    self.tracker.create(&id, &call.session_id, &call.agent.name, result.clone());
                }
                Some(id)
            }
            shape @ (ResultShape::StatusUpdate { .. } | ResultShape::ArtifactUpdate { .. }) => {
                let id = shape.task_id().map(String::from);
                if let Some(id) = &id {
                    self.log_outcome(id, self.tracker.apply_result(result));
                }
                id
            }
            ResultShape::Message | ResultShape::Other => None,
        }
    }

    fn log_outcome(&self, task_id: &str, outcome: Option<Result<AppendOutcome, RelayError>>) {
        match outcome {
            Some(Err(RelayError::UnknownTask(_))) => {
                warn!("Dropping event for unregistered task {}", task_id)
            }
            Some(Err(e)) => warn!("Failed to record event for task {}: {}", task_id, e),
            Some(Ok(AppendOutcome::AlreadyTerminal(state))) => {
                debug!("Task {} already {}; event ignored", task_id, state)
            }
            _ => {}
        }
    }

    // ── message/send ────────────────────────────────────────────

    async fn send(&self, call: Call) -> RouteOutcome {
        match self.invoke(&call, self.deadlines.send, false).await {
            Ok(AgentReply::Json(bytes)) => self.relay_json(&call, bytes),
            Ok(AgentReply::Stream(mut frames)) => {
                // The agent streamed anyway: answer with its first frame
                let first = tokio::time::timeout(self.deadlines.send, frames.next()).await;
                match first {
                    Ok(Some(Ok(frame))) => {
                        let task_id = frame.get("result").and_then(|r| self.observe(&call, r));
                        if let Some(task_id) = task_id {
                            self.spawn_ingest(task_id, frames);
                        }
                        let mut frame = frame;
                        if let Some(obj) = frame.as_object_mut() {
                            obj.insert("id".into(), call.id.clone());
                        }
                        RouteOutcome::Reply {
                            body: encode(&frame),
                            transport_failure: false,
                        }
                    }
                    Ok(Some(Err(e))) => RouteOutcome::error(call.id, &e),
                    Ok(None) => RouteOutcome::error(
                        call.id,
                        &RelayError::AgentUnreachable("agent closed the stream without answering".into()),
                    ),
                    Err(_) => RouteOutcome::error(
                        call.id,
                        &RelayError::Timeout {
                            method: call.method.to_string(),
                            after: self.deadlines.send,
                        },
                    ),
                }
            }
            Err(e) => RouteOutcome::error(call.id, &e),
        }
    }

    // ── message/stream ──────────────────────────────────────────

    async fn stream(&self, call: Call, guard: Option<OutstandingGuard>) -> RouteOutcome {
        let deadline = self.deadlines.stream_first_event;
        let mut frames = match self.invoke(&call, deadline, true).await {
            Ok(AgentReply::Stream(frames)) => frames,
            Ok(AgentReply::Json(bytes)) => {
                // Nothing will feed a subscription: relay the one answer and
                // leave the caller to poll any task it describes
                return match self.relay_json(&call, bytes) {
                    RouteOutcome::Reply { body, .. } => single_frame(body),
                    other => other,
                };
            }
            Err(e) => return RouteOutcome::error(call.id, &e),
        };

        let first = match tokio::time::timeout(deadline, frames.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return RouteOutcome::error(call.id, &e),
            Ok(None) => {
                return RouteOutcome::error(
                    call.id,
                    &RelayError::AgentUnreachable("agent closed the stream without events".into()),
                );
            }
            Err(_) => {
                return RouteOutcome::error(
                    call.id,
                    &RelayError::Timeout {
                        method: call.method.to_string(),
                        after: deadline,
                    },
                );
            }
        };

        let task = frame_result(&first).and_then(|r| match ResultShape::classify(r) {
            ResultShape::Task { id, .. } => Some(id),
            _ => None,
        });
        match task {
            Some(task_id) => {
                if let Some(result) = frame_result(&first) {
                    self.observe(&call, result);
                }
                self.spawn_ingest(task_id.clone(), frames);
                self.subscription_stream(&call, &task_id, 0, guard)
            }
            None => {
                if let Some(result) = frame_result(&first) {
                    self.observe(&call, result);
                }
                self.passthrough_stream(call, first, frames, guard)
            }
        }
    }

    /// Follow the agent's event stream into the tracker, independent of any caller.
    fn spawn_ingest(&self, task_id: String, mut frames: UpstreamFrames) {
        let tracker = self.tracker.clone();
        let idle = self.deadlines.stream_idle;
        let shutdown = self.shutdown.clone();
        let span = info_span!("ingest", task_id = %task_id);

        tokio::spawn(
            async move {
                loop {
                    let next = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        next = tokio::time::timeout(idle, frames.next()) => next,
                    };
                    let frame = match next {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => {
                            warn!("Agent stream broke: {}", e);
                            break;
                        }
                        Ok(None) => {
                            debug!("Agent stream ended");
                            break;
                        }
                        Err(_) => {
                            warn!("Agent stream idle for {:?}; detaching", idle);
                            break;
                        }
                    };

                    if let Some(error) = frame.get("error") {
                        warn!("Agent reported an error mid-stream: {}", error);
                        match tracker.fail(&task_id, error.clone()) {
                            Ok(AppendOutcome::Appended(_)) => {}
                            Ok(AppendOutcome::AlreadyTerminal(state)) => {
                                debug!("Agent error after task finished as {}", state)
                            }
                            Ok(AppendOutcome::Rejected { from, to }) => {
                                warn!("Agent error not recorded ({} -> {})", from, to)
                            }
                            Err(e) => warn!("Failed to record agent error: {}", e),
                        }
                        break;
                    }

                    let Some(result) = frame.get("result") else {
                        continue;
                    };
                    let event_task = ResultShape::classify(result)
                        .task_id()
                        .map(String::from)
                        .unwrap_or_else(|| task_id.clone());
                    match tracker.apply_result(result) {
                        Some(Err(RelayError::UnknownTask(_))) => {
                            warn!("Dropping event for unregistered task {}", event_task)
                        }
                        Some(Ok(AppendOutcome::Appended(event))) if event.state.is_terminal() => {
                            info!("Task reached {}", event.state);
                        }
                        _ => {}
                    }
                }
            }
            .instrument(span),
        );
    }

    fn subscription_stream(
        &self,
        call: &Call,
        task_id: &str,
        after_seq: u64,
        guard: Option<OutstandingGuard>,
    ) -> RouteOutcome {
        let subscription = match self.streams.subscribe(task_id, after_seq) {
            Ok(s) => s,
            Err(e) => return RouteOutcome::error(call.id.clone(), &e),
        };
        let id = call.id.clone();
        let method = call.method;
        let frames = subscription.into_stream().map(move |item| {
            let _held = &guard;
            match item {
                StreamItem::Event(event) if event.kind == EventKind::Error => SseFrame {
                    id: Some(event.seq),
                    data: error_envelope(&id, event.payload),
                },
                StreamItem::Event(event) => SseFrame {
                    id: Some(event.seq),
                    data: envelope(&id, event.payload),
                },
                StreamItem::IdleTimeout(after) => SseFrame {
                    id: None,
                    data: String::from_utf8_lossy(&encode(&JsonRpcResponse::from_error(
                        id.clone(),
                        &RelayError::Timeout {
                            method: method.to_string(),
                            after,
                        },
                    )))
                    .into_owned(),
                },
            }
        });
        RouteOutcome::Events(frames.boxed())
    }

    /// Relay an untracked agent stream frame by frame.
    fn passthrough_stream(
        &self,
        call: Call,
        first: Value,
        frames: UpstreamFrames,
        guard: Option<OutstandingGuard>,
    ) -> RouteOutcome {
        let router = self.clone();
        let state = (Some(first), frames, 0u64, guard, call, false);
        let stream = futures_util::stream::unfold(state, move |(pending, mut frames, seq, guard, call, done)| {
            let router = router.clone();
            async move {
                if done {
                    return None;
                }
                let (frame, done) = match pending {
                    Some(frame) => (frame, false),
                    None => match tokio::time::timeout(router.deadlines.stream_idle, frames.next()).await {
                        Ok(Some(Ok(frame))) => {
                            if let Some(result) = frame_result(&frame) {
                                router.observe(&call, result);
                            }
                            (frame, false)
                        }
                        Ok(Some(Err(e))) => (error_value(&call.id, &e), true),
                        Ok(None) => return None,
                        Err(_) => (
                            error_value(
                                &call.id,
                                &RelayError::Timeout {
                                    method: call.method.to_string(),
                                    after: router.deadlines.stream_idle,
                                },
                            ),
                            true,
                        ),
                    },
                };
                let seq = seq + 1;
                let sse = SseFrame {
                    id: Some(seq),
                    data: frame.to_string(),
                };
                Some((sse, (None, frames, seq, guard, call, done)))
            }
        });
        RouteOutcome::Events(stream.boxed())
    }

    // ── tasks/get ───────────────────────────────────────────────

    async fn get_task(&self, call: Call) -> RouteOutcome {
        let params: TaskIdParams = match serde_json::from_value(call.params.clone()) {
            Ok(p) => p,
            Err(e) => return RouteOutcome::error(call.id, &RelayError::InvalidParams(e.to_string())),
        };

        match self.invoke(&call, self.deadlines.task_call, false).await {
            Ok(AgentReply::Json(bytes)) => self.relay_json(&call, bytes),
            Ok(AgentReply::Stream(_)) => RouteOutcome::error(
                call.id,
                &RelayError::Internal("agent answered tasks/get with an event stream".into()),
            ),
            Err(e) => match self.owned_snapshot(&params.id, &call.session_id) {
                // The agent is unavailable but the relay saw this task
                Some(snapshot) if e.is_transport() || matches!(e, RelayError::Timeout { .. }) => {
                    info!("Answering tasks/get for {} from tracked state ({})", params.id, e);
                    RouteOutcome::success(call.id, snapshot.to_task_json())
                }
                _ => RouteOutcome::error(call.id, &e),
            },
        }
    }

    fn owned_snapshot(&self, task_id: &str, session_id: &str) -> Option<TaskSnapshot> {
        self.tracker
            .get(task_id)
            .filter(|snapshot| snapshot.session_id == session_id)
    }

    // ── tasks/cancel ────────────────────────────────────────────

    async fn cancel_task(&self, call: Call) -> RouteOutcome {
        let params: TaskIdParams = match serde_json::from_value(call.params.clone()) {
            Ok(p) => p,
            Err(e) => return RouteOutcome::error(call.id, &RelayError::InvalidParams(e.to_string())),
        };

        if self.owned_snapshot(&params.id, &call.session_id).is_none() {
            // Not ours to decide: let the agent answer
            return match self.invoke(&call, self.deadlines.task_call, false).await {
                Ok(AgentReply::Json(bytes)) => self.relay_json(&call, bytes),
                Ok(AgentReply::Stream(_)) => RouteOutcome::error(
                    call.id,
                    &RelayError::Internal("agent answered tasks/cancel with an event stream".into()),
                ),
                Err(e) => RouteOutcome::error(call.id, &e),
            };
        }

        match self.tracker.cancel(&params.id) {
            Ok(CancelOutcome::Canceled(snapshot)) => {
                self.signal_cancel(&call, &params.id).await;
                RouteOutcome::success(call.id, snapshot.to_task_json())
            }
            Ok(CancelOutcome::AlreadyTerminal(snapshot)) => {
                let mut task = snapshot.to_task_json();
                annotate(&mut task, "cancel", json!("already-terminal"));
                RouteOutcome::success(call.id, task)
            }
            Err(e) => RouteOutcome::error(call.id, &e),
        }
    }

    /// Best-effort cancel on the agent; the tracked state is already final.
    async fn signal_cancel(&self, call: &Call, task_id: &str) {
        let endpoint = match self.endpoint(&call.agent, call.method).await {
            Ok(e) => e,
            Err(e) => {
                warn!("Cannot signal cancel for task {}: {}", task_id, e);
                return;
            }
        };
        let client = self.client.clone();
        let outbound = call.outbound.clone();
        let task_id = task_id.to_string();
        let deadline = self.deadlines.task_call;
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, client.cancel_task(&endpoint, &task_id, &outbound)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Agent did not accept cancel for task {}: {}", task_id, e),
                Err(_) => warn!("Cancel for task {} timed out", task_id),
            }
        });
    }

    // ── tasks/resubscribe ───────────────────────────────────────

    fn resubscribe(&self, call: Call, guard: Option<OutstandingGuard>) -> RouteOutcome {
        let params: TaskIdParams = match serde_json::from_value(call.params.clone()) {
            Ok(p) => p,
            Err(e) => return RouteOutcome::error(call.id, &RelayError::InvalidParams(e.to_string())),
        };
        if self.owned_snapshot(&params.id, &call.session_id).is_none() {
            return RouteOutcome::error(call.id, &RelayError::UnknownTask(params.id));
        }
        let after = call.last_event_id.unwrap_or(0);
        self.subscription_stream(&call, &params.id, after, guard)
    }
}

/// Set `metadata.relay.<key>` on an A2A object.
fn annotate(object: &mut Value, key: &str, value: Value) {
    let Some(obj) = object.as_object_mut() else {
        return;
    };
    let metadata = obj.entry("metadata").or_insert_with(|| json!({}));
    if !metadata.is_object() {
        *metadata = json!({});
    }
    let Some(metadata) = metadata.as_object_mut() else {
        return;
    };
    let relay = metadata.entry("relay").or_insert_with(|| json!({}));
    if !relay.is_object() {
        *relay = json!({});
    }
    if let Some(relay) = relay.as_object_mut() {
        relay.insert(key.to_string(), value);
    }
}

fn frame_result(frame: &Value) -> Option<&Value> {
    frame.get("result")
}

fn envelope(id: &Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

/// An agent's JSON-RPC `error` object, readdressed to the caller's id.
fn error_envelope(id: &Value, error: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "error": error }).to_string()
}

fn error_value(id: &Value, err: &RelayError) -> Value {
    serde_json::to_value(JsonRpcResponse::from_error(id.clone(), err)).unwrap_or(Value::Null)
}

fn single_frame(body: Bytes) -> RouteOutcome {
    let frame = SseFrame {
        id: Some(1),
        data: String::from_utf8_lossy(&body).into_owned(),
    };
    RouteOutcome::Events(futures_util::stream::iter([frame]).boxed())
}
