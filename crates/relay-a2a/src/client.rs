//! Agent client: carries JSON-RPC payloads to agent runtimes

use std::time::Duration;

use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::protocol::headers;

/// Transport headers added to every outbound call. The payload is never touched.
#[derive(Debug, Clone)]
pub struct OutboundHeaders {
    pub session_header: String,
    pub session_id: String,
    pub correlation_id: String,
    /// Full `Authorization` header value, e.g. `Bearer <token>`
    pub authorization: Option<String>,
    /// Identity of a caller that authenticated without a forwardable token
    pub caller: Option<String>,
}

impl OutboundHeaders {
    pub fn to_header_map(&self) -> Result<HeaderMap> {
        let mut map = HeaderMap::new();
        insert(&mut map, &self.session_header, &self.session_id)?;
        insert(&mut map, headers::CORRELATION_ID, &self.correlation_id)?;
        if let Some(auth) = &self.authorization {
            let mut value = header_value(auth)?;
            value.set_sensitive(true);
            map.insert(AUTHORIZATION, value);
        }
        if let Some(caller) = &self.caller {
            insert(&mut map, headers::CALLER, caller)?;
        }
        Ok(map)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| RelayError::InvalidRequest(format!("invalid header value: {}", e)))
}

fn insert(map: &mut HeaderMap, name: &str, value: &str) -> Result<()> {
    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| RelayError::Internal(format!("invalid header name '{}': {}", name, e)))?;
    map.insert(name, header_value(value)?);
    Ok(())
}

/// Parsed `data:` payloads of an agent's event stream
pub struct UpstreamFrames {
    inner: BoxStream<'static, Result<Value>>,
}

impl UpstreamFrames {
    pub fn new(inner: BoxStream<'static, Result<Value>>) -> Self {
        Self { inner }
    }

    pub async fn next(&mut self) -> Option<Result<Value>> {
        self.inner.next().await
    }
}

/// How an agent answered an invocation
pub enum AgentReply {
    /// A single JSON-RPC response body, byte-for-byte as the agent sent it
    Json(Bytes),
    /// `text/event-stream`; one JSON-RPC response per event
    Stream(UpstreamFrames),
}

/// Client for agent runtimes
#[derive(Clone)]
pub struct AgentClient {
    http: Client,
}

impl AgentClient {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RelayError::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http })
    }

    pub fn from_client(http: Client) -> Self {
        Self { http }
    }

    /// POST a JSON-RPC envelope to an agent's service root.
    pub async fn invoke(
        &self,
        endpoint: &str,
        body: Bytes,
        outbound: &OutboundHeaders,
        want_stream: bool,
    ) -> Result<AgentReply> {
        let accept = if want_stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        debug!("Invoking agent at {} (accept: {})", endpoint, accept);

        let resp = self
            .http
            .post(endpoint)
            .headers(outbound.to_header_map()?)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, accept)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::AgentUnreachable(format!("{}: {}", endpoint, e)))?;

        let status = resp.status();
        if is_event_stream(&resp) {
            if !status.is_success() {
                return Err(RelayError::AgentUnreachable(format!(
                    "{} returned HTTP {} for event stream",
                    endpoint, status
                )));
            }
            return Ok(AgentReply::Stream(event_frames(resp)));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::AgentUnreachable(format!("{}: {}", endpoint, e)))?;

        // Agent-reported JSON-RPC errors travel verbatim whatever the HTTP status
        if status.is_success() || looks_like_jsonrpc(&bytes) {
            Ok(AgentReply::Json(bytes))
        } else {
            warn!("Agent at {} answered HTTP {} without a JSON-RPC body", endpoint, status);
            Err(RelayError::AgentUnreachable(format!(
                "{} returned HTTP {}",
                endpoint, status
            )))
        }
    }

    /// Best-effort `tasks/cancel` on the agent, independent of any caller request.
    pub async fn cancel_task(
        &self,
        endpoint: &str,
        task_id: &str,
        outbound: &OutboundHeaders,
    ) -> Result<()> {
        let envelope = serde_json::json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": "tasks/cancel",
            "params": { "id": task_id },
        });
        let body = serde_json::to_vec(&envelope)
            .map_err(|e| RelayError::Internal(format!("failed to encode cancel: {}", e)))?;

        match self.invoke(endpoint, Bytes::from(body), outbound, false).await? {
            AgentReply::Json(_) => {
                info!("Sent cancellation for task {} to {}", task_id, endpoint);
                Ok(())
            }
            AgentReply::Stream(_) => Err(RelayError::AgentUnreachable(
                "agent answered tasks/cancel with an event stream".into(),
            )),
        }
    }

    /// Forward an arbitrary request unchanged.
    pub async fn passthrough(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response> {
        debug!("Passing {} {} through to agent", method, url);
        self.http
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| RelayError::AgentUnreachable(format!("{}: {}", url, e)))
    }
}

fn is_event_stream(resp: &Response) -> bool {
    resp.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

fn looks_like_jsonrpc(bytes: &[u8]) -> bool {
    serde_json::from_slice::<Value>(bytes)
        .ok()
        .and_then(|v| v.get("jsonrpc").cloned())
        .is_some()
}

fn event_frames(resp: Response) -> UpstreamFrames {
    let stream = resp
        .bytes_stream()
        .eventsource()
        .filter_map(|event| async move {
            match event {
                Ok(event) if event.data.trim().is_empty() => None,
                Ok(event) => Some(serde_json::from_str::<Value>(&event.data).map_err(|e| {
                    RelayError::AgentUnreachable(format!("malformed stream event: {}", e))
                })),
                Err(e) => Some(Err(RelayError::AgentUnreachable(format!(
                    "event stream broken: {}",
                    e
                )))),
            }
        })
        .boxed();
    UpstreamFrames::new(stream)
}

/// Invocation URL of a hosted agent runtime addressed by ARN.
pub fn runtime_invocation_url(region: &str, runtime_arn: &str) -> String {
    let escaped: String = url::form_urlencoded::byte_serialize(runtime_arn.as_bytes()).collect();
    format!(
        "https://bedrock-agentcore.{}.amazonaws.com/runtimes/{}/invocations/",
        region, escaped
    )
}
