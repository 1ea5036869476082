//! A2A (Agent-to-Agent) protocol support for the relay
//!
//! Wire types for agent cards and JSON-RPC 2.0 envelopes, the relay's error
//! taxonomy, agent-card discovery with a single-flight cache, and the HTTP
//! client used to reach agent runtimes.

pub mod client;
pub mod credentials;
pub mod error;
pub mod protocol;
pub mod resolver;

pub use client::{AgentClient, AgentReply, OutboundHeaders, UpstreamFrames, runtime_invocation_url};
pub use credentials::{OAuthClientConfig, OAuthTokenSource};
pub use error::{RelayError, Result};
pub use protocol::{
    AgentCard, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Method, ResultShape, TaskState,
};
pub use resolver::CardResolver;
