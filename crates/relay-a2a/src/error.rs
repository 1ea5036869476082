//! Relay error taxonomy
//!
//! Every failure the relay can surface to a caller maps onto one of these
//! variants, and every variant maps onto exactly one JSON-RPC error code.

use std::time::Duration;

use crate::protocol::error_codes;

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("agent card unavailable at {endpoint}: {reason}")]
    DiscoveryUnavailable { endpoint: String, reason: String },

    #[error("invalid agent card: {0}")]
    InvalidCard(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("request id {0} is already outstanding on this session")]
    DuplicateRequestId(String),

    #[error("{method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },

    #[error("agent unreachable: {0}")]
    AgentUnreachable(String),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// JSON-RPC error code reported to callers for this failure.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Self::DiscoveryUnavailable { .. } => error_codes::DISCOVERY_UNAVAILABLE,
            Self::InvalidCard(_) => error_codes::INVALID_CARD,
            Self::Unauthenticated(_) => error_codes::UNAUTHENTICATED,
            Self::Forbidden(_) => error_codes::FORBIDDEN,
            Self::DuplicateRequestId(_) => error_codes::DUPLICATE_REQUEST_ID,
            Self::Timeout { .. } => error_codes::TIMEOUT,
            Self::AgentUnreachable(_) => error_codes::AGENT_UNREACHABLE,
            Self::UnsupportedMethod(_) => error_codes::METHOD_NOT_FOUND,
            Self::UnsupportedOperation(_) => error_codes::UNSUPPORTED_OPERATION,
            Self::UnknownTask(_) => error_codes::TASK_NOT_FOUND,
            Self::UnknownAgent(_) => error_codes::UNKNOWN_AGENT,
            Self::Parse(_) => error_codes::PARSE_ERROR,
            Self::InvalidRequest(_) => error_codes::INVALID_REQUEST,
            Self::InvalidParams(_) => error_codes::INVALID_PARAMS,
            Self::Internal(_) => error_codes::INTERNAL_ERROR,
        }
    }

    /// Failures of the network path to the agent rather than of the call itself.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::AgentUnreachable(_))
    }

    /// Failures the caller can fix by re-authenticating and retrying.
    pub fn is_retryable_auth(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }
}
