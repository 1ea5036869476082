//! Inbound A2A pipeline
//!
//! Requests enter through the axum front door ([`server`]), are authenticated
//! and bound to a session ([`auth`], [`session`]), then routed to the target
//! agent ([`router`]). Long-running tasks are tracked in [`tasks`] and their
//! events delivered to subscribers through [`stream`].

pub mod auth;
pub mod config;
pub mod router;
pub mod server;
pub mod session;
pub mod stream;
pub mod tasks;

pub use auth::{AuthContext, Authenticator, Gatekeeper};
pub use config::RelayConfig;
pub use router::{AgentDirectory, MessageRouter, RouteOutcome};
pub use server::{RelayState, build_router, serve};
pub use session::SessionManager;
pub use stream::StreamManager;
pub use tasks::TaskTracker;
