//! # metahub-server
//!
//! The hub process: WebSocket transport, client registry, environment
//! bindings, routing and error reporting.
//!
//! - [`hub::Hub`]: registry and binding table behind one lock, plus routing
//! - [`dispatch::ConnectionHandler`]: per-connection state machine
//! - [`session::run_ws_session`]: socket read/write loops and heartbeat
//! - [`server::HubServer`]: axum router, admin endpoints, listen/shutdown

#![deny(unsafe_code)]

pub mod binding;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod health;
pub mod heartbeat;
pub mod hub;
pub mod registry;
pub mod reporter;
mod router;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{RoutingConfig, ServerConfig};
pub use hub::Hub;
pub use server::HubServer;
