//! Relay transport for the agent relay.
//!
//! Provides:
//! - Control-channel and HTTP wire types
//! - `RelayServer` - Handler registry, routing and in-flight runs (host)
//! - HTTP/SSE router and the `/relay` control-channel socket
//! - `RemoteHandlerClient` - Control-channel client (remote)
//! - `connect` - Host election on the well-known port

pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod http;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod websocket;

pub use client::RemoteHandlerClient;
pub use config::{DEFAULT_HOST, DEFAULT_PORT, RelayConfig};
pub use connection::{ConnectionError, RelayConnection, RelayHost, RelayRole, connect, probe_health};
pub use http::build_router;
pub use protocol::ControlMessage;
pub use server::{RelayServer, RemoteConnection};
