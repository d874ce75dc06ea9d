//! gremlin-session - connection and session layer for Gremlin Server clients
//!
//! Multiplexes many concurrent queries over one WebSocket connection and
//! correlates each response to its caller by request id.
//!
//! ## Components
//!
//! - **Transport**: duplex connection behind the `Dialer` trait (WebSocket or in-memory)
//! - **Auth**: credential sources and the SASL PLAIN challenge handshake
//! - **Session**: outstanding request table, read loop, teardown
//! - **Keepalive**: ping-driven liveness monitor
//! - **Shutdown**: single-fire gate shared by every session loop
//! - **Client**: session ownership with reconnect and backoff

pub mod auth;
pub mod client;
pub mod config;
pub mod keepalive;
pub mod protocol;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod types;

pub use auth::{CredentialProvider, Credentials};
pub use client::{Client, DialerFactory, ReconnectPolicy, WebSocketFactory};
pub use config::{ConnectArgs, ConnectionConfig};
pub use protocol::{Query, QueryResult, RequestId};
pub use session::{HealthState, Session};
pub use shutdown::ShutdownReason;
pub use transport::{Dialer, MemoryDialer, MemoryServer, WebSocket};
pub use types::{Result, SessionError};
