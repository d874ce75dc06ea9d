//! Transport - the raw duplex connection
//!
//! The session only talks to the `Dialer` capability trait, so it runs the
//! same against a real WebSocket and against the in-memory fake.
//!
//! Contract:
//! - `send` may run concurrently with `read`, but not with another `send`
//!   (the session serializes writers)
//! - only one task ever calls `read`
//! - `ping` never blocks; the outcome arrives on the given channel
//! - `close` is idempotent

pub mod memory;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::types::Result;

pub use memory::{MemoryDialer, MemoryServer};
pub use websocket::WebSocket;

/// Outcome channel for one liveness ping
pub type PingResult = oneshot::Sender<Result<()>>;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open the connection. Calling it on an open or disposed transport is a
    /// usage error.
    async fn connect(&self) -> Result<()>;

    /// Write one complete message
    async fn send(&self, frame: Vec<u8>) -> Result<()>;

    /// Block until one complete data message arrives
    async fn read(&self) -> Result<Vec<u8>>;

    /// Start a liveness ping and report its outcome on `done`
    fn ping(&self, done: PingResult);

    /// Release the connection; later calls are no-ops
    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn is_disposed(&self) -> bool;

    /// Address this transport dials, for diagnostics
    fn address(&self) -> &str;
}
