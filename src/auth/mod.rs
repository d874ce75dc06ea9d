//! Authentication
//!
//! - **Credentials**: the connection's credential source
//! - **Negotiator**: bounded SASL challenge/response for one request
//! - **Handshake**: headers attached to the WebSocket upgrade

pub mod credentials;
pub mod handshake;
pub mod negotiator;

pub use credentials::{Challenge, CredentialProvider, Credentials, PlainCredentials};
pub use handshake::{BasicAuthHeader, HandshakeAuth};
pub use negotiator::{AuthNegotiator, AuthState, AuthStep};
