//! Credential sources for the SASL challenge
//!
//! A connection has at most one source: static PLAIN credentials or a
//! provider that answers the server challenge itself.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::protocol::ResponseStatus;
use crate::types::Result;

/// What the server sent with its 407
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Challenge {
    pub message: String,
    pub attributes: Map<String, Value>,
}

impl From<&ResponseStatus> for Challenge {
    fn from(status: &ResponseStatus) -> Self {
        Self {
            message: status.message.clone(),
            attributes: status.attributes.clone(),
        }
    }
}

/// Pluggable challenge answerer.
///
/// Returns the raw SASL bytes; the negotiator base64-encodes them.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn respond(&self, challenge: &Challenge) -> Result<Vec<u8>>;
}

/// Username/password pair, wiped from memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PlainCredentials {
    username: String,
    password: String,
}

impl PlainCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// SASL PLAIN message: `\0username\0password`
    pub fn sasl_plain(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(2 + self.username.len() + self.password.len());
        out.push(0);
        out.extend_from_slice(self.username.as_bytes());
        out.push(0);
        out.extend_from_slice(self.password.as_bytes());
        out
    }
}

impl fmt::Debug for PlainCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlainCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// The single credential source of a connection
#[derive(Clone)]
pub enum Credentials {
    Static(PlainCredentials),
    Provider(Arc<dyn CredentialProvider>),
}

impl Credentials {
    /// Static SASL PLAIN credentials
    pub fn plain(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Static(PlainCredentials::new(username, password))
    }

    pub fn provider(provider: Arc<dyn CredentialProvider>) -> Self {
        Self::Provider(provider)
    }

    /// Produce the answer bytes for a challenge
    pub async fn answer(&self, challenge: &Challenge) -> Result<Vec<u8>> {
        match self {
            Self::Static(plain) => Ok(plain.sasl_plain()),
            Self::Provider(provider) => provider.respond(challenge).await,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(plain) => f.debug_tuple("Static").field(plain).finish(),
            Self::Provider(_) => f.write_str("Provider(..)"),
        }
    }
}
