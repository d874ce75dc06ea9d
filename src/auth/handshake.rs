//! Header-based authentication for the WebSocket upgrade request
//!
//! Some deployments authenticate the HTTP upgrade instead of (or before)
//! the SASL challenge. Headers are produced on every connect, so signed or
//! expiring headers are regenerated when a client redials.

use base64::Engine;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::types::Result;

/// Supplies extra headers for the upgrade request
pub trait HandshakeAuth: Send + Sync {
    fn headers(&self) -> Result<Vec<(String, String)>>;
}

/// `Authorization: Basic …` header
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BasicAuthHeader {
    username: String,
    password: String,
}

impl BasicAuthHeader {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl HandshakeAuth for BasicAuthHeader {
    fn headers(&self) -> Result<Vec<(String, String)>> {
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", self.username, self.password));
        Ok(vec![("Authorization".to_string(), format!("Basic {token}"))])
    }
}

impl fmt::Debug for BasicAuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuthHeader")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let auth = BasicAuthHeader::new("Aladdin", "open sesame");
        let headers = auth.headers().unwrap();
        assert_eq!(
            headers,
            vec![(
                "Authorization".to_string(),
                "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==".to_string()
            )]
        );
        assert!(!format!("{auth:?}").contains("sesame"));
    }
}
