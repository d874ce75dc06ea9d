//! Client with reconnection
//!
//! A `Session` never reconnects. The `Client` owns that policy: when the
//! current session has shut down, the next `submit` dials a fresh transport
//! with doubling backoff and retries from there. Requests already in flight
//! when a session dies are not replayed.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{info, warn};

use crate::auth::HandshakeAuth;
use crate::config::ConnectionConfig;
use crate::protocol::{Query, QueryResult};
use crate::session::{HealthState, Session};
use crate::transport::{Dialer, WebSocket};
use crate::types::{Result, SessionError};

/// Builds a fresh, unconnected transport for each (re)connection
pub trait DialerFactory: Send + Sync {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Dialer>>;
}

impl<F> DialerFactory for F
where
    F: Fn(&ConnectionConfig) -> Result<Arc<dyn Dialer>> + Send + Sync,
{
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Dialer>> {
        self(config)
    }
}

/// Dials a `WebSocket` transport
#[derive(Default)]
pub struct WebSocketFactory {
    handshake_auth: Option<Arc<dyn HandshakeAuth>>,
}

impl WebSocketFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach headers to every upgrade request
    pub fn with_handshake_auth(mut self, auth: Arc<dyn HandshakeAuth>) -> Self {
        self.handshake_auth = Some(auth);
        self
    }
}

impl DialerFactory for WebSocketFactory {
    fn create(&self, config: &ConnectionConfig) -> Result<Arc<dyn Dialer>> {
        let mut socket = WebSocket::new(config.clone());
        if let Some(auth) = &self.handshake_auth {
            socket = socket.with_handshake_auth(Arc::clone(auth));
        }
        Ok(Arc::new(socket))
    }
}

/// When and how often to redial
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Dial attempts per reconnection before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

pub struct Client {
    config: ConnectionConfig,
    factory: Arc<dyn DialerFactory>,
    policy: ReconnectPolicy,
    session: RwLock<Arc<Session>>,
    /// Serializes redials so concurrent callers share one new session
    redial: Mutex<()>,
    /// Set once by `close`; interrupts backoff and in-progress dials
    closing: watch::Sender<bool>,
}

impl Client {
    /// Connect over WebSocket with the default reconnect policy.
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        Self::with_factory(config, Arc::new(WebSocketFactory::new()), ReconnectPolicy::default())
            .await
    }

    /// Connect with a custom transport factory and policy.
    pub async fn with_factory(
        config: ConnectionConfig,
        factory: Arc<dyn DialerFactory>,
        policy: ReconnectPolicy,
    ) -> Result<Self> {
        let dialer = factory.create(&config)?;
        let session = Session::connect(dialer, config.clone()).await?;
        let (closing, _) = watch::channel(false);

        Ok(Self {
            config,
            factory,
            policy,
            session: RwLock::new(Arc::new(session)),
            redial: Mutex::new(()),
            closing,
        })
    }

    /// Submit on the current session, redialing first if it has shut down.
    pub async fn submit(&self, query: impl Into<Query>) -> Result<QueryResult> {
        let session = self.current().await?;
        session.submit(query).await
    }

    /// Like `submit`, with an explicit per-request timeout.
    pub async fn submit_with_timeout(
        &self,
        query: impl Into<Query>,
        wait: Duration,
    ) -> Result<QueryResult> {
        let session = self.current().await?;
        session.submit_with_timeout(query, wait).await
    }

    /// Replace the current session with a freshly dialed one.
    pub async fn reconnect(&self) -> Result<()> {
        if self.is_closing() {
            return Err(SessionError::SessionClosed);
        }

        let _redial = self.redial.lock().await;
        let old = Arc::clone(&*self.session.read().await);
        old.close().await;
        self.redial_locked().await.map(|_| ())
    }

    /// Close the current session and stop redialing.
    ///
    /// Waits out any redial in progress, so once this returns no session
    /// owned by this client is live.
    pub async fn close(&self) {
        self.closing.send_replace(true);

        let _redial = self.redial.lock().await;
        let session = Arc::clone(&*self.session.read().await);
        session.close().await;
    }

    pub async fn health(&self) -> HealthState {
        self.session.read().await.health()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Current session if it is live, otherwise a new one per policy.
    async fn current(&self) -> Result<Arc<Session>> {
        {
            let session = self.session.read().await;
            if !session.is_closed() {
                return Ok(Arc::clone(&session));
            }
        }

        if self.is_closing() || !self.policy.enabled {
            return Err(SessionError::SessionClosed);
        }

        let _redial = self.redial.lock().await;
        {
            // Another caller may have redialed while we waited
            let session = self.session.read().await;
            if !session.is_closed() {
                return Ok(Arc::clone(&session));
            }
        }
        self.redial_locked().await
    }

    /// Dial with backoff and install the new session. Caller holds `redial`.
    async fn redial_locked(&self) -> Result<Arc<Session>> {
        let mut closing = self.closing.subscribe();
        let mut delay = self.policy.initial_delay;
        let mut last_error = SessionError::SessionClosed;

        for attempt in 1..=self.policy.max_attempts.max(1) {
            if self.is_closing() {
                return Err(SessionError::SessionClosed);
            }
            info!(attempt, "Reconnecting to {}", self.config.address);

            let dial = async {
                let dialer = self.factory.create(&self.config)?;
                Session::connect(dialer, self.config.clone()).await
            };
            let connected = tokio::select! {
                biased;
                _ = closing.wait_for(|c| *c) => return Err(SessionError::SessionClosed),
                connected = dial => connected,
            };

            match connected {
                Ok(session) => {
                    if self.is_closing() {
                        session.close().await;
                        return Err(SessionError::SessionClosed);
                    }
                    let session = Arc::new(session);
                    *self.session.write().await = Arc::clone(&session);
                    info!(attempt, "Reconnected to {}", self.config.address);
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Reconnect failed, retrying in {:?}", delay);
                    last_error = e;
                    if attempt < self.policy.max_attempts {
                        tokio::select! {
                            biased;
                            _ = closing.wait_for(|c| *c) => return Err(SessionError::SessionClosed),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        delay = self.policy.next_delay(delay);
                    }
                }
            }
        }

        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::default();
        let mut delay = policy.initial_delay;
        let mut seen = Vec::new();
        for _ in 0..12 {
            seen.push(delay);
            delay = policy.next_delay(delay);
        }
        assert_eq!(seen[0], Duration::from_millis(100));
        assert_eq!(seen[1], Duration::from_millis(200));
        assert_eq!(seen[2], Duration::from_millis(400));
        assert_eq!(*seen.last().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_disabled_policy() {
        let policy = ReconnectPolicy::disabled();
        assert!(!policy.enabled);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_websocket_factory_builds_unconnected_transport() {
        let factory = WebSocketFactory::new();
        let dialer = factory.create(&ConnectionConfig::default()).unwrap();
        assert!(!dialer.is_connected());
        assert_eq!(dialer.address(), "ws://localhost:8182/gremlin");
    }
}
