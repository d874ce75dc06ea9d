//! Configuration for gremlin-session
//!
//! `ConnectionConfig` is the recognized option surface for the transport and
//! keepalive. `ConnectArgs` exposes the same options as CLI arguments with
//! environment fallbacks using clap.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::Credentials;
use crate::types::{Result, SessionError};

/// Default handshake timeout (TCP + TLS + WebSocket upgrade)
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default interval between keepalive pings
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(60);

/// Default bound on a single ping round trip
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for a single frame write
pub const DEFAULT_WRITE_DEADLINE: Duration = Duration::from_secs(15);

/// Default deadline between inbound frames (pongs included)
pub const DEFAULT_READ_DEADLINE: Duration = Duration::from_secs(150);

/// Default socket buffer size in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Connection configuration.
///
/// Built with `Default` plus the `with_*` setters, then handed to a transport.
/// Once the transport is connected the configuration no longer changes.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URI of the server (`ws://` or `wss://`)
    pub address: String,
    /// Custom rustls configuration for `wss://`; `None` uses webpki roots
    pub tls: Option<Arc<rustls::ClientConfig>>,
    /// Request `permessage-deflate` compression
    pub compression: bool,
    /// Socket send buffer and WebSocket write buffer size
    pub write_buffer_size: usize,
    /// Let the write buffer grow past `write_buffer_size` for large frames.
    /// When off, a frame larger than the buffer fails with `Write`.
    pub write_buffer_resizing: bool,
    /// Socket receive buffer size
    pub read_buffer_size: usize,
    /// Bound on TCP connect + TLS + upgrade
    pub handshake_timeout: Duration,
    /// Bound on a single frame write
    pub write_deadline: Duration,
    /// Bound on the silence between two inbound frames. Only enforced while
    /// keepalive runs; an idle connection without pings may stay silent.
    pub read_deadline: Duration,
    /// Keepalive interval; zero disables the keepalive monitor and the
    /// per-frame read deadline
    pub ping_interval: Duration,
    /// Bound on one ping round trip
    pub ping_timeout: Duration,
    /// Consecutive failed pings treated as connection loss
    pub max_missed_pings: u32,
    /// Default bound on `submit`; `None` waits until response or shutdown
    pub request_timeout: Option<Duration>,
    /// Credential source for the challenge handshake
    pub credentials: Option<Credentials>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "ws://localhost:8182/gremlin".to_string(),
            tls: None,
            compression: false,
            write_buffer_size: DEFAULT_BUFFER_SIZE,
            write_buffer_resizing: true,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            write_deadline: DEFAULT_WRITE_DEADLINE,
            read_deadline: DEFAULT_READ_DEADLINE,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            max_missed_pings: 2,
            request_timeout: None,
            credentials: None,
        }
    }
}

impl ConnectionConfig {
    /// Create a configuration for the given address with default options.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn with_compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    pub fn with_write_buffer_resizing(mut self, enabled: bool) -> Self {
        self.write_buffer_resizing = enabled;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_write_deadline(mut self, deadline: Duration) -> Self {
        self.write_deadline = deadline;
        self
    }

    pub fn with_read_deadline(mut self, deadline: Duration) -> Self {
        self.read_deadline = deadline;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }

    pub fn with_max_missed_pings(mut self, count: u32) -> Self {
        self.max_missed_pings = count;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Whether the keepalive monitor should run
    pub fn keepalive_enabled(&self) -> bool {
        !self.ping_interval.is_zero()
    }

    /// Whether the address requires TLS
    pub fn is_secure(&self) -> bool {
        self.address.starts_with("wss://")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(self.address.starts_with("ws://") || self.address.starts_with("wss://")) {
            return Err(SessionError::Config(format!(
                "address must be a ws:// or wss:// URI, got '{}'",
                self.address
            )));
        }

        if self.write_buffer_size == 0 || self.read_buffer_size == 0 {
            return Err(SessionError::Config(
                "buffer sizes must be greater than zero".to_string(),
            ));
        }

        if self.handshake_timeout.is_zero()
            || self.write_deadline.is_zero()
            || self.read_deadline.is_zero()
        {
            return Err(SessionError::Config(
                "handshake timeout and deadlines must be greater than zero".to_string(),
            ));
        }

        if self.keepalive_enabled() {
            if self.read_deadline <= self.ping_interval {
                return Err(SessionError::Config(
                    "read deadline must exceed the ping interval".to_string(),
                ));
            }
            if self.ping_timeout.is_zero() {
                return Err(SessionError::Config(
                    "ping timeout must be greater than zero".to_string(),
                ));
            }
            if self.max_missed_pings == 0 {
                return Err(SessionError::Config(
                    "max missed pings must be at least 1".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Connection options as CLI arguments
#[derive(Parser, Debug, Clone)]
pub struct ConnectArgs {
    /// Gremlin Server WebSocket URL
    #[arg(long, env = "GREMLIN_URL", default_value = "ws://localhost:8182/gremlin")]
    pub url: String,

    /// Username for SASL PLAIN authentication (optional)
    #[arg(long, env = "GREMLIN_USERNAME")]
    pub username: Option<String>,

    /// Password for SASL PLAIN authentication (optional)
    #[arg(long, env = "GREMLIN_PASSWORD")]
    pub password: Option<String>,

    /// Request permessage-deflate compression
    #[arg(long, env = "GREMLIN_COMPRESSION", default_value = "false")]
    pub compression: bool,

    /// Socket write buffer size in bytes
    #[arg(long, env = "WRITE_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub write_buffer_size: usize,

    /// Allow the write buffer to grow for frames larger than its size
    #[arg(long, env = "WRITE_BUFFER_RESIZING", default_value = "true", action = clap::ArgAction::Set)]
    pub write_buffer_resizing: bool,

    /// Socket read buffer size in bytes
    #[arg(long, env = "READ_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub read_buffer_size: usize,

    /// Handshake timeout in milliseconds
    #[arg(long, env = "HANDSHAKE_TIMEOUT_MS", default_value = "5000")]
    pub handshake_timeout_ms: u64,

    /// Write deadline in milliseconds
    #[arg(long, env = "WRITE_DEADLINE_MS", default_value = "15000")]
    pub write_deadline_ms: u64,

    /// Read deadline in milliseconds
    #[arg(long, env = "READ_DEADLINE_MS", default_value = "150000")]
    pub read_deadline_ms: u64,

    /// Keepalive ping interval in milliseconds (0 disables keepalive)
    #[arg(long, env = "PING_INTERVAL_MS", default_value = "60000")]
    pub ping_interval_ms: u64,

    /// Bound on one keepalive ping round trip in milliseconds
    #[arg(long, env = "PING_TIMEOUT_MS", default_value = "10000")]
    pub ping_timeout_ms: u64,

    /// Consecutive failed pings treated as connection loss
    #[arg(long, env = "MAX_MISSED_PINGS", default_value = "2")]
    pub max_missed_pings: u32,

    /// Request timeout in milliseconds (0 waits indefinitely)
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "30000")]
    pub request_timeout_ms: u64,
}

impl ConnectArgs {
    /// Convert CLI arguments into a validated connection configuration
    pub fn to_config(&self) -> Result<ConnectionConfig> {
        let mut config = ConnectionConfig::new(self.url.clone())
            .with_compression(self.compression)
            .with_write_buffer_size(self.write_buffer_size)
            .with_write_buffer_resizing(self.write_buffer_resizing)
            .with_read_buffer_size(self.read_buffer_size)
            .with_handshake_timeout(Duration::from_millis(self.handshake_timeout_ms))
            .with_write_deadline(Duration::from_millis(self.write_deadline_ms))
            .with_read_deadline(Duration::from_millis(self.read_deadline_ms))
            .with_ping_interval(Duration::from_millis(self.ping_interval_ms))
            .with_ping_timeout(Duration::from_millis(self.ping_timeout_ms))
            .with_max_missed_pings(self.max_missed_pings);

        if self.request_timeout_ms > 0 {
            config = config.with_request_timeout(Duration::from_millis(self.request_timeout_ms));
        }

        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                config = config.with_credentials(Credentials::plain(user.clone(), pass.clone()));
            }
            (None, None) => {}
            _ => {
                return Err(SessionError::Config(
                    "username and password must be given together".to_string(),
                ));
            }
        }

        config.validate()?;
        Ok(config)
    }
}
