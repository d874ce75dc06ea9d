//! WebSocket transport
//!
//! Dials TCP explicitly so socket buffer sizes apply, then performs the
//! (optionally TLS) WebSocket upgrade within the handshake timeout. The
//! stream is split so one reader and one writer can run concurrently; each
//! half sits behind its own lock.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::{
    client_async_tls_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{HeaderName, HeaderValue, Request},
        protocol::{Message, WebSocketConfig},
        Error as WsError,
    },
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use super::{Dialer, PingResult};
use crate::auth::HandshakeAuth;
use crate::config::ConnectionConfig;
use crate::types::{ReadFailure, Result, SessionError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// WebSocket connection to a Gremlin Server
pub struct WebSocket {
    config: ConnectionConfig,
    handshake_auth: Option<Arc<dyn HandshakeAuth>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    stream: Mutex<Option<WsSource>>,
    /// Sequence number carried by the latest pong
    pongs: watch::Sender<u64>,
    ping_seq: AtomicU64,
    connecting: AtomicBool,
    connected: AtomicBool,
    disposed: AtomicBool,
}

impl WebSocket {
    pub fn new(config: ConnectionConfig) -> Self {
        let (pongs, _) = watch::channel(0);
        Self {
            config,
            handshake_auth: None,
            sink: Arc::new(Mutex::new(None)),
            stream: Mutex::new(None),
            pongs,
            ping_seq: AtomicU64::new(0),
            connecting: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Attach headers to every upgrade request
    pub fn with_handshake_auth(mut self, auth: Arc<dyn HandshakeAuth>) -> Self {
        self.handshake_auth = Some(auth);
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Reconfigure a transport that has not been opened yet.
    pub fn configure(&mut self, f: impl FnOnce(&mut ConnectionConfig)) -> Result<()> {
        if self.is_connected() || self.is_disposed() {
            return Err(SessionError::Usage(
                "configuration is immutable once the connection is established".to_string(),
            ));
        }
        f(&mut self.config);
        self.config.validate()
    }

    fn build_request(&self) -> Result<Request<()>> {
        let mut request = self
            .config
            .address
            .as_str()
            .into_client_request()
            .map_err(|e| SessionError::Connect(format!("Invalid address: {e}")))?;

        if let Some(ref auth) = self.handshake_auth {
            for (name, value) in auth.headers()? {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| SessionError::Connect(format!("Invalid header name: {e}")))?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|e| SessionError::Connect(format!("Invalid header value: {e}")))?;
                request.headers_mut().insert(name, value);
            }
        }

        Ok(request)
    }

    async fn resolve(&self, request: &Request<()>) -> Result<SocketAddr> {
        let uri = request.uri();
        let host = uri
            .host()
            .ok_or_else(|| SessionError::Connect("Address has no host".to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if self.config.is_secure() { 443 } else { 80 });

        let mut addrs = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|e| SessionError::Connect(format!("DNS lookup for {host} failed: {e}")))?;
        let addr = addrs
            .next()
            .ok_or_else(|| SessionError::Connect(format!("No addresses found for {host}")))?;
        Ok(addr)
    }

    async fn open_socket(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(|e| SessionError::Connect(format!("Failed to create socket: {e}")))?;

        socket
            .set_recv_buffer_size(buffer_size(self.config.read_buffer_size))
            .map_err(|e| SessionError::Connect(format!("Failed to set read buffer: {e}")))?;
        socket
            .set_send_buffer_size(buffer_size(self.config.write_buffer_size))
            .map_err(|e| SessionError::Connect(format!("Failed to set write buffer: {e}")))?;

        let stream = socket
            .connect(addr)
            .await
            .map_err(|e| SessionError::Connect(format!("TCP connect to {addr} failed: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| SessionError::Connect(format!("Failed to set TCP_NODELAY: {e}")))?;
        Ok(stream)
    }

    async fn dial(&self) -> Result<WsStream> {
        let request = self.build_request()?;
        let addr = self.resolve(&request).await?;
        let tcp = self.open_socket(addr).await?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.write_buffer_size = self.config.write_buffer_size;
        ws_config.max_write_buffer_size = max_write_buffer(&self.config);

        let connector = self
            .config
            .tls
            .as_ref()
            .map(|tls| Connector::Rustls(Arc::clone(tls)));

        let (ws, _response) = client_async_tls_with_config(request, tcp, Some(ws_config), connector)
            .await
            .map_err(|e| SessionError::Connect(format!("WebSocket handshake failed: {e}")))?;
        Ok(ws)
    }

    fn mark_lost(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

fn buffer_size(size: usize) -> u32 {
    u32::try_from(size).unwrap_or(u32::MAX)
}

/// Cap on tungstenite's outgoing buffer. Fixed buffers leave room for one
/// full frame plus whatever is still queued.
fn max_write_buffer(config: &ConnectionConfig) -> usize {
    if config.write_buffer_resizing {
        usize::MAX
    } else {
        config.write_buffer_size.saturating_mul(2)
    }
}

/// Reject frames a fixed-size write buffer cannot hold.
fn check_frame_size(config: &ConnectionConfig, len: usize) -> Result<()> {
    if !config.write_buffer_resizing && len > config.write_buffer_size {
        return Err(SessionError::Write(format!(
            "frame of {len} bytes exceeds the {} byte write buffer",
            config.write_buffer_size
        )));
    }
    Ok(())
}

/// Sequence number from a pong payload we sent as a ping
fn pong_sequence(payload: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = payload.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Wait until the pong for `seq` (or a later one) has been read.
async fn await_pong(
    mut pongs: watch::Receiver<u64>,
    seq: u64,
    pong_deadline: Duration,
) -> Result<()> {
    match timeout(pong_deadline, pongs.wait_for(|last| *last >= seq)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(SessionError::ConnectionClosed),
        Err(_) => Err(SessionError::Read(ReadFailure::Abnormal(format!(
            "no pong within {pong_deadline:?}"
        )))),
    }
}

/// Send one ping carrying `seq` and wait for its pong.
async fn send_ping(
    sink: Arc<Mutex<Option<WsSink>>>,
    pongs: watch::Receiver<u64>,
    seq: u64,
    write_deadline: Duration,
    pong_deadline: Duration,
) -> Result<()> {
    {
        let mut guard = sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| SessionError::Write("not connected".to_string()))?;
        timeout(write_deadline, sink.send(Message::Ping(seq.to_be_bytes().to_vec())))
            .await
            .map_err(|_| SessionError::Write("ping write deadline elapsed".to_string()))?
            .map_err(|e| SessionError::Write(format!("Failed to send ping: {e}")))?;
    }

    await_pong(pongs, seq, pong_deadline).await
}

#[async_trait]
impl Dialer for WebSocket {
    async fn connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Usage("transport already disposed".to_string()));
        }
        if self.is_connected() || self.connecting.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Usage("transport already connected".to_string()));
        }

        if self.config.compression {
            warn!("permessage-deflate is not supported by this transport, continuing uncompressed");
        }

        info!("Connecting to Gremlin Server at {}", self.config.address);
        let dialed = timeout(self.config.handshake_timeout, self.dial()).await;
        let result = match dialed {
            Ok(Ok(ws)) => {
                let (sink, stream) = ws.split();
                *self.sink.lock().await = Some(sink);
                *self.stream.lock().await = Some(stream);
                self.connected.store(true, Ordering::SeqCst);
                info!("Connected to Gremlin Server at {}", self.config.address);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SessionError::Connect(format!(
                "Handshake with {} did not complete within {:?}",
                self.config.address, self.config.handshake_timeout
            ))),
        };
        self.connecting.store(false, Ordering::SeqCst);
        result
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        check_frame_size(&self.config, frame.len())?;

        let mut guard = self.sink.lock().await;
        let sink = guard
            .as_mut()
            .ok_or_else(|| SessionError::Write("not connected".to_string()))?;

        match timeout(self.config.write_deadline, sink.send(Message::Binary(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.mark_lost();
                Err(SessionError::Write(format!("Failed to send frame: {e}")))
            }
            Err(_) => {
                self.mark_lost();
                Err(SessionError::Write(format!(
                    "write deadline of {:?} elapsed",
                    self.config.write_deadline
                )))
            }
        }
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or_else(|| {
            SessionError::Read(ReadFailure::Abnormal("not connected".to_string()))
        })?;

        loop {
            // Without keepalive there is no traffic to keep a quiet connection alive
            let next = if self.config.keepalive_enabled() {
                match timeout(self.config.read_deadline, stream.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        self.mark_lost();
                        return Err(SessionError::Read(ReadFailure::Abnormal(format!(
                            "no frame within read deadline of {:?}",
                            self.config.read_deadline
                        ))));
                    }
                }
            } else {
                stream.next().await
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                Some(Ok(Message::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(Message::Pong(payload))) => match pong_sequence(&payload) {
                    Some(seq) => {
                        self.pongs.send_if_modified(|last| {
                            let newer = seq > *last;
                            if newer {
                                *last = seq;
                            }
                            newer
                        });
                    }
                    None => debug!("Ignoring unsolicited pong"),
                },
                // Pong replies to server pings are queued by tungstenite itself
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    info!("Server closed connection: {:?}", frame);
                    self.mark_lost();
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|r| !r.is_empty());
                    return Err(SessionError::Read(ReadFailure::ClosedByPeer(reason)));
                }
                Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) | None => {
                    self.mark_lost();
                    return Err(SessionError::Read(ReadFailure::ClosedByPeer(None)));
                }
                Some(Err(e)) => {
                    self.mark_lost();
                    return Err(SessionError::Read(ReadFailure::Abnormal(e.to_string())));
                }
            }
        }
    }

    fn ping(&self, done: PingResult) {
        let sink = Arc::clone(&self.sink);
        let pongs = self.pongs.subscribe();
        let seq = self.ping_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let write_deadline = self.config.write_deadline;
        let pong_deadline = self.config.read_deadline;

        tokio::spawn(async move {
            let result = send_ping(sink, pongs, seq, write_deadline, pong_deadline).await;
            let _ = done.send(result);
        });
    }

    async fn close(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.mark_lost();

        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = timeout(self.config.write_deadline, sink.close())
                .await
                .unwrap_or(Ok(()))
            {
                debug!("Close handshake failed: {}", e);
            }
        }
        // A reader still parked on the stream keeps its lock; it fails on its own
        if let Ok(mut stream) = self.stream.try_lock() {
            stream.take();
        }

        debug!("Closed connection to {}", self.config.address);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn address(&self) -> &str {
        &self.config.address
    }
}
