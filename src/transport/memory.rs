//! In-memory transport
//!
//! `MemoryDialer` honors the `Dialer` contract without a network. Its peer,
//! `MemoryServer`, sees every frame the client writes and scripts what the
//! client reads: frames, a clean close, an abnormal disconnect, failing or
//! hanging pings, failing writes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

use super::{Dialer, PingResult};
use crate::protocol::{decode_request, RequestEnvelope, RequestId};
use crate::types::{ReadFailure, Result, SessionError};

/// How the fake answers `ping`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingMode {
    /// Resolve `Ok` immediately
    Healthy,
    /// Resolve with an error immediately
    Failing,
    /// Never resolve
    Hanging,
}

impl PingMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Failing,
            2 => Self::Hanging,
            _ => Self::Healthy,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Failing => 1,
            Self::Hanging => 2,
        }
    }
}

enum Inbound {
    Frame(Vec<u8>),
    PeerClose(Option<String>),
    Abnormal(String),
}

struct Shared {
    writes: AtomicUsize,
    pings: AtomicUsize,
    ping_mode: AtomicU8,
    fail_writes: AtomicBool,
    /// Largest accepted frame; zero means unlimited
    max_frame: AtomicUsize,
    refuse_connect: AtomicBool,
    connected: AtomicBool,
    disposed: AtomicBool,
    closed: watch::Sender<bool>,
    hung_pings: std::sync::Mutex<Vec<PingResult>>,
}

/// Client half of an in-memory connection
pub struct MemoryDialer {
    address: String,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Inbound>>,
    shared: Arc<Shared>,
}

/// Server half of an in-memory connection
pub struct MemoryServer {
    requests: mpsc::UnboundedReceiver<Vec<u8>>,
    inbound: mpsc::UnboundedSender<Inbound>,
    shared: Arc<Shared>,
}

impl MemoryDialer {
    /// Create a connected pair. The dialer still needs `connect`.
    pub fn pair(address: impl Into<String>) -> (MemoryDialer, MemoryServer) {
        let (outbound, requests) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            writes: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
            ping_mode: AtomicU8::new(PingMode::Healthy.as_u8()),
            fail_writes: AtomicBool::new(false),
            max_frame: AtomicUsize::new(0),
            refuse_connect: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            closed,
            hung_pings: std::sync::Mutex::new(Vec::new()),
        });

        let dialer = MemoryDialer {
            address: address.into(),
            outbound,
            inbound: Mutex::new(inbound_rx),
            shared: Arc::clone(&shared),
        };
        let server = MemoryServer {
            requests,
            inbound: inbound_tx,
            shared,
        };
        (dialer, server)
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn connect(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SessionError::Usage("transport already disposed".to_string()));
        }
        if self.shared.refuse_connect.load(Ordering::SeqCst) {
            return Err(SessionError::Connect(format!(
                "connection to {} refused",
                self.address
            )));
        }
        if self.shared.connected.swap(true, Ordering::SeqCst) {
            return Err(SessionError::Usage("transport already connected".to_string()));
        }
        Ok(())
    }

    async fn send(&self, frame: Vec<u8>) -> Result<()> {
        if !self.is_connected() {
            return Err(SessionError::Write("not connected".to_string()));
        }
        let max_frame = self.shared.max_frame.load(Ordering::SeqCst);
        if max_frame > 0 && frame.len() > max_frame {
            return Err(SessionError::Write(format!(
                "frame of {} bytes exceeds the {max_frame} byte write buffer",
                frame.len()
            )));
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            self.shared.connected.store(false, Ordering::SeqCst);
            return Err(SessionError::Write("connection reset by peer".to_string()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| SessionError::Write("peer is gone".to_string()))?;
        self.shared.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>> {
        let mut closed = self.shared.closed.subscribe();
        let mut inbound = self.inbound.lock().await;

        let next = tokio::select! {
            next = inbound.recv() => next,
            _ = closed.wait_for(|c| *c) => {
                return Err(SessionError::Read(ReadFailure::Abnormal(
                    "transport closed locally".to_string(),
                )));
            }
        };

        match next {
            Some(Inbound::Frame(frame)) => Ok(frame),
            Some(Inbound::PeerClose(reason)) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(SessionError::Read(ReadFailure::ClosedByPeer(reason)))
            }
            Some(Inbound::Abnormal(message)) => {
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(SessionError::Read(ReadFailure::Abnormal(message)))
            }
            None => {
                self.shared.connected.store(false, Ordering::SeqCst);
                Err(SessionError::Read(ReadFailure::ClosedByPeer(None)))
            }
        }
    }

    fn ping(&self, done: PingResult) {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);

        if !self.is_connected() {
            let _ = done.send(Err(SessionError::Write("not connected".to_string())));
            return;
        }

        match PingMode::from_u8(self.shared.ping_mode.load(Ordering::SeqCst)) {
            PingMode::Healthy => {
                let _ = done.send(Ok(()));
            }
            PingMode::Failing => {
                let _ = done.send(Err(SessionError::Read(ReadFailure::Abnormal(
                    "no pong".to_string(),
                ))));
            }
            PingMode::Hanging => {
                if let Ok(mut hung) = self.shared.hung_pings.lock() {
                    // Pings whose caller gave up no longer need holding
                    hung.retain(|pending| !pending.is_closed());
                    hung.push(done);
                }
            }
        }
    }

    async fn close(&self) -> Result<()> {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.closed.send_replace(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }

    fn address(&self) -> &str {
        &self.address
    }
}

impl MemoryServer {
    /// Next raw frame written by the client
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.requests.recv().await
    }

    /// Next decoded request, or `None` once the client side is dropped
    pub async fn next_request(&mut self) -> Option<RequestEnvelope> {
        let frame = self.requests.recv().await?;
        decode_request(&frame).ok()
    }

    /// Like `next_request`, giving up after `wait`
    pub async fn next_request_within(&mut self, wait: Duration) -> Option<RequestEnvelope> {
        tokio::time::timeout(wait, self.next_request())
            .await
            .ok()
            .flatten()
    }

    /// Deliver raw bytes to the client's next `read`
    pub fn push(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.inbound.send(Inbound::Frame(frame.into()));
    }

    /// Deliver a response envelope for `request_id`
    pub fn respond(&self, request_id: &RequestId, code: u16, data: Value) {
        let response = json!({
            "requestId": request_id,
            "status": {"message": "", "code": code, "attributes": {}},
            "result": {"data": data, "meta": {}}
        });
        self.push(response.to_string());
    }

    /// Deliver an error status with a message
    pub fn respond_error(&self, request_id: &RequestId, code: u16, message: &str) {
        let response = json!({
            "requestId": request_id,
            "status": {"message": message, "code": code, "attributes": {}},
            "result": {"data": null, "meta": {}}
        });
        self.push(response.to_string());
    }

    /// Make the client's read observe a clean close
    pub fn close_from_peer(&self, reason: Option<&str>) {
        let _ = self
            .inbound
            .send(Inbound::PeerClose(reason.map(str::to_string)));
    }

    /// Make the client's read observe an abnormal disconnect
    pub fn break_connection(&self, message: &str) {
        let _ = self.inbound.send(Inbound::Abnormal(message.to_string()));
    }

    pub fn set_ping_mode(&self, mode: PingMode) {
        self.shared.ping_mode.store(mode.as_u8(), Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Reject frames longer than `max` bytes without dropping the connection
    pub fn set_max_frame(&self, max: Option<usize>) {
        self.shared.max_frame.store(max.unwrap_or(0), Ordering::SeqCst);
    }

    /// Pings held unanswered in `PingMode::Hanging`
    pub fn hung_ping_count(&self) -> usize {
        self.shared.hung_pings.lock().map(|hung| hung.len()).unwrap_or(0)
    }

    pub fn set_refuse_connect(&self, refuse: bool) {
        self.shared.refuse_connect.store(refuse, Ordering::SeqCst);
    }

    /// Frames successfully written by the client
    pub fn write_count(&self) -> usize {
        self.shared.writes.load(Ordering::SeqCst)
    }

    /// Pings issued by the client
    pub fn ping_count(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Whether the client closed its side
    pub fn client_closed(&self) -> bool {
        self.shared.disposed.load(Ordering::SeqCst)
    }
}
