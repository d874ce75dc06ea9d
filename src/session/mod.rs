//! Session - request/response correlation over one shared connection
//!
//! Owns the outstanding request table and the shutdown gate. Background
//! tasks per session:
//! - **read loop**: the only reader; dispatches frames by request id
//! - **keepalive**: optional liveness monitor
//! - **supervisor**: waits for the gate, then tears everything down
//!
//! Teardown order is fixed: gate fires → read loop and keepalive exit →
//! transport closes → every outstanding waiter fails → health `Closed`.

mod health;

pub use health::{HealthCell, HealthState};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthNegotiator, AuthStep};
use crate::config::ConnectionConfig;
use crate::keepalive::{KeepaliveConfig, KeepaliveMonitor};
use crate::protocol::{
    decode_response, encode_request, Completion, Query, QueryResult, RequestEnvelope, RequestId,
};
use crate::shutdown::{ShutdownGate, ShutdownReason};
use crate::transport::Dialer;
use crate::types::{Result, SessionError};

/// Table entry for one outstanding request
struct Pending {
    waiter: oneshot::Sender<Completion>,
    /// Items from 206 batches received so far
    partial: Vec<Value>,
}

/// Decrements the live-task counter when a background task ends
struct LoopGuard(Arc<AtomicUsize>);

impl LoopGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LoopGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Inner {
    dialer: Arc<dyn Dialer>,
    config: ConnectionConfig,
    pending: DashMap<RequestId, Pending>,
    write_lock: Mutex<()>,
    gate: Arc<ShutdownGate>,
    health: Arc<HealthCell>,
    terminated: watch::Sender<bool>,
    active_loops: Arc<AtomicUsize>,
}

/// A live session over one connection
pub struct Session {
    inner: Arc<Inner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open the transport (unless already open) and start the background tasks.
    pub async fn connect(dialer: Arc<dyn Dialer>, config: ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let health = Arc::new(HealthCell::new());
        if !dialer.is_connected() {
            dialer.connect().await?;
        }
        health.transition(HealthState::Open);

        let (terminated, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            dialer,
            config,
            pending: DashMap::new(),
            write_lock: Mutex::new(()),
            gate: Arc::new(ShutdownGate::new()),
            health,
            terminated,
            active_loops: Arc::new(AtomicUsize::new(0)),
        });

        let reader = {
            let guard = LoopGuard::enter(&inner.active_loops);
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let _guard = guard;
                read_loop(inner).await;
            })
        };

        let keepalive = if inner.config.keepalive_enabled() {
            let guard = LoopGuard::enter(&inner.active_loops);
            let monitor = KeepaliveMonitor::new(
                KeepaliveConfig::from(&inner.config),
                Arc::clone(&inner.dialer),
                Arc::clone(&inner.gate),
                Arc::clone(&inner.health),
            );
            Some(tokio::spawn(async move {
                let _guard = guard;
                monitor.run().await;
            }))
        } else {
            None
        };

        let supervisor = {
            let guard = LoopGuard::enter(&inner.active_loops);
            let inner = Arc::clone(&inner);
            tokio::spawn(supervise(inner, reader, keepalive, guard))
        };

        info!("Session open on {}", inner.dialer.address());

        Ok(Self {
            inner,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }

    /// Submit a query and wait for its result.
    ///
    /// Bounded by `ConnectionConfig::request_timeout` when set.
    pub async fn submit(&self, query: impl Into<Query>) -> Result<QueryResult> {
        match self.inner.config.request_timeout {
            Some(wait) => self.submit_with_timeout(query, wait).await,
            None => self.inner.execute(RequestId::generate(), query.into()).await,
        }
    }

    /// Submit a query, failing with `Timeout` if no result arrives within `wait`.
    pub async fn submit_with_timeout(
        &self,
        query: impl Into<Query>,
        wait: Duration,
    ) -> Result<QueryResult> {
        let id = RequestId::generate();
        match tokio::time::timeout(wait, self.inner.execute(id.clone(), query.into())).await {
            Ok(result) => result,
            Err(_) => {
                self.inner.pending.remove(&id);
                warn!(request_id = %id, "Request timed out after {:?}", wait);
                Err(SessionError::Timeout(wait))
            }
        }
    }

    /// Close the session. Safe to call repeatedly and concurrently; every
    /// call returns once teardown is complete.
    pub async fn close(&self) {
        if self.inner.gate.fire(ShutdownReason::CallerClose) {
            info!("Closing session on {}", self.inner.dialer.address());
        }

        let supervisor = self.supervisor.lock().await.take();
        match supervisor {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Session supervisor failed: {}", e);
                }
            }
            None => {
                let mut terminated = self.inner.terminated.subscribe();
                let _ = terminated.wait_for(|t| *t).await;
            }
        }
    }

    pub fn health(&self) -> HealthState {
        self.inner.health.get()
    }

    /// Watch health transitions
    pub fn subscribe_health(&self) -> watch::Receiver<HealthState> {
        self.inner.health.subscribe()
    }

    /// Whether the shutdown gate has fired
    pub fn is_closed(&self) -> bool {
        self.inner.gate.is_fired()
    }

    pub fn shutdown_reason(&self) -> Option<ShutdownReason> {
        self.inner.gate.reason()
    }

    /// Number of requests waiting for a response
    pub fn outstanding(&self) -> usize {
        self.inner.pending.len()
    }

    /// Background tasks still running (read loop, keepalive, supervisor)
    pub fn active_loops(&self) -> usize {
        self.inner.active_loops.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> &str {
        self.inner.dialer.address()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Supervisor finishes teardown in the background
        self.inner.gate.fire(ShutdownReason::CallerClose);
    }
}

impl Inner {
    async fn execute(&self, id: RequestId, query: Query) -> Result<QueryResult> {
        if self.gate.is_fired() {
            return Err(SessionError::SessionClosed);
        }

        let mut negotiator = AuthNegotiator::new(id.clone(), self.config.credentials.as_ref());
        let mut envelope = RequestEnvelope::eval(id.clone(), query);
        let mut first_attempt = true;

        loop {
            let frame = encode_request(&envelope)?;
            let waiter = self.register(&id, first_attempt)?;
            first_attempt = false;

            if let Err(e) = self.write(frame).await {
                self.pending.remove(&id);
                return Err(e);
            }
            debug!(request_id = %id, op = %envelope.op, "Request sent");

            let completion = waiter.await.map_err(|_| SessionError::ConnectionClosed)?;

            match negotiator.on_response(completion).await? {
                AuthStep::Complete(result) => return Ok(result),
                AuthStep::Resubmit(next) => envelope = next,
            }
        }
    }

    /// Insert a waiter for `id`, re-checking the gate after insertion so a
    /// concurrent drain can never miss it.
    fn register(&self, id: &RequestId, first_attempt: bool) -> Result<oneshot::Receiver<Completion>> {
        let (waiter, rx) = oneshot::channel();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => {
                return Err(SessionError::Usage(format!(
                    "request id {id} is already outstanding"
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(Pending {
                    waiter,
                    partial: Vec::new(),
                });
            }
        }

        if self.gate.is_fired() {
            self.pending.remove(id);
            return Err(if first_attempt {
                SessionError::SessionClosed
            } else {
                SessionError::ConnectionClosed
            });
        }
        Ok(rx)
    }

    /// Single-writer send. A write that leaves the transport disconnected
    /// takes the session down; a rejected frame fails only its request.
    async fn write(&self, frame: Vec<u8>) -> Result<()> {
        let _writer = self.write_lock.lock().await;
        if self.gate.is_fired() {
            return Err(SessionError::ConnectionClosed);
        }

        match self.dialer.send(frame).await {
            Ok(()) => Ok(()),
            Err(e) if self.dialer.is_connected() => {
                warn!("Frame rejected by {}: {}", self.dialer.address(), e);
                Err(e)
            }
            Err(e) => {
                error!("Write to {} failed: {}", self.dialer.address(), e);
                self.gate.fire(ShutdownReason::WriteFailure);
                Err(e)
            }
        }
    }

    fn dispatch(&self, frame: &[u8]) {
        let response = match decode_response(frame) {
            Ok(response) => response,
            Err(e) => {
                warn!(bytes = frame.len(), error = %e, "Discarding malformed frame");
                return;
            }
        };

        let id = response.request_id.clone();
        let code = response.status.code();

        if !code.is_terminal() {
            match self.pending.get_mut(&id) {
                Some(mut entry) => {
                    let items = response.into_items();
                    debug!(request_id = %id, items = items.len(), "Partial content received");
                    entry.partial.extend(items);
                }
                None => warn!(request_id = %id, "Dropping partial response for unknown request"),
            }
            return;
        }

        match self.pending.remove(&id) {
            Some((_, pending)) => {
                let completion = Completion::new(pending.partial, response);
                if pending.waiter.send(completion).is_err() {
                    debug!(request_id = %id, "Waiter gone before response arrived");
                }
            }
            None => {
                warn!(request_id = %id, code = code.as_u16(), "Dropping response for unknown request");
            }
        }
    }

    /// Drop every waiter; each blocked submit sees `ConnectionClosed`.
    fn fail_outstanding(&self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }
}

async fn read_loop(inner: Arc<Inner>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = inner.gate.fired() => break,
            frame = inner.dialer.read() => frame,
        };

        match frame {
            Ok(frame) => inner.dispatch(&frame),
            Err(e) => {
                if inner.gate.is_fired() {
                    break;
                }
                if e.is_clean_close() {
                    info!("Server closed connection on {}: {}", inner.dialer.address(), e);
                } else {
                    error!("Read from {} failed: {}", inner.dialer.address(), e);
                }
                inner.gate.fire(ShutdownReason::ReadFailure);
                break;
            }
        }
    }
    debug!("Read loop stopped");
}

async fn supervise(
    inner: Arc<Inner>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
    guard: LoopGuard,
) {
    inner.gate.fired().await;
    let reason = inner
        .gate
        .reason()
        .unwrap_or(ShutdownReason::CallerClose);

    if let Err(e) = reader.await {
        error!("Read loop task failed: {}", e);
    }
    if let Some(keepalive) = keepalive {
        if let Err(e) = keepalive.await {
            error!("Keepalive task failed: {}", e);
        }
    }

    if let Err(e) = inner.dialer.close().await {
        warn!("Failed to close transport: {}", e);
    }

    let failed = inner.fail_outstanding();
    inner.health.transition(HealthState::Closed);
    info!(%reason, failed, "Session on {} closed", inner.dialer.address());

    drop(guard);
    inner.terminated.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryDialer;
    use serde_json::json;

    fn quiet_config() -> ConnectionConfig {
        ConnectionConfig::default().with_ping_interval(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_connect_opens_transport() {
        let (dialer, _server) = MemoryDialer::pair("mem://graph");
        let dialer: Arc<dyn Dialer> = Arc::new(dialer);
        let session = Session::connect(Arc::clone(&dialer), quiet_config()).await.unwrap();

        assert!(dialer.is_connected());
        assert_eq!(session.health(), HealthState::Open);
        // read loop + supervisor, keepalive disabled
        assert_eq!(session.active_loops(), 2);
        session.close().await;
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let (dialer, _server) = MemoryDialer::pair("mem://graph");
        let config = quiet_config().with_read_buffer_size(0);
        let result = Session::connect(Arc::new(dialer), config).await;
        assert!(matches!(result, Err(SessionError::Config(_))));
    }

    #[tokio::test]
    async fn test_partial_content_is_accumulated() {
        let (dialer, mut server) = MemoryDialer::pair("mem://graph");
        let session = Session::connect(Arc::new(dialer), quiet_config()).await.unwrap();

        let server_task = tokio::spawn(async move {
            let request = server.next_request().await.unwrap();
            server.respond(&request.request_id, 206, json!([1, 2]));
            server.respond(&request.request_id, 206, json!({"@type": "g:List", "@value": [3]}));
            server.respond(&request.request_id, 200, json!([4]));
            server
        });

        let result = session.submit("g.V().values('n')").await.unwrap();
        assert_eq!(result.data, vec![json!(1), json!(2), json!(3), json!(4)]);
        assert_eq!(session.outstanding(), 0);

        let _server = server_task.await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_no_content_is_empty_result() {
        let (dialer, mut server) = MemoryDialer::pair("mem://graph");
        let session = Session::connect(Arc::new(dialer), quiet_config()).await.unwrap();

        let server_task = tokio::spawn(async move {
            let request = server.next_request().await.unwrap();
            server.respond(&request.request_id, 204, Value::Null);
            server
        });

        let result = session.submit("g.V().drop()").await.unwrap();
        assert!(result.is_empty());

        let _server = server_task.await.unwrap();
        session.close().await;
    }

    #[tokio::test]
    async fn test_drop_fires_gate() {
        let (dialer, server) = MemoryDialer::pair("mem://graph");
        let session = Session::connect(Arc::new(dialer), quiet_config()).await.unwrap();
        drop(session);

        for _ in 0..100 {
            if server.client_closed() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dropping the session should close the transport");
    }
}
