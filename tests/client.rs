//! Client reconnection against the in-memory transport

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use gremlin_session::transport::PingResult;
use gremlin_session::{
    Client, ConnectionConfig, Dialer, DialerFactory, HealthState, MemoryDialer, MemoryServer,
    ReconnectPolicy, SessionError,
};

fn quiet_config() -> ConnectionConfig {
    ConnectionConfig::new("ws://graph.test:8182/gremlin")
        .with_ping_interval(Duration::ZERO)
        .with_read_deadline(Duration::from_secs(1))
}

fn fast_policy() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: 3,
        ..ReconnectPolicy::default()
    }
}

/// Factory handing each new server half to the test
fn memory_factory() -> (Arc<dyn DialerFactory>, mpsc::UnboundedReceiver<MemoryServer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let factory = move |config: &ConnectionConfig| -> gremlin_session::Result<Arc<dyn Dialer>> {
        let (dialer, server) = MemoryDialer::pair(config.address.clone());
        let _ = tx.send(server);
        Ok(Arc::new(dialer))
    };
    (Arc::new(factory), rx)
}

/// Answer every request with the server's generation number
fn serve(mut server: MemoryServer, generation: usize) {
    tokio::spawn(async move {
        while let Some(request) = server.next_request().await {
            server.respond(&request.request_id, 200, json!([generation]));
        }
    });
}

async fn wait_until_closed(client: &Client) {
    for _ in 0..200 {
        if client.health().await == HealthState::Closed {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session did not close");
}

#[tokio::test]
async fn submit_uses_current_session() {
    let (factory, mut servers) = memory_factory();
    let client = assert_ok!(Client::with_factory(quiet_config(), factory, fast_policy()).await);
    serve(servers.recv().await.unwrap(), 1);

    let result = assert_ok!(client.submit("g.V()").await);
    assert_eq!(result.data, vec![json!(1)]);
    assert_eq!(client.health().await, HealthState::Open);
    client.close().await;
}

#[tokio::test]
async fn redials_after_connection_loss() {
    let (factory, mut servers) = memory_factory();
    let client = assert_ok!(Client::with_factory(quiet_config(), factory, fast_policy()).await);

    let first = servers.recv().await.unwrap();
    first.close_from_peer(Some("restarting"));
    wait_until_closed(&client).await;

    let redial = tokio::spawn(async move {
        let second = servers.recv().await.unwrap();
        serve(second, 2);
        servers
    });

    let result = assert_ok!(client.submit("g.V()").await);
    assert_eq!(result.data, vec![json!(2)]);
    assert_eq!(client.health().await, HealthState::Open);

    let _servers = redial.await.unwrap();
    client.close().await;
}

#[tokio::test]
async fn disabled_policy_reports_closed_session() {
    let (factory, mut servers) = memory_factory();
    let client = assert_ok!(
        Client::with_factory(quiet_config(), factory, ReconnectPolicy::disabled()).await
    );

    let first = servers.recv().await.unwrap();
    first.break_connection("reset");
    wait_until_closed(&client).await;

    let err = assert_err!(client.submit("g.V()").await);
    assert!(matches!(err, SessionError::SessionClosed));
    assert!(servers.try_recv().is_err());
}

#[tokio::test]
async fn close_stops_redialing() {
    let (factory, mut servers) = memory_factory();
    let client = assert_ok!(Client::with_factory(quiet_config(), factory, fast_policy()).await);
    let first = servers.recv().await.unwrap();

    client.close().await;
    assert!(first.client_closed());

    let err = assert_err!(client.submit("g.V()").await);
    assert!(matches!(err, SessionError::SessionClosed));
    assert!(matches!(client.reconnect().await, Err(SessionError::SessionClosed)));
    assert!(servers.try_recv().is_err());
}

#[tokio::test]
async fn explicit_reconnect_replaces_session() {
    let (factory, mut servers) = memory_factory();
    let client = assert_ok!(Client::with_factory(quiet_config(), factory, fast_policy()).await);
    let first = servers.recv().await.unwrap();

    assert_ok!(client.reconnect().await);
    assert!(first.client_closed());

    serve(servers.recv().await.unwrap(), 2);
    let result = assert_ok!(client.submit("g.V()").await);
    assert_eq!(result.data, vec![json!(2)]);
    client.close().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let dials = Arc::new(AtomicUsize::new(0));
    let (tx, mut servers) = mpsc::unbounded_channel();

    let counter = Arc::clone(&dials);
    let factory = move |config: &ConnectionConfig| -> gremlin_session::Result<Arc<dyn Dialer>> {
        let (dialer, server) = MemoryDialer::pair(config.address.clone());
        if counter.fetch_add(1, Ordering::SeqCst) > 0 {
            server.set_refuse_connect(true);
        }
        let _ = tx.send(server);
        Ok(Arc::new(dialer))
    };

    let client = assert_ok!(
        Client::with_factory(quiet_config(), Arc::new(factory), fast_policy()).await
    );
    let first = servers.recv().await.unwrap();
    first.close_from_peer(None);
    wait_until_closed(&client).await;

    let err = assert_err!(client.submit("g.V()").await);
    assert!(matches!(err, SessionError::Connect(_)));
    assert_eq!(dials.load(Ordering::SeqCst), 1 + fast_policy().max_attempts as usize);
}

#[tokio::test]
async fn initial_connect_failure_is_returned() {
    let factory = |config: &ConnectionConfig| -> gremlin_session::Result<Arc<dyn Dialer>> {
        let (dialer, server) = MemoryDialer::pair(config.address.clone());
        server.set_refuse_connect(true);
        Ok(Arc::new(dialer))
    };

    let result = Client::with_factory(quiet_config(), Arc::new(factory), fast_policy()).await;
    assert!(matches!(result, Err(SessionError::Connect(_))));
}

/// Memory transport whose `connect` takes a while
struct SlowDialer {
    inner: MemoryDialer,
    delay: Duration,
}

#[async_trait]
impl Dialer for SlowDialer {
    async fn connect(&self) -> gremlin_session::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.connect().await
    }

    async fn send(&self, frame: Vec<u8>) -> gremlin_session::Result<()> {
        self.inner.send(frame).await
    }

    async fn read(&self) -> gremlin_session::Result<Vec<u8>> {
        self.inner.read().await
    }

    fn ping(&self, done: PingResult) {
        self.inner.ping(done)
    }

    async fn close(&self) -> gremlin_session::Result<()> {
        self.inner.close().await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    fn address(&self) -> &str {
        self.inner.address()
    }
}

#[tokio::test]
async fn close_during_redial_leaves_no_live_session() {
    let dials = Arc::new(AtomicUsize::new(0));
    let (tx, mut servers) = mpsc::unbounded_channel();

    let counter = Arc::clone(&dials);
    let factory = move |config: &ConnectionConfig| -> gremlin_session::Result<Arc<dyn Dialer>> {
        let (dialer, server) = MemoryDialer::pair(config.address.clone());
        let _ = tx.send(server);
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Arc::new(dialer))
        } else {
            Ok(Arc::new(SlowDialer {
                inner: dialer,
                delay: Duration::from_millis(200),
            }))
        }
    };

    let client = Arc::new(assert_ok!(
        Client::with_factory(quiet_config(), Arc::new(factory), fast_policy()).await
    ));
    let first = servers.recv().await.unwrap();
    first.close_from_peer(None);
    wait_until_closed(&client).await;

    let submitter = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.submit("g.V()").await })
    };

    // The redial is now parked inside the slow connect
    let second = servers.recv().await.unwrap();
    serve(second, 2);
    tokio::time::sleep(Duration::from_millis(50)).await;

    client.close().await;

    let err = assert_err!(submitter.await.unwrap());
    assert!(matches!(err, SessionError::SessionClosed));
    assert_eq!(client.health().await, HealthState::Closed);

    let err = assert_err!(client.submit("g.V()").await);
    assert!(matches!(err, SessionError::SessionClosed));

    // Nothing left dialing in the background
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(dials.load(Ordering::SeqCst), 2);
    assert_eq!(client.health().await, HealthState::Closed);
}
