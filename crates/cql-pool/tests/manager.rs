//! End-to-end pool manager tests against an in-process mock cluster.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use cql_pool::{
    Address, ChannelListener, ConnectError, ConnectionErrorCode, ConnectionPoolListener,
    ConnectionPoolManagerInitializer, ConnectionSettings, PlainTextAuthProvider, PoolEvent,
    PoolSettings, ProtocolVersion, Request, TlsSettings,
};
use cql_testing::MockCluster;

const WAIT: Duration = Duration::from_secs(5);

async fn next_event(events: &mut mpsc::UnboundedReceiver<PoolEvent>) -> PoolEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for pool event")
        .expect("event channel closed")
}

async fn collect_events(events: &mut mpsc::UnboundedReceiver<PoolEvent>, count: usize) -> Vec<PoolEvent> {
    let mut collected = Vec::with_capacity(count);
    for _ in 0..count {
        collected.push(next_event(events).await);
    }
    collected
}

async fn wait_for_up(events: &mut mpsc::UnboundedReceiver<PoolEvent>, address: &Address) {
    loop {
        if next_event(events).await == PoolEvent::Up(address.clone()) {
            return;
        }
    }
}

fn quiet_settings() -> PoolSettings {
    // Keep failed reconnects from racing the assertions.
    PoolSettings::new().reconnect_wait(Duration::from_secs(60))
}

#[tokio::test]
async fn test_query_on_every_address() {
    let mut cluster = MockCluster::new(3).unwrap();
    cluster.start_all().unwrap();

    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .initialize(cluster.addresses())
        .await;
    assert!(initialized.failures().is_empty());

    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 3);
    for address in cluster.addresses() {
        let connection = manager
            .find_least_busy(&address)
            .expect("expected a live connection");
        connection.execute("SELECT * FROM table").await.unwrap();
    }
    manager.close();
}

#[tokio::test]
async fn test_keyspace_selected_after_handshake() {
    let mut cluster = MockCluster::builder().nodes(1).keyspace("foo").build().unwrap();
    cluster.start_all().unwrap();

    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_keyspace("foo")
        .initialize(cluster.addresses())
        .await;
    assert!(initialized.failures().is_empty());

    let manager = initialized.into_manager().unwrap();
    let connection = manager.find_least_busy(&cluster.address(0)).unwrap();
    assert_eq!(connection.keyspace().as_deref(), Some("foo"));
    connection.execute("SELECT * FROM foo.bar").await.unwrap();
    manager.close();
}

#[tokio::test]
async fn test_authenticated_handshake() {
    let mut cluster = MockCluster::builder()
        .nodes(1)
        .credentials("cassandra", "cassandra")
        .build()
        .unwrap();
    cluster.start_all().unwrap();

    let settings = PoolSettings::new().connection(
        ConnectionSettings::new()
            .auth_provider(Arc::new(PlainTextAuthProvider::new("cassandra", "cassandra"))),
    );
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .initialize(cluster.addresses())
        .await;
    assert!(initialized.failures().is_empty());

    let manager = initialized.into_manager().unwrap();
    let connection = manager.find_least_busy(&cluster.address(0)).unwrap();
    connection.execute("SELECT * FROM table").await.unwrap();
    manager.close();
}

#[tokio::test]
async fn test_listener_reports_every_pool_up() {
    let mut cluster = MockCluster::new(3).unwrap();
    cluster.start_all().unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;
    assert!(initialized.failures().is_empty());

    let mut up: Vec<_> = collect_events(&mut events, 3).await;
    up.sort_by_key(|event| format!("{event:?}"));
    let mut expected: Vec<_> = cluster.addresses().into_iter().map(PoolEvent::Up).collect();
    expected.sort_by_key(|event| format!("{event:?}"));
    assert_eq!(up, expected);

    initialized.manager().close();
}

#[tokio::test]
async fn test_unreachable_addresses_reported_down_not_failed() {
    let mut cluster = MockCluster::new(3).unwrap();
    cluster.start(0).unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(quiet_settings())
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    // Refused addresses stay pooled and keep reconnecting; they are not
    // bootstrap failures.
    assert!(initialized.failures().is_empty());
    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 3);

    let observed = collect_events(&mut events, 3).await;
    let ups = observed
        .iter()
        .filter(|event| matches!(event, PoolEvent::Up(_)))
        .count();
    let downs = observed
        .iter()
        .filter(|event| matches!(event, PoolEvent::Down(_)))
        .count();
    assert_eq!(ups, 1);
    assert_eq!(downs, 2);
    assert!(observed.contains(&PoolEvent::Up(cluster.address(0))));

    manager.close();
}

#[tokio::test]
async fn test_add_and_remove_addresses_at_runtime() {
    let mut cluster = MockCluster::new(3).unwrap();
    cluster.start_all().unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    collect_events(&mut events, 3).await;

    for address in cluster.addresses() {
        manager.remove(&address);
        assert!(manager.find_least_busy(&address).is_none());
        assert_eq!(next_event(&mut events).await, PoolEvent::Down(address.clone()));

        manager.add(address.clone());
        assert_eq!(next_event(&mut events).await, PoolEvent::Up(address.clone()));
        let connection = manager.find_least_busy(&address).unwrap();
        connection.execute("SELECT * FROM table").await.unwrap();
    }

    manager.close();
}

#[tokio::test]
async fn test_reconnects_after_node_restart() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();
    let address = cluster.address(0);

    let settings = PoolSettings::new().reconnect_wait(Duration::from_millis(50));
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Up(address.clone()));

    cluster.stop(0);
    assert_eq!(next_event(&mut events).await, PoolEvent::Down(address.clone()));

    cluster.start(0).unwrap();
    wait_for_up(&mut events, &address).await;
    let connection = manager.find_least_busy(&address).unwrap();
    connection.execute("SELECT * FROM table").await.unwrap();

    manager.close();
}

#[tokio::test]
async fn test_handshake_timeout_is_retryable() {
    let mut cluster = MockCluster::builder()
        .nodes(3)
        .respond_startup(false)
        .build()
        .unwrap();
    cluster.start_all().unwrap();

    let settings = quiet_settings()
        .connection(ConnectionSettings::new().connect_timeout(Duration::from_millis(200)));
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert!(initialized.failures().is_empty());
    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 3);

    let observed = collect_events(&mut events, 3).await;
    assert!(observed.iter().all(|event| matches!(event, PoolEvent::Down(_))));

    manager.close();
}

#[tokio::test]
async fn test_unsupported_protocol_version_is_critical() {
    let mut cluster = MockCluster::new(3).unwrap();
    cluster.start_all().unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::new(0x7F))
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 3);
    for failure in initialized.failures() {
        assert!(matches!(failure.error, ConnectError::InvalidProtocol { .. }));
    }
    assert_eq!(initialized.manager().pool_count(), 0);

    let observed = collect_events(&mut events, 3).await;
    assert!(observed.iter().all(|event| matches!(
        event,
        PoolEvent::CriticalError {
            code: ConnectionErrorCode::InvalidProtocol,
            ..
        }
    )));

    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_unknown_keyspace_is_critical() {
    let mut cluster = MockCluster::builder().nodes(1).keyspace("foo").build().unwrap();
    cluster.start_all().unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_keyspace("missing")
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 1);
    assert!(matches!(
        initialized.failures()[0].error,
        ConnectError::Keyspace { .. }
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::CriticalError {
            code: ConnectionErrorCode::Keyspace,
            ..
        }
    ));
    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_bad_credentials_are_critical() {
    let mut cluster = MockCluster::builder()
        .nodes(1)
        .credentials("cassandra", "cassandra")
        .build()
        .unwrap();
    cluster.start_all().unwrap();

    let settings = PoolSettings::new().connection(
        ConnectionSettings::new()
            .auth_provider(Arc::new(PlainTextAuthProvider::new("invalid", "invalid"))),
    );
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 1);
    assert!(matches!(initialized.failures()[0].error, ConnectError::Auth(_)));
    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::CriticalError {
            code: ConnectionErrorCode::Auth,
            ..
        }
    ));
    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_missing_credentials_are_critical() {
    let mut cluster = MockCluster::builder()
        .nodes(1)
        .credentials("cassandra", "cassandra")
        .build()
        .unwrap();
    cluster.start_all().unwrap();

    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 1);
    assert!(matches!(initialized.failures()[0].error, ConnectError::Auth(_)));
    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_tls_handshake_with_trusted_certificate() {
    let mut cluster = MockCluster::builder().nodes(2).tls().build().unwrap();
    cluster.start_all().unwrap();

    let tls = TlsSettings::with_pem_roots(cluster.certificate_pem().unwrap().as_bytes()).unwrap();
    let settings = PoolSettings::new().connection(ConnectionSettings::new().tls(tls));
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .initialize(cluster.addresses())
        .await;
    assert!(initialized.failures().is_empty());

    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 2);
    for address in cluster.addresses() {
        let connection = manager.find_least_busy(&address).unwrap();
        connection.execute("SELECT * FROM table").await.unwrap();
    }
    manager.close();
}

#[tokio::test]
async fn test_untrusted_certificate_is_verify_error() {
    let mut cluster = MockCluster::builder().nodes(1).tls().build().unwrap();
    cluster.start_all().unwrap();

    // The nodes serve a self-signed certificate; a client trusting only the
    // public root set must reject it.
    let settings = PoolSettings::new()
        .connection(ConnectionSettings::new().tls(TlsSettings::with_webpki_roots()));
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 1);
    assert!(matches!(
        initialized.failures()[0].error,
        ConnectError::SslVerify(_)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::CriticalError {
            code: ConnectionErrorCode::SslVerify,
            ..
        }
    ));
    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_tls_against_plaintext_node_is_critical() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();

    let settings = PoolSettings::new()
        .connection(ConnectionSettings::new().tls(TlsSettings::with_webpki_roots()));
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;

    assert_eq!(initialized.failures().len(), 1);
    assert!(matches!(
        initialized.failures()[0].error,
        ConnectError::SslHandshake(_)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        PoolEvent::CriticalError {
            code: ConnectionErrorCode::SslHandshake,
            ..
        }
    ));
    assert!(initialized.into_manager().is_err());
}

#[tokio::test]
async fn test_empty_address_list() {
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .initialize(Vec::new())
        .await;
    assert!(initialized.failures().is_empty());
    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 0);
    manager.close();
}

#[tokio::test]
async fn test_duplicate_addresses_pooled_once() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();
    let address = cluster.address(0);

    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .initialize(vec![address.clone(), address.clone(), address])
        .await;
    let manager = initialized.into_manager().unwrap();
    assert_eq!(manager.pool_count(), 1);
    manager.close();
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();

    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Up(cluster.address(0)));

    manager.close();
    manager.close();

    assert_eq!(next_event(&mut events).await, PoolEvent::Down(cluster.address(0)));
    assert_eq!(next_event(&mut events).await, PoolEvent::Closed);
    // The manager released its listener on the first close; no second Closed
    // event can arrive.
    assert_eq!(events.recv().await, None);
    assert!(manager.find_least_busy(&cluster.address(0)).is_none());
}

#[tokio::test]
async fn test_least_busy_prefers_idle_connection() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();
    let address = cluster.address(0);

    let settings = PoolSettings::new().connections_per_host(2);
    let (listener, mut events) = ChannelListener::new();
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .with_listener(Arc::new(listener))
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    assert_eq!(next_event(&mut events).await, PoolEvent::Up(address.clone()));

    let first = manager.find_least_busy(&address).unwrap();
    // Buffer a request without flushing so it stays in flight and pins the
    // connection's load.
    let (responder, _response) = oneshot::channel();
    assert!(first.write(Request {
        query: "SELECT * FROM table".to_string(),
        responder,
    }));
    assert_eq!(first.in_flight(), 1);

    // The second connection may still be finishing its handshake.
    let second = timeout(WAIT, async {
        loop {
            let candidate = manager.find_least_busy(&address).unwrap();
            if !Arc::ptr_eq(&candidate, &first) {
                return candidate;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("second connection never came up");
    assert_eq!(second.in_flight(), 0);

    manager.close();
}

#[tokio::test]
async fn test_write_refused_past_in_flight_cap() {
    let mut cluster = MockCluster::builder()
        .nodes(1)
        .respond_startup(true)
        .build()
        .unwrap();
    cluster.start_all().unwrap();

    let mut connection_settings = ConnectionSettings::new();
    connection_settings.max_in_flight = 1;
    let settings = PoolSettings::new().connection(connection_settings);
    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .with_settings(settings)
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    let connection = manager.find_least_busy(&cluster.address(0)).unwrap();

    let (responder, _response) = oneshot::channel();
    assert!(connection.write(Request {
        query: "SELECT 1".to_string(),
        responder,
    }));
    let (responder, _response) = oneshot::channel();
    assert!(!connection.write(Request {
        query: "SELECT 2".to_string(),
        responder,
    }));

    manager.close();
}

#[tokio::test]
async fn test_listener_can_be_replaced() {
    let mut cluster = MockCluster::new(1).unwrap();
    cluster.start_all().unwrap();

    let initialized = ConnectionPoolManagerInitializer::new(ProtocolVersion::V4)
        .initialize(cluster.addresses())
        .await;
    let manager = initialized.into_manager().unwrap();
    assert!(manager.listener().is_none());

    let (listener, mut events) = ChannelListener::new();
    let listener: Arc<dyn ConnectionPoolListener> = Arc::new(listener);
    manager.set_listener(Some(Arc::clone(&listener)));
    let installed = manager.listener().expect("listener should be installed");
    assert!(Arc::ptr_eq(&installed, &listener));

    manager.close();
    assert_eq!(next_event(&mut events).await, PoolEvent::Closed);
}
