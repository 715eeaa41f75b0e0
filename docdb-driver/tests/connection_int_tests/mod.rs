use crate::{config, find, open_driver};
use docdb_driver::frame::ResultShape;
use docdb_driver::operation::Operation;
use docdb_driver::pool::{ConnectionHealth, Role};
use docdb_driver::DriverError;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::mock_server::{acknowledge, Action, MockServer};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread")]
async fn sole_unhealthy_connection_fails_fast() {
    let server = MockServer::acknowledging().await;
    let driver = open_driver(config(&server)).await;
    assert_eq!(driver.pool().capacity(), 1);

    let connection = driver.pool().checkout_writer().await.unwrap();
    driver.pool().mark_unhealthy(connection.id(), "test");

    let err = driver
        .submit(find("test", json!({})), ResultShape::Documents, false)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::NoHealthyConnection { role: Role::Writer }));
    assert_eq!(err.to_string(), "no healthy writer connection is available");
    assert!(server.received().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn hangup_resolves_pending_requests() {
    let server = MockServer::start(|frame| match frame.operation {
        Operation::Query { .. } => Action::Hangup,
        _ => acknowledge(frame),
    })
    .await;
    let driver = open_driver(config(&server)).await;

    let err = timeout(
        Duration::from_secs(5),
        driver.submit(find("test_hangup", json!({})), ResultShape::Documents, false),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(matches!(err, DriverError::ConnectionClosed { .. }), "{err:?}");
    assert!(err.is_retryable());
    assert!(driver.store().is_empty());
    assert_eq!(driver.pool().health(0), Some(ConnectionHealth::Unhealthy));
}

#[tokio::test(flavor = "multi_thread")]
async fn reconnects_after_hangup() {
    let hung_up = Arc::new(AtomicBool::new(false));
    let server = MockServer::start({
        let hung_up = hung_up.clone();
        move |frame| match frame.operation {
            Operation::Query { .. } if !hung_up.swap(true, Ordering::SeqCst) => Action::Hangup,
            Operation::Query { .. } => Action::document(json!({"a": 1})),
            _ => acknowledge(frame),
        }
    })
    .await;
    let mut config = config(&server);
    config.auto_reconnect = true;
    config.reconnect_interval_ms = 20;
    let driver = open_driver(config).await;

    let err = driver
        .submit(find("test_reconnect", json!({})), ResultShape::Documents, false)
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::ConnectionClosed { .. }));

    // either the background loop or the checkout itself brings the slot back
    let payload = driver
        .submit(find("test_reconnect", json!({})), ResultShape::Documents, false)
        .await
        .unwrap()
        .into_payload()
        .unwrap();
    assert_eq!(payload.documents().unwrap(), &[crate::doc(json!({"a": 1}))]);
    // a background reconnect racing the on-demand one may open a link that is then discarded
    assert!(server.connections_accepted() >= 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn close_cancels_in_flight_requests() {
    let server = MockServer::start(|_| Action::Silence).await;
    let driver = Arc::new(open_driver(config(&server)).await);

    let in_flight = tokio::spawn({
        let driver = driver.clone();
        async move {
            driver
                .submit(find("test_close", json!({})), ResultShape::Documents, false)
                .await
        }
    });
    server.wait_for_received(1).await;
    driver.close();

    let err = timeout(Duration::from_secs(5), in_flight)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, DriverError::ConnectionClosed { .. }));
    assert_eq!(driver.pool().health(0), Some(ConnectionHealth::Closed));
    assert!(matches!(
        driver.submit(find("test_close", json!({})), ResultShape::Documents, false).await,
        Err(DriverError::NoHealthyConnection { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn open_fails_without_a_server() {
    let server = MockServer::acknowledging().await;
    let mut config = config(&server);
    server.shutdown();
    drop(server);
    // nothing listens on this port once the listener task is gone
    tokio::time::sleep(Duration::from_millis(50)).await;
    config.connect_timeout_ms = 500;

    let driver = docdb_driver::Driver::new(config).unwrap();
    assert!(driver.open().await.is_err());
    assert_eq!(driver.pool().healthy_count(), 0);
}
