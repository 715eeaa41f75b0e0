use crate::{config, find, open_driver};
use docdb_driver::frame::ResultShape;
use docdb_driver::operation::Operation;
use docdb_driver::DriverError;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::mock_server::{Action, MockServer};
use tokio::time::{timeout, Instant};

/// Answers commands, ignores queries.
async fn server_ignoring_queries() -> MockServer {
    MockServer::start(|frame| match frame.operation {
        Operation::Query { .. } => Action::Silence,
        _ => Action::document(json!({"ok": 1})),
    })
    .await
}

fn ping() -> Operation {
    Operation::Command {
        database: "admin".to_owned(),
        command: crate::doc(json!({"ping": 1})),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn default_config_bounds_unanswered_requests() {
    let server = server_ignoring_queries().await;
    let mut config = config(&server);
    config.request_timeout_ms = 50;
    config.sweep_interval_ms = 20;
    let driver = open_driver(config).await;

    let err = timeout(
        Duration::from_millis(1000),
        driver.submit(find("test_reaper", json!({})), ResultShape::Documents, false),
    )
    .await
    .unwrap()
    .unwrap_err();
    match err {
        DriverError::Timeout { elapsed, .. } => assert!(elapsed > Duration::from_millis(50)),
        other => panic!("unexpected {other:?}"),
    }
    assert!(driver.store().is_empty());

    // the connection itself is fine
    assert!(driver.submit(ping(), ResultShape::Documents, false).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn lone_request_is_bounded_without_a_timer() {
    let server = server_ignoring_queries().await;
    let mut config = config(&server);
    config.reaper_timer = false;
    config.request_timeout_ms = 50;
    config.sweep_interval_ms = 20;
    let driver = open_driver(config).await;

    // nothing else is submitted, so no admission sweep happens either
    let err = timeout(
        Duration::from_millis(1000),
        driver.submit(find("test_reaper", json!({})), ResultShape::Documents, false),
    )
    .await
    .unwrap()
    .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(err.is_retryable());
    assert!(driver.store().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_reaps_unanswered_requests() {
    let server = server_ignoring_queries().await;
    let mut config = config(&server);
    config.reaper_timer = false;
    config.request_timeout_ms = 50;
    config.sweep_interval_ms = 500;
    let driver = Arc::new(open_driver(config).await);

    let stuck = tokio::spawn({
        let driver = driver.clone();
        async move {
            driver
                .submit(find("test_reaper", json!({})), ResultShape::Documents, false)
                .await
        }
    });
    server.wait_for_received(1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.store().len(), 1);

    // admitting any request sweeps once the sweep interval has passed
    driver
        .reaper()
        .set_last_sweep_at(Instant::now() - Duration::from_millis(500));
    driver.submit(ping(), ResultShape::Documents, false).await.unwrap();
    let err = timeout(Duration::from_millis(300), stuck)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    match err {
        // well before the request's own deadline
        DriverError::Timeout { elapsed, .. } => assert!(elapsed < Duration::from_millis(500)),
        other => panic!("unexpected {other:?}"),
    }
}
