use crate::{config, doc, insert, open_driver};
use docdb_driver::frame::ResultShape;
use docdb_driver::operation::{Namespace, Operation};
use docdb_driver::{DriverError, Reply};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::time::Duration;
use test_helpers::mock_server::{acknowledge, Action, MockServer};
use tokio::time::timeout;

fn is_confirmation(operation: &Operation) -> bool {
    matches!(operation, Operation::Command { command, .. } if command.contains_key("getlasterror"))
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_insert() {
    let server = MockServer::acknowledging().await;
    let driver = open_driver(config(&server)).await;

    let result = driver
        .submit(
            insert("test_safe_insert", vec![json!({"hello": "world"})]),
            ResultShape::Documents,
            true,
        )
        .await
        .unwrap()
        .into_safe_write()
        .unwrap();
    assert!(result.ok());
    assert_eq!(result.affected(), 1);
    assert_eq!(result.error_message(), None);

    // the confirmation directly follows the write it confirms
    let received = server.received();
    assert_eq!(received.len(), 2);
    assert!(received[0].operation.is_write());
    assert!(is_confirmation(&received[1].operation));
    assert_eq!(received[1].operation.database(), "integration_tests");
    assert_ne!(received[0].request_id, received[1].request_id);

    // the confirmation is never left behind in the store
    assert!(driver.store().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_key_is_reported_not_thrown() {
    let server = MockServer::start(|frame| {
        if is_confirmation(&frame.operation) {
            Action::document(json!({"ok": 0, "err": "E11000 duplicate key"}))
        } else {
            acknowledge(frame)
        }
    })
    .await;
    let driver = open_driver(config(&server)).await;

    let reply = driver
        .submit(
            insert("test_duplicate", vec![json!({"_id": 1})]),
            ResultShape::Documents,
            true,
        )
        .await
        .unwrap();
    let result = reply.into_safe_write().unwrap();
    assert!(!result.ok());
    assert_eq!(result.error_message(), Some("E11000 duplicate key"));
    assert!(matches!(
        result.into_result(),
        Err(DriverError::WriteRejected { message }) if message == "E11000 duplicate key"
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn no_op_update_affects_nothing() {
    let server = MockServer::start(|frame| {
        if is_confirmation(&frame.operation) {
            Action::document(json!({"ok": 1, "n": 0, "updatedExisting": false, "err": null}))
        } else {
            acknowledge(frame)
        }
    })
    .await;
    let driver = open_driver(config(&server)).await;

    let update = Operation::Update {
        namespace: Namespace::new("integration_tests", "test_update"),
        selector: doc(json!({"a": 100})),
        update: doc(json!({"$set": {"b": 1}})),
        upsert: false,
        multi: false,
    };
    let result = driver
        .submit(update, ResultShape::Documents, true)
        .await
        .unwrap()
        .into_safe_write()
        .unwrap();
    assert!(result.ok());
    assert_eq!(result.affected(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unacknowledged_write_is_fire_and_forget() {
    let server = MockServer::acknowledging().await;
    let driver = open_driver(config(&server)).await;

    let reply = driver
        .submit(
            Operation::Remove {
                namespace: Namespace::new("integration_tests", "test_remove"),
                selector: doc(json!({})),
                single: false,
            },
            ResultShape::Documents,
            false,
        )
        .await
        .unwrap();
    assert!(matches!(reply, Reply::Unacknowledged));
    assert!(driver.store().is_empty());

    let received = server.wait_for_received(1).await;
    assert_eq!(received[0].operation.kind(), "remove");
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_confirmation_is_indeterminate() {
    let server = MockServer::start(|frame| {
        if is_confirmation(&frame.operation) {
            Action::Hangup
        } else {
            acknowledge(frame)
        }
    })
    .await;
    let driver = open_driver(config(&server)).await;

    let err = driver
        .submit(
            insert("test_lost_confirmation", vec![json!({"a": 1})]),
            ResultShape::Documents,
            true,
        )
        .await
        .unwrap_err();
    match &err {
        DriverError::IndeterminateWrite { cause, .. } => {
            assert!(matches!(**cause, DriverError::ConnectionClosed { .. }))
        }
        other => panic!("unexpected {other:?}"),
    }
    // retrying could apply the write twice
    assert!(!err.is_retryable());
    assert!(driver.store().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn silent_confirmation_times_out_as_indeterminate() {
    let server = MockServer::start(|_| Action::Silence).await;
    let mut config = config(&server);
    // without a timer the confirmation's own deadline still ends the wait
    config.reaper_timer = false;
    config.request_timeout_ms = 50;
    config.sweep_interval_ms = 20;
    let driver = open_driver(config).await;

    let err = timeout(
        Duration::from_millis(1000),
        driver.submit(
            insert("test_silent_confirmation", vec![json!({"a": 1})]),
            ResultShape::Documents,
            true,
        ),
    )
    .await
    .unwrap()
    .unwrap_err();
    match err {
        DriverError::IndeterminateWrite { cause, .. } => assert!(cause.is_timeout()),
        other => panic!("unexpected {other:?}"),
    }
}
