use crate::{config, doc, find, insert, open_driver};
use docdb_driver::document;
use docdb_driver::error::ValidationError;
use docdb_driver::frame::{Payload, ResultShape};
use docdb_driver::operation::{Namespace, Operation};
use docdb_driver::pool::Role;
use docdb_driver::DriverError;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::mock_server::{acknowledge, Action, MockServer};

/// Replies to every query with the selector it was sent.
async fn echo_server() -> MockServer {
    MockServer::start(|frame| match &frame.operation {
        Operation::Query { selector, .. } => Action::Reply(vec![selector.clone()]),
        _ => acknowledge(frame),
    })
    .await
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_requests_are_never_sent() {
    let server = MockServer::acknowledging().await;
    let driver = open_driver(config(&server)).await;

    let cases: Vec<(Operation, ValidationError)> = vec![
        (find("te$t", json!({})), ValidationError::ContainsDollar),
        (find(".test", json!({})), ValidationError::BoundaryDot),
        (find("test.", json!({})), ValidationError::BoundaryDot),
        (find("test..t", json!({})), ValidationError::EmptyName),
        (find("", json!({})), ValidationError::EmptyName),
        (
            insert("test_invalid_key_names", vec![json!({"$hello": "world"})]),
            ValidationError::KeyStartsWithDollar("$hello".to_owned()),
        ),
        (
            insert("test_invalid_key_names", vec![json!({"hello": {".hello": "world"}})]),
            ValidationError::KeyContainsDot(".hello".to_owned()),
        ),
    ];
    for (operation, expected) in cases {
        match driver.submit(operation, ResultShape::Documents, true).await {
            Err(DriverError::Validation(err)) => assert_eq!(err, expected),
            other => panic!("expected {expected:?} got {other:?}"),
        }
    }

    // a valid request on the same connection shows the invalid ones never went out
    driver
        .submit(
            insert("test_valid", vec![json!({"he$llo": "world"})]),
            ResultShape::Documents,
            true,
        )
        .await
        .unwrap();
    assert_eq!(server.received().len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn update_modifiers_are_admitted() {
    let server = MockServer::acknowledging().await;
    let driver = open_driver(config(&server)).await;

    let update = |update: Value| Operation::Update {
        namespace: Namespace::new("integration_tests", "test_modifiers"),
        selector: doc(json!({"$or": [{"a": 1}, {"a": 2}]})),
        update: doc(update),
        upsert: true,
        multi: false,
    };
    assert!(driver
        .submit(update(json!({"$set": {"i": 2}})), ResultShape::Documents, true)
        .await
        .is_ok());
    assert!(driver
        .submit(update(json!({"$inc": {"count": 1}, "$set": {"seen": true}})), ResultShape::Documents, true)
        .await
        .is_ok());
    assert!(matches!(
        driver
            .submit(update(json!({"$set": {"$inner": 1}})), ResultShape::Documents, true)
            .await,
        Err(DriverError::Validation(ValidationError::KeyStartsWithDollar(_)))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn query_results() {
    let server = echo_server().await;
    let driver = open_driver(config(&server)).await;

    let payload = driver
        .submit(find("test_find", json!({"a": 1})), ResultShape::Documents, false)
        .await
        .unwrap()
        .into_payload()
        .unwrap();
    assert_eq!(payload, Payload::Documents(vec![doc(json!({"a": 1}))]));

    let raw = driver
        .submit(find("test_find", json!({"a": 2})), ResultShape::Raw, false)
        .await
        .unwrap()
        .into_payload()
        .unwrap();
    assert_eq!(
        raw,
        Payload::Raw(document::encode_documents(&[doc(json!({"a": 2}))]))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_command() {
    let server = MockServer::start(|frame| match &frame.operation {
        Operation::Command { command, .. } if command.contains_key("drop") => {
            Action::document(json!({"ok": 0, "errmsg": "ns not found"}))
        }
        _ => acknowledge(frame),
    })
    .await;
    let driver = open_driver(config(&server)).await;

    let drop_collection = Operation::Command {
        database: "integration_tests".to_owned(),
        command: doc(json!({"drop": "does_not_exist"})),
    };
    let err = driver
        .submit(drop_collection, ResultShape::Documents, false)
        .await
        .unwrap_err();
    assert!(matches!(&err, DriverError::CommandFailed { message } if message == "ns not found"));
    assert!(!err.is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_requests_get_their_own_replies() {
    let server = echo_server().await;
    let mut config = config(&server);
    config.pool_size = 3;
    let driver = Arc::new(open_driver(config).await);
    assert_eq!(driver.pool().healthy_count(), 3);

    let mut tasks = vec![];
    for i in 0..100 {
        let driver = driver.clone();
        tasks.push(tokio::spawn(async move {
            let payload = driver
                .submit(find("test_concurrent", json!({"i": i})), ResultShape::Documents, false)
                .await
                .unwrap()
                .into_payload()
                .unwrap();
            (i, payload)
        }));
    }
    for task in tasks {
        let (i, payload) = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload.first_document(), Some(&doc(json!({"i": i}))));
    }

    assert!(driver.store().is_empty());
    let mut ids: Vec<_> = server.received().iter().map(|frame| frame.request_id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 100);
}

#[tokio::test(flavor = "multi_thread")]
async fn reads_use_reader_connections() {
    let server = echo_server().await;
    let mut config = config(&server);
    config.pool_size = 2;
    config.reader_pool_size = 1;
    let driver = open_driver(config).await;

    let writer = driver.pool().checkout_writer().await.unwrap();
    driver.pool().mark_unhealthy(writer.id(), "test");

    // reads still work while the only writer is down
    assert!(driver
        .submit(find("test_readers", json!({})), ResultShape::Documents, false)
        .await
        .is_ok());
    assert!(matches!(
        driver
            .submit(insert("test_readers", vec![json!({"a": 1})]), ResultShape::Documents, true)
            .await,
        Err(DriverError::NoHealthyConnection { role: Role::Writer })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn strict_mode_is_exposed() {
    let server = MockServer::acknowledging().await;
    let mut config = config(&server);
    config.strict_mode = true;
    let driver = open_driver(config).await;
    assert!(driver.strict_mode());
    assert_eq!(
        DriverError::CollectionDoesNotExist {
            name: "does-not-exist".to_owned()
        }
        .to_string(),
        "Collection does-not-exist does not exist. Currently in strict mode."
    );
}
