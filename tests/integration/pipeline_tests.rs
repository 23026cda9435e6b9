//! Full pipeline runs against in-memory channel adapters, covering the
//! intercept-mode scenarios the core's own unit tests don't already cover
//! (passthrough round-trip and notification handling live in
//! `mitm-core`'s `pipeline.rs` tests instead).

use std::time::Duration;

use mitm_core::{Action, Mode, Transport};
use serde_json::json;

use crate::common::{build_pipeline, setup_test_logging};

#[tokio::test]
async fn s3_modify_rewrites_the_forwarded_envelope() {
    setup_test_logging();
    let harness = build_pipeline(Mode::Intercept);
    let run = tokio::spawn({
        let pipeline = harness.pipeline.clone();
        let client = harness.client.clone();
        let server = harness.server.clone();
        async move { pipeline.run(client, server, Transport::Stdio).await }
    });

    harness
        .client_in
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "rm"}}))
        .await
        .unwrap();

    // Poll until the message is held; the forward loop races the test task.
    let held = loop {
        let held = harness.intercept.held().await;
        if let Some(h) = held.into_iter().next() {
            break h;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    let original_proxy_id = held.message.proxy_id;
    held.release(Action::Modify(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "ls"}})))
        .await
        .unwrap();

    let forwarded = harness.server_out.recv().await.unwrap();
    assert_eq!(forwarded["params"]["name"], "ls");

    drop(harness.client_in);
    drop(harness.server_in);
    let _ = run.await;

    let captured = harness.session.by_id(original_proxy_id).await.unwrap();
    assert!(captured.modified);
    assert_eq!(captured.original_raw.unwrap()["params"]["name"], "rm");
    assert_eq!(captured.raw["params"]["name"], "ls");
}

#[tokio::test]
async fn s4_drop_never_reaches_the_peer() {
    setup_test_logging();
    let harness = build_pipeline(Mode::Intercept);
    let run = tokio::spawn({
        let pipeline = harness.pipeline.clone();
        let client = harness.client.clone();
        let server = harness.server.clone();
        async move { pipeline.run(client, server, Transport::Stdio).await }
    });

    harness
        .client_in
        .send(json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}))
        .await
        .unwrap();

    let held = loop {
        let held = harness.intercept.held().await;
        if let Some(h) = held.into_iter().next() {
            break h;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    let proxy_id = held.message.proxy_id;
    held.release(Action::Drop).await.unwrap();

    // Give the forward loop a moment to act on the release, then confirm
    // nothing ever lands on the server side.
    let nothing = tokio::time::timeout(Duration::from_millis(50), harness.server_out.recv()).await;
    assert!(nothing.is_err(), "dropped message should never reach the server");

    drop(harness.client_in);
    drop(harness.server_in);
    let _ = run.await;

    let captured = harness.session.by_id(proxy_id).await.unwrap();
    assert!(!captured.modified);
}

#[tokio::test]
async fn s5_switching_to_passthrough_releases_every_held_message_in_order() {
    setup_test_logging();
    let harness = build_pipeline(Mode::Intercept);
    let run = tokio::spawn({
        let pipeline = harness.pipeline.clone();
        let client = harness.client.clone();
        let server = harness.server.clone();
        async move { pipeline.run(client, server, Transport::Stdio).await }
    });

    harness.client_in.send(json!({"jsonrpc": "2.0", "id": 1, "method": "a"})).await.unwrap();
    harness.client_in.send(json!({"jsonrpc": "2.0", "id": 2, "method": "b"})).await.unwrap();

    loop {
        if harness.intercept.held().await.len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    harness.intercept.set_mode(Mode::Passthrough).await;

    let first = harness.server_out.recv().await.unwrap();
    let second = harness.server_out.recv().await.unwrap();
    assert_eq!(first["method"], "a");
    assert_eq!(second["method"], "b");
    assert!(harness.intercept.held().await.is_empty());

    drop(harness.client_in);
    drop(harness.server_in);
    let _ = run.await;
}
