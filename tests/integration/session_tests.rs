//! Session capture exercised end-to-end through a running pipeline, as
//! opposed to `mitm-core`'s own unit tests which construct `ProxyMessage`s
//! by hand.

use mitm_core::{Mode, SessionStore, Transport};
use serde_json::json;

use crate::common::{build_pipeline, setup_test_logging};

#[tokio::test]
async fn captured_session_survives_a_save_and_load_round_trip() {
    setup_test_logging();
    let harness = build_pipeline(Mode::Passthrough);
    let run = tokio::spawn({
        let pipeline = harness.pipeline.clone();
        let client = harness.client.clone();
        let server = harness.server.clone();
        async move { pipeline.run(client, server, Transport::Stdio).await }
    });

    harness
        .client_in
        .send(json!({"jsonrpc": "2.0", "id": 7, "method": "resources/list"}))
        .await
        .unwrap();
    let forwarded = harness.server_out.recv().await.unwrap();
    assert_eq!(forwarded["id"], 7);

    harness
        .server_in
        .send(json!({"jsonrpc": "2.0", "id": 7, "result": {"resources": []}}))
        .await
        .unwrap();
    harness.client_out.recv().await.unwrap();

    drop(harness.client_in);
    drop(harness.server_in);
    let _ = run.await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    harness.session.save(&path).await.unwrap();

    let reloaded = SessionStore::load(&path).await.unwrap();
    let before = harness.session.messages().await;
    let after = reloaded.messages().await;

    assert_eq!(before.len(), 2);
    assert_eq!(after.len(), 2);
    assert_eq!(after[1].correlated_id, Some(after[0].proxy_id));
    assert_eq!(after[0].raw["method"], "resources/list");
    assert_eq!(after[1].raw["result"]["resources"], json!([]));
}
