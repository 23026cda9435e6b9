//! Out-of-band injector that re-sends a captured request (optionally
//! edited) through the server-facing adapter and pairs the fresh response.
//!
//! Correlation works the same way a live request does: the fresh id is
//! registered in the shared correlation map before the write, so a very
//! fast response can never arrive uncorrelated. The wait itself is a
//! single bounded `tokio::time::timeout` rather than a retry loop.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use crate::correlation;
use crate::error::{ProxyError, Result};
use crate::message::{Direction, Envelope, JsonRpcId, ProxyMessage};
use crate::pipeline::{CorrelationMap, Pipeline, SharedAdapter};
use crate::session::SessionStore;

/// Replay ids start well above any id a well-behaved client is likely to
/// have issued, purely so captured sessions stay easy to read by eye. This
/// is a cosmetic choice, not a correctness requirement — the only rule the
/// engine enforces is that the id must be free in the correlation map.
const FIRST_REPLAY_ID: i64 = 1_000_000;

pub struct ReplayEngine {
    session: Arc<SessionStore>,
    correlation: Arc<CorrelationMap>,
    pipeline: Arc<Pipeline>,
    server: SharedAdapter,
    next_replay_id: AtomicI64,
}

impl ReplayEngine {
    pub fn new(pipeline: Arc<Pipeline>, server: SharedAdapter) -> Self {
        Self {
            session: pipeline.session_store(),
            correlation: pipeline.correlation_map(),
            pipeline,
            server,
            next_replay_id: AtomicI64::new(FIRST_REPLAY_ID),
        }
    }

    /// Re-issue `original`'s request, substituting `request_envelope` (the
    /// operator's possibly-edited copy) for the payload and a fresh jsonrpc
    /// id for correlation. Waits up to `deadline` for the paired response.
    ///
    /// On success, returns the response [`ProxyMessage`] that correlated
    /// against the replay; both it and the synthetic request remain in the
    /// session either way.
    pub async fn replay(
        &self,
        original: &ProxyMessage,
        request_envelope: Envelope,
        deadline: Duration,
    ) -> Result<ProxyMessage> {
        let modified = request_envelope != original.raw;
        let new_id = self.fresh_id().await;
        let mut envelope = request_envelope;
        Self::substitute_id(&mut envelope, &new_id);

        let sequence = self.pipeline.next_sequence();
        let mut synthetic = ProxyMessage::new(
            sequence,
            Direction::ClientToServer,
            original.transport,
            envelope.clone(),
            Some(new_id.clone()),
            correlation::extract_method(&envelope),
        );
        if modified {
            synthetic.modified = true;
            synthetic.original_raw = Some(original.raw.clone());
        }
        let replay_proxy_id = synthetic.proxy_id;

        // Register before writing so a very fast response can never arrive
        // uncorrelated.
        self.correlation.register(new_id, replay_proxy_id).await;
        self.session.append(synthetic).await;

        let mut events = self.pipeline.subscribe();

        self.server
            .lock()
            .await
            .write(envelope)
            .await
            .map_err(|e| ProxyError::Transport(format!("replay write failed: {e}")))?;

        let wait_for_response = async {
            loop {
                match events.recv().await {
                    Ok(msg) if msg.correlated_id == Some(replay_proxy_id) => return Some(msg),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        };

        match tokio::time::timeout(deadline, wait_for_response).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(ProxyError::Transport(
                "pipeline shut down while awaiting replay response".to_string(),
            )),
            Err(_) => Err(ProxyError::ReplayTimeout(deadline)),
        }
    }

    async fn fresh_id(&self) -> JsonRpcId {
        loop {
            let candidate = JsonRpcId::Number(self.next_replay_id.fetch_add(1, Ordering::SeqCst));
            if self.correlation.is_free(&candidate).await {
                return candidate;
            }
        }
    }

    fn substitute_id(envelope: &mut Envelope, id: &JsonRpcId) {
        if let Some(obj) = envelope.as_object_mut() {
            obj.insert(
                "id".to_string(),
                match id {
                    JsonRpcId::Number(n) => json!(n),
                    JsonRpcId::String(s) => json!(s),
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::InterceptEngine;
    use crate::message::Transport;
    use crate::pipeline::{ChannelAdapter, NullObserver, Observer, Pipeline};
    use serde_json::json;
    use tokio::sync::{mpsc, Mutex};

    fn make_original(method: &str, id: i64) -> ProxyMessage {
        ProxyMessage::new(
            0,
            Direction::ClientToServer,
            Transport::Stdio,
            json!({"jsonrpc": "2.0", "id": id, "method": method}),
            Some(JsonRpcId::Number(id)),
            Some(method.to_string()),
        )
    }

    #[tokio::test]
    async fn s6_replay_pairs_by_new_id() {
        let session = Arc::new(SessionStore::new(Transport::Stdio, Some("mock".into()), None));
        let intercept = Arc::new(InterceptEngine::default());
        let correlation = Arc::new(CorrelationMap::new());
        let observer: Arc<dyn Observer> = Arc::new(NullObserver);
        let pipeline = Arc::new(Pipeline::new(session.clone(), intercept, correlation, observer));

        // A full client/server adapter pair, with the pipeline's own forward
        // loops running, so the replayed response flows through the normal
        // server->client loop and gets correlated the ordinary way (spec
        // §4.5 step 4) rather than being inspected out of band.
        let (client_in_tx, client_in_rx) = mpsc::channel(8);
        let (client_out_tx, mut client_out_rx) = mpsc::channel(8);
        let client_adapter = ChannelAdapter {
            inbox: client_in_rx,
            outbox: client_out_tx,
        };
        let client: SharedAdapter = Arc::new(Mutex::new(client_adapter));

        let (server_in_tx, server_in_rx) = mpsc::channel(8);
        let (server_out_tx, mut server_out_rx) = mpsc::channel(8);
        let server_adapter = ChannelAdapter {
            inbox: server_in_rx,
            outbox: server_out_tx,
        };
        let server: SharedAdapter = Arc::new(Mutex::new(server_adapter));

        let run = tokio::spawn({
            let pipeline = pipeline.clone();
            let client = client.clone();
            let server = server.clone();
            async move { pipeline.run(client, server, Transport::Stdio).await }
        });

        let engine = ReplayEngine::new(pipeline.clone(), server.clone());
        let original = make_original("tools/call", 3);

        let replay_fut = tokio::spawn({
            let engine_envelope = original.raw.clone();
            let original = original.clone();
            async move { engine.replay(&original, engine_envelope, Duration::from_secs(1)).await }
        });

        // Observe the substituted envelope the replay wrote to the server side.
        let forwarded = server_out_rx.recv().await.unwrap();
        let new_id = forwarded["id"].as_i64().unwrap();
        assert_ne!(new_id, 3);

        // Feed the paired response in on the server->client loop's read
        // side so `process_one` actually correlates and broadcasts it.
        server_in_tx
            .send(json!({"jsonrpc": "2.0", "id": new_id, "result": {"ok": true}}))
            .await
            .unwrap();

        let response = replay_fut.await.unwrap().unwrap();
        assert_eq!(response.raw["result"]["ok"], true);

        // The forward loop also delivered it to the client side as usual.
        let delivered_to_client = client_out_rx.recv().await.unwrap();
        assert_eq!(delivered_to_client["id"], new_id);

        let messages = session.messages().await;
        let synthetic = messages
            .iter()
            .find(|m| m.jsonrpc_id == Some(JsonRpcId::Number(new_id)) && m.method.is_some())
            .unwrap();
        assert!(!synthetic.modified);
        assert_eq!(response.correlated_id, Some(synthetic.proxy_id));

        drop(client_in_tx);
        drop(server_in_tx);
        let _ = run.await;
    }

    #[tokio::test]
    async fn replay_times_out_without_response() {
        let session = Arc::new(SessionStore::new(Transport::Stdio, Some("mock".into()), None));
        let intercept = Arc::new(InterceptEngine::default());
        let correlation = Arc::new(CorrelationMap::new());
        let observer: Arc<dyn Observer> = Arc::new(NullObserver);
        let pipeline = Arc::new(Pipeline::new(session, intercept, correlation, observer));

        let (_server_in_tx, server_in_rx) = mpsc::channel(8);
        let (server_out_tx, _server_out_rx) = mpsc::channel(8);
        let server_adapter = ChannelAdapter {
            inbox: server_in_rx,
            outbox: server_out_tx,
        };
        let server: SharedAdapter = Arc::new(Mutex::new(server_adapter));

        let engine = ReplayEngine::new(pipeline, server);
        let original = make_original("tools/call", 3);

        let err = engine
            .replay(&original, original.raw.clone(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_matches::assert_matches!(err, ProxyError::ReplayTimeout(_));
    }
}
