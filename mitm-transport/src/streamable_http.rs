//! Streamable HTTP transport (MCP spec 2025-03-26): a single endpoint that
//! accepts a JSON-RPC request and returns the corresponding response
//! synchronously. Each inbound POST is held open behind a oneshot channel
//! keyed by the request's jsonrpc id until the opposite forward loop
//! writes back the paired response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use mitm_core::{correlation, Envelope, JsonRpcId, ProxyError, Result, TransportAdapter};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

/// How long an inbound HTTP POST waits for its paired response before
/// returning 504. The pipeline's own replay deadline is a separate,
/// operator-controlled concern; this is just the HTTP client's patience.
const RESPONSE_WAIT: Duration = Duration::from_secs(30);

type PendingMap = Arc<Mutex<HashMap<JsonRpcId, oneshot::Sender<Envelope>>>>;

/// Client-facing streamable-HTTP server: one POST per JSON-RPC request,
/// held open until the server-facing loop writes back the paired response.
pub struct StreamableHttpServerAdapter {
    inbox_rx: mpsc::Receiver<Envelope>,
    pending: PendingMap,
    server_task: JoinHandle<()>,
}

#[derive(Clone)]
struct ServerState {
    inbox_tx: mpsc::Sender<Envelope>,
    pending: PendingMap,
}

impl StreamableHttpServerAdapter {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let state = ServerState {
            inbox_tx,
            pending: pending.clone(),
        };

        let app = Router::new()
            .route("/mcp", post(handle_post))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Transport(format!("bind {addr} failed: {e}")))?;

        tracing::info!(%addr, "streamable-HTTP server listening");
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "streamable-HTTP server terminated");
            }
        });

        Ok(Self {
            inbox_rx,
            pending,
            server_task,
        })
    }
}

async fn handle_post(State(state): State<ServerState>, Json(envelope): Json<Envelope>) -> impl IntoResponse {
    let id = correlation::extract_id(&envelope);

    let Some(id) = id else {
        // Notification: fire-and-forget, per the streamable-HTTP spec.
        return match state.inbox_tx.send(envelope).await {
            Ok(_) => StatusCode::ACCEPTED.into_response(),
            Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        };
    };

    let (tx, rx) = oneshot::channel();
    state.pending.lock().await.insert(id.clone(), tx);

    if state.inbox_tx.send(envelope).await.is_err() {
        state.pending.lock().await.remove(&id);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    match tokio::time::timeout(RESPONSE_WAIT, rx).await {
        Ok(Ok(response)) => Json(response).into_response(),
        Ok(Err(_)) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Err(_) => {
            state.pending.lock().await.remove(&id);
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
    }
}

#[async_trait]
impl TransportAdapter for StreamableHttpServerAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        self.inbox_rx
            .recv()
            .await
            .ok_or_else(|| ProxyError::Transport("streamable-HTTP client channel closed".to_string()))
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        match correlation::extract_id(&envelope) {
            Some(id) => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(envelope);
                } else {
                    tracing::warn!(?id, "streamable-HTTP: no pending request waiting for this response");
                }
                Ok(())
            }
            None => {
                // A server-initiated notification has nowhere to go without
                // an open GET stream; the streamable-HTTP spec makes that
                // stream optional and this adapter does not implement it.
                tracing::warn!("streamable-HTTP: dropping server-initiated notification, no push channel");
                Ok(())
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.server_task.abort();
        Ok(())
    }
}

/// Server-facing streamable-HTTP client: POSTs each outgoing message and
/// feeds the synchronous response into an internal queue the opposite
/// forward loop reads from.
pub struct StreamableHttpClientAdapter {
    http: reqwest::Client,
    url: url::Url,
    responses_tx: mpsc::Sender<Envelope>,
    responses_rx: mpsc::Receiver<Envelope>,
}

impl StreamableHttpClientAdapter {
    pub fn new(url: url::Url) -> Self {
        let (responses_tx, responses_rx) = mpsc::channel(64);
        Self {
            http: reqwest::Client::new(),
            url,
            responses_tx,
            responses_rx,
        }
    }
}

#[async_trait]
impl TransportAdapter for StreamableHttpClientAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        self.responses_rx
            .recv()
            .await
            .ok_or_else(|| ProxyError::Transport("upstream response channel closed".to_string()))
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        let is_notification = correlation::extract_id(&envelope).is_none();

        let response = self
            .http
            .post(self.url.clone())
            .json(&envelope)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("POST to upstream failed: {e}")))?;

        if is_notification || response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let response = response
            .error_for_status()
            .map_err(|e| ProxyError::Transport(format!("upstream rejected request: {e}")))?;

        let body: Envelope = response
            .json()
            .await
            .map_err(|e| ProxyError::Decode(format!("bad upstream response body: {e}")))?;

        self.responses_tx
            .send(body)
            .await
            .map_err(|_| ProxyError::Transport("upstream response channel closed".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
