//! Server-sent-events transport: a client-facing HTTP+SSE server that
//! accepts POSTed JSON-RPC requests and streams responses back, and a
//! server-facing HTTP+SSE client that does the mirror image against an
//! upstream MCP server.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use mitm_core::{Envelope, ProxyError, Result, TransportAdapter};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

/// Client-facing SSE server: browsers/CLI clients POST JSON-RPC requests to
/// `/messages` and subscribe to `/events` for responses and notifications.
pub struct SseServerAdapter {
    inbox_rx: mpsc::Receiver<Envelope>,
    outbox_tx: broadcast::Sender<Envelope>,
    server_task: JoinHandle<()>,
}

#[derive(Clone)]
struct ServerState {
    inbox_tx: mpsc::Sender<Envelope>,
    outbox_tx: broadcast::Sender<Envelope>,
}

impl SseServerAdapter {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let (inbox_tx, inbox_rx) = mpsc::channel(64);
        let (outbox_tx, _) = broadcast::channel(256);

        let state = ServerState {
            inbox_tx,
            outbox_tx: outbox_tx.clone(),
        };

        let app = Router::new()
            .route("/messages", post(receive_message))
            .route("/events", get(stream_events))
            .layer(CorsLayer::permissive())
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| ProxyError::Transport(format!("bind {addr} failed: {e}")))?;

        tracing::info!(%addr, "SSE server listening");
        let server_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "SSE server terminated");
            }
        });

        Ok(Self {
            inbox_rx,
            outbox_tx,
            server_task,
        })
    }
}

async fn receive_message(State(state): State<ServerState>, Json(envelope): Json<Envelope>) -> impl IntoResponse {
    if state.inbox_tx.send(envelope).await.is_err() {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    } else {
        axum::http::StatusCode::ACCEPTED
    }
}

async fn stream_events(
    State(state): State<ServerState>,
) -> Sse<impl futures::Stream<Item = std::result::Result<Event, std::convert::Infallible>>> {
    let rx = state.outbox_tx.subscribe();
    let stream = tokio_stream::wrappers::BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(envelope) => Some(Ok(Event::default().json_data(envelope).unwrap_or_else(|_| Event::default()))),
            Err(_) => None,
        }
    });
    Sse::new(stream)
}

// --- adapter trait impls below depend only on axum/tokio/mitm-core types ---

#[async_trait]
impl TransportAdapter for SseServerAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        self.inbox_rx
            .recv()
            .await
            .ok_or_else(|| ProxyError::Transport("SSE client channel closed".to_string()))
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        if self.server_task.is_finished() {
            return Err(ProxyError::Transport("SSE server task has exited".to_string()));
        }
        // No subscribers yet is not a failure — the SSE client may not
        // have connected to /events yet.
        let _ = self.outbox_tx.send(envelope);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.server_task.abort();
        Ok(())
    }
}

/// Server-facing SSE client: connects to an upstream MCP server's `/events`
/// stream and POSTs requests to its `/messages` endpoint.
pub struct SseClientAdapter {
    http: reqwest::Client,
    base_url: url::Url,
    events_rx: mpsc::Receiver<Result<Envelope>>,
    reader_task: JoinHandle<()>,
}

impl SseClientAdapter {
    pub async fn connect(base_url: url::Url) -> Result<Self> {
        let http = reqwest::Client::new();
        let events_url = base_url
            .join("events")
            .map_err(|e| ProxyError::Transport(format!("invalid upstream url: {e}")))?;

        let response = http
            .get(events_url)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("connect to upstream SSE failed: {e}")))?;

        let (tx, rx) = mpsc::channel(64);
        let mut stream = response.bytes_stream().eventsource();
        let reader_task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let sent = match event {
                    Ok(ev) => match serde_json::from_str::<Envelope>(&ev.data) {
                        Ok(envelope) => tx.send(Ok(envelope)).await,
                        Err(e) => {
                            tx.send(Err(ProxyError::Decode(format!("bad SSE payload: {e}")))).await
                        }
                    },
                    Err(e) => tx.send(Err(ProxyError::Transport(format!("SSE stream error: {e}")))).await,
                };
                if sent.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            http,
            base_url,
            events_rx: rx,
            reader_task,
        })
    }
}

#[async_trait]
impl TransportAdapter for SseClientAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        self.events_rx
            .recv()
            .await
            .ok_or_else(|| ProxyError::Transport("upstream SSE stream closed".to_string()))?
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        let messages_url = self
            .base_url
            .join("messages")
            .map_err(|e| ProxyError::Transport(format!("invalid upstream url: {e}")))?;
        self.http
            .post(messages_url)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| ProxyError::Transport(format!("POST to upstream failed: {e}")))?
            .error_for_status()
            .map_err(|e| ProxyError::Transport(format!("upstream rejected request: {e}")))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.reader_task.abort();
        Ok(())
    }
}
