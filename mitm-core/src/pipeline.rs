//! Two concurrent forward loops plus the shared sequence counter and
//! correlation map. Each loop reads, processes, and writes in turn; an
//! error on either side broadcasts a shutdown signal so its sibling
//! unwinds instead of blocking forever on its own read.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;

use crate::correlation::{self, Kind};
use crate::error::{ProxyError, Result};
use crate::intercept::{validate_action, Action, HeldMessage, InterceptEngine, Mode};
use crate::message::{Direction, Envelope, JsonRpcId, ProxyMessage, Transport};
use crate::session::SessionStore;

/// The contract a concrete transport (stdio, SSE, streamable HTTP) must
/// satisfy. Both the client-facing and server-facing side implement the
/// same trait; the pipeline does not care which concrete transport is on
/// either end.
#[async_trait]
pub trait TransportAdapter: Send {
    /// Return the next decoded envelope. Fails on disconnect or an
    /// unrecoverable decode error — the pipeline never sees raw bytes.
    async fn read(&mut self) -> Result<Envelope>;

    /// Send an envelope. Fails on disconnect.
    async fn write(&mut self, envelope: Envelope) -> Result<()>;

    /// Idempotent release of underlying resources.
    async fn close(&mut self) -> Result<()>;
}

/// A shared handle to a transport adapter. Both forward loops touch the
/// same adapter object — one reads it, the other writes it — so it is
/// shared behind a mutex rather than split, matching the single
/// `read`/`write`/`close` contract in the external interface.
pub type SharedAdapter = Arc<Mutex<dyn TransportAdapter>>;

/// Announces pipeline events to whatever is watching (a UI, a logger).
/// Invoked synchronously from the forward loop; an error is caught, logged,
/// and swallowed rather than allowed to terminate the pipeline.
pub trait Observer: Send + Sync {
    fn on_received(&self, _msg: &ProxyMessage) -> Result<()> {
        Ok(())
    }
    fn on_held(&self, _held: &HeldMessage) -> Result<()> {
        Ok(())
    }
    fn on_forwarded(&self, _msg: &ProxyMessage) -> Result<()> {
        Ok(())
    }
}

/// An observer that does nothing, for headless/library use.
pub struct NullObserver;
impl Observer for NullObserver {}

/// Request/response correlation shared by both forward loops and the
/// replay engine. The second write for a colliding jsonrpc id silently
/// overwrites the first — the protocol forbids the collision and the proxy
/// must not invent a repair (see DESIGN.md's Open Question resolution).
#[derive(Default)]
pub struct CorrelationMap {
    inner: Mutex<HashMap<JsonRpcId, Uuid>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request (or a replay's synthetic stand-in) under
    /// its jsonrpc id.
    pub async fn register(&self, id: JsonRpcId, proxy_id: Uuid) {
        self.inner.lock().await.insert(id, proxy_id);
    }

    /// Pop the entry for `id`, if any matching request is outstanding.
    pub async fn resolve(&self, id: &JsonRpcId) -> Option<Uuid> {
        self.inner.lock().await.remove(id)
    }

    /// True if `id` is not currently in use — used by the replay engine to
    /// pick a fresh substitute id.
    pub async fn is_free(&self, id: &JsonRpcId) -> bool {
        !self.inner.lock().await.contains_key(id)
    }
}

/// How many completed messages the replay engine's event subscription may
/// lag behind before older ones are dropped from its view. Generous enough
/// that a replay waiting on a single correlated id never misses it under
/// normal load.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The bidirectional message pipeline.
pub struct Pipeline {
    session: Arc<SessionStore>,
    intercept: Arc<InterceptEngine>,
    correlation: Arc<CorrelationMap>,
    sequence: Arc<AtomicU64>,
    observer: Arc<dyn Observer>,
    events: broadcast::Sender<ProxyMessage>,
}

impl Pipeline {
    pub fn new(
        session: Arc<SessionStore>,
        intercept: Arc<InterceptEngine>,
        correlation: Arc<CorrelationMap>,
        observer: Arc<dyn Observer>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session,
            intercept,
            correlation,
            sequence: Arc::new(AtomicU64::new(0)),
            observer,
            events,
        }
    }

    /// Shared correlation map, exposed so a replay engine running alongside
    /// this pipeline can register and resolve against the same state.
    pub fn correlation_map(&self) -> Arc<CorrelationMap> {
        self.correlation.clone()
    }

    /// Shared session store, exposed so a replay engine can append its own
    /// synthetic entries into the same capture.
    pub fn session_store(&self) -> Arc<SessionStore> {
        self.session.clone()
    }

    /// The next value of the shared sequence counter, for a replay engine's
    /// synthetic entries to stay in the same monotonic series as the two
    /// forward loops.
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribe to every message as it finishes the capture+correlate step,
    /// regardless of direction. The replay engine uses this to notice when
    /// its synthetic request's response arrives.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyMessage> {
        self.events.subscribe()
    }

    /// Run both forward loops to completion. Returns once both have
    /// terminated — one loop failing cancels its sibling, releases every
    /// outstanding held message as forward, and closes both adapters.
    pub async fn run(
        self: Arc<Self>,
        client: SharedAdapter,
        server: SharedAdapter,
        transport: Transport,
    ) -> Result<()> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let c2s = {
            let pipeline = self.clone();
            let shutdown_tx = shutdown_tx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let (read_side, write_side) = (client.clone(), server.clone());
            tokio::spawn(async move {
                pipeline
                    .forward_loop(read_side, write_side, Direction::ClientToServer, transport, shutdown_tx, shutdown_rx)
                    .await
            })
        };

        let s2c = {
            let pipeline = self.clone();
            let shutdown_tx = shutdown_tx.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            let (read_side, write_side) = (server.clone(), client.clone());
            tokio::spawn(async move {
                pipeline
                    .forward_loop(read_side, write_side, Direction::ServerToClient, transport, shutdown_tx, shutdown_rx)
                    .await
            })
        };

        let (r1, r2) = tokio::join!(c2s, s2c);

        // Unblock any straggling held message before closing adapters.
        self.intercept.set_mode(Mode::Passthrough).await;
        self.session.mark_ended().await;

        let _ = client.lock().await.close().await;
        let _ = server.lock().await.close().await;

        let r1 = r1.map_err(|e| ProxyError::Transport(format!("forward loop panicked: {e}")))?;
        let r2 = r2.map_err(|e| ProxyError::Transport(format!("forward loop panicked: {e}")))?;
        r1.and(r2)
    }

    async fn forward_loop(
        self: Arc<Self>,
        read_side: SharedAdapter,
        write_side: SharedAdapter,
        direction: Direction,
        transport: Transport,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            let read_fut = {
                let read_side = read_side.clone();
                async move { read_side.lock().await.read().await }
            };

            let raw = tokio::select! {
                _ = shutdown_rx.recv() => return Ok(()),
                result = read_fut => match result {
                    Ok(raw) => raw,
                    Err(e) => {
                        let _ = shutdown_tx.send(());
                        return Err(e);
                    }
                },
            };

            if let Err(e) = self
                .process_one(raw, &read_side, &write_side, direction, transport)
                .await
            {
                let _ = shutdown_tx.send(());
                return Err(e);
            }
        }
    }

    async fn process_one(
        &self,
        raw: Envelope,
        _read_side: &SharedAdapter,
        write_side: &SharedAdapter,
        direction: Direction,
        transport: Transport,
    ) -> Result<()> {
        // Wrap
        let kind = correlation::classify(&raw);
        let jsonrpc_id = correlation::extract_id(&raw);
        let method = correlation::extract_method(&raw);
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut msg = ProxyMessage::new(sequence, direction, transport, raw, jsonrpc_id.clone(), method);

        // Correlate
        match kind {
            Kind::Request => {
                if let Some(id) = jsonrpc_id {
                    self.correlation.register(id, msg.proxy_id).await;
                }
            }
            Kind::Response | Kind::Error => {
                if let Some(id) = jsonrpc_id {
                    if let Some(correlated) = self.correlation.resolve(&id).await {
                        msg.correlated_id = Some(correlated);
                    }
                }
            }
            Kind::Notification => {}
        }

        // Capture
        let proxy_id = msg.proxy_id;
        self.session.append(msg.clone()).await;
        let _ = self.events.send(msg.clone());

        // Announce received
        if let Err(e) = self.observer.on_received(&msg) {
            tracing::warn!(error = %e, "observer on_received failed");
        }

        // Intercept
        let mut outgoing = msg.raw.clone();
        let mut dropped = false;
        if self.intercept.should_hold().await {
            let (held, rx) = self.intercept.hold(msg.clone()).await;
            if let Err(e) = self.observer.on_held(&held) {
                tracing::warn!(error = %e, "observer on_held failed");
            }

            let action = rx.await.unwrap_or(Action::Forward);
            self.intercept.forget(proxy_id).await;

            if let Err(e) = validate_action(&action) {
                tracing::warn!(error = %e, "invalid release action, forwarding unchanged");
            } else {
                match action {
                    Action::Drop => dropped = true,
                    Action::Modify(replacement) => {
                        outgoing = replacement;
                        self.session
                            .mark_modified(proxy_id, msg.raw.clone(), outgoing.clone())
                            .await;
                        msg.original_raw = Some(msg.raw.clone());
                        msg.modified = true;
                        msg.raw = outgoing.clone();
                    }
                    Action::Forward => {}
                }
            }
        }

        if dropped {
            return Ok(());
        }

        // Write
        write_side
            .lock()
            .await
            .write(outgoing)
            .await
            .map_err(|e| ProxyError::Transport(format!("write failed: {e}")))?;

        // Announce forwarded
        if let Err(e) = self.observer.on_forwarded(&msg) {
            tracing::warn!(error = %e, "observer on_forwarded failed");
        }

        Ok(())
    }
}

/// In-memory adapter useful for tests and for a replay engine's synthetic
/// writes: pairs an mpsc-backed reader with a direct writer.
pub struct ChannelAdapter {
    pub inbox: tokio::sync::mpsc::Receiver<Envelope>,
    pub outbox: tokio::sync::mpsc::Sender<Envelope>,
}

#[async_trait]
impl TransportAdapter for ChannelAdapter {
    async fn read(&mut self) -> Result<Envelope> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| ProxyError::Transport("channel closed".to_string()))
    }

    async fn write(&mut self, envelope: Envelope) -> Result<()> {
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| ProxyError::Transport("channel closed".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.inbox.close();
        Ok(())
    }
}
