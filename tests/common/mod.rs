//! Shared fixtures for the integration suite.

use std::sync::Arc;

use mitm_core::{ChannelAdapter, CorrelationMap, Envelope, InterceptEngine, Mode, NullObserver, Observer, Pipeline, SessionStore, SharedAdapter, Transport};
use tokio::sync::{mpsc, Mutex};

/// Initialise a test-scoped tracing subscriber. Safe to call from every test;
/// only the first call in a process installs the global subscriber.
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt().with_env_filter("debug").with_test_writer().try_init();
}

/// One half of an in-memory channel pair: the adapter the pipeline owns, and
/// the sender/receiver handles a test uses to play a peer.
pub struct ChannelHarness {
    pub adapter: ChannelAdapter,
    pub send_in: mpsc::Sender<Envelope>,
    pub recv_out: mpsc::Receiver<Envelope>,
}

pub fn channel_harness() -> ChannelHarness {
    let (in_tx, in_rx) = mpsc::channel(16);
    let (out_tx, out_rx) = mpsc::channel(16);
    ChannelHarness {
        adapter: ChannelAdapter {
            inbox: in_rx,
            outbox: out_tx,
        },
        send_in: in_tx,
        recv_out: out_rx,
    }
}

/// A pipeline wired to two `ChannelAdapter`s, plus the handles needed to play
/// both peers and inspect the resulting session.
pub struct PipelineHarness {
    pub pipeline: Arc<Pipeline>,
    pub intercept: Arc<InterceptEngine>,
    pub session: Arc<SessionStore>,
    pub client: SharedAdapter,
    pub server: SharedAdapter,
    pub client_in: mpsc::Sender<Envelope>,
    pub client_out: mpsc::Receiver<Envelope>,
    pub server_in: mpsc::Sender<Envelope>,
    pub server_out: mpsc::Receiver<Envelope>,
}

pub fn build_pipeline(mode: Mode) -> PipelineHarness {
    let session = Arc::new(SessionStore::new(Transport::Stdio, Some("mock".into()), None));
    let intercept = Arc::new(InterceptEngine::new(mode));
    let correlation = Arc::new(CorrelationMap::new());
    let observer: Arc<dyn Observer> = Arc::new(NullObserver);
    let pipeline = Arc::new(Pipeline::new(session.clone(), intercept.clone(), correlation, observer));

    let client_harness = channel_harness();
    let server_harness = channel_harness();

    PipelineHarness {
        pipeline,
        intercept,
        session,
        client: Arc::new(Mutex::new(client_harness.adapter)),
        server: Arc::new(Mutex::new(server_harness.adapter)),
        client_in: client_harness.send_in,
        client_out: client_harness.recv_out,
        server_in: server_harness.send_in,
        server_out: server_harness.recv_out,
    }
}
