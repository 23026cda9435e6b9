//! Interception engine for a JSON-RPC 2.0 / MCP man-in-the-middle proxy.
//!
//! This crate is the core described in the project's design document: the
//! correlation helpers, the session store, the intercept engine, the
//! bidirectional pipeline, and the replay engine. It does not know how to
//! speak to a subprocess or an HTTP server — those adapters live in
//! `mitm-transport` — and it never interprets method semantics.

pub mod correlation;
pub mod error;
pub mod intercept;
pub mod message;
pub mod pipeline;
pub mod replay;
pub mod session;

pub use error::{ProxyError, Result};
pub use intercept::{Action, HeldMessage, InterceptEngine, Mode};
pub use message::{Direction, Envelope, JsonRpcId, ProxyMessage, Transport};
pub use pipeline::{ChannelAdapter, CorrelationMap, NullObserver, Observer, Pipeline, SharedAdapter, TransportAdapter};
pub use replay::ReplayEngine;
pub use session::SessionStore;
