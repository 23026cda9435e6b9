//! Concrete transport adapters implementing `mitm_core::TransportAdapter`:
//! subprocess/host stdio, server-sent events, and streamable HTTP. These
//! are external collaborators from the core's point of view — the pipeline
//! only ever sees the `read`/`write`/`close` contract.

pub mod sse;
pub mod stdio;
pub mod streamable_http;

pub use sse::{SseClientAdapter, SseServerAdapter};
pub use stdio::{HostStdioAdapter, ProcessAdapter};
pub use streamable_http::{StreamableHttpClientAdapter, StreamableHttpServerAdapter};
