use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The decoded JSON-RPC envelope a transport adapter moves. The core never
/// interprets its contents beyond the classification in [`crate::correlation`].
pub type Envelope = Value;

/// Which side of the proxy a message was read from / is being written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// The direction a correlated response to a request in `self` must arrive on.
    pub fn opposite(self) -> Direction {
        match self {
            Direction::ClientToServer => Direction::ServerToClient,
            Direction::ServerToClient => Direction::ClientToServer,
        }
    }
}

/// The wire transport a message was carried over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Stdio,
    Sse,
    StreamableHttp,
}

/// A JSON-RPC id, either a string or an integer. Both must round-trip through
/// the persisted session format unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

/// Immutable envelope wrapper the pipeline hands to the session store, the
/// intercept engine, and the observer.
///
/// Every field is fixed at construction time except `correlated_id`, which
/// the opposite forward loop may set exactly once when a matching response
/// arrives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyMessage {
    pub proxy_id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub transport: Transport,
    pub raw: Envelope,
    pub jsonrpc_id: Option<JsonRpcId>,
    pub method: Option<String>,
    pub correlated_id: Option<Uuid>,
    pub modified: bool,
    pub original_raw: Option<Envelope>,
}

impl ProxyMessage {
    /// Construct a fresh envelope at read time. `correlated_id` starts
    /// unset; `modified`/`original_raw` reflect no edit yet.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sequence: u64,
        direction: Direction,
        transport: Transport,
        raw: Envelope,
        jsonrpc_id: Option<JsonRpcId>,
        method: Option<String>,
    ) -> Self {
        Self {
            proxy_id: Uuid::new_v4(),
            sequence,
            timestamp: Utc::now(),
            direction,
            transport,
            raw,
            jsonrpc_id,
            method,
            correlated_id: None,
            modified: false,
            original_raw: None,
        }
    }
}
