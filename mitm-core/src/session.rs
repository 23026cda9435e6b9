//! Append-only, ordered capture of every proxied message with a durable
//! JSON representation: session metadata alongside a nested payload object
//! per message.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::message::{ProxyMessage, Transport};

/// On-disk form of a single captured envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    proxy_id: Uuid,
    sequence: u64,
    timestamp: DateTime<Utc>,
    direction: crate::message::Direction,
    transport: Transport,
    jsonrpc_id: Option<crate::message::JsonRpcId>,
    method: Option<String>,
    correlated_id: Option<Uuid>,
    modified: bool,
    payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_payload: Option<Value>,
}

impl From<&ProxyMessage> for StoredMessage {
    fn from(m: &ProxyMessage) -> Self {
        Self {
            proxy_id: m.proxy_id,
            sequence: m.sequence,
            timestamp: m.timestamp,
            direction: m.direction,
            transport: m.transport,
            jsonrpc_id: m.jsonrpc_id.clone(),
            method: m.method.clone(),
            correlated_id: m.correlated_id,
            modified: m.modified,
            payload: m.raw.clone(),
            original_payload: m.original_raw.clone(),
        }
    }
}

impl TryFrom<StoredMessage> for ProxyMessage {
    type Error = ProxyError;

    fn try_from(s: StoredMessage) -> Result<Self> {
        if !s.payload.is_object() {
            return Err(ProxyError::CorruptSession(format!(
                "message {} has a non-object payload",
                s.proxy_id
            )));
        }
        Ok(ProxyMessage {
            proxy_id: s.proxy_id,
            sequence: s.sequence,
            timestamp: s.timestamp,
            direction: s.direction,
            transport: s.transport,
            raw: s.payload,
            jsonrpc_id: s.jsonrpc_id,
            method: s.method,
            correlated_id: s.correlated_id,
            modified: s.modified,
            original_raw: s.original_payload,
        })
    }
}

/// The full durable representation of one proxy run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionRecord {
    id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    transport: Transport,
    server_command: Option<String>,
    server_url: Option<String>,
    messages: Vec<StoredMessage>,
    #[serde(default)]
    metadata: serde_json::Map<String, Value>,
}

struct Inner {
    id: Uuid,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    transport: Transport,
    server_command: Option<String>,
    server_url: Option<String>,
    messages: Vec<ProxyMessage>,
    index: HashMap<Uuid, usize>,
    metadata: serde_json::Map<String, Value>,
}

/// The in-memory session store. Owns every captured [`ProxyMessage`] for the
/// lifetime of the proxy run; accessed only from pipeline tasks, so a
/// `tokio::sync::Mutex` is sufficient synchronisation.
pub struct SessionStore {
    inner: Mutex<Inner>,
}

impl SessionStore {
    /// Start a new, empty session for the given transport and either a
    /// server command (stdio) or a server URL (network transports).
    pub fn new(transport: Transport, server_command: Option<String>, server_url: Option<String>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                id: Uuid::new_v4(),
                started_at: Utc::now(),
                ended_at: None,
                transport,
                server_command,
                server_url,
                messages: Vec::new(),
                index: HashMap::new(),
                metadata: serde_json::Map::new(),
            }),
        }
    }

    /// Append a captured envelope. Appending with a previously used
    /// `proxy_id` is a programming error, not a user error, and panics —
    /// `ProxyMessage::new` always mints a fresh uuid so this should never
    /// happen in practice.
    pub async fn append(&self, msg: ProxyMessage) {
        let mut inner = self.inner.lock().await;
        let idx = inner.messages.len();
        if inner.index.insert(msg.proxy_id, idx).is_some() {
            panic!("session store: proxy_id {} appended twice", msg.proxy_id);
        }
        inner.messages.push(msg);
    }

    /// Mark an existing message as modified: record its pre-edit form as
    /// `original_raw` and replace `raw` with the envelope actually forwarded.
    /// `correlated_id` is always set on a message before it is captured (the
    /// pipeline correlates before it appends), so the store never needs to
    /// back-patch that field — only a later operator edit mutates an
    /// already-captured entry.
    pub async fn mark_modified(&self, proxy_id: Uuid, original_raw: Value, forwarded_raw: Value) {
        let mut inner = self.inner.lock().await;
        if let Some(&idx) = inner.index.get(&proxy_id) {
            let m = &mut inner.messages[idx];
            m.modified = true;
            m.original_raw = Some(original_raw);
            m.raw = forwarded_raw;
        }
    }

    /// A snapshot of the ordered message list. Mutating the returned `Vec`
    /// does not affect the store.
    pub async fn messages(&self) -> Vec<ProxyMessage> {
        self.inner.lock().await.messages.clone()
    }

    /// Look up a single captured message by its proxy id.
    pub async fn by_id(&self, proxy_id: Uuid) -> Option<ProxyMessage> {
        let inner = self.inner.lock().await;
        inner.index.get(&proxy_id).map(|&idx| inner.messages[idx].clone())
    }

    /// Record the session's end time. Idempotent.
    pub async fn mark_ended(&self) {
        let mut inner = self.inner.lock().await;
        if inner.ended_at.is_none() {
            inner.ended_at = Some(Utc::now());
        }
    }

    /// Set a free-form operator metadata key, overwriting any prior value.
    /// Persisted verbatim under the session record's `metadata` object.
    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.lock().await.metadata.insert(key.into(), value);
    }

    /// Snapshot of the session's operator metadata.
    pub async fn metadata(&self) -> serde_json::Map<String, Value> {
        self.inner.lock().await.metadata.clone()
    }

    /// Atomically write the session record to `path`. Parent directories are
    /// created as needed. Uses a write-then-rename so a crash mid-write
    /// never corrupts a previously saved session.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProxyError::Transport(format!("create session dir: {e}")))?;
            }
        }

        let record = {
            let inner = self.inner.lock().await;
            SessionRecord {
                id: inner.id,
                started_at: inner.started_at,
                ended_at: inner.ended_at,
                transport: inner.transport,
                server_command: inner.server_command.clone(),
                server_url: inner.server_url.clone(),
                messages: inner.messages.iter().map(StoredMessage::from).collect(),
                metadata: inner.metadata.clone(),
            }
        };

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| ProxyError::Transport(format!("encode session: {e}")))?;

        let tmp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| ProxyError::Transport(format!("create temp session file: {e}")))?;
        file.write_all(&json)
            .await
            .map_err(|e| ProxyError::Transport(format!("write session: {e}")))?;
        file.sync_all()
            .await
            .map_err(|e| ProxyError::Transport(format!("sync session: {e}")))?;
        drop(file);

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ProxyError::Transport(format!("rename session file: {e}")))?;

        Ok(())
    }

    /// Load a session store from its durable representation. Fails with
    /// [`ProxyError::CorruptSession`] if any entry fails validation; no
    /// partial store is ever returned.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = tokio::fs::read(path.as_ref())
            .await
            .map_err(|e| ProxyError::CorruptSession(format!("read session file: {e}")))?;
        let record: SessionRecord = serde_json::from_slice(&bytes)
            .map_err(|e| ProxyError::CorruptSession(format!("parse session file: {e}")))?;

        let mut messages = Vec::with_capacity(record.messages.len());
        let mut index = HashMap::with_capacity(record.messages.len());
        for stored in record.messages {
            let msg: ProxyMessage = stored.try_into()?;
            index.insert(msg.proxy_id, messages.len());
            messages.push(msg);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                id: record.id,
                started_at: record.started_at,
                ended_at: record.ended_at,
                transport: record.transport,
                server_command: record.server_command,
                server_url: record.server_url,
                messages,
                index,
                metadata: record.metadata,
            }),
        })
    }
}
