//! Passthrough/Intercept mode register and held-message registry.
//!
//! Release is modeled as a single-shot completion channel carrying the
//! operator's action. Bundling the action into the channel payload, rather
//! than setting a field and firing a separate signal, rules out a release
//! racing ahead of its own action becoming visible.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::error::{ProxyError, Result};
use crate::message::ProxyMessage;

/// The proxy's current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Passthrough,
    Intercept,
}

/// What the operator decided to do with a held message.
#[derive(Debug, Clone)]
pub enum Action {
    Forward,
    Modify(Value),
    Drop,
}

/// A held message as seen by the operator: the captured envelope plus a
/// handle to resolve it.
pub struct HeldMessage {
    pub message: ProxyMessage,
    released: Arc<AtomicBool>,
    resolve: Mutex<Option<oneshot::Sender<Action>>>,
}

impl HeldMessage {
    /// Resolve this held message with the operator's action. A no-op if it
    /// has already been released.
    pub async fn release(&self, action: Action) -> Result<()> {
        if let Action::Modify(_) = &action {
            // validated further by the engine below; here we only guard
            // the already-released case.
        }
        let mut slot = self.resolve.lock().await;
        match slot.take() {
            Some(tx) => {
                self.released.store(true, Ordering::SeqCst);
                // The receiver may already be gone if the forward loop
                // terminated concurrently; that is not an operator error.
                let _ = tx.send(action);
                Ok(())
            }
            None => Err(ProxyError::InvalidAction(format!(
                "message {} already released",
                self.message.proxy_id
            ))),
        }
    }
}

struct PendingHold {
    held: Arc<HeldMessage>,
}

/// Mode register plus registry of currently held messages.
pub struct InterceptEngine {
    mode: Mutex<Mode>,
    held: Mutex<VecDeque<PendingHold>>,
}

impl Default for InterceptEngine {
    fn default() -> Self {
        Self::new(Mode::Passthrough)
    }
}

impl InterceptEngine {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode: Mutex::new(mode),
            held: Mutex::new(VecDeque::new()),
        }
    }

    /// True iff the current mode is Intercept.
    pub async fn should_hold(&self) -> bool {
        *self.mode.lock().await == Mode::Intercept
    }

    /// Switch modes. Switching to Passthrough releases every currently held
    /// message with `Action::Forward`, in insertion order.
    pub async fn set_mode(&self, mode: Mode) {
        *self.mode.lock().await = mode;
        if mode == Mode::Passthrough {
            self.release_all_as_forward().await;
        }
    }

    async fn release_all_as_forward(&self) {
        let mut held = self.held.lock().await;
        while let Some(pending) = held.pop_front() {
            // Ignore already-released races; releasing twice is a no-op.
            let _ = pending.held.release(Action::Forward).await;
        }
    }

    /// Construct a held-message record for `msg` and enqueue it. Returns the
    /// handle the pipeline awaits and the same handle the operator (or a
    /// controller) uses to release it.
    pub async fn hold(&self, msg: ProxyMessage) -> (Arc<HeldMessage>, oneshot::Receiver<Action>) {
        let (tx, rx) = oneshot::channel();
        let handle = Arc::new(HeldMessage {
            message: msg,
            released: Arc::new(AtomicBool::new(false)),
            resolve: Mutex::new(Some(tx)),
        });
        self.held.lock().await.push_back(PendingHold {
            held: handle.clone(),
        });
        (handle, rx)
    }

    /// Remove a held message from the registry once its release has fired.
    /// Pipeline loops call this after waking from the release signal.
    pub async fn forget(&self, proxy_id: Uuid) {
        let mut held = self.held.lock().await;
        held.retain(|p| p.held.message.proxy_id != proxy_id);
    }

    /// Snapshot of currently waiting held records, in insertion order.
    pub async fn held(&self) -> Vec<Arc<HeldMessage>> {
        self.held.lock().await.iter().map(|p| p.held.clone()).collect()
    }
}

/// Validate a release action before it is applied by a forward loop. A
/// `modify` action without a replacement envelope is invalid.
pub fn validate_action(action: &Action) -> Result<()> {
    match action {
        Action::Modify(v) if !v.is_object() => Err(ProxyError::InvalidAction(
            "modify action requires a replacement envelope".to_string(),
        )),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Direction, Transport};
    use serde_json::json;

    fn sample() -> ProxyMessage {
        ProxyMessage::new(
            0,
            Direction::ClientToServer,
            Transport::Stdio,
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call"}),
            None,
            Some("tools/call".to_string()),
        )
    }

    #[tokio::test]
    async fn passthrough_never_holds() {
        let engine = InterceptEngine::default();
        assert!(!engine.should_hold().await);
    }

    #[tokio::test]
    async fn hold_and_release_forward() {
        let engine = InterceptEngine::new(Mode::Intercept);
        assert!(engine.should_hold().await);

        let (handle, rx) = engine.hold(sample()).await;
        assert_eq!(engine.held().await.len(), 1);

        handle.release(Action::Forward).await.unwrap();
        let action = rx.await.unwrap();
        assert_matches::assert_matches!(action, Action::Forward);

        engine.forget(handle.message.proxy_id).await;
        assert_eq!(engine.held().await.len(), 0);
    }

    #[tokio::test]
    async fn double_release_is_no_op_error() {
        let engine = InterceptEngine::new(Mode::Intercept);
        let (handle, _rx) = engine.hold(sample()).await;
        handle.release(Action::Drop).await.unwrap();
        let err = handle.release(Action::Forward).await.unwrap_err();
        assert_matches::assert_matches!(err, ProxyError::InvalidAction(_));
    }

    #[tokio::test]
    async fn passthrough_releases_all_held_in_order() {
        let engine = InterceptEngine::new(Mode::Intercept);
        let (h1, rx1) = engine.hold(sample()).await;
        let (h2, rx2) = engine.hold(sample()).await;

        engine.set_mode(Mode::Passthrough).await;

        assert_matches::assert_matches!(rx1.await.unwrap(), Action::Forward);
        assert_matches::assert_matches!(rx2.await.unwrap(), Action::Forward);
        assert_eq!(engine.held().await.len(), 0);
        let _ = (h1, h2);
    }

    #[test]
    fn modify_without_envelope_is_invalid() {
        let err = validate_action(&Action::Modify(Value::Null)).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidAction(_)));
        validate_action(&Action::Modify(json!({"jsonrpc": "2.0"}))).unwrap();
    }
}
