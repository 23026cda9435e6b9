//! Default observer that renders pipeline events through `tracing`, with
//! an arrow prefix showing which way each message crossed the proxy.

use mitm_core::{Direction, HeldMessage, Observer, ProxyMessage, Result};

pub struct TracingObserver;

impl Observer for TracingObserver {
    fn on_received(&self, msg: &ProxyMessage) -> Result<()> {
        let arrow = match msg.direction {
            Direction::ClientToServer => "->",
            Direction::ServerToClient => "<-",
        };
        tracing::info!(
            proxy_id = %msg.proxy_id,
            sequence = msg.sequence,
            method = ?msg.method,
            "{arrow} received"
        );
        Ok(())
    }

    fn on_held(&self, held: &HeldMessage) -> Result<()> {
        tracing::info!(proxy_id = %held.message.proxy_id, method = ?held.message.method, "held for operator decision");
        Ok(())
    }

    fn on_forwarded(&self, msg: &ProxyMessage) -> Result<()> {
        if msg.modified {
            tracing::info!(proxy_id = %msg.proxy_id, "[MODIFIED] forwarded");
        } else {
            tracing::debug!(proxy_id = %msg.proxy_id, "forwarded");
        }
        Ok(())
    }
}
