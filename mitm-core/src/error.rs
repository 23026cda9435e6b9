use thiserror::Error;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// The error taxonomy for the interception engine.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A transport adapter failed to read, write, or close. Terminates the
    /// affected forward loop and, by propagation, its sibling.
    #[error("transport error: {0}")]
    Transport(String),

    /// A byte stream could not be parsed as a JSON-RPC envelope. The pipeline
    /// never sees raw bytes directly; adapters map decode failures into this.
    #[error("decode error: {0}")]
    Decode(String),

    /// A persisted session file failed validation on load.
    #[error("corrupt session: {0}")]
    CorruptSession(String),

    /// The operator supplied an invalid release action: `modify` without a
    /// replacement envelope, or a release of an already-released message.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    /// A replay's deadline elapsed before the correlated response arrived.
    #[error("replay timed out after {0:?}")]
    ReplayTimeout(std::time::Duration),

    /// An observer callback raised. Caught by the pipeline and never
    /// propagated past it; this variant exists for logging the failure.
    #[error("observer error: {0}")]
    Observer(String),
}
