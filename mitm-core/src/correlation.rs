//! Pure classification of decoded JSON-RPC envelopes. These functions never
//! raise; an envelope that matches none of the recognised shapes classifies
//! as [`Kind::Notification`] only if it also lacks an id, otherwise it is
//! treated as best-effort (the id is still extracted where present).

use crate::message::{Envelope, JsonRpcId};

/// The four JSON-RPC envelope shapes the core distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Response,
    Error,
    Notification,
}

/// Classify a decoded envelope. A request has `id` and `method`; a response
/// has `id` and `result`; an error has `id` and `error`; a notification has
/// `method` and no `id`.
pub fn classify(envelope: &Envelope) -> Kind {
    let has_id = envelope.get("id").is_some();
    let has_method = envelope.get("method").is_some();
    let has_result = envelope.get("result").is_some();
    let has_error = envelope.get("error").is_some();

    if has_id && has_method {
        Kind::Request
    } else if has_id && has_result {
        Kind::Response
    } else if has_id && has_error {
        Kind::Error
    } else {
        // Notifications lack an id by definition; anything else that
        // reaches here (id with neither method/result/error, or bare
        // method-less junk) is forwarded untouched rather than rejected —
        // the core does not interpret method semantics.
        Kind::Notification
    }
}

/// Extract the jsonrpc id, present for request/response/error.
pub fn extract_id(envelope: &Envelope) -> Option<JsonRpcId> {
    match envelope.get("id") {
        Some(v) if v.is_string() => v.as_str().map(|s| JsonRpcId::String(s.to_string())),
        Some(v) if v.is_i64() || v.is_u64() => v.as_i64().map(JsonRpcId::Number),
        _ => None,
    }
}

/// Extract the method string, present for request/notification.
pub fn extract_method(envelope: &Envelope) -> Option<String> {
    envelope
        .get("method")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// True if the envelope is a request or error/response matching the given
/// direction-independent correlation key — i.e. it carries a jsonrpc id.
pub fn is_correlatable(kind: Kind) -> bool {
    matches!(kind, Kind::Request | Kind::Response | Kind::Error)
}
