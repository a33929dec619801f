//! Transport-level error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("protocol version {requested} is outside supported range [{min}, {max}]")]
    UnsupportedProtocolVersion {
        requested: u32,
        min: u32,
        max: u32,
    },

    #[error("malformed subscribe path or query string: {0}")]
    MalformedRequest(String),

    #[error("connection closed")]
    Closed,

    #[error("send queue is full (bounded in-flight exceeded)")]
    QueueFull,

    #[error("peer did not respond to ping within the liveness window")]
    LivenessTimeout,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Close reasons are truncated to 123 bytes (§4.6) — the websocket close
/// frame's payload is capped at 125 bytes total, 2 of which are the status
/// code, leaving 123 for the UTF-8 reason string. Truncation is performed
/// on a UTF-8 boundary so the result is never invalid UTF-8.
pub fn truncate_close_reason(reason: &str) -> String {
    const MAX_BYTES: usize = 123;
    if reason.len() <= MAX_BYTES {
        return reason.to_string();
    }
    let mut end = MAX_BYTES;
    while end > 0 && !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reason_is_untouched() {
        assert_eq!(truncate_close_reason("ownership changed"), "ownership changed");
    }

    #[test]
    fn long_reason_is_truncated_to_123_bytes() {
        let reason = "x".repeat(500);
        let truncated = truncate_close_reason(&reason);
        assert_eq!(truncated.len(), 123);
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        // Each 'é' is 2 bytes; 123 is odd, so a naive byte-123 cut would
        // land mid-codepoint.
        let reason = "é".repeat(100);
        let truncated = truncate_close_reason(&reason);
        assert!(truncated.len() <= 123);
        assert!(String::from_utf8(truncated.into_bytes()).is_ok());
    }
}
