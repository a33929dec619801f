//! The wire-visible error taxonomy (§7). This is a plain numbered enum —
//! it crosses the transport boundary as `{type: <number>, message?}` so the
//! numbering is part of the protocol and must not be reordered.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Error kinds a subscriber can observe in an `["error", ...]` downstream
/// frame. Numbering matches §7 exactly and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum ErrorKind {
    Unknown = 0,
    WrongReplicaVersion = 1,
    WatermarkTooOld = 2,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Unknown => "unknown",
            ErrorKind::WrongReplicaVersion => "wrong replica version",
            ErrorKind::WatermarkTooOld => "watermark too old",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbering_matches_spec() {
        assert_eq!(serde_json::to_string(&ErrorKind::Unknown).unwrap(), "0");
        assert_eq!(
            serde_json::to_string(&ErrorKind::WrongReplicaVersion).unwrap(),
            "1"
        );
        assert_eq!(
            serde_json::to_string(&ErrorKind::WatermarkTooOld).unwrap(),
            "2"
        );
    }

    #[test]
    fn rejects_unknown_discriminant() {
        assert!(serde_json::from_str::<ErrorKind>("9").is_err());
    }
}
