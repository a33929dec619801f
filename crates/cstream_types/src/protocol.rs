//! Wire protocol definitions (§6): downstream frames the streamer sends to
//! subscribers, upstream frames subscribers send back, and the envelope
//! that wraps either side of that exchange with a per-message ack id.

use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::error::ErrorKind;
use crate::watermark::Watermark;

/// Minimum protocol version this streamer will negotiate with a
/// subscriber. Versions below this predate the `status` prelude frame.
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u32 = 1;
/// The protocol version this streamer speaks natively.
pub const CURRENT_PROTOCOL_VERSION: u32 = 2;

/// One frame sent from the streamer to a subscriber. Serializes as the
/// tuple shape in §6 (`["tag", ...fields]`) via `#[serde(tag = ...)]`
/// would produce an object, not a tuple, so this is hand-rolled as an
/// explicit tuple-of-(tag, payload) via `DownstreamFrame::to_wire`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownstreamFrame {
    /// Optional v2+ prelude signalling the subscription is valid and about
    /// to start streaming (catch-up or live).
    Status,
    Begin {
        change: Change,
        commit_watermark: Watermark,
    },
    Data {
        change: Change,
    },
    Commit {
        change: Change,
        watermark: Watermark,
    },
    Rollback {
        change: Change,
    },
    Control {
        tag: ControlTag,
    },
    Error {
        kind: ErrorKind,
        message: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ControlTag {
    ResetRequired,
}

/// Minimal JSON tuple/array representation matching §6's wire shapes
/// exactly, independent of how `Change` itself happens to serialize.
impl DownstreamFrame {
    pub fn to_wire(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            DownstreamFrame::Status => json!(["status", {"tag": "status"}]),
            DownstreamFrame::Begin {
                change,
                commit_watermark,
            } => json!(["begin", change, {"commitWatermark": commit_watermark}]),
            DownstreamFrame::Data { change } => json!(["data", change]),
            DownstreamFrame::Commit { change, watermark } => {
                json!(["commit", change, {"watermark": watermark}])
            }
            DownstreamFrame::Rollback { change } => json!(["rollback", change]),
            DownstreamFrame::Control { tag } => json!(["control", {"tag": tag}]),
            DownstreamFrame::Error { kind, message } => {
                json!(["error", {"type": kind, "message": message}])
            }
        }
    }

    /// Build the appropriate frame for a live (non-catch-up) change,
    /// bracketing a transaction's Begin/Commit/Rollback with their
    /// companion metadata fields.
    pub fn for_change(change: &Change, commit_watermark: Option<&Watermark>) -> Self {
        match change {
            Change::Begin { .. } => DownstreamFrame::Begin {
                change: change.clone(),
                commit_watermark: commit_watermark.cloned().unwrap_or_else(|| {
                    // A Begin always carries its own watermark as the
                    // pre-commit watermark when the final commit
                    // watermark isn't yet known (e.g. during decode,
                    // before Commit has been observed).
                    change.watermark().clone()
                }),
            },
            Change::Commit { watermark } => DownstreamFrame::Commit {
                change: change.clone(),
                watermark: watermark.clone(),
            },
            Change::Rollback { .. } => DownstreamFrame::Rollback {
                change: change.clone(),
            },
            Change::DataChange { .. } => DownstreamFrame::Data {
                change: change.clone(),
            },
        }
    }
}

/// An upstream frame: the only one is the subscriber status/heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamStatus {
    pub watermark: Watermark,
}

impl UpstreamStatus {
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!(["status", {}, {"watermark": self.watermark}])
    }

    pub fn from_wire(value: &serde_json::Value) -> Option<Self> {
        let arr = value.as_array()?;
        if arr.len() != 3 || arr[0].as_str() != Some("status") {
            return None;
        }
        let watermark = arr[2].get("watermark")?.as_str()?;
        Some(UpstreamStatus {
            watermark: Watermark::from_raw(watermark),
        })
    }
}

/// The transport-level envelope wrapping every application frame in both
/// directions: `{id, msg}` outbound, `{ack: id}` the only inbound control
/// frame (§4.6). `id` starts at 1 and increases monotonically per
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub msg: T,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Ack {
    pub ack: u64,
}

/// Query-string parameters accepted on `/{prefix}/v{N}/changes` (§6).
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeRequest {
    pub protocol_version: u32,
    pub id: String,
    pub replica_version: Watermark,
    pub watermark: Watermark,
    pub initial: bool,
    pub task_id: Option<String>,
    pub mode: SubscriberMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriberMode {
    #[default]
    Serving,
    Backup,
}

impl SubscriberMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "serving" => Some(SubscriberMode::Serving),
            "backup" => Some(SubscriberMode::Backup),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_frame_matches_wire_shape() {
        let w = Watermark::from_lsn(9);
        let change = Change::Begin {
            watermark: w.clone(),
        };
        let frame = DownstreamFrame::Begin {
            change,
            commit_watermark: w.clone(),
        };
        let wire = frame.to_wire();
        assert_eq!(wire[0], "begin");
        assert_eq!(wire[2]["commitWatermark"], w.to_string());
    }

    #[test]
    fn error_frame_carries_numeric_type() {
        let frame = DownstreamFrame::Error {
            kind: ErrorKind::WatermarkTooOld,
            message: Some("earliest supported watermark is 06".into()),
        };
        let wire = frame.to_wire();
        assert_eq!(wire[1]["type"], 2);
    }

    #[test]
    fn upstream_status_roundtrips() {
        let status = UpstreamStatus {
            watermark: Watermark::from_lsn(11),
        };
        let wire = status.to_wire();
        let back = UpstreamStatus::from_wire(&wire).unwrap();
        assert_eq!(status, back);
    }
}
