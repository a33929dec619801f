//! Streamer-level error types (§7): the errors that can end a single
//! subscription (`WrongReplicaVersion`, `WatermarkTooOld`) versus the ones
//! that end the whole service (`AutoResetSignal`, `OwnershipChanged`,
//! any ChangeSource/Storer failure).

use cstream_types::{ErrorKind, Watermark};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("subscriber's replica version is {requested}, current replica version is {current}")]
    WrongReplicaVersion {
        current: Watermark,
        requested: Watermark,
    },

    #[error("subscriber's watermark predates the retained log: earliest supported watermark is {earliest} (requested {requested})")]
    WatermarkTooOld {
        earliest: Watermark,
        requested: Watermark,
    },

    #[error("protocol version {requested} is outside supported range [{min}, {max}]")]
    UnsupportedProtocolVersion { requested: u32, min: u32, max: u32 },

    #[error("upstream requires a full resync")]
    AutoResetSignal,

    #[error("changeLog write ownership was lost to another task")]
    OwnershipChanged,

    #[error("store error: {0}")]
    Store(#[from] cstream_store::error::StoreError),

    #[error("source error: {0}")]
    Source(#[from] cstream_source::error::SourceError),

    #[error("transport error: {0}")]
    Transport(#[from] cstream_transport::error::TransportError),
}

pub type Result<T> = std::result::Result<T, StreamerError>;

impl StreamerError {
    /// Map onto the wire-visible numeric taxonomy (§7). Errors that don't
    /// correspond to a per-subscriber closure (service-fatal ones) never
    /// reach this — they tear the service down instead of producing an
    /// `["error", ...]` frame.
    pub fn wire_kind(&self) -> ErrorKind {
        match self {
            StreamerError::WrongReplicaVersion { .. } => ErrorKind::WrongReplicaVersion,
            StreamerError::WatermarkTooOld { .. } => ErrorKind::WatermarkTooOld,
            _ => ErrorKind::Unknown,
        }
    }

    /// Per §7: only these two classifications close a single subscription
    /// without disturbing the rest of the service or the stored log.
    pub fn is_subscriber_only(&self) -> bool {
        matches!(
            self,
            StreamerError::WrongReplicaVersion { .. } | StreamerError::WatermarkTooOld { .. }
        )
    }

    /// Per §7: these tear the whole service down for external supervision.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StreamerError::AutoResetSignal | StreamerError::OwnershipChanged
        ) || matches!(self, StreamerError::Store(cstream_store::error::StoreError::OwnershipChanged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_replica_version_maps_to_wire_kind_one() {
        let err = StreamerError::WrongReplicaVersion {
            current: Watermark::from_raw("01"),
            requested: Watermark::from_raw("01foobar"),
        };
        assert_eq!(err.wire_kind(), ErrorKind::WrongReplicaVersion);
        assert!(err.is_subscriber_only());
        assert!(!err.is_fatal());
    }

    #[test]
    fn auto_reset_is_fatal_not_subscriber_only() {
        let err = StreamerError::AutoResetSignal;
        assert!(err.is_fatal());
        assert!(!err.is_subscriber_only());
    }
}
