//! ChangeSource error types (§4.1, §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("replication slot is busy (transient, retriable)")]
    ReplicationSlotBusy,

    #[error("fatal upstream error: {0}")]
    FatalUpstreamError(String),

    #[error("upstream signalled a full resync is required")]
    AutoResetSignal,

    #[error("malformed pgoutput frame: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, SourceError>;

impl SourceError {
    /// Per §4.1: `ReplicationSlotBusy` is the one retriable classification;
    /// everything else is fatal to the current session.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SourceError::ReplicationSlotBusy)
    }
}
