//! Storer and transaction-pool error types (§7).

use cstream_types::Watermark;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<tokio_postgres::Error>),

    #[error("serialization failure on commit, reinterpreted as ownership change")]
    OwnershipChanged,

    #[error("subscriber's watermark {requested} predates the earliest retained changeLog entry (earliest supported watermark is {earliest})")]
    WatermarkTooOld {
        earliest: Watermark,
        requested: Watermark,
    },

    #[error("storer event loop is no longer running")]
    PoolClosed,

    #[error("migration {0} failed")]
    Migration(u32, #[source] tokio_postgres::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
