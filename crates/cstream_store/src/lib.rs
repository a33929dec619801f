//! Change DB access for the change-streaming broker (§4.2, §5, §6).
//!
//! - [`schema`]: linear numbered migrations creating the `cdc.*` tables.
//! - [`pool`]: [`pool::TransactionPool`], the worker-pool abstraction over
//!   `bb8`-pooled `tokio_postgres` connections described in §5.
//! - [`storer`]: [`storer::Storer`], the single-writer actor described in
//!   §4.2.

pub mod error;
pub mod pool;
pub mod schema;
pub mod storer;

pub mod prelude {
    pub use crate::error::{Result, StoreError};
    pub use crate::pool::{PgPool, PoolMode, TransactionPool};
    pub use crate::schema::run_migrations;
    pub use crate::storer::{CatchupSink, ConsumedSender, Storer};
}
