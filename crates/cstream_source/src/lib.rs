//! Upstream logical-replication session for the change-streaming broker
//! (§4.1).
//!
//! - [`pgoutput`]: stateless decoder for the wire format itself.
//! - [`source`]: [`source::ChangeSource`], which owns the replication
//!   connection, the relation cache, and the open-transaction watermark,
//!   and turns decoded messages into [`cstream_types::Change`] values.

pub mod error;
pub mod pgoutput;
pub mod source;

pub mod prelude {
    pub use crate::error::{Result, SourceError};
    pub use crate::source::{ChangeSource, StreamHandle};
}
