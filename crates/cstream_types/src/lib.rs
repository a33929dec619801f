//! Shared data model for the change-streaming broker.
//!
//! This crate is the workspace's lowest layer (no I/O, no database driver,
//! no websocket dependency) — every other crate depends on it, it depends
//! on nothing workspace-local. Mirrors the role `contracts`/`shared/lib`
//! play in a layered Rust service: pure types that define the contract
//! between components without pulling in how any one of them is
//! implemented.
//!
//! # Modules
//!
//! - [`watermark`]: the [`Watermark`] position type.
//! - [`change`]: the [`Change`] tagged union and row/relation types.
//! - [`persisted`]: Change DB row shapes (`changeLog`, `replicationState`,
//!   `replicationConfig`).
//! - [`protocol`]: wire frame types for the subscriber websocket protocol.
//! - [`error`]: the wire-visible [`ErrorKind`] taxonomy.

pub mod change;
pub mod error;
pub mod persisted;
pub mod protocol;
pub mod watermark;

pub use change::{Change, DataChange, ReplicaIdentity, Relation, Row};
pub use error::ErrorKind;
pub use persisted::{ChangeLogEntry, ReplicationConfig, ReplicationState};
pub use protocol::{
    Ack, ControlTag, DownstreamFrame, Envelope, SubscribeRequest, SubscriberMode, UpstreamStatus,
    CURRENT_PROTOCOL_VERSION, MIN_SUPPORTED_PROTOCOL_VERSION,
};
pub use watermark::Watermark;

/// Prelude for convenient `use cstream_types::prelude::*;` in downstream
/// crates.
pub mod prelude {
    pub use crate::{
        Ack, Change, ChangeLogEntry, ControlTag, DataChange, DownstreamFrame, Envelope,
        ErrorKind, ReplicaIdentity, Relation, ReplicationConfig, ReplicationState, Row,
        SubscribeRequest, SubscriberMode, UpstreamStatus, Watermark, CURRENT_PROTOCOL_VERSION,
        MIN_SUPPORTED_PROTOCOL_VERSION,
    };
}
