//! Websocket transport for the change-streaming broker (§4.6, §6).
//!
//! Layering: [`path`] parses the upgrade request, [`server`] drives the
//! handshake itself, and [`framing`] wraps the resulting stream with
//! per-message ack tracking and bounded in-flight back-pressure. None of
//! this crate knows about `Change`/`Storer`/`Subscriber` beyond the wire
//! types re-exported from `cstream_types` — the streamer crate owns all
//! application-level behavior.

pub mod error;
pub mod framing;
pub mod path;
pub mod server;

pub mod prelude {
    pub use crate::error::{truncate_close_reason, Result, TransportError};
    pub use crate::framing::{
        split, ConsumedWaiter, FramedReceiver, FramedSender, Inbound, DEFAULT_MAX_IN_FLIGHT,
        PING_GRACE, PING_INTERVAL,
    };
    pub use crate::path::{parse_path, parse_subscribe_query, ParsedPath, RequestedRoute};
    pub use crate::server::{accept, UpgradeRequest};
}
