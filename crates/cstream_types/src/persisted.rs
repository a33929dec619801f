//! Rows of the Change DB (§3, §6): `changeLog`, `replicationState`,
//! `replicationConfig`. These types are shared between `cstream_store`
//! (which reads/writes them) and anything that needs to reason about
//! persisted state without depending on a database driver.

use serde::{Deserialize, Serialize};

use crate::change::Change;
use crate::watermark::Watermark;

/// One row of `cdc.changeLog`. Primary key is `(watermark, pos)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    pub watermark: Watermark,
    pub pos: i64,
    pub change: Change,
    /// Set only on the Commit row; carries the Begin's (pre-commit)
    /// watermark for debuggability. `None` on every other row.
    pub precommit: Option<Watermark>,
}

/// The singleton `cdc.replicationState` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationState {
    pub last_watermark: Watermark,
    pub owner: String,
    pub owner_address: Option<String>,
}

impl ReplicationState {
    pub fn fresh(owner: impl Into<String>) -> Self {
        Self {
            last_watermark: Watermark::zero(),
            owner: owner.into(),
            owner_address: None,
        }
    }
}

/// The singleton `cdc.replicationConfig` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    pub replica_version: Watermark,
    pub publications: Vec<String>,
    pub reset_required: bool,
}
