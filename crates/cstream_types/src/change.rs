//! The `Change` data model: a sealed tagged union describing one
//! transactional or schema-level effect observed on the upstream.
//!
//! `Change` is content-opaque beyond this envelope — row payloads are
//! carried as [`serde_json::Value`] and never interpreted by the broker.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::watermark::Watermark;

/// A replicated table or the conceptual "relation" a DDL change applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub schema: String,
    pub name: String,
    /// Ordered key column names (the replica identity, or a surrogate
    /// primary key if the table has no replica identity set).
    pub key_columns: Vec<String>,
    pub replica_identity: ReplicaIdentity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaIdentity {
    Default,
    Full,
    Nothing,
    Index,
}

/// A row, keyed by column name. Values are JSON-compatible scalars; the
/// `arbitrary_precision` feature on `serde_json` is what lets a `Value`
/// carry a bigint without going through `f64` and losing precision.
pub type Row = BTreeMap<String, Value>;

/// One row-level effect of a committed (or in-flight, for `DataChange`)
/// transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataChange {
    Insert {
        relation: Relation,
        new: Row,
    },
    Update {
        relation: Relation,
        /// `None` when the replica identity covers unchanged key columns
        /// (the common case); `Some` when a key column itself was
        /// updated, in which case it holds the pre-image of the key.
        key: Option<Row>,
        new: Row,
    },
    Delete {
        relation: Relation,
        /// The deleted row's key columns (or full row image under
        /// `ReplicaIdentity::Full`).
        old: Row,
    },
    Truncate {
        relations: Vec<Relation>,
    },
    CreateTable {
        relation: Relation,
        ddl: String,
    },
    RenameTable {
        from: Relation,
        to: Relation,
    },
    AddColumn {
        relation: Relation,
        column: String,
        ddl: String,
    },
    UpdateColumn {
        relation: Relation,
        column: String,
        ddl: String,
    },
    DropColumn {
        relation: Relation,
        column: String,
    },
    DropTable {
        relation: Relation,
    },
    CreateIndex {
        relation: Relation,
        ddl: String,
    },
    DropIndex {
        relation: Relation,
        index_name: String,
    },
}

impl DataChange {
    /// The relation this change is primarily about, for logging and
    /// catch-up bookkeeping. `Truncate` has no single relation so this
    /// returns `None` for it.
    pub fn primary_relation(&self) -> Option<&Relation> {
        match self {
            DataChange::Insert { relation, .. }
            | DataChange::Update { relation, .. }
            | DataChange::Delete { relation, .. }
            | DataChange::CreateTable { relation, .. }
            | DataChange::AddColumn { relation, .. }
            | DataChange::UpdateColumn { relation, .. }
            | DataChange::DropColumn { relation, .. }
            | DataChange::DropTable { relation }
            | DataChange::CreateIndex { relation, .. }
            | DataChange::DropIndex { relation, .. } => Some(relation),
            DataChange::RenameTable { from, .. } => Some(from),
            DataChange::Truncate { .. } => None,
        }
    }
}

/// A single transactional or schema-level effect produced by the upstream.
///
/// Every caller must handle all four tags exhaustively — there is no
/// catch-all variant. [`Change::Begin`] and [`Change::Commit`] bracket a
/// transaction's [`Change::DataChange`] entries; [`Change::Rollback`]
/// replaces `Commit` when the transaction aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// Opens a transaction. `watermark` is the transaction's pre-commit
    /// watermark — every entry in the transaction, including this one,
    /// shares it until `Commit` assigns the final one.
    Begin { watermark: Watermark },
    /// Closes a transaction durably. `watermark` is final and becomes
    /// observable to subscribers and the upstream ack path.
    Commit { watermark: Watermark },
    /// Aborts a transaction. No changeLog rows are produced for it.
    Rollback { watermark: Watermark },
    DataChange {
        watermark: Watermark,
        change: DataChange,
    },
}

impl Change {
    pub fn watermark(&self) -> &Watermark {
        match self {
            Change::Begin { watermark }
            | Change::Commit { watermark }
            | Change::Rollback { watermark }
            | Change::DataChange { watermark, .. } => watermark,
        }
    }

    pub fn is_begin(&self) -> bool {
        matches!(self, Change::Begin { .. })
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Change::Commit { .. })
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self, Change::Rollback { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "widgets".into(),
            key_columns: vec!["id".into()],
            replica_identity: ReplicaIdentity::Default,
        }
    }

    #[test]
    fn change_watermark_is_exposed_for_every_tag() {
        let w = Watermark::from_lsn(1);
        let begin = Change::Begin {
            watermark: w.clone(),
        };
        let commit = Change::Commit {
            watermark: w.clone(),
        };
        let rollback = Change::Rollback {
            watermark: w.clone(),
        };
        let mut row = Row::new();
        row.insert("id".into(), serde_json::json!(1));
        let data = Change::DataChange {
            watermark: w.clone(),
            change: DataChange::Insert {
                relation: relation(),
                new: row,
            },
        };
        assert_eq!(begin.watermark(), &w);
        assert_eq!(commit.watermark(), &w);
        assert_eq!(rollback.watermark(), &w);
        assert_eq!(data.watermark(), &w);
    }

    #[test]
    fn json_roundtrips_bigint_without_precision_loss() {
        let mut row = Row::new();
        row.insert("id".into(), serde_json::json!(9007199254740993u64));
        let change = DataChange::Insert {
            relation: relation(),
            new: row,
        };
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("9007199254740993"));
        let back: DataChange = serde_json::from_str(&json).unwrap();
        assert_eq!(change, back);
    }
}
