//! ChangeSource (§4.1): the upstream logical-replication session.
//!
//! Opens a dedicated `replication=database` connection, issues
//! `START_REPLICATION SLOT ... LOGICAL`, and decodes the resulting
//! `CopyBoth` duplex stream into `Change` values. Grounded on the
//! `copy_both_simple` pattern used by postgres logical-replication clients
//! in the wild (pgdog's `logical::subscriber`, the neon safekeeper's WAL
//! sender on the producing side) — `tokio_postgres` itself has no
//! higher-level replication API, so this is the idiomatic way to drive it.

use std::collections::HashMap;
use std::time::Duration;

use backoff::exponential::ExponentialBackoff;
use backoff::SystemClock;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::{Config, CopyBothDuplex, NoTls};

use cstream_types::{Change, DataChange, Relation, Watermark};

use crate::error::{Result, SourceError};
use crate::pgoutput::{self, RawMessage, RelationMessage};

/// Maximum idle time before a keepalive ack is sent even if no data-ack
/// has gone out (§4.1: "~32s regardless, to prevent upstream session
/// timeout").
const KEEPALIVE_ACK_INTERVAL: Duration = Duration::from_secs(32);

/// Bounded retry for `ReplicationSlotBusy` (§4.1: "default five attempts
/// at ~10ms").
const SLOT_BUSY_MAX_ATTEMPTS: usize = 5;
const SLOT_BUSY_INITIAL_INTERVAL: Duration = Duration::from_millis(10);

/// Schema/name of the sentinel relation that an upstream event trigger
/// publishes DDL changes through, wal2json-style (§4(added)).
const DDL_SENTINEL_SCHEMA: &str = "cdc";
const DDL_SENTINEL_RELATION: &str = "ddl_log";

pub struct ChangeSource {
    config: Config,
    slot_name: String,
    publication: String,
}

pub struct StreamHandle {
    pub initial_watermark: Watermark,
    pub changes: mpsc::UnboundedReceiver<Result<Change>>,
    pub acks: mpsc::UnboundedSender<Watermark>,
}

impl ChangeSource {
    pub fn new(config: Config, slot_name: impl Into<String>, publication: impl Into<String>) -> Self {
        Self {
            config,
            slot_name: slot_name.into(),
            publication: publication.into(),
        }
    }

    /// Start (or restart) the replication stream from `from_watermark`,
    /// retrying `ReplicationSlotBusy` with bounded backoff.
    pub async fn start_stream(&self, from_watermark: Watermark) -> Result<StreamHandle> {
        let mut attempt = 0usize;
        let mut backoff: ExponentialBackoff<SystemClock> = backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(SLOT_BUSY_INITIAL_INTERVAL)
            .with_multiplier(2.0)
            .with_max_interval(Duration::from_secs(1))
            .with_max_elapsed_time(None)
            .build();

        loop {
            match self.try_start_stream(from_watermark.clone()).await {
                Ok(handle) => return Ok(handle),
                Err(e) if e.is_retriable() && attempt < SLOT_BUSY_MAX_ATTEMPTS => {
                    attempt += 1;
                    let delay = backoff::backoff::Backoff::next_backoff(&mut backoff)
                        .unwrap_or(SLOT_BUSY_INITIAL_INTERVAL);
                    tracing::warn!(attempt, ?delay, "replication slot busy, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_start_stream(&self, from_watermark: Watermark) -> Result<StreamHandle> {
        let mut config = self.config.clone();
        config.replication_mode(ReplicationMode::Logical);
        let (client, connection) = config.connect(NoTls).await.map_err(classify_connect_error)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(%e, "replication connection terminated");
            }
        });

        let start_lsn = from_watermark
            .to_lsn()
            .map(|lsn| lsn_to_pg_text(lsn))
            .unwrap_or_else(|| "0/0".to_string());

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} (proto_version '1', publication_names '{}')",
            quote_ident(&self.slot_name),
            start_lsn,
            self.publication
        );

        let duplex = client
            .copy_both_simple::<Bytes>(&query)
            .await
            .map_err(classify_stream_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_decode_loop(duplex, tx, ack_rx));

        Ok(StreamHandle {
            initial_watermark: from_watermark,
            changes: rx,
            acks: ack_tx,
        })
    }
}

fn classify_connect_error(e: tokio_postgres::Error) -> SourceError {
    if let Some(db_err) = e.as_db_error() {
        if db_err.message().contains("replication slot") && db_err.message().contains("is active") {
            return SourceError::ReplicationSlotBusy;
        }
    }
    SourceError::Database(e)
}

fn classify_stream_error(e: tokio_postgres::Error) -> SourceError {
    classify_connect_error(e)
}

async fn run_decode_loop(
    mut duplex: CopyBothDuplex<Bytes>,
    tx: mpsc::UnboundedSender<Result<Change>>,
    mut ack_rx: mpsc::UnboundedReceiver<Watermark>,
) {
    let mut relations: HashMap<i32, RelationMessage> = HashMap::new();
    let mut pending_watermark: Option<Watermark> = None;
    let mut last_ack_applied: u64 = 0;
    let mut keepalive_ticker = tokio::time::interval(KEEPALIVE_ACK_INTERVAL);
    let mut ack_rx = Some(ack_rx);

    loop {
        tokio::select! {
            frame = duplex.next() => {
                let Some(frame) = frame else { break };
                match frame {
                    Ok(bytes) => {
                        if let Err(err) = handle_frame(
                            bytes,
                            &mut duplex,
                            &mut relations,
                            &mut pending_watermark,
                            &mut last_ack_applied,
                            &tx,
                        ).await {
                            let _ = tx.send(Err(err));
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(classify_stream_error(e)));
                        break;
                    }
                }
            }
            acked = recv_ack(&mut ack_rx) => {
                match acked {
                    Some(watermark) => {
                        if let Some(lsn) = watermark.to_lsn() {
                            last_ack_applied = lsn;
                            let _ = send_standby_status_update(&mut duplex, lsn).await;
                        }
                    }
                    None => ack_rx = None,
                }
            }
            _ = keepalive_ticker.tick() => {
                let _ = send_standby_status_update(&mut duplex, last_ack_applied).await;
            }
        }
    }
}

/// Awaits the next ack, or never resolves once the sender side has been
/// dropped (rather than spinning on a closed channel).
async fn recv_ack(ack_rx: &mut Option<mpsc::UnboundedReceiver<Watermark>>) -> Option<Watermark> {
    match ack_rx.as_mut() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_frame(
    mut bytes: Bytes,
    duplex: &mut CopyBothDuplex<Bytes>,
    relations: &mut HashMap<i32, RelationMessage>,
    pending_watermark: &mut Option<Watermark>,
    last_ack_applied: &mut u64,
    tx: &mpsc::UnboundedSender<Result<Change>>,
) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    let tag = bytes.get_u8();
    match tag {
        b'w' => {
            if bytes.remaining() < 24 {
                return Err(SourceError::Decode("truncated XLogData header".into()));
            }
            let _start_lsn = bytes.get_u64();
            let _end_lsn = bytes.get_u64();
            let _send_time = bytes.get_u64();
            let message = pgoutput::decode_message(bytes)?;
            apply_message(message, relations, pending_watermark, tx);
        }
        b'k' => {
            if bytes.remaining() < 17 {
                return Err(SourceError::Decode("truncated keepalive".into()));
            }
            let end_lsn = bytes.get_u64();
            let _timestamp = bytes.get_u64();
            let should_respond = bytes.get_u8() != 0;
            if should_respond {
                let applied = end_lsn.max(*last_ack_applied);
                *last_ack_applied = applied;
                send_standby_status_update(duplex, applied).await?;
            }
        }
        other => {
            return Err(SourceError::Decode(format!(
                "unsupported CopyData tag '{}'",
                other as char
            )))
        }
    }
    Ok(())
}

fn apply_message(
    message: RawMessage,
    relations: &mut HashMap<i32, RelationMessage>,
    pending_watermark: &mut Option<Watermark>,
    tx: &mpsc::UnboundedSender<Result<Change>>,
) {
    match message {
        RawMessage::Begin { final_lsn, .. } => {
            let watermark = Watermark::from_lsn(final_lsn);
            *pending_watermark = Some(watermark.clone());
            let _ = tx.send(Ok(Change::Begin { watermark }));
        }
        RawMessage::Commit { .. } => {
            if let Some(watermark) = pending_watermark.take() {
                let _ = tx.send(Ok(Change::Commit { watermark }));
            }
        }
        RawMessage::Relation(relation) => {
            relations.insert(relation.id, relation);
        }
        RawMessage::Insert { relation_id, new } => {
            let Some(watermark) = pending_watermark.clone() else { return };
            let Some(relation) = relations.get(&relation_id) else { return };
            if is_ddl_sentinel(&relation.relation) {
                if let Some(change) = decode_ddl_insert(&new, relation) {
                    let _ = tx.send(Ok(Change::DataChange { watermark, change }));
                }
                return;
            }
            let row = pgoutput::tuple_to_row(&new, &relation.columns);
            let change = DataChange::Insert {
                relation: relation.relation.clone(),
                new: row,
            };
            let _ = tx.send(Ok(Change::DataChange { watermark, change }));
        }
        RawMessage::Update {
            relation_id,
            key_or_old,
            new,
        } => {
            let Some(watermark) = pending_watermark.clone() else { return };
            let Some(relation) = relations.get(&relation_id) else { return };
            let new_row = pgoutput::tuple_to_row(&new, &relation.columns);
            let key_row = key_or_old.map(|t| pgoutput::tuple_to_row(&t, &relation.columns));
            let change = DataChange::Update {
                relation: relation.relation.clone(),
                key: key_row,
                new: new_row,
            };
            let _ = tx.send(Ok(Change::DataChange { watermark, change }));
        }
        RawMessage::Delete {
            relation_id,
            key_or_old,
        } => {
            let Some(watermark) = pending_watermark.clone() else { return };
            let Some(relation) = relations.get(&relation_id) else { return };
            let old_row = pgoutput::tuple_to_row(&key_or_old, &relation.columns);
            let change = DataChange::Delete {
                relation: relation.relation.clone(),
                old: old_row,
            };
            let _ = tx.send(Ok(Change::DataChange { watermark, change }));
        }
        RawMessage::Truncate { relation_ids } => {
            let Some(watermark) = pending_watermark.clone() else { return };
            let relations: Vec<Relation> = relation_ids
                .iter()
                .filter_map(|id| relations.get(id).map(|r| r.relation.clone()))
                .collect();
            if relations.is_empty() {
                return;
            }
            let change = DataChange::Truncate { relations };
            let _ = tx.send(Ok(Change::DataChange { watermark, change }));
        }
    }
}

fn is_ddl_sentinel(relation: &Relation) -> bool {
    relation.schema == DDL_SENTINEL_SCHEMA && relation.name == DDL_SENTINEL_RELATION
}

/// Decode a row inserted into the DDL sentinel relation into the matching
/// `DataChange` DDL sub-variant. The sentinel carries a `payload` text
/// column holding a JSON object `{"op": ..., "schema": ..., "name": ...,
/// "ddl": ...}` published by the upstream event trigger.
fn decode_ddl_insert(tuple: &pgoutput::TupleData, relation: &RelationMessage) -> Option<DataChange> {
    let payload_idx = relation.columns.iter().position(|c| c.name == "payload")?;
    let pgoutput::ColumnValue::Text(payload) = tuple.columns.get(payload_idx)? else {
        return None;
    };
    let value: serde_json::Value = serde_json::from_str(payload).ok()?;
    let op = value.get("op")?.as_str()?;
    let schema = value.get("schema")?.as_str()?.to_string();
    let name = value.get("name")?.as_str()?.to_string();
    let relation_ref = Relation {
        schema,
        name,
        key_columns: Vec::new(),
        replica_identity: cstream_types::ReplicaIdentity::Nothing,
    };
    let ddl = value.get("ddl").and_then(|v| v.as_str()).unwrap_or("").to_string();

    Some(match op {
        "create-table" => DataChange::CreateTable {
            relation: relation_ref,
            ddl,
        },
        "rename-table" => {
            let to_name = value.get("toName")?.as_str()?.to_string();
            let to = Relation {
                schema: relation_ref.schema.clone(),
                name: to_name,
                key_columns: Vec::new(),
                replica_identity: cstream_types::ReplicaIdentity::Nothing,
            };
            DataChange::RenameTable {
                from: relation_ref,
                to,
            }
        }
        "add-column" => DataChange::AddColumn {
            relation: relation_ref,
            column: value.get("column")?.as_str()?.to_string(),
            ddl,
        },
        "update-column" => DataChange::UpdateColumn {
            relation: relation_ref,
            column: value.get("column")?.as_str()?.to_string(),
            ddl,
        },
        "drop-column" => DataChange::DropColumn {
            relation: relation_ref,
            column: value.get("column")?.as_str()?.to_string(),
        },
        "drop-table" => DataChange::DropTable { relation: relation_ref },
        "create-index" => DataChange::CreateIndex {
            relation: relation_ref,
            ddl,
        },
        "drop-index" => DataChange::DropIndex {
            relation: relation_ref,
            index_name: value.get("indexName")?.as_str()?.to_string(),
        },
        _ => return None,
    })
}

async fn send_standby_status_update(duplex: &mut CopyBothDuplex<Bytes>, lsn: u64) -> Result<()> {
    let mut buf = BytesMut::with_capacity(34);
    buf.put_u8(b'r');
    buf.put_u64(lsn + 1); // written
    buf.put_u64(lsn + 1); // flushed
    buf.put_u64(lsn + 1); // applied
    buf.put_u64(0); // client timestamp, unused here
    buf.put_u8(0); // reply requested = false
    duplex
        .send(buf.freeze())
        .await
        .map_err(SourceError::Database)
}

fn lsn_to_pg_text(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_round_trips_through_watermark() {
        let watermark = Watermark::from_lsn(0x16B374D848);
        let lsn = watermark.to_lsn().unwrap();
        assert_eq!(lsn_to_pg_text(lsn), "16/B374D848");
    }

    #[test]
    fn quote_ident_escapes_double_quotes() {
        assert_eq!(quote_ident(r#"weird"slot"#), r#""weird""slot""#);
    }
}
