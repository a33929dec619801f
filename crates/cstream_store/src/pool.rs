//! TransactionPool (§5): a small worker pool where each worker holds
//! exactly one live database transaction for the pool's lifetime, tasks
//! are dequeued FIFO and dispatched to the first free worker, and
//! read-only workers can share one consistent snapshot via
//! `pg_export_snapshot()` / `SET TRANSACTION SNAPSHOT`.
//!
//! Grounded on the teacher's handle/driver actor split
//! (`raft::node::{ZoneConsensus, ZoneConsensusDriver}`): a cheap, `Clone`
//! handle sends jobs down an `mpsc` channel to worker tasks that
//! exclusively own the `tokio_postgres` transaction, rather than sharing
//! `&mut Transaction` across tasks directly.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_postgres::NoTls;

use cstream_types::{Change, ChangeLogEntry, Watermark};

use crate::error::{Result, StoreError};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// Read-only, serializable, sharing a single exported snapshot across
    /// every worker — used for subscriber catch-up.
    ReadOnly,
    /// Read-write, serializable — used for the Storer's single write
    /// worker, one transaction per Begin..Commit cycle.
    Serializable,
}

/// One unit of work dispatched to a worker's held transaction. Replies are
/// delivered via the embedded oneshot sender rather than a generic return
/// value, so the queue itself stays a plain, non-generic channel (mirrors
/// the teacher's `RaftMsg` command-enum-over-mpsc pattern rather than a
/// type-erased closure queue).
pub enum PoolJob {
    InsertChangeLogRow {
        watermark: Watermark,
        pos: i64,
        change: Change,
        precommit: Option<Watermark>,
        reply: oneshot::Sender<Result<()>>,
    },
    AssumeOwnership {
        owner: String,
        reply: oneshot::Sender<Result<()>>,
    },
    AdvanceLastWatermark {
        owner: String,
        watermark: Watermark,
        reply: oneshot::Sender<Result<()>>,
    },
    ReadReplicationConfig {
        reply: oneshot::Sender<Result<cstream_types::ReplicationConfig>>,
    },
    ReadLastWatermark {
        reply: oneshot::Sender<Result<Watermark>>,
    },
    EarliestWatermark {
        reply: oneshot::Sender<Result<Option<Watermark>>>,
    },
    /// Page through `changeLog` rows with `watermark >= from`, in commit
    /// order, `limit` rows at a time.
    CursorPage {
        from: Watermark,
        after_pos: Option<(Watermark, i64)>,
        limit: i64,
        reply: oneshot::Sender<Result<Vec<ChangeLogEntry>>>,
    },
    PurgeBefore {
        watermark: Watermark,
        reply: oneshot::Sender<Result<u64>>,
    },
    Commit {
        reply: oneshot::Sender<Result<()>>,
    },
    Rollback {
        reply: oneshot::Sender<Result<()>>,
    },
}

type SharedReceiver = Arc<AsyncMutex<mpsc::UnboundedReceiver<PoolJob>>>;

/// A handle to the pool. Cheap to clone; every clone shares the same
/// worker set and FIFO job queue via a ref-counted sender.
#[derive(Clone)]
pub struct TransactionPool {
    tx: mpsc::UnboundedSender<PoolJob>,
    refs: Arc<AtomicUsize>,
}

impl TransactionPool {
    /// Start `worker_count` workers, each checking out one connection from
    /// `pg_pool`, opening a transaction in `mode`, and (for `ReadOnly`)
    /// coordinating a shared snapshot before serving any job.
    pub async fn start(pg_pool: PgPool, mode: PoolMode, worker_count: usize) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<PoolJob>();
        let rx: SharedReceiver = Arc::new(AsyncMutex::new(rx));
        let snapshot_id: Arc<tokio::sync::OnceCell<String>> = Arc::new(tokio::sync::OnceCell::new());

        for worker_id in 0..worker_count.max(1) {
            let pg_pool = pg_pool.clone();
            let rx = rx.clone();
            let snapshot_id = snapshot_id.clone();
            tokio::spawn(async move {
                if let Err(err) = run_worker(worker_id, pg_pool, mode, rx, snapshot_id).await {
                    tracing::error!(worker_id, %err, "transaction pool worker exited with error");
                }
            });
        }

        Ok(Self {
            tx,
            refs: Arc::new(AtomicUsize::new(1)),
        })
    }

    async fn dispatch(&self, job: PoolJob) -> Result<()> {
        self.tx.send(job).map_err(|_| StoreError::PoolClosed)
    }

    pub async fn insert_change_log_row(
        &self,
        watermark: Watermark,
        pos: i64,
        change: Change,
        precommit: Option<Watermark>,
    ) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::InsertChangeLogRow {
            watermark,
            pos,
            change,
            precommit,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn assume_ownership(&self, owner: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::AssumeOwnership { owner, reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn advance_last_watermark(&self, owner: String, watermark: Watermark) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::AdvanceLastWatermark {
            owner,
            watermark,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn read_replication_config(&self) -> Result<cstream_types::ReplicationConfig> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::ReadReplicationConfig { reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn read_last_watermark(&self) -> Result<Watermark> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::ReadLastWatermark { reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn earliest_watermark(&self) -> Result<Option<Watermark>> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::EarliestWatermark { reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn cursor_page(
        &self,
        from: Watermark,
        after_pos: Option<(Watermark, i64)>,
        limit: i64,
    ) -> Result<Vec<ChangeLogEntry>> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::CursorPage {
            from,
            after_pos,
            limit,
            reply,
        })
        .await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn purge_before(&self, watermark: Watermark) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::PurgeBefore { watermark, reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn commit(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::Commit { reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn rollback(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(PoolJob::Rollback { reply }).await?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    /// Reference-count this handle (§5: "ref/unref with setDone on
    /// reach-zero so that ownership may be shared with the receiver").
    pub fn acquire(&self) -> Self {
        self.refs.fetch_add(1, Ordering::SeqCst);
        self.clone()
    }

    /// Release a reference. Returns `true` if this was the last one.
    pub fn release(&self) -> bool {
        self.refs.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

async fn run_worker(
    worker_id: usize,
    pg_pool: PgPool,
    mode: PoolMode,
    rx: SharedReceiver,
    snapshot_id: Arc<tokio::sync::OnceCell<String>>,
) -> Result<()> {
    let mut conn = pg_pool.get_owned().await.map_err(StoreError::Pool)?;
    let isolation = match mode {
        PoolMode::ReadOnly => "ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE",
        PoolMode::Serializable => "ISOLATION LEVEL SERIALIZABLE",
    };
    conn.batch_execute(&format!("BEGIN {isolation}")).await?;

    if mode == PoolMode::ReadOnly {
        // First worker through exports the snapshot; every later worker
        // sets the same one, so all read workers see one consistent view.
        let needs_export = snapshot_id.get().is_none();
        if needs_export {
            let row = conn
                .query_one("SELECT pg_export_snapshot()", &[])
                .await?;
            let id: String = row.get(0);
            let _ = snapshot_id.set(id);
        }
        if let Some(id) = snapshot_id.get() {
            if !needs_export {
                conn.batch_execute(&format!("SET TRANSACTION SNAPSHOT '{id}'"))
                    .await?;
            }
        }
    }

    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let ends_transaction = matches!(job, PoolJob::Commit { .. } | PoolJob::Rollback { .. });

        if let Err(err) = handle_job(&conn, job).await {
            tracing::warn!(worker_id, %err, "pool worker job failed");
        }

        // A write worker's transaction lasts one Begin..Commit/Rollback
        // cycle, not the worker's whole lifetime (unlike a read-only
        // worker's single shared snapshot) — re-open immediately so the
        // next Begin has a transaction to land in.
        if ends_transaction && mode == PoolMode::Serializable {
            if let Err(err) = conn.batch_execute(&format!("BEGIN {isolation}")).await {
                tracing::error!(worker_id, %err, "failed to reopen write transaction");
                return Err(err.into());
            }
        }
    }

    Ok(())
}

async fn handle_job(conn: &tokio_postgres::Client, job: PoolJob) -> Result<()> {
    match job {
        PoolJob::InsertChangeLogRow {
            watermark,
            pos,
            change,
            precommit,
            reply,
        } => {
            let result = insert_change_log_row(conn, &watermark, pos, &change, precommit.as_ref()).await;
            let _ = reply.send(result);
        }
        PoolJob::AssumeOwnership { owner, reply } => {
            let result = assume_ownership(conn, &owner).await;
            let _ = reply.send(result);
        }
        PoolJob::AdvanceLastWatermark {
            owner,
            watermark,
            reply,
        } => {
            let result = advance_last_watermark(conn, &owner, &watermark).await;
            let _ = reply.send(result);
        }
        PoolJob::ReadReplicationConfig { reply } => {
            let result = read_replication_config(conn).await;
            let _ = reply.send(result);
        }
        PoolJob::ReadLastWatermark { reply } => {
            let result = read_last_watermark(conn).await;
            let _ = reply.send(result);
        }
        PoolJob::EarliestWatermark { reply } => {
            let result = earliest_watermark(conn).await;
            let _ = reply.send(result);
        }
        PoolJob::CursorPage {
            from,
            after_pos,
            limit,
            reply,
        } => {
            let result = cursor_page(conn, &from, after_pos.as_ref(), limit).await;
            let _ = reply.send(result);
        }
        PoolJob::PurgeBefore { watermark, reply } => {
            let result = purge_before(conn, &watermark).await;
            let _ = reply.send(result);
        }
        PoolJob::Commit { reply } => {
            let result = conn.batch_execute("COMMIT").await.map_err(Into::into);
            let _ = reply.send(result);
        }
        PoolJob::Rollback { reply } => {
            let result = conn.batch_execute("ROLLBACK").await.map_err(Into::into);
            let _ = reply.send(result);
        }
    }
    Ok(())
}

async fn insert_change_log_row(
    conn: &tokio_postgres::Client,
    watermark: &Watermark,
    pos: i64,
    change: &Change,
    precommit: Option<&Watermark>,
) -> Result<()> {
    let change_json = serde_json::to_value(change)?;
    conn.execute(
        r#"INSERT INTO cdc."changeLog" (watermark, pos, change, precommit) VALUES ($1, $2, $3, $4)"#,
        &[
            &watermark.as_str(),
            &pos,
            &change_json,
            &precommit.map(|w| w.as_str()),
        ],
    )
    .await?;
    Ok(())
}

async fn assume_ownership(conn: &tokio_postgres::Client, owner: &str) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO cdc."replicationState" (lock, "lastWatermark", owner)
        VALUES (1, $1, $2)
        ON CONFLICT (lock) DO UPDATE SET owner = EXCLUDED.owner
        "#,
        &[&Watermark::zero().as_str(), &owner],
    )
    .await?;
    Ok(())
}

async fn advance_last_watermark(
    conn: &tokio_postgres::Client,
    owner: &str,
    watermark: &Watermark,
) -> Result<()> {
    let updated = conn
        .execute(
            r#"UPDATE cdc."replicationState" SET "lastWatermark" = $1 WHERE owner = $2"#,
            &[&watermark.as_str(), &owner],
        )
        .await?;
    if updated == 0 {
        return Err(StoreError::OwnershipChanged);
    }
    Ok(())
}

async fn read_replication_config(
    conn: &tokio_postgres::Client,
) -> Result<cstream_types::ReplicationConfig> {
    let row = conn
        .query_one(
            r#"SELECT "replicaVersion", publications, "resetRequired" FROM cdc."replicationConfig" WHERE lock = 1"#,
            &[],
        )
        .await?;
    Ok(cstream_types::ReplicationConfig {
        replica_version: Watermark::from_raw(row.get::<_, String>(0)),
        publications: row.get(1),
        reset_required: row.get(2),
    })
}

async fn read_last_watermark(conn: &tokio_postgres::Client) -> Result<Watermark> {
    let row = conn
        .query_one(r#"SELECT "lastWatermark" FROM cdc."replicationState" WHERE lock = 1"#, &[])
        .await?;
    Ok(Watermark::from_raw(row.get::<_, String>(0)))
}

async fn earliest_watermark(conn: &tokio_postgres::Client) -> Result<Option<Watermark>> {
    let rows = conn
        .query(
            r#"SELECT watermark FROM cdc."changeLog" ORDER BY watermark ASC LIMIT 1"#,
            &[],
        )
        .await?;
    Ok(rows.first().map(|row| Watermark::from_raw(row.get::<_, String>(0))))
}

async fn cursor_page(
    conn: &tokio_postgres::Client,
    from: &Watermark,
    after_pos: Option<&(Watermark, i64)>,
    limit: i64,
) -> Result<Vec<ChangeLogEntry>> {
    let rows = match after_pos {
        None => {
            conn.query(
                r#"SELECT watermark, pos, change, precommit FROM cdc."changeLog"
                   WHERE watermark >= $1 ORDER BY watermark, pos LIMIT $2"#,
                &[&from.as_str(), &limit],
            )
            .await?
        }
        Some((w, p)) => {
            conn.query(
                r#"SELECT watermark, pos, change, precommit FROM cdc."changeLog"
                   WHERE (watermark, pos) > ($1, $2) ORDER BY watermark, pos LIMIT $3"#,
                &[&w.as_str(), p, &limit],
            )
            .await?
        }
    };

    rows.into_iter()
        .map(|row| {
            let watermark: String = row.get(0);
            let pos: i64 = row.get(1);
            let change_json: serde_json::Value = row.get(2);
            let precommit: Option<String> = row.get(3);
            Ok(ChangeLogEntry {
                watermark: Watermark::from_raw(watermark),
                pos,
                change: serde_json::from_value(change_json)?,
                precommit: precommit.map(Watermark::from_raw),
            })
        })
        .collect()
}

async fn purge_before(conn: &tokio_postgres::Client, watermark: &Watermark) -> Result<u64> {
    let deleted = conn
        .execute(
            r#"DELETE FROM cdc."changeLog" WHERE watermark < $1"#,
            &[&watermark.as_str()],
        )
        .await?;
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_counting_reports_last_release() {
        let refs = Arc::new(AtomicUsize::new(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let pool = TransactionPool { tx, refs };
        let second = pool.acquire();
        assert!(!pool.release());
        assert!(second.release());
    }
}
