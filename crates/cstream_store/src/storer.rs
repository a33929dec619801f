//! The Storer (§4.2): single-writer, serialized consumer of the
//! ChangeSource stream. Implemented as a handle/actor pair — [`Storer`] is
//! the cheap, cloneable handle every other component holds; [`StorerActor`]
//! is the single task that owns the FIFO input queue and drives the state
//! machine table in §4.2. This mirrors the teacher's
//! `ZoneConsensus`/`ZoneConsensusDriver` split: the actor is the only thing
//! ever allowed to touch the write `TransactionPool`.

use tokio::sync::{mpsc, oneshot};

use cstream_types::{Change, ChangeLogEntry, Watermark};

use crate::error::{Result, StoreError};
use crate::pool::{PoolMode, TransactionPool};

/// A subscriber queued for catch-up. The Storer only needs enough of a
/// subscriber to push rows at it and signal completion/failure —
/// `cstream_streamer` supplies the concrete implementation.
#[async_trait::async_trait]
pub trait CatchupSink: Send + Sync {
    /// The watermark this subscriber asked to resume from.
    fn requested_watermark(&self) -> &Watermark;
    /// Push one historical row during catch-up.
    async fn catchup(&self, entry: ChangeLogEntry);
    /// Catch-up is complete; flush any buffered live changes.
    async fn set_caught_up(&self);
    /// Catch-up failed — typically `WatermarkTooOld`.
    async fn fail(&self, message: String);
}

enum StorerCommand {
    AssumeOwnership {
        task_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Change(Change),
    Status(Watermark),
    Subscriber(Box<dyn CatchupSink>),
    PurgeBefore {
        watermark: Watermark,
        reply: oneshot::Sender<Result<u64>>,
    },
    GetLastWatermark {
        reply: oneshot::Sender<Result<Watermark>>,
    },
    ReadReplicationConfig {
        reply: oneshot::Sender<Result<cstream_types::ReplicationConfig>>,
    },
    Stop,
}

/// Fired for every durable commit and out-of-band status message, so the
/// Forwarder can relay an ack upstream. `Watermark(0)`-style keepalive acks
/// are just `Watermark::zero()`.
pub type ConsumedSender = mpsc::UnboundedSender<Watermark>;

#[derive(Clone)]
pub struct Storer {
    tx: mpsc::UnboundedSender<StorerCommand>,
}

impl Storer {
    /// Spawn the actor and return the handle. `write_pool` must be a
    /// [`PoolMode::Serializable`] pool with exactly one worker — the
    /// single-writer discipline is enforced structurally by the actor
    /// owning the only handle capable of issuing write jobs, not by the
    /// pool itself.
    pub fn spawn(
        write_pool: TransactionPool,
        read_pool: TransactionPool,
        consumed: ConsumedSender,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = StorerActor {
            write_pool,
            read_pool,
            consumed,
            rx,
            pending: None,
            catchup_queue: Vec::new(),
        };
        tokio::spawn(actor.run());
        Self { tx }
    }

    pub async fn assume_ownership(&self, task_id: impl Into<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorerCommand::AssumeOwnership {
                task_id: task_id.into(),
                reply,
            })
            .map_err(|_| StoreError::PoolClosed)?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub fn store(&self, change: Change) {
        let _ = self.tx.send(StorerCommand::Change(change));
    }

    pub fn status(&self, watermark: Watermark) {
        let _ = self.tx.send(StorerCommand::Status(watermark));
    }

    pub fn catchup(&self, subscriber: Box<dyn CatchupSink>) {
        let _ = self.tx.send(StorerCommand::Subscriber(subscriber));
    }

    pub async fn purge_records_before(&self, watermark: Watermark) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorerCommand::PurgeBefore { watermark, reply })
            .map_err(|_| StoreError::PoolClosed)?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub async fn get_last_watermark(&self) -> Result<Watermark> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorerCommand::GetLastWatermark { reply })
            .map_err(|_| StoreError::PoolClosed)?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    /// Read-only; does not go through the write transaction's state
    /// machine, just borrows the write pool's worker for a single query.
    pub async fn read_replication_config(&self) -> Result<cstream_types::ReplicationConfig> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StorerCommand::ReadReplicationConfig { reply })
            .map_err(|_| StoreError::PoolClosed)?;
        rx.await.map_err(|_| StoreError::PoolClosed)?
    }

    pub fn stop(&self) {
        let _ = self.tx.send(StorerCommand::Stop);
    }
}

/// The pending-transaction state tracked across `Begin`..`Commit`/`Rollback`.
struct PendingTxn {
    precommit: Watermark,
    pos: i64,
    owner: String,
}

struct StorerActor {
    write_pool: TransactionPool,
    read_pool: TransactionPool,
    consumed: ConsumedSender,
    rx: mpsc::UnboundedReceiver<StorerCommand>,
    pending: Option<PendingTxn>,
    /// Subscribers that arrived while a transaction was open; drained into
    /// catch-up once the transaction resolves (commit or rollback).
    catchup_queue: Vec<Box<dyn CatchupSink>>,
}

impl StorerActor {
    async fn run(mut self) {
        let mut owner = String::new();
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                StorerCommand::AssumeOwnership { task_id, reply } => {
                    let result = self.write_pool.assume_ownership(task_id.clone()).await;
                    if result.is_ok() {
                        owner = task_id;
                    }
                    let _ = reply.send(result);
                }
                StorerCommand::Change(change) => {
                    if let Err(err) = self.apply_change(&owner, change).await {
                        tracing::error!(%err, "storer failed applying change, stopping");
                        break;
                    }
                }
                StorerCommand::Status(watermark) => {
                    let _ = self.consumed.send(watermark);
                }
                StorerCommand::Subscriber(sub) => {
                    if self.pending.is_some() {
                        self.catchup_queue.push(sub);
                    } else {
                        self.start_catchup(vec![sub]).await;
                    }
                }
                StorerCommand::PurgeBefore { watermark, reply } => {
                    let result = self.write_pool.purge_before(watermark).await;
                    let _ = reply.send(result);
                }
                StorerCommand::GetLastWatermark { reply } => {
                    let result = self.write_pool.read_last_watermark().await;
                    let _ = reply.send(result);
                }
                StorerCommand::ReadReplicationConfig { reply } => {
                    let result = self.write_pool.read_replication_config().await;
                    let _ = reply.send(result);
                }
                StorerCommand::Stop => break,
            }
        }
        tracing::info!("storer actor exiting");
    }

    async fn apply_change(&mut self, owner: &str, change: Change) -> Result<()> {
        match (&self.pending, &change) {
            (None, Change::Begin { watermark }) => {
                self.pending = Some(PendingTxn {
                    precommit: watermark.clone(),
                    pos: 0,
                    owner: owner.to_string(),
                });
                self.write_pool
                    .insert_change_log_row(watermark.clone(), 0, change, None)
                    .await?;
            }
            (Some(_), Change::DataChange { .. }) => {
                let pending = self.pending.as_mut().expect("checked above");
                pending.pos += 1;
                let pos = pending.pos;
                let precommit = pending.precommit.clone();
                self.write_pool
                    .insert_change_log_row(precommit, pos, change, None)
                    .await?;
            }
            (Some(_), Change::Commit { watermark }) => {
                let pending = self.pending.take().expect("checked above");
                let pos = pending.pos + 1;
                self.write_pool
                    .insert_change_log_row(watermark.clone(), pos, change, Some(pending.precommit))
                    .await?;
                match self
                    .write_pool
                    .advance_last_watermark(pending.owner, watermark.clone())
                    .await
                {
                    Ok(()) => {
                        self.write_pool.commit().await?;
                        let _ = self.consumed.send(watermark.clone());
                        self.drain_catchup_queue().await;
                    }
                    Err(StoreError::OwnershipChanged) => {
                        self.write_pool.rollback().await?;
                        return Err(StoreError::OwnershipChanged);
                    }
                    Err(e) => return Err(e),
                }
            }
            (Some(_), Change::Rollback { .. }) => {
                self.pending = None;
                self.write_pool.rollback().await?;
                self.drain_catchup_queue().await;
            }
            (None, Change::Commit { .. } | Change::Rollback { .. } | Change::DataChange { .. }) => {
                tracing::warn!("received change outside an open transaction, dropping");
            }
            (Some(_), Change::Begin { .. }) => {
                tracing::warn!("received Begin while a transaction was already open, dropping");
            }
        }
        Ok(())
    }

    async fn drain_catchup_queue(&mut self) {
        if self.catchup_queue.is_empty() {
            return;
        }
        let queued = std::mem::take(&mut self.catchup_queue);
        self.start_catchup(queued).await;
    }

    /// Open a read-only snapshot and stream each subscriber's catch-up
    /// rows concurrently. Spawned as a background task so it never blocks
    /// the actor's own command loop — the actor keeps accepting new
    /// `Begin`/`Commit` events from the ChangeSource while catch-up runs.
    async fn start_catchup(&self, subs: Vec<Box<dyn CatchupSink>>) {
        let read_pool = self.read_pool.clone();
        tokio::spawn(async move {
            for sub in subs {
                if let Err(err) = stream_catchup(&read_pool, sub.as_ref()).await {
                    sub.fail(err.to_string()).await;
                } else {
                    sub.set_caught_up().await;
                }
            }
        });
    }
}

const CATCHUP_PAGE_SIZE: i64 = 10_000;

async fn stream_catchup(pool: &TransactionPool, sub: &dyn CatchupSink) -> Result<()> {
    let requested = sub.requested_watermark().clone();
    let mut cursor: Option<(Watermark, i64)> = None;
    let mut first_page = true;

    loop {
        let page = pool
            .cursor_page(requested.clone(), cursor.clone(), CATCHUP_PAGE_SIZE)
            .await?;

        if first_page {
            first_page = false;
            if let Some(first) = page.first() {
                if first.watermark != requested {
                    return Err(StoreError::WatermarkTooOld {
                        earliest: first.watermark.clone(),
                        requested,
                    });
                }
            }
        }

        if page.is_empty() {
            break;
        }

        let last = page.last().map(|e| (e.watermark.clone(), e.pos));
        let page_len = page.len();
        for entry in page {
            // A row at or before `requested` belongs to a transaction the
            // subscriber already has (its own prior commit watermark), and
            // must not be redelivered — except at the true bootstrap
            // position (`Watermark::zero()`, "no prior commits"), where
            // the first transaction's own rows legitimately start here.
            if entry.watermark <= requested && requested != Watermark::zero() {
                continue;
            }
            sub.catchup(entry).await;
        }
        cursor = last;

        if (page_len as i64) < CATCHUP_PAGE_SIZE {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink(Watermark);

    #[async_trait::async_trait]
    impl CatchupSink for NullSink {
        fn requested_watermark(&self) -> &Watermark {
            &self.0
        }
        async fn catchup(&self, _entry: ChangeLogEntry) {}
        async fn set_caught_up(&self) {}
        async fn fail(&self, _message: String) {}
    }

    #[test]
    fn pending_txn_pos_starts_at_zero() {
        let pending = PendingTxn {
            precommit: Watermark::from_lsn(1),
            pos: 0,
            owner: "task-a".into(),
        };
        assert_eq!(pending.pos, 0);
    }

    #[tokio::test]
    async fn catchup_sink_trait_object_is_usable() {
        let sink: Box<dyn CatchupSink> = Box::new(NullSink(Watermark::zero()));
        assert_eq!(sink.requested_watermark(), &Watermark::zero());
    }
}
