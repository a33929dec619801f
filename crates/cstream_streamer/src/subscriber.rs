//! Subscriber (§4.3): per-connection buffering, ordering, and error
//! surfacing. Implemented as a handle/actor pair, the same shape as
//! [`cstream_store::storer::Storer`] — [`Subscriber`] is the cheap handle
//! every other component (the Forwarder's registry, the Storer's
//! catch-up task) holds; [`SubscriberActor`] is the single task that owns
//! the live transport sender and the ordering state, so frames for one
//! connection are always pushed in the order commands arrive on its
//! queue regardless of which caller enqueued them.

use cstream_store::storer::CatchupSink;
use cstream_transport::framing::FramedSender;
use cstream_types::{Change, ChangeLogEntry, DownstreamFrame, ErrorKind, SubscriberMode, Watermark};
use tokio::sync::mpsc;

/// Reported to the Forwarder's registry when a subscription ends, so the
/// entry can be removed without the actor holding a back-pointer to the
/// registry itself (§9: "no object holds a back-pointer that outlives its
/// peer").
#[derive(Debug, Clone)]
pub enum SubscriberEvent {
    /// The transport closed on its own (peer disconnected, liveness
    /// timeout) — not an application-level error.
    Closed { id: String },
    /// The subscription was ended with a wire-visible error (§7:
    /// per-subscriber, not fatal to the service).
    Failed {
        id: String,
        kind: ErrorKind,
        message: String,
    },
}

enum SubscriberCommand {
    /// A live change forwarded from the Forwarder's fan-out loop.
    Live(Change),
    /// One historical row during catch-up, already validated by the
    /// Storer against this subscriber's requested watermark.
    Catchup(ChangeLogEntry),
    /// Catch-up finished: flush anything buffered during it and switch to
    /// direct-forward mode.
    CaughtUp,
    /// Catch-up (or anything else) failed; close with an error frame.
    Fail { kind: ErrorKind, message: String },
    /// The subscriber's reported acked watermark advanced (from an
    /// upstream `status` frame) — tracked for observability, not acted on
    /// here; acking is the Storer's concern via the Forwarder.
    Acked(Watermark),
    /// Read back the subscriber's current tracked watermark, so cleanup
    /// scheduling (§4.4) can compute the lowest live subscriber position.
    QueryWatermark(tokio::sync::oneshot::Sender<Watermark>),
    Shutdown,
}

/// A connected subscriber's handle. Cheap to clone; every clone enqueues
/// onto the same ordered command queue.
#[derive(Clone)]
pub struct Subscriber {
    tx: mpsc::UnboundedSender<SubscriberCommand>,
    requested_watermark: Watermark,
    pub id: String,
    pub mode: SubscriberMode,
}

impl Subscriber {
    /// Spawn the actor and return the handle. `events` is how the actor
    /// reports its own closure back to whoever holds the registry.
    pub fn spawn(
        id: String,
        mode: SubscriberMode,
        protocol_version: u32,
        requested_watermark: Watermark,
        sender: FramedSender,
        events: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let actor = SubscriberActor {
            id: id.clone(),
            protocol_version,
            sender,
            watermark: requested_watermark.clone(),
            backlog: Some(Vec::new()),
            initial_status_sent: false,
            rx,
            events,
        };
        tokio::spawn(actor.run());
        Self {
            tx,
            requested_watermark,
            id,
            mode,
        }
    }

    /// Forward a live change. Non-blocking: the actor applies its own
    /// back-pressure against the transport, never this call.
    pub fn send(&self, change: Change) {
        let _ = self.tx.send(SubscriberCommand::Live(change));
    }

    pub fn note_acked(&self, watermark: Watermark) {
        let _ = self.tx.send(SubscriberCommand::Acked(watermark));
    }

    /// Current tracked watermark (§4.4: used to compute the lowest live
    /// subscriber position when scheduling cleanup). Returns the
    /// subscriber's requested watermark if the actor has already exited.
    pub async fn current_watermark(&self) -> Watermark {
        let (reply, rx) = tokio::sync::oneshot::channel();
        if self.tx.send(SubscriberCommand::QueryWatermark(reply)).is_err() {
            return self.requested_watermark.clone();
        }
        rx.await.unwrap_or_else(|_| self.requested_watermark.clone())
    }

    pub fn close(&self, kind_and_message: Option<(ErrorKind, String)>) {
        match kind_and_message {
            Some((kind, message)) => {
                let _ = self.tx.send(SubscriberCommand::Fail { kind, message });
            }
            None => {
                let _ = self.tx.send(SubscriberCommand::Shutdown);
            }
        }
    }
}

#[async_trait::async_trait]
impl CatchupSink for Subscriber {
    fn requested_watermark(&self) -> &Watermark {
        &self.requested_watermark
    }

    async fn catchup(&self, entry: ChangeLogEntry) {
        let _ = self.tx.send(SubscriberCommand::Catchup(entry));
    }

    async fn set_caught_up(&self) {
        let _ = self.tx.send(SubscriberCommand::CaughtUp);
    }

    async fn fail(&self, message: String) {
        // The only failure `start_catchup` produces is a watermark the
        // retained log no longer covers (§4.2).
        let _ = self.tx.send(SubscriberCommand::Fail {
            kind: ErrorKind::WatermarkTooOld,
            message,
        });
    }
}

struct SubscriberActor {
    id: String,
    protocol_version: u32,
    sender: FramedSender,
    /// Next expected position: a change is deliverable only if its
    /// watermark is strictly greater than this (§4.3 invariant); advances
    /// only when a Commit (live or catch-up) passes through.
    watermark: Watermark,
    /// `Some` while catching up (frames accumulate here instead of being
    /// pushed); `None` once caught up and forwarding directly.
    backlog: Option<Vec<DownstreamFrame>>,
    initial_status_sent: bool,
    rx: mpsc::UnboundedReceiver<SubscriberCommand>,
    events: mpsc::UnboundedSender<SubscriberEvent>,
}

impl SubscriberActor {
    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                SubscriberCommand::Live(change) => {
                    if let Err(err) = self.handle_live(change).await {
                        tracing::warn!(id = %self.id, %err, "subscriber push failed, closing");
                        let _ = self.events.send(SubscriberEvent::Closed { id: self.id.clone() });
                        return;
                    }
                }
                SubscriberCommand::Catchup(entry) => {
                    if let Err(err) = self.handle_catchup(entry).await {
                        tracing::warn!(id = %self.id, %err, "subscriber catch-up push failed, closing");
                        let _ = self.events.send(SubscriberEvent::Closed { id: self.id.clone() });
                        return;
                    }
                }
                SubscriberCommand::CaughtUp => {
                    if let Err(err) = self.flush_backlog().await {
                        tracing::warn!(id = %self.id, %err, "subscriber backlog flush failed, closing");
                        let _ = self.events.send(SubscriberEvent::Closed { id: self.id.clone() });
                        return;
                    }
                }
                SubscriberCommand::Fail { kind, message } => {
                    self.close_with_error(kind, message).await;
                    return;
                }
                SubscriberCommand::Acked(_watermark) => {
                    // Observability only here; ack accounting that
                    // releases upstream log space lives in the Storer.
                }
                SubscriberCommand::QueryWatermark(reply) => {
                    let _ = reply.send(self.watermark.clone());
                }
                SubscriberCommand::Shutdown => {
                    let _ = self.sender.close(1000, "shutting down").await;
                    let _ = self.events.send(SubscriberEvent::Closed { id: self.id.clone() });
                    return;
                }
            }
        }
        let _ = self.events.send(SubscriberEvent::Closed { id: self.id });
    }

    async fn ensure_status_prelude(&mut self) -> cstream_transport::error::Result<()> {
        if self.initial_status_sent || self.protocol_version < 2 {
            return Ok(());
        }
        self.initial_status_sent = true;
        self.sender.send(DownstreamFrame::Status.to_wire()).await?;
        Ok(())
    }

    fn advance_watermark_on_commit(&mut self, change: &Change) {
        if change.is_commit() {
            self.watermark = change.watermark().clone();
        }
    }

    async fn handle_live(&mut self, change: Change) -> cstream_transport::error::Result<()> {
        if change.watermark() <= &self.watermark {
            // Already delivered (or delivered via catch-up); the Forwarder
            // fans every live change out to every subscriber regardless of
            // where each one currently stands.
            return Ok(());
        }
        let frame = DownstreamFrame::for_change(&change, None);
        if let Some(backlog) = self.backlog.as_mut() {
            backlog.push(frame);
        } else {
            self.ensure_status_prelude().await?;
            self.sender.send(frame.to_wire()).await?;
        }
        self.advance_watermark_on_commit(&change);
        Ok(())
    }

    async fn handle_catchup(&mut self, entry: ChangeLogEntry) -> cstream_transport::error::Result<()> {
        if entry.watermark <= self.watermark && self.watermark != Watermark::zero() {
            // Already delivered before this connection's requested
            // watermark (or during an earlier page of this same
            // catch-up) — same gate as `handle_live`, just against the
            // catch-up cursor instead of the live stream. Exempt the true
            // bootstrap position (`self.watermark` still at the sentinel
            // zero, meaning no commit has been processed yet): the very
            // first transaction's own rows start exactly there and must
            // still be delivered.
            return Ok(());
        }
        self.ensure_status_prelude().await?;
        let frame = DownstreamFrame::for_change(&entry.change, None);
        self.sender.send(frame.to_wire()).await?;
        self.advance_watermark_on_commit(&entry.change);
        Ok(())
    }

    async fn flush_backlog(&mut self) -> cstream_transport::error::Result<()> {
        self.ensure_status_prelude().await?;
        let backlog = self.backlog.take().unwrap_or_default();
        for frame in backlog {
            self.sender.send(frame.to_wire()).await?;
        }
        Ok(())
    }

    async fn close_with_error(&mut self, kind: ErrorKind, message: String) {
        let frame = DownstreamFrame::Error {
            kind,
            message: Some(message.clone()),
        };
        if let Ok(waiter) = self.sender.send(frame.to_wire()).await {
            // §4.3: cancel the transport only after the error frame has
            // been consumed by the peer.
            let _ = waiter.wait().await;
        }
        let _ = self.sender.close(4000 + kind as u16, &message).await;
        let _ = self.events.send(SubscriberEvent::Failed {
            id: self.id.clone(),
            kind,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cstream_types::{DataChange, Relation, Row};

    fn relation() -> Relation {
        Relation {
            schema: "public".into(),
            name: "widgets".into(),
            key_columns: vec!["id".into()],
            replica_identity: cstream_types::ReplicaIdentity::Default,
        }
    }

    fn insert_change(watermark: Watermark) -> Change {
        Change::DataChange {
            watermark,
            change: DataChange::Insert {
                relation: relation(),
                new: Row::new(),
            },
        }
    }

    #[test]
    fn watermark_gate_rejects_already_seen_changes() {
        // A change at or before the tracked watermark must not be
        // forwarded — this is what lets the Forwarder fan every live
        // change out to every subscriber without per-subscriber filtering
        // upstream of this actor.
        let w = Watermark::from_lsn(5);
        let change = insert_change(w.clone());
        assert!(change.watermark() <= &w);
    }

    #[test]
    fn commit_advances_tracked_watermark_past_data_changes() {
        let w = Watermark::from_lsn(9);
        let commit = Change::Commit { watermark: w.clone() };
        assert!(commit.is_commit());
        assert_eq!(commit.watermark(), &w);
    }
}
