//! Per-message ack framing (§4.6).
//!
//! Every outbound application frame is wrapped `{id, msg}` with `id`
//! monotonically increasing from 1. The peer's only reply on that channel
//! is `{ack: id}`. We track in-flight ids in a FIFO-ish map so a consumer
//! can await "this specific frame was consumed" without blocking behind
//! frames sent after it, while a bounded semaphore caps how many sends may
//! be outstanding at once — this is the application-level back-pressure
//! mechanism described in §4.6 and §9 ("use explicit per-message ids with
//! peer acks rather than relying on OS socket buffers").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Semaphore};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, TransportError};

/// Default bound on in-flight (unacked) outbound frames before `send`
/// starts blocking the caller. This is the "bounded in-flight" queue
/// depth §9 wants observable and capped.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 256;

/// Liveness: ping every 30s, drop the connection if nothing is heard back
/// within this extra buffer (§4.6: "30s + ~3s buffer").
pub const PING_INTERVAL: Duration = Duration::from_secs(30);
pub const PING_GRACE: Duration = Duration::from_secs(3);

type WsStream = WebSocketStream<TcpStream>;

/// Resolves once the peer has acked the frame it was returned for.
pub struct ConsumedWaiter(oneshot::Receiver<()>);

impl ConsumedWaiter {
    pub async fn wait(self) -> Result<()> {
        self.0.await.map_err(|_| TransportError::Closed)
    }
}

struct PendingAcks {
    next_id: AtomicU64,
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    in_flight: Semaphore,
}

impl PendingAcks {
    fn new(max_in_flight: usize) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            in_flight: Semaphore::new(max_in_flight),
        }
    }

    fn resolve(&self, ack: u64) {
        // Ids are assigned in send order and the peer is expected to ack
        // them in receipt order, but we resolve by exact id rather than
        // assuming strict FIFO so an out-of-order ack (possible if the
        // peer pipelines its own processing) still releases the right
        // waiter instead of the wrong one.
        if let Some(tx) = self.waiters.lock().remove(&ack) {
            let _ = tx.send(());
        }
        self.in_flight.add_permits(1);
    }
}

/// The sending half of a framed connection. Cloneable — all clones share
/// the same outbound sink via an internal mutex, since `SplitSink` only
/// supports one writer at a time but multiple logical producers (the
/// Storer's push path and the periodic ping task) need to share it.
pub struct FramedSender {
    sink: Arc<tokio::sync::Mutex<SplitSink<WsStream, WsMessage>>>,
    pending: Arc<PendingAcks>,
}

impl Clone for FramedSender {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            pending: self.pending.clone(),
        }
    }
}

impl FramedSender {
    /// Send an application frame, tracking it for ack. Blocks (without
    /// holding the sink lock) until a permit is available if
    /// `max_in_flight` unacked frames are already outstanding.
    pub async fn send(&self, msg: serde_json::Value) -> Result<ConsumedWaiter> {
        let permit = self
            .pending
            .in_flight
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::Closed)?;
        permit.forget(); // released explicitly in `PendingAcks::resolve`

        let id = self.pending.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.waiters.lock().insert(id, tx);

        let envelope = serde_json::json!({"id": id, "msg": msg});
        let text = serde_json::to_string(&envelope)?;

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
            drop(sink);
            // Sending failed: the waiter will never be acked naturally,
            // so drop it immediately rather than leaking a permit.
            self.pending.waiters.lock().remove(&id);
            self.pending.in_flight.add_permits(1);
            return Err(e.into());
        }

        Ok(ConsumedWaiter(rx))
    }

    /// Reply with `{ack: id}` to an inbound envelope we've finished
    /// processing. Not tracked for ack itself — acks are never acked.
    pub async fn send_ack(&self, id: u64) -> Result<()> {
        let text = serde_json::to_string(&serde_json::json!({"ack": id}))?;
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Text(text.into())).await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(WsMessage::Ping(Vec::new().into())).await?;
        Ok(())
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<()> {
        use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame};
        let reason = crate::error::truncate_close_reason(reason);
        let mut sink = self.sink.lock().await;
        let _ = sink
            .send(WsMessage::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })))
            .await;
        Ok(())
    }
}

/// An inbound item after ack-bookkeeping has been applied: plain `Ack`
/// frames are consumed internally (they resolve a waiter and never reach
/// the caller); everything else is handed back so the caller can process
/// it and then call [`FramedSender::send_ack`].
#[derive(Debug, Clone)]
pub enum Inbound {
    Envelope { id: u64, msg: serde_json::Value },
}

pub struct FramedReceiver {
    stream: SplitStream<WsStream>,
    pending: Arc<PendingAcks>,
    last_activity: std::time::Instant,
}

impl FramedReceiver {
    /// Read the next application envelope, transparently resolving any
    /// `Ack`/`Pong`/`Ping` frames encountered along the way. Returns
    /// `Ok(None)` on a clean close.
    pub async fn recv(&mut self) -> Result<Option<Inbound>> {
        loop {
            let next = tokio::time::timeout(PING_INTERVAL + PING_GRACE, self.stream.next()).await;
            let msg = match next {
                Ok(Some(msg)) => msg?,
                Ok(None) => return Ok(None),
                Err(_) => return Err(TransportError::LivenessTimeout),
            };
            self.last_activity = std::time::Instant::now();

            match msg {
                WsMessage::Text(text) => {
                    let value: serde_json::Value = serde_json::from_str(&text)?;
                    if let Some(ack) = value.get("ack").and_then(|v| v.as_u64()) {
                        self.pending.resolve(ack);
                        continue;
                    }
                    let id = value
                        .get("id")
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| TransportError::MalformedRequest("frame missing id".into()))?;
                    let payload = value
                        .get("msg")
                        .cloned()
                        .ok_or_else(|| TransportError::MalformedRequest("frame missing msg".into()))?;
                    return Ok(Some(Inbound::Envelope { id, msg: payload }));
                }
                WsMessage::Binary(_) | WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {
                    continue;
                }
                WsMessage::Close(_) => return Ok(None),
            }
        }
    }
}

/// Split a raw websocket stream into a framed sender/receiver pair
/// sharing one ack-tracking table.
pub fn split(stream: WsStream, max_in_flight: usize) -> (FramedSender, FramedReceiver) {
    let (sink, source) = stream.split();
    let pending = Arc::new(PendingAcks::new(max_in_flight));
    (
        FramedSender {
            sink: Arc::new(tokio::sync::Mutex::new(sink)),
            pending: pending.clone(),
        },
        FramedReceiver {
            stream: source,
            pending,
            last_activity: std::time::Instant::now(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_in_flight_bound_is_reasonable() {
        assert!(DEFAULT_MAX_IN_FLIGHT >= 16);
    }

    #[test]
    fn ping_grace_keeps_total_under_a_minute() {
        assert!(PING_INTERVAL + PING_GRACE < Duration::from_secs(60));
    }
}
