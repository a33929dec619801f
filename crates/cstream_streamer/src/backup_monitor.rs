//! BackupMonitor (§4.5): converts external backup-progress observations
//! plus subscriber snapshot reservations into safe `scheduleCleanup` calls.
//!
//! Grounded on the same registry shape as
//! [`cstream_streamer::subscriber`]/the teacher's `ZoneRaftRegistry` — a
//! `DashMap` of live entries (here, reservations) destroyed on end or on
//! transport close (§3 "Lifetimes and ownership").

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, RwLock};

use cstream_types::Watermark;

use crate::forwarder::ChangeStreamer;

/// Prometheus gauge this monitor scrapes for restore progress (§4.5).
const METRIC_NAME: &str = "litestream_replica_progress";

/// Default scrape cadence (§4.5: "timer, ~60s").
pub const DEFAULT_SCRAPE_INTERVAL: Duration = Duration::from_secs(60);

struct ReservationEntry {
    started_at: Instant,
    /// Closed (or dropped) to end the reservation's frame stream when the
    /// transport itself goes away rather than via an explicit `end`.
    frames: mpsc::UnboundedSender<serde_json::Value>,
}

/// Tracks subscriber snapshot reservations and backup-progress
/// observations, and drives `ChangeStreamer::schedule_cleanup`.
pub struct BackupMonitor {
    reservations: DashMap<String, ReservationEntry>,
    /// `cleanupDelay`: extended by `end_reservation` to the longest
    /// observed restore duration so far (§4.5 rationale).
    cleanup_delay: RwLock<Duration>,
    /// `watermark -> backup completion time`, only for watermarks not yet
    /// folded into a scheduled cleanup.
    observed: RwLock<BTreeMap<Watermark, DateTime<Utc>>>,
    metrics_url: Option<String>,
    backup_url: Option<String>,
    http: reqwest::Client,
}

impl BackupMonitor {
    pub fn new(metrics_url: Option<String>, backup_url: Option<String>, min_cleanup_delay: Duration) -> Self {
        Self {
            reservations: DashMap::new(),
            cleanup_delay: RwLock::new(min_cleanup_delay),
            observed: RwLock::new(BTreeMap::new()),
            metrics_url,
            backup_url,
            http: reqwest::Client::new(),
        }
    }

    /// `startSnapshotReservation`: begin (or restart) a reservation for
    /// `task_id`, returning the frame stream whose first element is the
    /// `status{backupUrl}` frame. Active reservations pause cleanup
    /// scheduling for as long as they're outstanding.
    pub fn start_reservation(&self, task_id: String) -> mpsc::UnboundedReceiver<serde_json::Value> {
        // A second reservation for the same task cancels the first
        // (dropping its sender ends that stream for whoever was reading
        // it) rather than running two concurrently.
        self.reservations.remove(&task_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let status = serde_json::json!({
            "tag": "status",
            "backupUrl": self.backup_url,
        });
        let _ = tx.send(status);

        self.reservations.insert(
            task_id,
            ReservationEntry {
                started_at: Instant::now(),
                frames: tx,
            },
        );
        rx
    }

    /// `endReservation`. `update_delay=false` must be used when the
    /// reservation ended by transport closure rather than an explicit
    /// end, per §4.5.
    pub async fn end_reservation(&self, task_id: &str, update_delay: bool) {
        let Some((_, entry)) = self.reservations.remove(task_id) else {
            return;
        };
        if update_delay {
            let elapsed = entry.started_at.elapsed();
            let mut delay = self.cleanup_delay.write().await;
            if elapsed > *delay {
                *delay = elapsed;
            }
        }
    }

    pub fn has_active_reservations(&self) -> bool {
        !self.reservations.is_empty()
    }

    /// Scrape the metrics endpoint and fold any newly observed
    /// watermark into the backup-time map. No-op if no URL is configured.
    async fn scrape(&self) -> Result<(), BackupMonitorError> {
        let Some(url) = &self.metrics_url else {
            return Ok(());
        };
        let body = self
            .http
            .get(url)
            .send()
            .await
            .map_err(BackupMonitorError::Fetch)?
            .text()
            .await
            .map_err(BackupMonitorError::Fetch)?;
        let scraped = prometheus_parse::Scrape::parse(body.lines().map(|l| Ok(l.to_string())))
            .map_err(|e: std::io::Error| BackupMonitorError::Parse(e.to_string()))?;

        let mut observed = self.observed.write().await;
        for sample in scraped.samples {
            if sample.metric != METRIC_NAME {
                continue;
            }
            let prometheus_parse::Value::Gauge(unix_seconds) = sample.value else {
                continue;
            };
            let Some(watermark) = sample.labels.get("watermark") else {
                continue;
            };
            let watermark = Watermark::from_raw(watermark);
            let backup_time = DateTime::<Utc>::from_timestamp(unix_seconds as i64, 0)
                .unwrap_or_else(Utc::now);
            observed
                .entry(watermark)
                .and_modify(|existing| {
                    if backup_time > *existing {
                        *existing = backup_time;
                    }
                })
                .or_insert(backup_time);
        }
        Ok(())
    }

    /// `checkWatermarksAndScheduleCleanup`: scrape, then — if no
    /// reservation is currently active — schedule cleanup up through the
    /// highest watermark whose backup completed at least `cleanupDelay`
    /// ago, and forget every observation at or below it.
    pub async fn check_and_schedule_cleanup(&self, streamer: &ChangeStreamer) {
        if let Err(err) = self.scrape().await {
            tracing::warn!(%err, "backup-metrics scrape failed");
            return;
        }
        if self.has_active_reservations() {
            return;
        }

        let delay = *self.cleanup_delay.read().await;
        let now = Utc::now();
        let mut observed = self.observed.write().await;
        let eligible: Option<Watermark> = observed
            .iter()
            .filter(|(_, backup_time)| {
                now.signed_duration_since(**backup_time)
                    >= chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero())
            })
            .map(|(w, _)| w.clone())
            .max();

        if let Some(watermark) = eligible {
            observed.retain(|w, _| *w > watermark);
            drop(observed);
            streamer.schedule_cleanup(watermark).await;
        }
    }

    /// Spawn the periodic scrape loop (§4.5: "timer, ~60s").
    pub fn spawn_loop(
        monitor: std::sync::Arc<Self>,
        streamer: ChangeStreamer,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                monitor.check_and_schedule_cleanup(&streamer).await;
            }
        })
    }
}

#[derive(Debug, thiserror::Error)]
enum BackupMonitorError {
    #[error("failed to fetch backup metrics: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("failed to parse backup metrics: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ending_a_reservation_without_update_does_not_extend_delay() {
        let monitor = BackupMonitor::new(None, None, Duration::from_secs(30));
        let _rx = monitor.start_reservation("task-1".into());
        tokio::time::sleep(Duration::from_millis(5)).await;
        monitor.end_reservation("task-1", false).await;
        assert_eq!(*monitor.cleanup_delay.read().await, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn ending_a_reservation_with_update_extends_delay_to_elapsed() {
        let monitor = BackupMonitor::new(None, None, Duration::from_millis(1));
        let _rx = monitor.start_reservation("task-1".into());
        tokio::time::sleep(Duration::from_millis(20)).await;
        monitor.end_reservation("task-1", true).await;
        assert!(*monitor.cleanup_delay.read().await >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn second_reservation_for_same_task_cancels_first() {
        let monitor = BackupMonitor::new(None, Some("s3://bucket/backup".into()), Duration::from_secs(1));
        let mut first = monitor.start_reservation("task-1".into());
        let _second = monitor.start_reservation("task-1".into());
        // The first stream's sender was dropped when the second
        // reservation replaced it, so it now reads as closed.
        assert!(first.recv().await.is_some()); // initial status frame still buffered
        assert!(first.recv().await.is_none());
    }

    #[tokio::test]
    async fn active_reservation_blocks_cleanup_scheduling() {
        let monitor = BackupMonitor::new(None, None, Duration::from_secs(0));
        let _rx = monitor.start_reservation("task-1".into());
        assert!(monitor.has_active_reservations());
    }
}
