//! Environment-driven configuration for the change-streaming broker.
//!
//! This is deliberately a small struct, not a CLI subcommand tree — §1
//! names "configuration loading and CLI" as an external collaborator, so
//! the surface here only covers what the wire/environment contract in §6
//! actually names (`DATABASE_URL`, the backup-metrics endpoint, the
//! optional backup URL, `--auto-reset`) plus the handful of knobs the
//! streamer needs to bind a listener and talk to the Change DB.
//!
//! Uses `clap`'s `env` feature the way `cstream_types`' sibling crates use
//! `clap` elsewhere in the workspace's binaries — one `Parser` derive,
//! fields pull from either a flag or its matching environment variable.

use std::time::Duration;

use clap::Parser;
use url::Url;

use cstream_types::Watermark;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL for {field}: {source}")]
    InvalidUrl {
        field: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// The change-streamer's full runtime configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "cstream-broker")]
#[command(about = "Change-streaming broker: consumes a logical-replication stream and fans it out to subscribers")]
pub struct StreamerConfig {
    /// Postgres connection string for both the replication session and the
    /// Change DB transaction pool.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Name of the logical-replication slot to stream from.
    #[arg(long, env = "REPLICATION_SLOT", default_value = "cdc_streamer")]
    pub replication_slot: String,

    /// Name of the publication the replication slot was created against.
    #[arg(long, env = "PUBLICATION_NAME", default_value = "cdc_publication")]
    pub publication_name: String,

    /// Address the websocket transport listens on.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:9200")]
    pub listen_addr: String,

    /// Path prefix subscribers connect under: `/{prefix}/v{N}/changes`.
    #[arg(long, env = "SERVICE_PREFIX", default_value = "cdc")]
    pub service_prefix: String,

    /// URL of a Prometheus-style metrics endpoint the `BackupMonitor`
    /// scrapes for `litestream_replica_progress` (§4.5). Optional: when
    /// unset, cleanup is still scheduled, just with no backup-coordinated
    /// floor beyond `min_cleanup_delay_ms`.
    #[arg(long, env = "BACKUP_METRICS_URL")]
    pub backup_metrics_url: Option<String>,

    /// Advertised URL of the backup artifact the `snapshot` reservation
    /// frame reports to a restoring subscriber.
    #[arg(long, env = "BACKUP_URL")]
    pub backup_url: Option<String>,

    /// Minimum delay `scheduleCleanup` waits before purging a watermark,
    /// regardless of backup-derived delay (§4.4, §9 Open Questions).
    #[arg(long, env = "CLEANUP_DELAY_MS", default_value_t = 30_000)]
    pub min_cleanup_delay_ms: u64,

    /// If set, a `resetRequired=true` row or an upstream reset signal
    /// tears the service down immediately instead of merely logging it,
    /// so an external supervisor can wipe and re-initialize the replica
    /// (§6: "`--auto-reset` flag").
    #[arg(long, env = "AUTO_RESET", default_value_t = false)]
    pub auto_reset: bool,

    /// The task id this process identifies itself as when contending for
    /// changeLog write ownership.
    #[arg(long, env = "TASK_ID", default_value = "cstream-broker")]
    pub task_id: String,
}

impl StreamerConfig {
    /// Parse from `std::env::args()` and the process environment.
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn min_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.min_cleanup_delay_ms)
    }

    /// Validate that configured URLs actually parse, surfacing a clear
    /// error before any connection attempt rather than an opaque I/O
    /// failure deep in `cstream_source`/`cstream_streamer`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Url::parse(&self.database_url).map_err(|source| ConfigError::InvalidUrl {
            field: "database_url",
            source,
        })?;
        if let Some(url) = &self.backup_metrics_url {
            Url::parse(url).map_err(|source| ConfigError::InvalidUrl {
                field: "backup_metrics_url",
                source,
            })?;
        }
        Ok(())
    }

    /// The watermark to resume replication from on initial sync, before
    /// any commit has ever been durably stored: the sentinel zero
    /// watermark, matching `ReplicationState::fresh`.
    pub fn fresh_replica_version(&self) -> Watermark {
        Watermark::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_args() {
        let config = StreamerConfig::parse_from([
            "cstream-broker",
            "--database-url",
            "postgres://localhost/cdc",
        ]);
        assert_eq!(config.database_url, "postgres://localhost/cdc");
        assert_eq!(config.min_cleanup_delay_ms, 30_000);
        assert!(!config.auto_reset);
    }

    #[test]
    fn validate_rejects_malformed_database_url() {
        let config = StreamerConfig::parse_from([
            "cstream-broker",
            "--database-url",
            "not a url",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_urls() {
        let config = StreamerConfig::parse_from([
            "cstream-broker",
            "--database-url",
            "postgres://localhost/cdc",
            "--backup-metrics-url",
            "http://localhost:9090/metrics",
        ]);
        assert!(config.validate().is_ok());
    }
}
