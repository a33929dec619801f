//! Change-streaming broker entrypoint: wires configuration, the Change DB
//! pools, the Storer, the Forwarder, and the websocket transport together
//! and runs the accept loop until shutdown.
//!
//! Grounded on the teacher's `bin/raft_server.rs`: tracing init from the
//! environment, a `watch::channel(false)` shutdown signal set from
//! `ctrl_c`, and the transport loop spawned as a background task that the
//! shutdown signal tears down rather than the main task driving I/O itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use cstream_config::StreamerConfig;
use cstream_store::prelude::*;
use cstream_streamer::prelude::*;
use cstream_transport::prelude::*;
use cstream_types::Watermark;

/// How often `log_diagnostics` runs (§6(added)): a cheap tracing summary,
/// not a scrape target, so a short interval costs nothing external.
const DIAGNOSTICS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = StreamerConfig::load();
    config.validate()?;

    let pg_pool = connect_pg_pool(&config).await?;
    seed_initial_rows(&config).await?;

    let write_pool = TransactionPool::start(pg_pool.clone(), PoolMode::Serializable, 1).await?;
    let read_pool = TransactionPool::start(pg_pool, PoolMode::ReadOnly, 4).await?;

    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool, read_pool, consumed_tx);
    storer.assume_ownership(config.task_id.clone()).await?;

    let pg_config: tokio_postgres::Config = config.database_url.parse()?;
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        config.replication_slot.clone(),
        config.publication_name.clone(),
        config.min_cleanup_delay(),
        config.auto_reset,
    );

    let monitor = Arc::new(BackupMonitor::new(
        config.backup_metrics_url.clone(),
        config.backup_url.clone(),
        config.min_cleanup_delay(),
    ));
    BackupMonitor::spawn_loop(
        monitor.clone(),
        streamer.clone(),
        cstream_streamer::backup_monitor::DEFAULT_SCRAPE_INTERVAL,
    );

    let diagnostics_streamer = streamer.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DIAGNOSTICS_INTERVAL);
        loop {
            interval.tick().await;
            diagnostics_streamer.log_diagnostics().await;
        }
    });

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "cstream-broker listening");

    let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
    let streamer_for_signal = streamer.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        streamer_for_signal.shutdown();
        let _ = shutdown_tx.send(true);
    });

    let service_prefix = Arc::new(config.service_prefix.clone());
    let snapshot_counter = Arc::new(AtomicU64::new(1));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(%err, "accept failed");
                        continue;
                    }
                };
                let streamer = streamer.clone();
                let monitor = monitor.clone();
                let service_prefix = service_prefix.clone();
                let snapshot_counter = snapshot_counter.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, streamer, monitor, service_prefix, snapshot_counter).await
                    {
                        tracing::warn!(%peer, %err, "connection ended with error");
                    }
                });
            }
        }
    }

    tracing::info!("cstream-broker stopped");
    Ok(())
}

async fn connect_pg_pool(config: &StreamerConfig) -> anyhow::Result<PgPool> {
    use bb8_postgres::PostgresConnectionManager;
    use tokio_postgres::NoTls;
    let manager = PostgresConnectionManager::new_from_stringlike(&config.database_url, NoTls)?;
    Ok(bb8::Pool::builder().max_size(8).build(manager).await?)
}

/// Run migrations and seed the singleton `replicationConfig`/
/// `replicationState` rows the first time this process ever starts against
/// a given Change DB — every later start leaves them untouched.
async fn seed_initial_rows(config: &StreamerConfig) -> anyhow::Result<()> {
    use tokio_postgres::NoTls;
    let (mut client, connection) = tokio_postgres::connect(&config.database_url, NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    run_migrations(&mut client).await?;

    client
        .execute(
            r#"INSERT INTO cdc."replicationConfig" (lock, "replicaVersion", publications)
               VALUES (1, $1, $2)
               ON CONFLICT (lock) DO NOTHING"#,
            &[&Watermark::zero().as_str(), &vec![config.publication_name.clone()]],
        )
        .await?;
    client
        .execute(
            r#"INSERT INTO cdc."replicationState" (lock, "lastWatermark", owner)
               VALUES (1, $1, $2)
               ON CONFLICT (lock) DO NOTHING"#,
            &[&Watermark::zero().as_str(), &config.task_id],
        )
        .await?;

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    streamer: ChangeStreamer,
    monitor: Arc<BackupMonitor>,
    service_prefix: Arc<String>,
    snapshot_counter: Arc<AtomicU64>,
) -> anyhow::Result<()> {
    let (upgrade, ws) = cstream_transport::server::accept(stream).await?;

    if upgrade.parsed_path.service_prefix != *service_prefix {
        tracing::warn!(prefix = %upgrade.parsed_path.service_prefix, "unknown service prefix, dropping");
        return Ok(());
    }
    if streamer
        .check_protocol_version(upgrade.parsed_path.protocol_version)
        .is_err()
    {
        tracing::warn!(version = upgrade.parsed_path.protocol_version, "unsupported protocol version");
        return Ok(());
    }

    match upgrade.parsed_path.route {
        RequestedRoute::Changes => {
            let request = upgrade
                .subscribe
                .expect("parse_path only returns Changes with a parsed subscribe query");
            let (sender, mut receiver) = split(ws, DEFAULT_MAX_IN_FLIGHT);
            if request.initial {
                if let Some(task_id) = &request.task_id {
                    monitor.end_reservation(task_id, true).await;
                }
            }
            let subscriber = streamer.subscribe(request, sender).await?;
            // The only upstream frame a subscriber sends is its own acked
            // watermark; everything else (acks to our own pushed frames)
            // is handled transparently inside `FramedReceiver::recv`.
            while let Ok(Some(Inbound::Envelope { msg, .. })) = receiver.recv().await {
                if let Some(status) = cstream_types::UpstreamStatus::from_wire(&msg) {
                    subscriber.note_acked(status.watermark);
                }
            }
            subscriber.close(None);
        }
        RequestedRoute::Snapshot => {
            let task_id = format!("snapshot-{}", snapshot_counter.fetch_add(1, Ordering::SeqCst));
            let mut frames = monitor.start_reservation(task_id.clone());
            let (sender, mut receiver) = split(ws, DEFAULT_MAX_IN_FLIGHT);

            loop {
                tokio::select! {
                    frame = frames.recv() => {
                        match frame {
                            Some(value) => { sender.send(value).await?; }
                            None => break,
                        }
                    }
                    inbound = receiver.recv() => {
                        match inbound {
                            Ok(Some(_)) => continue,
                            Ok(None) | Err(_) => break,
                        }
                    }
                }
            }
            monitor.end_reservation(&task_id, false).await;
        }
    }

    Ok(())
}
