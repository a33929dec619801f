//! Integration tests exercising the seed scenarios (forward+store,
//! catch-up across restart, watermark-too-old, wrong replica version,
//! backup-coordinated cleanup) against a real Postgres instance.
//!
//! Gated on `DATABASE_URL`, the same convention the teacher's
//! `test_grpc_cluster` uses for its Docker-backed cluster test: the test
//! skips (rather than fails) when the environment it needs isn't present,
//! since spinning up Postgres is the CI job's responsibility, not this
//! binary's.

use std::time::Duration;

use bb8_postgres::PostgresConnectionManager;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_postgres::NoTls;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use cstream_store::pool::{PgPool, PoolMode, TransactionPool};
use cstream_store::schema::run_migrations;
use cstream_store::storer::Storer;
use cstream_streamer::forwarder::ChangeStreamer;
use cstream_transport::framing;
use cstream_types::{SubscribeRequest, SubscriberMode, Watermark};

fn database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

async fn connect_raw(database_url: &str) -> tokio_postgres::Client {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

/// Fresh `cdc.*` schema, migrated, with a singleton `replicationConfig` row
/// at `replicaVersion = 0` and a `replicationState` row owned by this test.
/// Returns the raw `bb8` pool; callers start their own `TransactionPool`s on
/// top of it so seed writes can be committed before the read-only pool
/// exports its shared snapshot.
async fn provision(database_url: &str) -> PgPool {
    let mut client = connect_raw(database_url).await;
    client.batch_execute("DROP SCHEMA IF EXISTS cdc CASCADE").await.unwrap();
    run_migrations(&mut client).await.unwrap();
    client
        .execute(
            r#"INSERT INTO cdc."replicationConfig" (lock, "replicaVersion", publications)
               VALUES (1, $1, ARRAY['cdc_publication'])"#,
            &[&Watermark::zero().as_str()],
        )
        .await
        .unwrap();
    client
        .execute(
            r#"INSERT INTO cdc."replicationState" (lock, "lastWatermark", owner)
               VALUES (1, $1, 'test-owner')"#,
            &[&Watermark::zero().as_str()],
        )
        .await
        .unwrap();

    let manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls).unwrap();
    bb8::Pool::builder().max_size(8).build(manager).await.unwrap()
}

/// Start a single-worker write pool, seed it with `rows`, commit, then start
/// a read pool on the same `pg_pool` — only after the commit, so the
/// read-only worker's exported snapshot sees the seeded rows.
async fn seeded_pools(
    pg_pool: PgPool,
    rows: Vec<(Watermark, i64, cstream_types::Change, Option<Watermark>)>,
) -> (TransactionPool, TransactionPool) {
    let write_pool = TransactionPool::start(pg_pool.clone(), PoolMode::Serializable, 1)
        .await
        .unwrap();
    if !rows.is_empty() {
        for (watermark, pos, change, precommit) in rows {
            write_pool
                .insert_change_log_row(watermark, pos, change, precommit)
                .await
                .unwrap();
        }
        write_pool.commit().await.unwrap();
    }
    let read_pool = TransactionPool::start(pg_pool, PoolMode::ReadOnly, 2).await.unwrap();
    (write_pool, read_pool)
}

/// A loopback websocket pair: `server` is what `cstream_transport::framing`
/// wraps (the side under test); `client` is read/written directly in tests
/// to stand in for a subscriber.
async fn websocket_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server_task = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    });
    let tcp = TcpStream::connect(addr).await.unwrap();
    let (client, _response) = tokio_tungstenite::client_async(format!("ws://{addr}/"), tcp)
        .await
        .unwrap();
    let server = server_task.await.unwrap();
    (server, client)
}

/// Read the next application frame off the client side, acking it so any
/// `ConsumedWaiter` on the server side resolves.
async fn recv_and_ack(client: &mut WebSocketStream<TcpStream>) -> serde_json::Value {
    loop {
        match client.next().await.unwrap().unwrap() {
            WsMessage::Text(text) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                let id = value["id"].as_u64().unwrap();
                client
                    .send(WsMessage::Text(
                        serde_json::json!({"ack": id}).to_string().into(),
                    ))
                    .await
                    .unwrap();
                return value["msg"].clone();
            }
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

fn request(id: &str, replica_version: &str, watermark: &str, initial: bool) -> SubscribeRequest {
    SubscribeRequest {
        protocol_version: 2,
        id: id.to_string(),
        replica_version: Watermark::from_raw(replica_version),
        watermark: Watermark::from_raw(watermark),
        initial,
        task_id: None,
        mode: SubscriberMode::Serving,
    }
}

#[tokio::test]
async fn wrong_replica_version_closes_with_error_frame() {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pg_pool = provision(&database_url).await;
    let (write_pool, read_pool) = seeded_pools(pg_pool, Vec::new()).await;
    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool, read_pool, consumed_tx);
    let pg_config: tokio_postgres::Config = database_url.parse().unwrap();
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        "cdc_streamer_test_slot",
        "cdc_publication",
        Duration::from_millis(50),
        false,
    );

    let (server, mut client) = websocket_pair().await;
    let (sender, _receiver) = framing::split(server, framing::DEFAULT_MAX_IN_FLIGHT);

    let req = request("sub-1", "deadbeef", "0", false);
    streamer.subscribe(req, sender).await.unwrap();

    let frame = recv_and_ack(&mut client).await;
    assert_eq!(frame[0], "error");
    assert_eq!(frame[1]["type"], 1);
}

#[tokio::test]
async fn watermark_too_old_closes_with_error_frame() {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pg_pool = provision(&database_url).await;

    // The retained log starts at lsn 1, not at zero, so a subscriber asking
    // to resume from zero falls outside what catch-up can serve.
    let (write_pool, read_pool) = seeded_pools(
        pg_pool,
        vec![(
            Watermark::from_lsn(1),
            0,
            cstream_types::Change::Commit { watermark: Watermark::from_lsn(1) },
            Some(Watermark::zero()),
        )],
    )
    .await;

    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool, read_pool, consumed_tx);
    let pg_config: tokio_postgres::Config = database_url.parse().unwrap();
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        "cdc_streamer_test_slot",
        "cdc_publication",
        Duration::from_millis(50),
        false,
    );

    let (server, mut client) = websocket_pair().await;
    let (sender, _receiver) = framing::split(server, framing::DEFAULT_MAX_IN_FLIGHT);

    let req = request("sub-2", Watermark::zero().as_str(), Watermark::zero().as_str(), false);
    streamer.subscribe(req, sender).await.unwrap();

    let frame = recv_and_ack(&mut client).await;
    assert_eq!(frame[0], "error");
    assert_eq!(frame[1]["type"], 2);
}

#[tokio::test]
async fn catch_up_delivers_rows_in_commit_order() {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pg_pool = provision(&database_url).await;

    let begin = Watermark::zero();
    let commit = Watermark::from_lsn(20);
    let (write_pool, read_pool) = seeded_pools(
        pg_pool,
        vec![
            (begin.clone(), 0, cstream_types::Change::Begin { watermark: begin }, None),
            (
                commit.clone(),
                1,
                cstream_types::Change::Commit { watermark: commit.clone() },
                Some(Watermark::zero()),
            ),
        ],
    )
    .await;

    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool, read_pool, consumed_tx);
    let pg_config: tokio_postgres::Config = database_url.parse().unwrap();
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        "cdc_streamer_test_slot_2",
        "cdc_publication",
        Duration::from_millis(50),
        false,
    );

    let (server, mut client) = websocket_pair().await;
    let (sender, _receiver) = framing::split(server, framing::DEFAULT_MAX_IN_FLIGHT);

    let req = request("sub-3", Watermark::zero().as_str(), Watermark::zero().as_str(), true);
    streamer.subscribe(req, sender).await.unwrap();

    let first = recv_and_ack(&mut client).await;
    assert_eq!(first[0], "status");
    let second = recv_and_ack(&mut client).await;
    assert_eq!(second[0], "begin");
    let third = recv_and_ack(&mut client).await;
    assert_eq!(third[0], "commit");
    assert_eq!(third[2]["watermark"], commit.to_string());
}

/// Seed scenario 2: log contains commits at two positions; a subscriber
/// resuming from the earlier one must receive only the later transaction,
/// not a redelivery of the transaction it already has.
#[tokio::test]
async fn catch_up_does_not_redeliver_an_already_committed_transaction() {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pg_pool = provision(&database_url).await;

    let precommit_a = Watermark::from_lsn(1);
    let commit_a = Watermark::from_lsn(3);
    let precommit_b = Watermark::from_lsn(4);
    let commit_b = Watermark::from_lsn(6);
    let (write_pool, read_pool) = seeded_pools(
        pg_pool,
        vec![
            (
                precommit_a.clone(),
                0,
                cstream_types::Change::Begin { watermark: precommit_a.clone() },
                None,
            ),
            (
                commit_a.clone(),
                1,
                cstream_types::Change::Commit { watermark: commit_a.clone() },
                Some(precommit_a),
            ),
            (
                precommit_b.clone(),
                0,
                cstream_types::Change::Begin { watermark: precommit_b.clone() },
                None,
            ),
            (
                commit_b.clone(),
                1,
                cstream_types::Change::Commit { watermark: commit_b.clone() },
                Some(precommit_b),
            ),
        ],
    )
    .await;

    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool, read_pool, consumed_tx);
    let pg_config: tokio_postgres::Config = database_url.parse().unwrap();
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        "cdc_streamer_test_slot_4",
        "cdc_publication",
        Duration::from_millis(50),
        false,
    );

    let (server, mut client) = websocket_pair().await;
    let (sender, _receiver) = framing::split(server, framing::DEFAULT_MAX_IN_FLIGHT);

    // Already has transaction A (committed at 3); resuming from there
    // should surface only transaction B.
    let req = request("sub-4", Watermark::zero().as_str(), commit_a.as_str(), true);
    streamer.subscribe(req, sender).await.unwrap();

    let first = recv_and_ack(&mut client).await;
    assert_eq!(first[0], "status");
    let second = recv_and_ack(&mut client).await;
    assert_eq!(second[0], "begin");
    let third = recv_and_ack(&mut client).await;
    assert_eq!(third[0], "commit");
    assert_eq!(third[2]["watermark"], commit_b.to_string());
}

#[tokio::test]
async fn backup_coordinated_cleanup_respects_min_delay() {
    let Some(database_url) = database_url() else {
        eprintln!("skipping: DATABASE_URL not set");
        return;
    };
    let pg_pool = provision(&database_url).await;
    let (write_pool, read_pool) = seeded_pools(
        pg_pool,
        vec![(
            Watermark::from_lsn(1),
            0,
            cstream_types::Change::Commit { watermark: Watermark::from_lsn(1) },
            Some(Watermark::zero()),
        )],
    )
    .await;
    write_pool
        .advance_last_watermark("test-owner".to_string(), Watermark::from_lsn(2))
        .await
        .unwrap();

    // Read back through `write_pool` itself rather than `read_pool`: the
    // purge this test triggers runs on the write worker's own connection
    // and is visible there immediately, without depending on a
    // read-only snapshot that was pinned before the purge happened.
    let still_present = write_pool
        .cursor_page(Watermark::from_lsn(0), None, 10)
        .await
        .unwrap();
    assert_eq!(still_present.len(), 1);

    let (consumed_tx, consumed_rx) = tokio::sync::mpsc::unbounded_channel();
    let storer = Storer::spawn(write_pool.clone(), read_pool, consumed_tx);
    let pg_config: tokio_postgres::Config = database_url.parse().unwrap();
    let streamer = ChangeStreamer::new(
        storer,
        consumed_rx,
        pg_config,
        "cdc_streamer_test_slot_3",
        "cdc_publication",
        Duration::from_millis(10),
        false,
    );

    streamer.schedule_cleanup(Watermark::from_lsn(2)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let purged = write_pool
        .cursor_page(Watermark::from_lsn(0), None, 10)
        .await
        .unwrap();
    assert!(purged.is_empty());
}
