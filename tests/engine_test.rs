//! Integration tests for the delivery engine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use outbox_sender::broker::memory::Fault;
use outbox_sender::broker::{BrokerPort, CONTENT_TYPE, InMemoryBroker};
use outbox_sender::config::OutboxConfig;
use outbox_sender::engine::{Outbox, Redeliverer};
use outbox_sender::error::{Error, Stage};
use outbox_sender::model::Destination;
use outbox_sender::storage::QueueStore;
use serde_json::json;
use tempfile::TempDir;

fn open_outbox(path: &Path, broker: &InMemoryBroker) -> Outbox<InMemoryBroker> {
    let config = OutboxConfig::new("me", "hello", path);
    Outbox::open(&config, broker.clone()).expect("failed to open outbox")
}

fn setup() -> (TempDir, InMemoryBroker, Outbox<InMemoryBroker>) {
    let dir = tempfile::tempdir().unwrap();
    let broker = InMemoryBroker::new();
    let outbox = open_outbox(&dir.path().join("output_queue.json"), &broker);
    (dir, broker, outbox)
}

/// Queue `payloads` while the broker is down, then bring it back.
async fn queue_offline(
    broker: &InMemoryBroker,
    outbox: &Outbox<InMemoryBroker>,
    payloads: &[&str],
) {
    broker.set_offline(true);
    for p in payloads {
        let err = outbox.send_raw(p.to_string()).await.unwrap_err();
        assert_eq!(err.stage(), Stage::Connect);
    }
    broker.set_offline(false);
}

fn contents(outbox: &Outbox<InMemoryBroker>) -> Vec<String> {
    outbox
        .entries()
        .unwrap()
        .into_iter()
        .map(|e| e.content)
        .collect()
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_round_trip_publishes_once_and_empties_store() {
    let (_dir, broker, outbox) = setup();
    let payload = json!({"text": "sometext", "number": 12, "json": {"text": "moretext"}});

    let report = outbox.send(&payload).await.unwrap();

    assert_eq!(report.drained.delivered, 1);
    assert_eq!(outbox.pending().unwrap(), 0);

    let published = broker.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].content, serde_json::to_string(&payload).unwrap());
    assert_eq!(published[0].destination, Destination::new("me", "hello"));
    assert_eq!(published[0].content_type, "application/json");
}

#[tokio::test]
async fn each_attempt_opens_and_closes_its_own_connection() {
    let (_dir, broker, outbox) = setup();

    for n in 0..3 {
        outbox.send(&json!({ "number": n })).await.unwrap();
    }

    assert_eq!(broker.connects(), 3);
    assert_eq!(broker.closes(), 3);
}

#[tokio::test]
async fn drain_on_empty_store_sends_nothing() {
    let (_dir, broker, outbox) = setup();

    let report = outbox.drain().await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(report.to_string(), "nothing to send");
    assert_eq!(broker.connects(), 0);
}

// ---------------------------------------------------------------------------
// Ordering and failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn delivery_follows_enqueue_order() {
    let (_dir, broker, outbox) = setup();
    let payloads = ["a", "b", "c", "d", "e"];
    queue_offline(&broker, &outbox, &payloads).await;

    let report = outbox.drain().await.unwrap();

    assert_eq!(report.delivered, 5);
    assert_eq!(broker.published_contents(), payloads.map(String::from).to_vec());
}

#[tokio::test]
async fn failed_send_keeps_the_message_queued() {
    let (_dir, broker, outbox) = setup();
    broker.set_offline(true);

    let err = outbox.send(&json!({"text": "later"})).await.unwrap_err();

    assert!(matches!(err, Error::Connect(_)), "got {err:?}");
    assert!(err.is_recoverable());
    assert_eq!(outbox.pending().unwrap(), 1);
}

#[tokio::test]
async fn nack_on_head_stops_drain_and_leaves_queue_untouched() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["A", "B", "C"]).await;
    broker.push_fault(Fault::Nack);

    let err = outbox.drain().await.unwrap_err();

    assert!(matches!(err, Error::Nack(_)), "got {err:?}");
    assert_eq!(broker.publish_attempts(), 1);
    assert!(broker.published().is_empty());
    assert_eq!(contents(&outbox), vec!["A", "B", "C"]);
    // The connection is closed even though the publish was refused.
    assert_eq!(broker.connects(), broker.closes());
}

#[tokio::test]
async fn publish_error_keeps_entries_for_the_next_drain() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["A", "B", "C"]).await;

    // The first publish consumes the fault, so A is the one that fails.
    broker.push_fault(Fault::PublishError);
    let err = outbox.drain().await;
    assert!(matches!(err, Err(Error::Publish(_))));
    assert_eq!(contents(&outbox), vec!["A", "B", "C"]);

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.delivered, 3);
    assert_eq!(broker.published_contents(), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn refused_connection_reports_connect_stage() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["A"]).await;
    broker.push_fault(Fault::RefuseConnect);

    let err = outbox.drain().await.unwrap_err();

    assert_eq!(err.stage(), Stage::Connect);
    assert_eq!(broker.publish_attempts(), 0);
    assert_eq!(outbox.pending().unwrap(), 1);
}

#[tokio::test]
async fn later_send_flushes_earlier_backlog_first() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["old-1", "old-2"]).await;

    let report = outbox.send_raw("new".to_string()).await.unwrap();

    assert_eq!(report.drained.delivered, 3);
    assert_eq!(broker.published_contents(), vec!["old-1", "old-2", "new"]);
}

// ---------------------------------------------------------------------------
// Storage failures
// ---------------------------------------------------------------------------

/// A directory on the store's temp path makes every rewrite fail.
fn block_store_writes(dir: &TempDir) -> std::path::PathBuf {
    let tmp = dir.path().join(".output_queue.json.tmp");
    std::fs::create_dir(&tmp).unwrap();
    tmp
}

#[tokio::test]
async fn failed_enqueue_reports_storage_and_never_connects() {
    let (dir, broker, outbox) = setup();
    block_store_writes(&dir);

    let err = outbox.send_raw("lost".to_string()).await.unwrap_err();

    assert_eq!(err.stage(), Stage::Storage);
    assert!(!err.is_recoverable());
    assert_eq!(broker.connects(), 0);
    assert_eq!(outbox.pending().unwrap(), 0);
}

#[tokio::test]
async fn failed_removal_after_ack_keeps_entry_at_head() {
    let (dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["A", "B"]).await;
    let blocker = block_store_writes(&dir);

    let err = outbox.drain().await.unwrap_err();

    assert_eq!(err.stage(), Stage::Storage);
    assert_eq!(broker.published_contents(), vec!["A"]);
    assert_eq!(contents(&outbox), vec!["A", "B"]);

    // Once the store is writable again the acked head goes out a second time.
    std::fs::remove_dir(&blocker).unwrap();
    let report = outbox.drain().await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(broker.published_contents(), vec!["A", "A", "B"]);
    assert_eq!(outbox.pending().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Durability across restarts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn undelivered_entries_survive_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("output_queue.json");
    let broker = InMemoryBroker::new();

    let before = {
        let outbox = open_outbox(&path, &broker);
        queue_offline(&broker, &outbox, &["1", "2", "3", "4"]).await;
        outbox.entries().unwrap()
    };

    let store = QueueStore::open(&path).unwrap();
    assert_eq!(store.entries(), before.as_slice());

    let outbox = open_outbox(&path, &broker);
    outbox.drain().await.unwrap();
    assert_eq!(broker.published_contents(), vec!["1", "2", "3", "4"]);
}

#[tokio::test]
async fn ack_without_removal_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("output_queue.json");
    let broker = InMemoryBroker::new();
    let destination = Destination::new("me", "hello");

    // Publish and ack by hand, then "crash" before the entry is removed.
    {
        let mut store = QueueStore::open(&path).unwrap();
        store.push_raw("payload".to_string()).unwrap();
        let entry = store.peek_oldest().unwrap().clone();

        let mut conn = broker.connect("amqp://test").await.unwrap();
        broker
            .publish(&mut conn, &destination, CONTENT_TYPE, &entry.content)
            .await
            .unwrap();
        broker.close(conn).await;
    }

    let outbox = open_outbox(&path, &broker);
    assert_eq!(outbox.pending().unwrap(), 1);

    outbox.drain().await.unwrap();
    assert_eq!(broker.published_contents(), vec!["payload", "payload"]);
    assert_eq!(outbox.pending().unwrap(), 0);
}

#[tokio::test]
async fn unreadable_store_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("output_queue.json");
    std::fs::write(&path, "{ broken").unwrap();

    let config = OutboxConfig::new("me", "hello", &path);
    let result = Outbox::open(&config, InMemoryBroker::new());

    assert!(matches!(result, Err(Error::StorageInit { .. })));
}

// ---------------------------------------------------------------------------
// Mutual exclusion
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_drains_never_overlap() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["a", "b", "c", "d", "e"]).await;
    broker.set_publish_delay(Duration::from_millis(20));

    let outbox = Arc::new(outbox);
    let first = tokio::spawn({
        let outbox = Arc::clone(&outbox);
        async move { outbox.drain().await }
    });
    let second = tokio::spawn({
        let outbox = Arc::clone(&outbox);
        async move { outbox.drain().await }
    });

    let a = first.await.unwrap().unwrap();
    let b = second.await.unwrap().unwrap();

    assert_eq!(a.delivered + b.delivered, 5);
    assert_eq!(broker.max_in_flight(), 1);
    assert_eq!(broker.published_contents(), vec!["a", "b", "c", "d", "e"]);
    assert_eq!(outbox.pending().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sends_deliver_every_message_exactly_once() {
    let (_dir, broker, outbox) = setup();
    broker.set_publish_delay(Duration::from_millis(5));
    let outbox = Arc::new(outbox);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let outbox = Arc::clone(&outbox);
            tokio::spawn(async move { outbox.send(&json!({ "number": i })).await })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mut published = broker.published_contents();
    published.sort();
    let mut expected: Vec<String> = (0..10)
        .map(|i| json!({ "number": i }).to_string())
        .collect();
    expected.sort();

    assert_eq!(published, expected);
    assert_eq!(broker.max_in_flight(), 1);
    assert_eq!(outbox.pending().unwrap(), 0);
}

// ---------------------------------------------------------------------------
// Redelivery loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn redeliverer_flushes_backlog_once_broker_returns() {
    let (_dir, broker, outbox) = setup();
    queue_offline(&broker, &outbox, &["x", "y"]).await;
    broker.set_offline(true);

    let outbox = Arc::new(outbox);
    let redeliverer = Redeliverer::new(Arc::clone(&outbox), Duration::from_millis(10));
    let handle = tokio::spawn({
        let r = redeliverer.clone();
        async move { r.run().await }
    });

    // A few failing ticks, then the broker comes back.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(outbox.pending().unwrap(), 2);
    broker.set_offline(false);

    tokio::time::timeout(Duration::from_secs(5), async {
        while outbox.pending().unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backlog was not redelivered");

    redeliverer.shutdown();
    handle.await.unwrap().unwrap();
    assert_eq!(broker.published_contents(), vec!["x", "y"]);
}

#[tokio::test]
async fn redeliverer_stops_when_shutdown_precedes_run() {
    let (_dir, _broker, outbox) = setup();
    let redeliverer = Redeliverer::new(Arc::new(outbox), Duration::from_secs(3600));

    redeliverer.shutdown();

    tokio::time::timeout(Duration::from_secs(1), redeliverer.run())
        .await
        .expect("run did not observe shutdown")
        .unwrap();
}

#[tokio::test]
async fn one_shutdown_stops_every_running_clone() {
    let (_dir, _broker, outbox) = setup();
    let redeliverer = Redeliverer::new(Arc::new(outbox), Duration::from_millis(10));

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let r = redeliverer.clone();
            tokio::spawn(async move { r.run().await })
        })
        .collect();

    // Let both loops tick at least once before stopping them.
    tokio::time::sleep(Duration::from_millis(30)).await;
    redeliverer.shutdown();

    for handle in handles {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("a clone kept running after shutdown")
            .unwrap()
            .unwrap();
    }
}
