//! Endpoint behavior against an in-process router stand-in.

use async_trait::async_trait;
use databeam_bus::testing::StubRouter;
use databeam_bus::{Bus, BusQueryable, BusSubscriber, BusRouter, Endpoint};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

struct EchoQueryable;

#[async_trait]
impl BusQueryable for EchoQueryable {
    async fn notify_queryable(&self, topic: &str, payload: &str) -> String {
        format!("{topic}:{payload}")
    }
}

struct SlowQueryable;

#[async_trait]
impl BusQueryable for SlowQueryable {
    async fn notify_queryable(&self, _topic: &str, _payload: &str) -> String {
        tokio::time::sleep(Duration::from_millis(400)).await;
        "late".to_string()
    }
}

struct CountingSubscriber {
    hits: AtomicUsize,
}

#[async_trait]
impl BusSubscriber for CountingSubscriber {
    async fn notify_subscriber(&self, _key: &str, _payload: &str) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

async fn wait_for(hits: &AtomicUsize, expected: usize) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if hits.load(Ordering::SeqCst) >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn query_reaches_declared_queryable() {
    let router = StubRouter::spawn().await.unwrap();
    let module = Endpoint::connect(&router.config(), "db/m/imu", CancellationToken::new())
        .await
        .unwrap();
    let controller = Endpoint::connect(&router.config(), "db/c", CancellationToken::new())
        .await
        .unwrap();

    controller
        .declare_queryable("ping", Arc::new(EchoQueryable))
        .await;

    let reply = module
        .query("db/c", "ping", "hello", Duration::from_secs(2))
        .await;
    assert_eq!(reply, "ping:hello");

    module.shutdown().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn query_timeout_returns_empty_after_deadline() {
    let router = StubRouter::spawn().await.unwrap();
    let module = Endpoint::connect(&router.config(), "db/m/imu", CancellationToken::new())
        .await
        .unwrap();

    let started = Instant::now();
    let reply = module
        .query("nowhere/c", "foo", "", Duration::from_millis(250))
        .await;
    let elapsed = started.elapsed();

    assert!(reply.is_empty());
    assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");

    module.shutdown().await;
}

#[tokio::test]
async fn stale_reply_from_timed_out_query_is_discarded() {
    let router = StubRouter::spawn().await.unwrap();
    let module = Endpoint::connect(&router.config(), "db/m/imu", CancellationToken::new())
        .await
        .unwrap();
    let controller = Endpoint::connect(&router.config(), "db/c", CancellationToken::new())
        .await
        .unwrap();

    controller
        .declare_queryable("slow", Arc::new(SlowQueryable))
        .await;
    controller
        .declare_queryable("fast", Arc::new(EchoQueryable))
        .await;

    // First query times out before the slow handler replies.
    let reply = module
        .query("db/c", "slow", "", Duration::from_millis(100))
        .await;
    assert!(reply.is_empty());

    // The late reply arrives while the second query waits; its uuid does
    // not match and it must be discarded.
    let reply = module
        .query("db/c", "fast", "x", Duration::from_secs(2))
        .await;
    assert_eq!(reply, "fast:x");

    module.shutdown().await;
    controller.shutdown().await;
}

#[tokio::test]
async fn duplicate_subscription_is_stored_once() {
    let router = StubRouter::spawn().await.unwrap();
    let receiver = Endpoint::connect(&router.config(), "db/m/sink", CancellationToken::new())
        .await
        .unwrap();
    let sender = Endpoint::connect(&router.config(), "db/m/src", CancellationToken::new())
        .await
        .unwrap();

    let counting = Arc::new(CountingSubscriber {
        hits: AtomicUsize::new(0),
    });
    let key = "db/m/src/data/liveall";
    receiver.subscribe(key, counting.clone()).await;
    receiver.subscribe(key, counting.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    sender.publish(key, "{\"v\":1}").await;
    assert!(wait_for(&counting.hits, 1).await);
    // a duplicate registration would have produced a second hit
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counting.hits.load(Ordering::SeqCst), 1);

    // One unsubscribe removes the only reference.
    receiver.unsubscribe(key, counting.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    sender.publish(key, "{\"v\":2}").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counting.hits.load(Ordering::SeqCst), 1);

    receiver.shutdown().await;
    sender.shutdown().await;
}

#[tokio::test]
async fn router_publishes_through_local_endpoint() {
    let stub = StubRouter::spawn().await.unwrap();
    let bus = BusRouter::connect(
        stub.config(),
        "db",
        "db/m/imu",
        CancellationToken::new(),
    )
    .await
    .unwrap();

    let counting = Arc::new(CountingSubscriber {
        hits: AtomicUsize::new(0),
    });
    bus.subscribe("db/m/imu/event_in", counting.clone()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    bus.publish("db/m/imu/event_in", "{}").await;
    assert!(wait_for(&counting.hits, 1).await);

    // Unknown deployment: logged and dropped, no panic.
    bus.publish("otherdb/m/x/liveall", "{}").await;

    bus.shutdown().await;
}
