//! Subscriber dispatch concurrency cap, and handler-panic isolation.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quantbus::{BusConfig, HandlerKind, MessageBus, Payload};

static PORT: AtomicU16 = AtomicU16::new(27_000);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

#[tokio::test]
async fn handler_dispatch_never_exceeds_the_configured_cap() {
    let port = next_port();
    let config = BusConfig::new()
        .with_handler_max_concurrency(2)
        .with_failed_socket_cooldown(Duration::from_millis(200));
    let subscriber = MessageBus::new(config.clone());
    let publisher = MessageBus::new(config);

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let in_flight2 = in_flight.clone();
    let max_observed2 = max_observed.clone();

    subscriber
        .register_handler(
            "work",
            HandlerKind::Blocking(Arc::new(move |_topic, _payload| {
                let current = in_flight2.fetch_add(1, Ordering::SeqCst) + 1;
                max_observed2.fetch_max(current, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(100));
                in_flight2.fetch_sub(1, Ordering::SeqCst);
            })),
        )
        .await;

    subscriber
        .spawn_subscribe_loop(port, None)
        .await
        .expect("subscribe loop binds");
    tokio::time::sleep(Duration::from_millis(200)).await;

    for i in 0..10 {
        publisher
            .publish_on(port, "work", Payload::new(serde_json::json!({"i": i})))
            .await;
    }

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(
        max_observed.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent handler invocations, cap was 2",
        max_observed.load(Ordering::SeqCst)
    );

    subscriber.cleanup(true).await;
    publisher.cleanup(true).await;
}

#[tokio::test]
async fn a_panicking_handler_does_not_take_down_the_subscribe_loop() {
    let port = next_port();
    let config = BusConfig::new().with_failed_socket_cooldown(Duration::from_millis(200));
    let subscriber = MessageBus::new(config.clone());
    let publisher = MessageBus::new(config);

    let good_calls = Arc::new(AtomicUsize::new(0));
    let good_calls2 = good_calls.clone();
    subscriber
        .register_handler(
            "boom",
            HandlerKind::Blocking(Arc::new(|_topic, _payload| {
                panic!("handler intentionally failing");
            })),
        )
        .await;
    subscriber
        .register_handler(
            "ok",
            HandlerKind::Blocking(Arc::new(move |_topic, _payload| {
                good_calls2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;

    subscriber
        .spawn_subscribe_loop(port, None)
        .await
        .expect("subscribe loop binds");
    tokio::time::sleep(Duration::from_millis(200)).await;

    publisher.publish_on(port, "boom", Payload::new(serde_json::json!(null))).await;
    publisher.publish_on(port, "ok", Payload::new(serde_json::json!(null))).await;

    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(good_calls.load(Ordering::SeqCst), 1);

    subscriber.cleanup(true).await;
    publisher.cleanup(true).await;
}
