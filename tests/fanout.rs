//! End-to-end pub/sub fan-out: one publisher, one subscribe loop, a
//! registered handler collecting delivered messages in order.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quantbus::{BusConfig, HandlerKind, MessageBus, Payload};

static PORT: AtomicU16 = AtomicU16::new(24_000);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

#[tokio::test]
async fn subscribed_messages_are_delivered_in_order() {
    let port = next_port();
    let config = BusConfig::new().with_failed_socket_cooldown(Duration::from_millis(200));
    let subscriber = MessageBus::new(config.clone());
    let publisher = MessageBus::new(config);

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = received.clone();
    subscriber
        .register_handler(
            "ticks",
            HandlerKind::Blocking(Arc::new(move |_topic, payload| {
                received2.lock().unwrap().push(payload.into_value()["data"].clone());
            })),
        )
        .await;

    subscriber
        .spawn_subscribe_loop(port, None)
        .await
        .expect("subscribe loop binds");

    // Slow-joiner: give the SUB connection time to complete before publishing.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(publisher.publish_on(port, "ticks", Payload::new(serde_json::json!({"n": 1}))).await);
    assert!(publisher.publish_on(port, "ticks", Payload::new(serde_json::json!({"n": 2}))).await);

    tokio::time::sleep(Duration::from_millis(300)).await;

    let seen = received.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![serde_json::json!({"n": 1}), serde_json::json!({"n": 2})]
    );

    let pub_metrics = publisher.get_metrics().await;
    assert_eq!(pub_metrics.messages_sent, 2);
    let sub_metrics = subscriber.get_metrics().await;
    assert_eq!(sub_metrics.messages_received, 2);

    subscriber.cleanup(true).await;
    publisher.cleanup(true).await;
}

#[tokio::test]
async fn messages_for_unregistered_topics_are_not_silently_counted_as_handled() {
    let port = next_port();
    let config = BusConfig::new().with_failed_socket_cooldown(Duration::from_millis(200));
    let subscriber = MessageBus::new(config.clone());
    let publisher = MessageBus::new(config);

    subscriber
        .spawn_subscribe_loop(port, None)
        .await
        .expect("subscribe loop binds");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(publisher.publish_on(port, "untracked", Payload::new(serde_json::json!(null))).await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let sub_metrics = subscriber.get_metrics().await;
    assert_eq!(sub_metrics.messages_received, 1);

    subscriber.cleanup(true).await;
    publisher.cleanup(true).await;
}
