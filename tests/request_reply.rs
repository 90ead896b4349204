//! End-to-end request/reply exchange, plus timeout-and-cooldown behavior
//! when nothing is listening.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quantbus::{BusConfig, MessageBus, Payload, ResponseFuture};

static PORT: AtomicU16 = AtomicU16::new(25_000);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

#[tokio::test]
async fn request_reaches_the_response_loop_and_gets_echoed_back() {
    let port = next_port();
    let config = BusConfig::new().with_failed_socket_cooldown(Duration::from_millis(200));
    let server = MessageBus::new(config.clone());
    let client = MessageBus::new(config);

    server
        .spawn_response_loop(
            port,
            Arc::new(|payload: Payload| -> ResponseFuture { Box::pin(async move { payload }) }),
        )
        .await
        .expect("response loop binds");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let reply = client
        .request_on(port, Payload::new(serde_json::json!({"op": "ping"})))
        .await
        .expect("echo reply");
    let reply = reply.into_value();
    assert_eq!(reply["data"], serde_json::json!({"op": "ping"}));
    assert!(reply["ts"].is_u64());

    let client_metrics = client.get_metrics().await;
    assert_eq!(client_metrics.request_timeouts, 0);

    server.cleanup(true).await;
    client.cleanup(true).await;
}

#[tokio::test]
async fn request_with_no_responder_times_out_and_enters_cooldown() {
    let port = next_port();
    let config = BusConfig::new()
        .with_req_total_timeout(Duration::from_millis(150))
        .with_failed_socket_cooldown(Duration::from_secs(10));
    let client = MessageBus::new(config);

    let reply = client
        .request_on(port, Payload::new(serde_json::json!({"op": "ping"})))
        .await;
    assert!(reply.is_none());

    let metrics = client.get_metrics().await;
    assert_eq!(metrics.request_timeouts, 1);

    // Second attempt within the cooldown window must short-circuit
    // without re-attempting the send.
    let start = std::time::Instant::now();
    let second = client
        .request_on(port, Payload::new(serde_json::json!({"op": "ping"})))
        .await;
    let elapsed = start.elapsed();
    assert!(second.is_none());
    assert!(elapsed < Duration::from_millis(50), "cooldown should short-circuit: {elapsed:?}");

    client.cleanup(true).await;
}
