//! `RequestMux` — serialized REQ/REP exchange per port (SPEC_FULL.md §4.3).
//!
//! A per-port mutex serializes the full send+recv cycle, rendered here by
//! holding the `SocketEntry`'s own socket-guard mutex across both the send
//! and the recv: no separate lock is needed because a second caller simply
//! blocks on the same guard until the first exchange (or its failure)
//! releases it.

use futures::{SinkExt, StreamExt};
use tokio::time::timeout;

use crate::config::BusConfig;
use crate::metrics::MetricsCounters;
use crate::payload::Payload;
use crate::registry::{Lazy, SocketPattern, SocketRegistry};
use crate::serializer::Serializer;

/// Send `payload` on `port`'s REQ socket and await exactly one reply frame
/// within `config.req_total_timeout`, split evenly between send and recv.
///
/// Returns `None` (the "null reply sentinel") on any failure: no socket
/// available, encode error, send timeout, recv timeout, or transport
/// error. Every failure path calls `fail(entry)` since the REQ state
/// machine cannot be resynchronised without tearing the socket down.
pub async fn request(
    registry: &SocketRegistry,
    serializer: &dyn Serializer,
    metrics: &MetricsCounters,
    config: &BusConfig,
    port: u16,
    payload: Payload,
) -> Option<Payload> {
    let entry = match registry.acquire_requester(port, config, metrics).await {
        Lazy::Ready(entry) => entry,
        Lazy::Unavailable => {
            metrics.outbound_dropped();
            return None;
        }
    };

    let phase_timeout = config.req_phase_timeout();
    let mut guard = entry.socket_guard().await;
    let socket = match guard.as_mut() {
        Some(socket) => socket,
        None => {
            drop(guard);
            metrics.outbound_dropped();
            return None;
        }
    };

    let bytes = match serializer.encode(&payload) {
        Ok(bytes) => bytes,
        Err(err) => {
            drop(guard);
            metrics.errors();
            metrics.outbound_dropped();
            tracing::warn!(port, error = %err, "request encode failed");
            return None;
        }
    };

    let send_result = timeout(phase_timeout, socket.send(vec![bytes].into())).await;
    let send_ok = matches!(send_result, Ok(Ok(())));
    if !send_ok {
        drop(guard);
        record_failure(metrics, &send_result);
        entry.fail(metrics, SocketPattern::Req, "request send failed").await;
        return None;
    }

    let recv_result = timeout(phase_timeout, socket.next()).await;
    drop(guard);

    let frames = match recv_result {
        Ok(Some(Ok(frames))) => frames,
        Ok(Some(Err(_))) | Ok(None) => {
            metrics.errors();
            entry.fail(metrics, SocketPattern::Req, "request recv failed").await;
            return None;
        }
        Err(_) => {
            metrics.request_timeouts();
            entry.fail(metrics, SocketPattern::Req, "request recv timed out").await;
            return None;
        }
    };

    let frame = match frames.into_iter().next() {
        Some(frame) => frame,
        None => {
            metrics.errors();
            entry
                .fail(metrics, SocketPattern::Req, "reply had no frames")
                .await;
            return None;
        }
    };

    match serializer.decode(&frame) {
        Ok(reply) => Some(reply),
        Err(_) => {
            metrics.inbound_dropped();
            entry
                .fail(metrics, SocketPattern::Req, "reply decode failed")
                .await;
            None
        }
    }
}

fn record_failure<T, E>(metrics: &MetricsCounters, result: &Result<Result<T, E>, tokio::time::error::Elapsed>) {
    match result {
        Err(_) => metrics.request_timeouts(),
        Ok(Err(_)) => metrics.errors(),
        Ok(Ok(_)) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BusConfig;
    use crate::serializer::JsonSerializer;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn request_with_no_peer_returns_none_and_counts_timeout() {
        let registry = SocketRegistry::new();
        let metrics = MetricsCounters::default();
        let config = BusConfig::new()
            .with_req_total_timeout(StdDuration::from_millis(150))
            .with_failed_socket_cooldown(StdDuration::from_millis(300));
        let serializer = JsonSerializer;

        let reply = request(
            &registry,
            &serializer,
            &metrics,
            &config,
            19990,
            Payload::new(serde_json::json!({"op": "x"})),
        )
        .await;

        assert!(reply.is_none());
        let snap = metrics.snapshot(0);
        assert_eq!(snap.request_timeouts, 1);
    }

    #[tokio::test]
    async fn second_request_within_cooldown_is_dropped_immediately() {
        let registry = SocketRegistry::new();
        let metrics = MetricsCounters::default();
        let config = BusConfig::new()
            .with_req_total_timeout(StdDuration::from_millis(100))
            .with_failed_socket_cooldown(StdDuration::from_secs(5));
        let serializer = JsonSerializer;

        let _ = request(
            &registry,
            &serializer,
            &metrics,
            &config,
            19991,
            Payload::new(serde_json::json!({"op": "x"})),
        )
        .await;

        let start = std::time::Instant::now();
        let reply = request(
            &registry,
            &serializer,
            &metrics,
            &config,
            19991,
            Payload::new(serde_json::json!({"op": "y"})),
        )
        .await;
        let elapsed = start.elapsed();

        assert!(reply.is_none());
        assert!(elapsed < StdDuration::from_millis(50), "cooldown should short-circuit: {elapsed:?}");
        let snap = metrics.snapshot(0);
        assert_eq!(snap.outbound_dropped, 1);
    }
}
