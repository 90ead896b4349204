//! Centralized ZMQ socket construction.
//!
//! All socket setup goes through these helpers so that HWM, linger, and
//! reconnect behavior stay consistent across every pattern the registry
//! manages. `tmq` doesn't export concrete socket types, so sockets are
//! stored behind the trait aliases below (`impl Stream`/`Sink` bounds)
//! rather than named types.

use anyhow::{Context, Result};
use futures::{Sink, Stream};
use tmq::{publish, pull, push, reply, request, subscribe, TmqError};

pub use tmq::Context as ZmqContext;
pub use tmq::Multipart;

/// Reconnect interval applied to every connect-role socket, in milliseconds.
pub const DEFAULT_RECONNECT_IVL_MS: i32 = 1000;
/// Cap on exponential reconnect backoff, in milliseconds.
pub const DEFAULT_RECONNECT_IVL_MAX_MS: i32 = 60_000;

/// Trait bound for a PUB socket (send only).
pub trait PublisherSocket: Sink<Multipart, Error = TmqError> + Unpin + Send {}
impl<T> PublisherSocket for T where T: Sink<Multipart, Error = TmqError> + Unpin + Send {}

/// Trait bound for a SUB socket (receive only).
pub trait SubscriberSocket: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}
impl<T> SubscriberSocket for T where T: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}

/// Trait bound for a PUSH socket (send only).
pub trait PusherSocket: Sink<Multipart, Error = TmqError> + Unpin + Send {}
impl<T> PusherSocket for T where T: Sink<Multipart, Error = TmqError> + Unpin + Send {}

/// Trait bound for a PULL socket (receive only).
pub trait PullerSocket: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}
impl<T> PullerSocket for T where T: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}

/// Trait bound for a REQ socket (strict send-then-recv).
pub trait RequesterSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> RequesterSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Trait bound for a REP socket (strict recv-then-send).
pub trait ReplierSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> ReplierSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Connect a PUB socket and apply the configured send-side HWM.
///
/// SUB binds for this crate (see `create_subscriber_and_bind`), so PUB is
/// the connecting side — the reverse of the usual ZMQ pub/sub convention,
/// needed so a second `subscribe_loop` on an occupied port can surface a
/// genuine bind conflict.
pub fn create_publisher_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    hwm_outbound: i32,
    linger_ms: i32,
) -> Result<Box<dyn PublisherSocket>> {
    let socket = publish(ctx)
        .set_linger(linger_ms)
        .set_sndhwm(hwm_outbound)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("failed to connect PUB to {endpoint}"))?;
    Ok(Box::new(socket))
}

/// Bind a SUB socket, applying the configured recv-side HWM and the given
/// topic prefixes (an empty slice subscribes to everything).
pub fn create_subscriber_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    hwm_inbound: i32,
    linger_ms: i32,
    topics: &[String],
) -> Result<Box<dyn SubscriberSocket>> {
    let builder = subscribe(ctx).set_linger(linger_ms).set_rcvhwm(hwm_inbound);
    let mut socket = builder
        .bind(endpoint)
        .with_context(|| format!("failed to bind SUB to {endpoint}"))?;
    if topics.is_empty() {
        socket = socket
            .subscribe(b"")
            .with_context(|| "failed to subscribe to all topics")?;
    } else {
        for topic in topics {
            socket = socket
                .subscribe(topic.as_bytes())
                .with_context(|| format!("failed to subscribe to topic {topic}"))?;
        }
    }
    Ok(Box::new(socket))
}

/// Connect a PUSH socket.
pub fn create_pusher_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    hwm_outbound: i32,
    linger_ms: i32,
) -> Result<Box<dyn PusherSocket>> {
    let socket = push(ctx)
        .set_linger(linger_ms)
        .set_sndhwm(hwm_outbound)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("failed to connect PUSH to {endpoint}"))?;
    Ok(Box::new(socket))
}

/// Bind a PULL socket.
pub fn create_puller_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    hwm_inbound: i32,
    linger_ms: i32,
) -> Result<Box<dyn PullerSocket>> {
    let socket = pull(ctx)
        .set_linger(linger_ms)
        .set_rcvhwm(hwm_inbound)
        .bind(endpoint)
        .with_context(|| format!("failed to bind PULL to {endpoint}"))?;
    Ok(Box::new(socket))
}

/// Connect a REQ socket.
pub fn create_requester_and_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    linger_ms: i32,
) -> Result<Box<dyn RequesterSocket>> {
    let socket = request(ctx)
        .set_linger(linger_ms)
        .set_reconnect_ivl(DEFAULT_RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(DEFAULT_RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("failed to connect REQ to {endpoint}"))?;
    Ok(Box::new(socket))
}

/// Bind a REP socket.
pub fn create_replier_and_bind(
    ctx: &ZmqContext,
    endpoint: &str,
    linger_ms: i32,
) -> Result<Box<dyn ReplierSocket>> {
    let socket = reply(ctx)
        .set_linger(linger_ms)
        .bind(endpoint)
        .with_context(|| format!("failed to bind REP to {endpoint}"))?;
    Ok(Box::new(socket))
}

/// Build a `tcp://127.0.0.1:<port>` endpoint string.
pub fn local_endpoint(port: u16) -> String {
    format!("tcp://127.0.0.1:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconnect_constants() {
        assert_eq!(DEFAULT_RECONNECT_IVL_MS, 1000);
        assert_eq!(DEFAULT_RECONNECT_IVL_MAX_MS, 60_000);
        assert!(DEFAULT_RECONNECT_IVL_MAX_MS > DEFAULT_RECONNECT_IVL_MS);
    }

    #[test]
    fn endpoint_formatting() {
        assert_eq!(local_endpoint(5555), "tcp://127.0.0.1:5555");
    }
}
