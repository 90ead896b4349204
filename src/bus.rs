//! `MessageBus` — the public surface tying pub/sub, push/pull, and req/rep
//! together over one [`SocketRegistry`] (SPEC_FULL.md §2, §6).
//!
//! A bus is cheap to `Clone`: every clone shares the same registry, metrics,
//! handler table, and shutdown signal via an inner `Arc`. Long-lived loops
//! are spawned as independent tasks and hold their own clone.

use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info_span, warn, Instrument, Level};

use crate::config::{BusConfig, GLOBAL_EVENTS, STATE_MANAGEMENT, TASK_RESULTS};
use crate::error::BindError;
use crate::handler::{HandlerKind, HandlerTable, PullHandler, ResponseHandler};
use crate::metrics::MetricsSnapshot;
use crate::mux;
use crate::payload::Payload;
use crate::registry::{SocketEntry, SocketPattern, SocketRegistry};
use crate::serializer::{self, Serializer};
use crate::socket::{PullerSocket, ReplierSocket, SubscriberSocket};

/// Send-time envelope timestamp: milliseconds since the Unix epoch.
fn now_epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct Inner {
    registry: SocketRegistry,
    metrics: crate::metrics::MetricsCounters,
    config: BusConfig,
    serializer: Box<dyn Serializer>,
    handlers: HandlerTable,
    shutdown: Notify,
    dispatch_semaphore: Option<Arc<Semaphore>>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Asynchronous messaging bus multiplexing PUB/SUB, PUSH/PULL, and REQ/REP
/// over a single managed socket registry.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    /// Build a bus from `config`. No sockets are opened until a publish,
    /// push, request, or `spawn_*_loop` call needs one.
    pub fn new(config: BusConfig) -> Self {
        let dispatch_semaphore = config
            .handler_max_concurrency
            .map(|n| Arc::new(Semaphore::new(n)));
        let serializer = serializer::for_kind(config.serializer);
        Self {
            inner: Arc::new(Inner {
                registry: SocketRegistry::new(),
                metrics: crate::metrics::MetricsCounters::default(),
                config,
                serializer,
                handlers: HandlerTable::new(),
                shutdown: Notify::new(),
                dispatch_semaphore,
                tasks: tokio::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register (or replace) the handler invoked for messages on `topic`
    /// delivered through any active `subscribe_loop`.
    pub async fn register_handler(&self, topic: impl Into<String>, handler: HandlerKind) {
        self.inner.handlers.register(topic, handler).await;
    }

    /// Combine the monotonic counters with the live `active_connections`
    /// gauge.
    pub async fn get_metrics(&self) -> MetricsSnapshot {
        let active = self.inner.registry.active_connections().await;
        self.inner.metrics.snapshot(active)
    }

    // ---- publish (PUB, connects) ---------------------------------------

    /// Publish `data` under `topic` on the default broadcast port.
    pub async fn publish(&self, topic: &str, data: Payload) -> bool {
        self.publish_on(GLOBAL_EVENTS, topic, data).await
    }

    /// Publish `data` under `topic` on `port`.
    pub async fn publish_on(&self, port: u16, topic: &str, data: Payload) -> bool {
        let entry = match self
            .inner
            .registry
            .acquire_publisher(port, &self.inner.config, &self.inner.metrics)
            .await
        {
            crate::registry::Lazy::Ready(entry) => entry,
            crate::registry::Lazy::Unavailable => {
                self.inner.metrics.outbound_dropped();
                return false;
            }
        };

        let envelope = Payload::new(serde_json::json!({
            "topic": topic,
            "data": data.into_value(),
            "ts": now_epoch_millis(),
        }));
        let bytes = match self.inner.serializer.encode(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.inner.metrics.errors();
                self.inner.metrics.outbound_dropped();
                warn!(topic, error = %err, "publish encode failed");
                return false;
            }
        };

        let frames: crate::socket::Multipart = vec![topic.as_bytes().to_vec(), bytes].into();
        let mut guard = entry.socket_guard().await;
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => {
                drop(guard);
                self.inner.metrics.outbound_dropped();
                return false;
            }
        };
        let result = timeout(self.inner.config.pub_send_timeout, socket.send(frames)).await;
        drop(guard);
        match result {
            Ok(Ok(())) => {
                self.inner.metrics.messages_sent();
                true
            }
            Ok(Err(_)) => {
                entry.fail(&self.inner.metrics, SocketPattern::Pub, "publish send failed").await;
                self.inner.metrics.outbound_dropped();
                false
            }
            Err(_) => {
                self.inner.metrics.backpressure_events();
                self.inner.metrics.outbound_dropped();
                false
            }
        }
    }

    // ---- subscribe_loop (SUB, binds) -------------------------------------

    /// Bind (synchronously, surfacing [`BindError`]) and spawn a long-lived
    /// subscribe loop on `port`, dispatching each message to the handler
    /// registered for its topic. `topics` of `None` subscribes to every
    /// topic.
    pub async fn spawn_subscribe_loop(
        &self,
        port: u16,
        topics: Option<Vec<String>>,
    ) -> Result<(), BindError> {
        let topics = topics.unwrap_or_default();
        let entry = self
            .inner
            .registry
            .acquire_for_bind_subscriber(port, &self.inner.config, &self.inner.metrics, &topics)
            .await?;
        let bus = self.clone();
        let handle = tokio::spawn(
            async move { bus.run_subscribe_loop(port, entry).await }
                .instrument(info_span!("subscribe_loop", port)),
        );
        self.inner.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn run_subscribe_loop(
        self,
        port: u16,
        mut entry: Arc<SocketEntry<Box<dyn SubscriberSocket>>>,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => return,
                received = Self::recv_multipart(&entry) => {
                    match received {
                        Some(Ok(frames)) => self.handle_subscribed_frames(frames).await,
                        Some(Err(_)) | None => {
                            entry.fail(&self.inner.metrics, SocketPattern::Sub, "subscribe recv failed").await;
                            entry = self.rebuild_subscriber_loop(port).await;
                        }
                    }
                }
            }
        }
    }

    async fn rebuild_subscriber_loop(&self, port: u16) -> Arc<SocketEntry<Box<dyn SubscriberSocket>>> {
        loop {
            tokio::time::sleep(self.inner.config.failed_socket_cooldown).await;
            match self.inner.registry.rebuild_subscriber(port, &self.inner.config).await {
                Ok(entry) => return entry,
                Err(err) => warn!(port, error = %err, "subscriber rebuild failed, retrying"),
            }
        }
    }

    async fn handle_subscribed_frames(&self, frames: crate::socket::Multipart) {
        let mut iter = frames.into_iter();
        let (topic_frame, payload_frame) = match (iter.next(), iter.next()) {
            (Some(t), Some(p)) => (t, p),
            _ => {
                self.inner.metrics.inbound_dropped();
                return;
            }
        };
        let topic = match std::str::from_utf8(&topic_frame) {
            Ok(topic) => topic.to_string(),
            Err(_) => {
                self.inner.metrics.inbound_dropped();
                return;
            }
        };
        let payload = match self.inner.serializer.decode(&payload_frame) {
            Ok(payload) => payload,
            Err(_) => {
                self.inner.metrics.inbound_dropped();
                return;
            }
        };
        self.inner.metrics.messages_received();
        self.dispatch_to_handler(topic, payload).await;
    }

    async fn dispatch_to_handler(&self, topic: String, payload: Payload) {
        match self.inner.handlers.get(&topic).await {
            Some(HandlerKind::Cooperative(f)) => {
                let permit = self.acquire_permit().await;
                let fut = f(topic.clone(), payload);
                let metrics_topic = topic;
                let bus = self.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if std::panic::AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                        bus.inner.metrics.errors();
                        warn!(topic = metrics_topic, "cooperative handler panicked");
                    }
                });
            }
            Some(HandlerKind::Blocking(f)) => {
                let permit = self.acquire_permit().await;
                let bus = self.clone();
                let metrics_topic = topic.clone();
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(topic, payload)));
                    if result.is_err() {
                        bus.inner.metrics.errors();
                        warn!(topic = metrics_topic, "blocking handler panicked");
                    }
                });
            }
            None => self.log_no_handler(&topic),
        }
    }

    async fn acquire_permit(&self) -> Option<OwnedSemaphorePermit> {
        match &self.inner.dispatch_semaphore {
            Some(sem) => sem.clone().acquire_owned().await.ok(),
            None => None,
        }
    }

    fn log_no_handler(&self, topic: &str) {
        match self.inner.config.log_level_no_handler {
            Level::ERROR => tracing::error!(topic, "no handler registered for topic"),
            Level::WARN => tracing::warn!(topic, "no handler registered for topic"),
            Level::INFO => tracing::info!(topic, "no handler registered for topic"),
            Level::DEBUG => tracing::debug!(topic, "no handler registered for topic"),
            Level::TRACE => tracing::trace!(topic, "no handler registered for topic"),
        }
    }

    async fn recv_multipart<H>(
        entry: &Arc<SocketEntry<Box<H>>>,
    ) -> Option<Result<crate::socket::Multipart, tmq::TmqError>>
    where
        H: futures::Stream<Item = Result<crate::socket::Multipart, tmq::TmqError>> + Unpin + ?Sized,
    {
        let mut guard = entry.socket_guard().await;
        match guard.as_mut() {
            Some(socket) => socket.next().await,
            None => None,
        }
    }

    // ---- push_result (PUSH, connects) --------------------------------

    /// Push `data` as a work item on the default result-stream port.
    pub async fn push_result(&self, data: Payload) -> bool {
        self.push_result_on(TASK_RESULTS, data).await
    }

    /// Push `data` as a work item on `port`.
    pub async fn push_result_on(&self, port: u16, data: Payload) -> bool {
        let entry = match self
            .inner
            .registry
            .acquire_pusher(port, &self.inner.config, &self.inner.metrics)
            .await
        {
            crate::registry::Lazy::Ready(entry) => entry,
            crate::registry::Lazy::Unavailable => {
                self.inner.metrics.outbound_dropped();
                return false;
            }
        };
        let envelope = Payload::new(serde_json::json!({
            "data": data.into_value(),
            "ts": now_epoch_millis(),
        }));
        let bytes = match self.inner.serializer.encode(&envelope) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.inner.metrics.errors();
                self.inner.metrics.outbound_dropped();
                return false;
            }
        };
        let mut guard = entry.socket_guard().await;
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => {
                drop(guard);
                self.inner.metrics.outbound_dropped();
                return false;
            }
        };
        let result = timeout(self.inner.config.push_send_timeout, socket.send(vec![bytes].into())).await;
        drop(guard);
        match result {
            Ok(Ok(())) => {
                self.inner.metrics.messages_sent();
                true
            }
            Ok(Err(_)) => {
                entry.fail(&self.inner.metrics, SocketPattern::Push, "push send failed").await;
                self.inner.metrics.outbound_dropped();
                false
            }
            Err(_) => {
                self.inner.metrics.backpressure_events();
                self.inner.metrics.outbound_dropped();
                false
            }
        }
    }

    // ---- pull_results_loop (PULL, binds) ------------------------------

    /// Bind and spawn a long-lived pull loop on `port`, invoking `handler`
    /// for every message pulled, on the blocking worker pool.
    pub async fn spawn_pull_results_loop(
        &self,
        port: u16,
        handler: PullHandler,
    ) -> Result<(), BindError> {
        let entry = self
            .inner
            .registry
            .acquire_for_bind_puller(port, &self.inner.config, &self.inner.metrics)
            .await?;
        let bus = self.clone();
        let handle = tokio::spawn(
            async move { bus.run_pull_loop(port, entry, handler).await }
                .instrument(info_span!("pull_results_loop", port)),
        );
        self.inner.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn run_pull_loop(
        self,
        port: u16,
        mut entry: Arc<SocketEntry<Box<dyn PullerSocket>>>,
        handler: PullHandler,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => return,
                received = Self::recv_multipart(&entry) => {
                    match received {
                        Some(Ok(frames)) => {
                            if let Some(bytes) = frames.into_iter().next() {
                                match self.inner.serializer.decode(&bytes) {
                                    Ok(payload) => {
                                        self.inner.metrics.messages_received();
                                        let handler = handler.clone();
                                        tokio::task::spawn_blocking(move || handler(payload));
                                    }
                                    Err(_) => self.inner.metrics.inbound_dropped(),
                                }
                            } else {
                                self.inner.metrics.inbound_dropped();
                            }
                        }
                        Some(Err(_)) | None => {
                            entry.fail(&self.inner.metrics, SocketPattern::Pull, "pull recv failed").await;
                            entry = self.rebuild_puller_loop(port).await;
                        }
                    }
                }
            }
        }
    }

    async fn rebuild_puller_loop(&self, port: u16) -> Arc<SocketEntry<Box<dyn PullerSocket>>> {
        loop {
            tokio::time::sleep(self.inner.config.failed_socket_cooldown).await;
            match self.inner.registry.rebuild_puller(port, &self.inner.config).await {
                Ok(entry) => return entry,
                Err(err) => warn!(port, error = %err, "puller rebuild failed, retrying"),
            }
        }
    }

    // ---- request (REQ, connects) --------------------------------------

    /// Send `data` as a request on the default control port and await
    /// exactly one reply, or `None` on any failure.
    pub async fn request(&self, data: Payload) -> Option<Payload> {
        self.request_on(STATE_MANAGEMENT, data).await
    }

    /// Send `data` as a request on `port` and await exactly one reply.
    /// `request_timeouts`/`errors`/`outbound_dropped` track this path;
    /// `messages_sent`/`messages_received` are not incremented, matching
    /// the non-streaming request/reply contract.
    pub async fn request_on(&self, port: u16, data: Payload) -> Option<Payload> {
        let envelope = Payload::new(serde_json::json!({
            "data": data.into_value(),
            "ts": now_epoch_millis(),
        }));
        mux::request(
            &self.inner.registry,
            self.inner.serializer.as_ref(),
            &self.inner.metrics,
            &self.inner.config,
            port,
            envelope,
        )
        .await
    }

    // ---- response_loop (REP, binds) ------------------------------------

    /// Bind and spawn a long-lived response loop on `port`. `handler` is
    /// called once per request and must produce exactly one reply.
    pub async fn spawn_response_loop(
        &self,
        port: u16,
        handler: ResponseHandler,
    ) -> Result<(), BindError> {
        let entry = self
            .inner
            .registry
            .acquire_for_bind_replier(port, &self.inner.config, &self.inner.metrics)
            .await?;
        let bus = self.clone();
        let handle = tokio::spawn(
            async move { bus.run_response_loop(port, entry, handler).await }
                .instrument(info_span!("response_loop", port)),
        );
        self.inner.tasks.lock().await.push(handle);
        Ok(())
    }

    async fn run_response_loop(
        self,
        port: u16,
        mut entry: Arc<SocketEntry<Box<dyn ReplierSocket>>>,
        handler: ResponseHandler,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.notified() => return,
                received = timeout(self.inner.config.rep_recv_timeout, Self::recv_multipart(&entry)) => {
                    let received = match received {
                        Ok(received) => received,
                        Err(_) => continue,
                    };
                    match received {
                        Some(Ok(frames)) => {
                            let reply = self.run_response_handler(&handler, frames).await;
                            self.send_reply(&entry, reply).await;
                            if !entry.is_healthy().await {
                                entry = self.rebuild_replier_loop(port).await;
                            }
                        }
                        Some(Err(_)) | None => {
                            entry.fail(&self.inner.metrics, SocketPattern::Rep, "response recv failed").await;
                            entry = self.rebuild_replier_loop(port).await;
                        }
                    }
                }
            }
        }
    }

    async fn run_response_handler(&self, handler: &ResponseHandler, frames: crate::socket::Multipart) -> Payload {
        let request = match frames.into_iter().next() {
            Some(bytes) => self.inner.serializer.decode(&bytes).ok(),
            None => None,
        };
        match request {
            Some(payload) => {
                let fut = handler(payload);
                match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(reply) => reply,
                    Err(_) => {
                        self.inner.metrics.errors();
                        warn!("response handler panicked");
                        Payload::new(serde_json::json!({"error": "handler_panicked"}))
                    }
                }
            }
            None => {
                self.inner.metrics.inbound_dropped();
                Payload::new(Value::Null)
            }
        }
    }

    async fn send_reply(&self, entry: &Arc<SocketEntry<Box<dyn ReplierSocket>>>, reply: Payload) {
        let bytes = match self.inner.serializer.encode(&reply) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.inner.metrics.errors();
                return;
            }
        };
        let mut guard = entry.socket_guard().await;
        let socket = match guard.as_mut() {
            Some(socket) => socket,
            None => return,
        };
        let result = timeout(self.inner.config.rep_send_timeout, socket.send(vec![bytes].into())).await;
        let failed = !matches!(result, Ok(Ok(())));
        drop(guard);
        if failed {
            entry.fail(&self.inner.metrics, SocketPattern::Rep, "response send failed").await;
        }
    }

    async fn rebuild_replier_loop(&self, port: u16) -> Arc<SocketEntry<Box<dyn ReplierSocket>>> {
        loop {
            tokio::time::sleep(self.inner.config.failed_socket_cooldown).await;
            match self.inner.registry.rebuild_replier(port, &self.inner.config).await {
                Ok(entry) => return entry,
                Err(err) => warn!(port, error = %err, "replier rebuild failed, retrying"),
            }
        }
    }

    // ---- lifecycle ------------------------------------------------------

    /// Stop every spawned loop and close all sockets.
    ///
    /// When `cancel_running` is `true`, in-flight loop tasks are aborted
    /// immediately; otherwise each is given up to
    /// [`BusConfig::failed_socket_cooldown`] to observe the shutdown signal
    /// and return on its own before being aborted.
    pub async fn cleanup(&self, cancel_running: bool) {
        self.inner.shutdown.notify_waiters();
        let mut tasks = self.inner.tasks.lock().await;
        if cancel_running {
            for task in tasks.drain(..) {
                task.abort();
            }
        } else {
            let grace = self.inner.config.failed_socket_cooldown;
            for task in tasks.drain(..) {
                if timeout(grace, task).await.is_err() {
                    warn!("loop task did not shut down within grace period, continuing");
                }
            }
        }
        drop(tasks);
        self.inner.registry.close_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::atomic::AtomicUsize;

    static PORT: AtomicU16 = AtomicU16::new(23_000);

    fn next_port() -> u16 {
        PORT.fetch_add(1, Ordering::SeqCst)
    }

    #[tokio::test]
    async fn fresh_bus_reports_zero_metrics() {
        let bus = MessageBus::new(BusConfig::new());
        let snap = bus.get_metrics().await;
        assert_eq!(snap.messages_sent, 0);
        assert_eq!(snap.active_connections, 0);
    }

    #[tokio::test]
    async fn publish_with_no_subscriber_still_counts_as_sent() {
        // PUB sockets don't block on the absence of a subscriber: the
        // send succeeds at the transport layer regardless of peers.
        let port = next_port();
        let bus = MessageBus::new(BusConfig::new());
        let sent = bus.publish_on(port, "ticks", Payload::new(Value::Null)).await;
        assert!(sent);
        let snap = bus.get_metrics().await;
        assert_eq!(snap.messages_sent, 1);
    }

    #[tokio::test]
    async fn register_handler_is_observable_via_dispatch() {
        let bus = MessageBus::new(BusConfig::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        bus.register_handler(
            "ticks",
            HandlerKind::Blocking(Arc::new(move |_topic, _payload| {
                calls2.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .await;
        bus.dispatch_to_handler("ticks".to_string(), Payload::new(Value::Null))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_bind_on_same_port_surfaces_bind_error() {
        let port = next_port();
        let bus_a = MessageBus::new(BusConfig::new());
        let bus_b = MessageBus::new(BusConfig::new());
        bus_a.spawn_subscribe_loop(port, None).await.expect("first bind succeeds");
        let err = bus_b.spawn_subscribe_loop(port, None).await;
        assert!(err.is_err());
        bus_a.cleanup(true).await;
    }
}
