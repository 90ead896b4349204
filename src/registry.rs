//! The socket registry (SPEC_FULL.md §4.2).
//!
//! Caches one socket per `(pattern, port)`, rebuilds it after a
//! [`BusConfig::failed_socket_cooldown`](crate::config::BusConfig) once it
//! has failed, and exposes two distinct acquisition paths: senders never
//! see a bind failure, long-lived loop launchers do.
//!
//! The failed-socket cooldown is this crate's circuit breaker — the same
//! "track peer health separately from raw connectivity" idea as the
//! teacher's client-side health tracker, just applied to locally-owned
//! sockets instead of a remote peer.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::BusConfig;
use crate::error::BindError;
use crate::metrics::MetricsCounters;
use crate::socket::{
    create_puller_and_bind, create_publisher_and_connect, create_pusher_and_connect,
    create_replier_and_bind, create_requester_and_connect, create_subscriber_and_bind,
    local_endpoint, PublisherSocket, PullerSocket, PusherSocket, ReplierSocket, RequesterSocket,
    SubscriberSocket, ZmqContext,
};

/// The six ZMQ patterns the bus multiplexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketPattern {
    Pub,
    Sub,
    Push,
    Pull,
    Req,
    Rep,
}

/// Bind-vs-connect role, fixed per pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Bind,
    Connect,
}

impl SocketPattern {
    /// PULL/REP/SUB bind; PUB/PUSH/REQ connect. SUB binds rather than PUB so
    /// that two `subscribe_loop` calls on the same port produce a genuine
    /// port conflict instead of two independently-succeeding connects.
    pub fn role(self) -> SocketRole {
        match self {
            SocketPattern::Sub | SocketPattern::Pull | SocketPattern::Rep => SocketRole::Bind,
            SocketPattern::Pub | SocketPattern::Push | SocketPattern::Req => SocketRole::Connect,
        }
    }
}

/// Health state of a [`SocketEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Healthy,
    Failed,
}

/// One cached socket plus its health/cooldown bookkeeping.
///
/// `H` is the concrete boxed socket handle for this pattern (e.g.
/// `Box<dyn PublisherSocket>`). The handle lives behind its own mutex so a
/// long send/recv doesn't block an unrelated health check, while `state`
/// and `failed_at` are read far more often than the socket is replaced.
pub struct SocketEntry<H> {
    pub port: u16,
    state: AsyncMutex<EntryState>,
    socket: AsyncMutex<Option<H>>,
    /// SUB-only: topic prefixes to reapply after a rebuild.
    subscriptions: AsyncMutex<Vec<String>>,
}

struct EntryState {
    state: SocketState,
    failed_at: Option<Instant>,
}

impl<H> SocketEntry<H> {
    fn new(socket: H) -> Self {
        Self {
            port: 0,
            state: AsyncMutex::new(EntryState {
                state: SocketState::Healthy,
                failed_at: None,
            }),
            socket: AsyncMutex::new(Some(socket)),
            subscriptions: AsyncMutex::new(Vec::new()),
        }
    }

    /// Mark this entry FAILED, close the socket (by dropping it — `tmq`
    /// sockets apply their configured linger on drop), and record the
    /// failure. SPEC_FULL.md §4.2 `fail(entry, reason)`.
    pub async fn fail(&self, metrics: &MetricsCounters, pattern: SocketPattern, reason: &str) {
        let mut state = self.state.lock().await;
        state.state = SocketState::Failed;
        state.failed_at = Some(Instant::now());
        *self.socket.lock().await = None;
        metrics.errors();
        warn!(?pattern, port = self.port, reason, "socket marked failed");
    }

    /// Whether this entry is currently usable.
    pub async fn is_healthy(&self) -> bool {
        self.state.lock().await.state == SocketState::Healthy
    }

    async fn cooldown_elapsed(&self, cooldown: std::time::Duration) -> bool {
        match self.state.lock().await.failed_at {
            Some(failed_at) => failed_at.elapsed() >= cooldown,
            None => true,
        }
    }

    /// Lock the underlying socket slot for direct (possibly async) use.
    /// `None` means the entry has been failed and not yet rebuilt.
    pub async fn socket_guard(&self) -> tokio::sync::MutexGuard<'_, Option<H>> {
        self.socket.lock().await
    }
}

/// The registry of all sockets a [`crate::bus::MessageBus`] has opened.
pub struct SocketRegistry {
    ctx: ZmqContext,
    pub_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn PublisherSocket>>>>>,
    sub_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn SubscriberSocket>>>>>,
    push_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn PusherSocket>>>>>,
    pull_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn PullerSocket>>>>>,
    req_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn RequesterSocket>>>>>,
    rep_entries: AsyncMutex<HashMap<u16, std::sync::Arc<SocketEntry<Box<dyn ReplierSocket>>>>>,
}

/// The outcome of a lazy (sender-side) acquisition: either a usable entry
/// or "unavailable right now", which the caller turns into a drop.
pub enum Lazy<T> {
    Ready(T),
    Unavailable,
}

macro_rules! lazy_acquire {
    ($name:ident, $map:ident, $handle:ty, $pattern:expr, $create:expr) => {
        /// Lazily acquire an entry for sending: HEALTHY is reused,
        /// FAILED-but-in-cooldown returns `Unavailable` (the caller counts
        /// a drop), FAILED-past-cooldown or missing is (re)constructed. A
        /// bind failure here is swallowed into `Unavailable` — only
        /// `acquire_for_bind` surfaces `BindError`.
        pub async fn $name(
            &self,
            port: u16,
            config: &BusConfig,
            metrics: &MetricsCounters,
        ) -> Lazy<std::sync::Arc<SocketEntry<$handle>>> {
            let mut map = self.$map.lock().await;
            if let Some(entry) = map.get(&port) {
                if entry.is_healthy().await {
                    return Lazy::Ready(entry.clone());
                }
                if !entry.cooldown_elapsed(config.failed_socket_cooldown).await {
                    return Lazy::Unavailable;
                }
                map.remove(&port);
            }
            let endpoint = local_endpoint(port);
            match $create(&self.ctx, &endpoint, config) {
                Ok(socket) => {
                    let mut entry = SocketEntry::new(socket);
                    entry.port = port;
                    let entry = std::sync::Arc::new(entry);
                    map.insert(port, entry.clone());
                    Lazy::Ready(entry)
                }
                Err(err) => {
                    metrics.failed_bind_count();
                    warn!(pattern = ?$pattern, port, error = %err, "lazy socket construction failed");
                    Lazy::Unavailable
                }
            }
        }
    };
}

impl SocketRegistry {
    /// Create a registry owning a fresh transport context.
    pub fn new() -> Self {
        Self {
            ctx: ZmqContext::new(),
            pub_entries: AsyncMutex::new(HashMap::new()),
            sub_entries: AsyncMutex::new(HashMap::new()),
            push_entries: AsyncMutex::new(HashMap::new()),
            pull_entries: AsyncMutex::new(HashMap::new()),
            req_entries: AsyncMutex::new(HashMap::new()),
            rep_entries: AsyncMutex::new(HashMap::new()),
        }
    }

    lazy_acquire!(
        acquire_publisher,
        pub_entries,
        Box<dyn PublisherSocket>,
        SocketPattern::Pub,
        |ctx, endpoint, config: &BusConfig| create_publisher_and_connect(
            ctx,
            endpoint,
            config.hwm_outbound,
            config.close_linger_ms
        )
    );

    lazy_acquire!(
        acquire_pusher,
        push_entries,
        Box<dyn PusherSocket>,
        SocketPattern::Push,
        |ctx, endpoint, config: &BusConfig| create_pusher_and_connect(
            ctx,
            endpoint,
            config.hwm_outbound,
            config.close_linger_ms
        )
    );

    lazy_acquire!(
        acquire_requester,
        req_entries,
        Box<dyn RequesterSocket>,
        SocketPattern::Req,
        |ctx, endpoint, config: &BusConfig| create_requester_and_connect(
            ctx,
            endpoint,
            config.close_linger_ms
        )
    );

    /// Bind-side acquisition for `subscribe_loop`: propagates a bind
    /// failure to the caller as [`BindError`] rather than swallowing it.
    /// Used only on first bind; post-bind rebuilds after a transport
    /// failure go through the same construction but no longer surface
    /// errors (they are retried silently by the owning loop).
    pub async fn acquire_for_bind_subscriber(
        &self,
        port: u16,
        config: &BusConfig,
        metrics: &MetricsCounters,
        topics: &[String],
    ) -> Result<std::sync::Arc<SocketEntry<Box<dyn SubscriberSocket>>>, BindError> {
        let mut map = self.sub_entries.lock().await;
        if let Some(entry) = map.get(&port) {
            if entry.is_healthy().await {
                return Ok(entry.clone());
            }
            map.remove(&port);
        }
        let endpoint = local_endpoint(port);
        let socket = create_subscriber_and_bind(
            &self.ctx,
            &endpoint,
            config.hwm_inbound,
            config.close_linger_ms,
            topics,
        )
        .map_err(|source| {
            metrics.failed_bind_count();
            BindError {
                pattern: SocketPattern::Sub,
                role: SocketRole::Bind,
                port,
                source,
            }
        })?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        *entry.subscriptions.get_mut() = topics.to_vec();
        let entry = std::sync::Arc::new(entry);
        map.insert(port, entry.clone());
        Ok(entry)
    }

    /// Rebuild a SUB entry after a post-bind transport error, reapplying
    /// its prior subscriptions. Never surfaces an error to the loop caller
    /// — on failure the loop simply retries after another cooldown.
    pub async fn rebuild_subscriber(
        &self,
        port: u16,
        config: &BusConfig,
    ) -> anyhow::Result<std::sync::Arc<SocketEntry<Box<dyn SubscriberSocket>>>> {
        let topics = {
            let map = self.sub_entries.lock().await;
            match map.get(&port) {
                Some(entry) => entry.subscriptions.lock().await.clone(),
                None => Vec::new(),
            }
        };
        let endpoint = local_endpoint(port);
        let socket = create_subscriber_and_bind(
            &self.ctx,
            &endpoint,
            config.hwm_inbound,
            config.close_linger_ms,
            &topics,
        )?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        *entry.subscriptions.get_mut() = topics;
        let entry = std::sync::Arc::new(entry);
        self.sub_entries.lock().await.insert(port, entry.clone());
        Ok(entry)
    }

    /// Bind-side acquisition for `pull_results_loop`.
    pub async fn acquire_for_bind_puller(
        &self,
        port: u16,
        config: &BusConfig,
        metrics: &MetricsCounters,
    ) -> Result<std::sync::Arc<SocketEntry<Box<dyn PullerSocket>>>, BindError> {
        let mut map = self.pull_entries.lock().await;
        if let Some(entry) = map.get(&port) {
            if entry.is_healthy().await {
                return Ok(entry.clone());
            }
            map.remove(&port);
        }
        let endpoint = local_endpoint(port);
        let socket =
            create_puller_and_bind(&self.ctx, &endpoint, config.hwm_inbound, config.close_linger_ms)
                .map_err(|source| {
                    metrics.failed_bind_count();
                    BindError {
                        pattern: SocketPattern::Pull,
                        role: SocketRole::Bind,
                        port,
                        source,
                    }
                })?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        let entry = std::sync::Arc::new(entry);
        map.insert(port, entry.clone());
        Ok(entry)
    }

    /// Rebuild a PULL entry after a post-bind transport error.
    pub async fn rebuild_puller(
        &self,
        port: u16,
        config: &BusConfig,
    ) -> anyhow::Result<std::sync::Arc<SocketEntry<Box<dyn PullerSocket>>>> {
        let endpoint = local_endpoint(port);
        let socket =
            create_puller_and_bind(&self.ctx, &endpoint, config.hwm_inbound, config.close_linger_ms)?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        let entry = std::sync::Arc::new(entry);
        self.pull_entries.lock().await.insert(port, entry.clone());
        Ok(entry)
    }

    /// Bind-side acquisition for `response_loop`.
    pub async fn acquire_for_bind_replier(
        &self,
        port: u16,
        config: &BusConfig,
        metrics: &MetricsCounters,
    ) -> Result<std::sync::Arc<SocketEntry<Box<dyn ReplierSocket>>>, BindError> {
        let mut map = self.rep_entries.lock().await;
        if let Some(entry) = map.get(&port) {
            if entry.is_healthy().await {
                return Ok(entry.clone());
            }
            map.remove(&port);
        }
        let endpoint = local_endpoint(port);
        let socket = create_replier_and_bind(&self.ctx, &endpoint, config.close_linger_ms)
            .map_err(|source| {
                metrics.failed_bind_count();
                BindError {
                    pattern: SocketPattern::Rep,
                    role: SocketRole::Bind,
                    port,
                    source,
                }
            })?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        let entry = std::sync::Arc::new(entry);
        map.insert(port, entry.clone());
        Ok(entry)
    }

    /// Rebuild a REP entry after a post-bind transport error.
    pub async fn rebuild_replier(
        &self,
        port: u16,
        config: &BusConfig,
    ) -> anyhow::Result<std::sync::Arc<SocketEntry<Box<dyn ReplierSocket>>>> {
        let endpoint = local_endpoint(port);
        let socket = create_replier_and_bind(&self.ctx, &endpoint, config.close_linger_ms)?;
        let mut entry = SocketEntry::new(socket);
        entry.port = port;
        let entry = std::sync::Arc::new(entry);
        self.rep_entries.lock().await.insert(port, entry.clone());
        Ok(entry)
    }

    /// Count of HEALTHY entries across every pattern — the derived
    /// `active_connections` gauge (SPEC_FULL.md §9 open-question decision).
    pub async fn active_connections(&self) -> u64 {
        let mut count = 0u64;
        for entry in self.pub_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        for entry in self.sub_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        for entry in self.push_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        for entry in self.pull_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        for entry in self.req_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        for entry in self.rep_entries.lock().await.values() {
            if entry.is_healthy().await {
                count += 1;
            }
        }
        count
    }

    /// Close every socket by dropping the registry's maps. Called from
    /// `MessageBus::cleanup` after every loop has been cancelled and
    /// joined.
    pub async fn close_all(&self) {
        self.pub_entries.lock().await.clear();
        self.sub_entries.lock().await.clear();
        self.push_entries.lock().await.clear();
        self.pull_entries.lock().await.clear();
        self.req_entries.lock().await.clear();
        self.rep_entries.lock().await.clear();
    }
}

impl Default for SocketRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_is_derived_from_pattern() {
        assert_eq!(SocketPattern::Pub.role(), SocketRole::Bind);
        assert_eq!(SocketPattern::Pull.role(), SocketRole::Bind);
        assert_eq!(SocketPattern::Rep.role(), SocketRole::Bind);
        assert_eq!(SocketPattern::Sub.role(), SocketRole::Connect);
        assert_eq!(SocketPattern::Push.role(), SocketRole::Connect);
        assert_eq!(SocketPattern::Req.role(), SocketRole::Connect);
    }

    #[tokio::test]
    async fn fresh_registry_has_no_active_connections() {
        let registry = SocketRegistry::new();
        assert_eq!(registry.active_connections().await, 0);
    }
}
