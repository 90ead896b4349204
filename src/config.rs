//! Bus configuration.
//!
//! `BusConfig` is a plain in-process value — it is constructed by the
//! caller and handed to [`crate::bus::MessageBus::new`]. Loading it from a
//! file or the environment is the caller's concern, not this crate's.

use std::time::Duration;

use tracing::Level;

/// Default port for the broadcast (PUB/SUB) event bus.
pub const GLOBAL_EVENTS: u16 = 5555;
/// Default port for the work-queue (PUSH/PULL) result stream.
pub const TASK_RESULTS: u16 = 5556;
/// Default port for the synchronous (REQ/REP) control channel.
pub const STATE_MANAGEMENT: u16 = 5557;

/// Selects the wire encoding used by [`crate::serializer::Serializer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializerKind {
    /// Standard JSON, UTF-8, non-ASCII preserved.
    Json,
    /// MessagePack via `rmp-serde`.
    Fast,
}

impl Default for SerializerKind {
    fn default() -> Self {
        Self::Json
    }
}

/// Configuration for a [`crate::bus::MessageBus`] instance.
///
/// All fields are optional in the sense that [`BusConfig::default`] gives a
/// complete, usable configuration; callers override only what they need via
/// the `with_*` builder methods.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Send-side high-water mark applied to PUB/PUSH/REQ sockets.
    pub hwm_outbound: i32,
    /// Recv-side high-water mark applied to SUB/PULL/REP sockets.
    pub hwm_inbound: i32,
    /// Deadline for a single `publish` send.
    pub pub_send_timeout: Duration,
    /// Deadline for a single `push_result` send.
    pub push_send_timeout: Duration,
    /// Total send+recv deadline for `request`; halved per phase.
    pub req_total_timeout: Duration,
    /// Deadline for a single `response_loop` receive.
    pub rep_recv_timeout: Duration,
    /// Deadline for a single `response_loop` reply send.
    pub rep_send_timeout: Duration,
    /// Cooldown before a FAILED socket entry is eligible for rebuild.
    pub failed_socket_cooldown: Duration,
    /// Semaphore capacity for concurrent subscriber handler dispatch.
    /// `None` means unlimited.
    pub handler_max_concurrency: Option<usize>,
    /// Log level used when a subscribed topic has no registered handler.
    pub log_level_no_handler: Level,
    /// Wire encoding backend.
    pub serializer: SerializerKind,
    /// Linger applied when closing a socket, in milliseconds.
    pub close_linger_ms: i32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            hwm_outbound: 1000,
            hwm_inbound: 1000,
            pub_send_timeout: Duration::from_secs_f64(1.0),
            push_send_timeout: Duration::from_secs_f64(1.0),
            req_total_timeout: Duration::from_secs_f64(5.0),
            rep_recv_timeout: Duration::from_secs_f64(30.0),
            rep_send_timeout: Duration::from_secs_f64(5.0),
            failed_socket_cooldown: Duration::from_secs_f64(10.0),
            handler_max_concurrency: None,
            log_level_no_handler: Level::DEBUG,
            serializer: SerializerKind::Json,
            close_linger_ms: 100,
        }
    }
}

impl BusConfig {
    /// Start from the defaults in SPEC_FULL.md §6.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override both HWMs at once.
    pub fn with_hwm(mut self, outbound: i32, inbound: i32) -> Self {
        self.hwm_outbound = outbound;
        self.hwm_inbound = inbound;
        self
    }

    /// Override the publish send deadline.
    pub fn with_pub_send_timeout(mut self, timeout: Duration) -> Self {
        self.pub_send_timeout = timeout;
        self
    }

    /// Override the push send deadline.
    pub fn with_push_send_timeout(mut self, timeout: Duration) -> Self {
        self.push_send_timeout = timeout;
        self
    }

    /// Override the request total (send+recv) deadline.
    pub fn with_req_total_timeout(mut self, timeout: Duration) -> Self {
        self.req_total_timeout = timeout;
        self
    }

    /// Override the response-loop recv deadline.
    pub fn with_rep_recv_timeout(mut self, timeout: Duration) -> Self {
        self.rep_recv_timeout = timeout;
        self
    }

    /// Override the response-loop send deadline.
    pub fn with_rep_send_timeout(mut self, timeout: Duration) -> Self {
        self.rep_send_timeout = timeout;
        self
    }

    /// Override the failed-socket cooldown.
    pub fn with_failed_socket_cooldown(mut self, cooldown: Duration) -> Self {
        self.failed_socket_cooldown = cooldown;
        self
    }

    /// Cap concurrent subscriber handler dispatch at `max`.
    pub fn with_handler_max_concurrency(mut self, max: usize) -> Self {
        self.handler_max_concurrency = Some(max);
        self
    }

    /// Select the wire encoding backend.
    pub fn with_serializer(mut self, kind: SerializerKind) -> Self {
        self.serializer = kind;
        self
    }

    /// Override the close linger, in milliseconds.
    pub fn with_close_linger_ms(mut self, linger_ms: i32) -> Self {
        self.close_linger_ms = linger_ms;
        self
    }

    /// Override the log level used for unhandled-topic notices.
    pub fn with_log_level_no_handler(mut self, level: Level) -> Self {
        self.log_level_no_handler = level;
        self
    }

    /// `req_total_timeout` split evenly between the send and recv phases.
    pub fn req_phase_timeout(&self) -> Duration {
        self.req_total_timeout / 2
    }
}
