//! Asynchronous ZMQ-backed messaging middleware for a trading runtime:
//! broadcast pub/sub, work-queue push/pull, and synchronous request/reply,
//! all multiplexed over one [`SocketRegistry`](registry::SocketRegistry)
//! and a single [`MessageBus`] handle.
//!
//! ```no_run
//! use quantbus::{BusConfig, MessageBus, Payload};
//!
//! # async fn run() {
//! let bus = MessageBus::new(BusConfig::new());
//! bus.publish("ticks", Payload::new(serde_json::json!({"symbol": "AAPL"}))).await;
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod mux;
pub mod payload;
pub mod registry;
pub mod serializer;
pub mod socket;

pub use bus::MessageBus;
pub use config::{BusConfig, SerializerKind, GLOBAL_EVENTS, STATE_MANAGEMENT, TASK_RESULTS};
pub use error::{BindError, DecodeError, EncodeError};
pub use handler::{CooperativeFuture, HandlerKind, HandlerTable, PullHandler, ResponseFuture, ResponseHandler};
pub use metrics::{MetricsCounters, MetricsSnapshot};
pub use payload::Payload;
pub use registry::{SocketPattern, SocketRole};
pub use serializer::{FastSerializer, JsonSerializer, Serializer};
