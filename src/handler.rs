//! The handler table (SPEC_FULL.md §3, §9).
//!
//! The source detects coroutine-ness of a callable at registration time;
//! this rendering makes the distinction explicit per §9's instruction,
//! with two variants routed to either a direct task spawn or
//! `spawn_blocking`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::payload::Payload;

/// A cooperative handler's future.
pub type CooperativeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A `response_loop` reply-producing future.
pub type ResponseFuture = Pin<Box<dyn Future<Output = Payload> + Send>>;

/// Request handler bound to a `response_loop`: takes the decoded request
/// payload, returns the reply to send back. Exactly one call per request.
pub type ResponseHandler = Arc<dyn Fn(Payload) -> ResponseFuture + Send + Sync>;

/// `pull_results_loop` hook, invoked once per pulled message on the
/// blocking worker pool.
pub type PullHandler = Arc<dyn Fn(Payload) + Send + Sync>;

/// A handler bound to a topic: either cooperative (runs directly as a
/// spawned task) or blocking (runs on the blocking worker pool so the
/// subscribe loop never stalls behind it).
#[derive(Clone)]
pub enum HandlerKind {
    /// Returns a future; dispatched with `tokio::spawn`.
    Cooperative(Arc<dyn Fn(String, Payload) -> CooperativeFuture + Send + Sync>),
    /// Ordinary blocking function; dispatched with `tokio::task::spawn_blocking`.
    Blocking(Arc<dyn Fn(String, Payload) + Send + Sync>),
}

/// Topic → handler map, shared between `register_handler` callers and the
/// subscribe dispatch loop.
#[derive(Default, Clone)]
pub struct HandlerTable {
    inner: Arc<RwLock<HashMap<String, HandlerKind>>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or atomically replace) the handler for `topic`.
    pub async fn register(&self, topic: impl Into<String>, handler: HandlerKind) {
        self.inner.write().await.insert(topic.into(), handler);
    }

    /// Look up the handler bound to `topic`, if any.
    pub async fn get(&self, topic: &str) -> Option<HandlerKind> {
        self.inner.read().await.get(topic).cloned()
    }
}
