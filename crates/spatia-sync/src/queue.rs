use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::state::ConnectionState;

/// Transport-agnostic description of one outbound call.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpec {
    pub method: Method,
    pub path: String,
    pub body: Option<Value>,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiResponse {
    pub fn json<T: DeserializeOwned>(&self) -> SyncResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|err| SyncError::InvalidResponse(err.to_string()))
    }
}

/// Sends a request over whatever transport backs the queue.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, request: RequestSpec) -> SyncResult<ApiResponse>;
}

/// One entry of the geometry sync call `POST /api/geometry`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeometryUpdate {
    pub id: String,
    pub x: i64,
    pub y: i64,
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub dispatched: u64,
    pub flushed: u64,
    pub rejected_full: u64,
    pub expired: u64,
}

type Responder = oneshot::Sender<SyncResult<ApiResponse>>;

struct QueuedCall {
    id: u64,
    request: RequestSpec,
    responder: Responder,
    enqueued_at: Instant,
    expiry: AbortHandle,
}

struct QueueInner {
    state: ConnectionState,
    pending: VecDeque<QueuedCall>,
    next_id: u64,
    stats: QueueStats,
}

/// Deferred result of [`RequestQueue::submit`]. Always settles: success,
/// dispatch failure, `QUEUE_FULL`, or `QUEUE_TIMEOUT`.
#[must_use = "a pending call settles whether or not it is awaited"]
pub struct PendingCall {
    rx: oneshot::Receiver<SyncResult<ApiResponse>>,
}

impl Future for PendingCall {
    type Output = SyncResult<ApiResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(SyncError::Shutdown)))
    }
}

/// Connection-aware request queue.
///
/// While the connection is untrusted, calls are held (bounded by `capacity`)
/// and each carries its own expiry timer. A transition into `connected` or
/// `recovered` drains the queue in submission order. Must be used from within
/// a Tokio runtime.
pub struct RequestQueue {
    dispatcher: Arc<dyn Dispatch>,
    capacity: usize,
    expiry: Duration,
    inner: Arc<Mutex<QueueInner>>,
}

impl RequestQueue {
    pub fn new(dispatcher: Arc<dyn Dispatch>, capacity: usize, expiry: Duration) -> Self {
        Self {
            dispatcher,
            capacity,
            expiry,
            inner: Arc::new(Mutex::new(QueueInner {
                state: ConnectionState::Connecting,
                pending: VecDeque::with_capacity(capacity),
                next_id: 0,
                stats: QueueStats::default(),
            })),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.lock().state
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            ..inner.stats.clone()
        }
    }

    pub fn submit(&self, request: RequestSpec) -> PendingCall {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();

        if inner.state.is_ready() {
            inner.stats.dispatched += 1;
            drop(inner);
            self.spawn_dispatch(vec![(request, tx)]);
            return PendingCall { rx };
        }

        if inner.pending.len() >= self.capacity {
            inner.stats.rejected_full += 1;
            drop(inner);
            warn!(
                target: "spatia.queue",
                method = %request.method,
                path = %request.path,
                capacity = self.capacity,
                "request queue full; rejecting call"
            );
            let _ = tx.send(Err(SyncError::QueueFull {
                capacity: self.capacity,
            }));
            return PendingCall { rx };
        }

        let id = inner.next_id;
        inner.next_id += 1;
        debug!(
            target: "spatia.queue",
            method = %request.method,
            path = %request.path,
            state = %inner.state,
            pending = inner.pending.len() + 1,
            "queueing request until connection is trusted"
        );
        let expiry = self.spawn_expiry(id);
        inner.pending.push_back(QueuedCall {
            id,
            request,
            responder: tx,
            enqueued_at: Instant::now(),
            expiry,
        });
        PendingCall { rx }
    }

    pub async fn request(&self, request: RequestSpec) -> SyncResult<ApiResponse> {
        self.submit(request).await
    }

    pub fn get(&self, path: impl Into<String>) -> PendingCall {
        self.submit(RequestSpec::new(Method::GET, path))
    }

    pub fn delete(&self, path: impl Into<String>) -> PendingCall {
        self.submit(RequestSpec::new(Method::DELETE, path))
    }

    pub fn post(&self, path: impl Into<String>, body: Value) -> PendingCall {
        self.submit(RequestSpec::new(Method::POST, path).with_body(body))
    }

    pub fn put(&self, path: impl Into<String>, body: Value) -> PendingCall {
        self.submit(RequestSpec::new(Method::PUT, path).with_body(body))
    }

    pub fn patch(&self, path: impl Into<String>, body: Value) -> PendingCall {
        self.submit(RequestSpec::new(Method::PATCH, path).with_body(body))
    }

    pub fn post_geometry(&self, updates: &[GeometryUpdate]) -> PendingCall {
        let body = Value::Array(
            updates
                .iter()
                .map(|update| serde_json::json!({ "id": update.id, "x": update.x, "y": update.y }))
                .collect(),
        );
        self.post("/api/geometry", body)
    }

    /// Records the supervisor's new state and flushes when it is trusted.
    pub fn notify_state_change(&self, state: ConnectionState) {
        let batch: Vec<QueuedCall> = {
            let mut inner = self.inner.lock();
            inner.state = state;
            if !state.is_ready() {
                return;
            }
            let drained: Vec<QueuedCall> = inner.pending.drain(..).collect();
            inner.stats.flushed += drained.len() as u64;
            drained
        };

        if batch.is_empty() {
            return;
        }
        info!(
            target: "spatia.queue",
            state = %state,
            count = batch.len(),
            "flushing queued requests"
        );

        let calls = batch
            .into_iter()
            .map(|call| {
                call.expiry.abort();
                debug!(
                    target: "spatia.queue",
                    call_id = call.id,
                    waited_ms = call.enqueued_at.elapsed().as_millis() as u64,
                    "dispatching queued request"
                );
                (call.request, call.responder)
            })
            .collect();
        self.spawn_dispatch(calls);
    }

    /// Starts every call in order; responses settle independently.
    fn spawn_dispatch(&self, calls: Vec<(RequestSpec, Responder)>) {
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            let sends = calls.into_iter().map(|(request, responder)| {
                let dispatcher = Arc::clone(&dispatcher);
                async move {
                    let result = dispatcher.dispatch(request).await;
                    let _ = responder.send(result);
                }
            });
            futures::future::join_all(sends).await;
        });
    }

    fn spawn_expiry(&self, id: u64) -> AbortHandle {
        let inner = Arc::clone(&self.inner);
        let expiry = self.expiry;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            let expired = {
                let mut guard = inner.lock();
                let position = guard.pending.iter().position(|call| call.id == id);
                let call = position.and_then(|index| guard.pending.remove(index));
                if call.is_some() {
                    guard.stats.expired += 1;
                }
                call
            };
            if let Some(call) = expired {
                let waited = call.enqueued_at.elapsed();
                warn!(
                    target: "spatia.queue",
                    method = %call.request.method,
                    path = %call.request.path,
                    waited_ms = waited.as_millis() as u64,
                    "queued request expired before connection was trusted"
                );
                let _ = call.responder.send(Err(SyncError::QueueTimeout { waited }));
            }
        });
        handle.abort_handle()
    }
}

impl Drop for RequestQueue {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        for call in inner.pending.drain(..) {
            call.expiry.abort();
            let _ = call.responder.send(Err(SyncError::Shutdown));
        }
    }
}
