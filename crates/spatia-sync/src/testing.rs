//! Test doubles for the transport seams.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::events::{EventSink, StreamEvent};
use crate::http::StreamSignal;
use crate::queue::{ApiResponse, Dispatch, RequestSpec};
use crate::supervisor::{EventStreamConnector, HealthProbe, HealthReport};

#[derive(Default)]
pub(crate) struct RecordingDispatch {
    calls: Mutex<Vec<(String, Option<Value>)>>,
    delay: Option<Duration>,
    fail: bool,
}

impl RecordingDispatch {
    pub(crate) fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .map(|(call, _)| call.clone())
            .collect()
    }

    pub(crate) fn bodies(&self) -> Vec<Option<Value>> {
        self.calls
            .lock()
            .iter()
            .map(|(_, body)| body.clone())
            .collect()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatch {
    async fn dispatch(&self, request: RequestSpec) -> SyncResult<ApiResponse> {
        self.calls.lock().push((
            format!("{} {}", request.method, request.path),
            request.body.clone(),
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(SyncError::Network("connection refused".into()));
        }
        Ok(ApiResponse {
            status: 200,
            body: serde_json::json!({ "path": request.path }),
        })
    }
}

/// Replays scripted heartbeat outcomes; succeeds once the script runs dry.
#[derive(Default)]
pub(crate) struct ScriptedProbe {
    outcomes: Mutex<VecDeque<bool>>,
    probes: AtomicUsize,
}

impl ScriptedProbe {
    pub(crate) fn push(&self, outcomes: &[bool]) {
        self.outcomes.lock().extend(outcomes.iter().copied());
    }

    pub(crate) fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self) -> SyncResult<HealthReport> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let healthy = self.outcomes.lock().pop_front().unwrap_or(true);
        if healthy {
            Ok(HealthReport {
                workspace: Some("test-workspace".into()),
            })
        } else {
            Err(SyncError::Network("health probe refused".into()))
        }
    }
}

/// Hands out one channel-backed stream per `connect` call.
#[derive(Default)]
pub(crate) struct ChannelStreams {
    senders: Mutex<Vec<mpsc::UnboundedSender<StreamSignal>>>,
}

impl ChannelStreams {
    pub(crate) fn opened(&self) -> usize {
        self.senders.lock().len()
    }

    /// Sends on the most recently opened stream.
    pub(crate) fn send(&self, signal: StreamSignal) {
        if let Some(sender) = self.senders.lock().last() {
            let _ = sender.unbounded_send(signal);
        }
    }

    pub(crate) fn latest_closed(&self) -> bool {
        self.senders
            .lock()
            .last()
            .map(|sender| sender.is_closed())
            .unwrap_or(true)
    }
}

impl EventStreamConnector for ChannelStreams {
    fn connect(&self) -> BoxStream<'static, StreamSignal> {
        let (tx, rx) = mpsc::unbounded();
        self.senders.lock().push(tx);
        rx.boxed()
    }
}

/// Connector whose streams never yield; used when only lifecycle matters.
pub(crate) struct SilentStreams;

impl EventStreamConnector for SilentStreams {
    fn connect(&self) -> BoxStream<'static, StreamSignal> {
        stream::pending().boxed()
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    resyncs: AtomicUsize,
    events: Mutex<Vec<StreamEvent>>,
}

impl RecordingSink {
    pub(crate) fn resyncs(&self) -> usize {
        self.resyncs.load(Ordering::SeqCst)
    }

    pub(crate) fn event_types(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|event| event.kind.as_str().to_string())
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn on_sync_required(&self) {
        self.resyncs.fetch_add(1, Ordering::SeqCst);
    }

    fn on_event(&self, event: &StreamEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Yields to the scheduler until `condition` holds or the budget runs out.
pub(crate) async fn settle(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}
