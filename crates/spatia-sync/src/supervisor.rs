use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::{EventDispatcher, EventSink};
use crate::http::StreamSignal;
use crate::queue::RequestQueue;
use crate::state::{ConnectionMachine, ConnectionState, Transition};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub workspace: Option<String>,
}

/// Lightweight liveness probe. Any error counts as a failed heartbeat.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> SyncResult<HealthReport>;
}

/// Opens one event-stream connection per call.
pub trait EventStreamConnector: Send + Sync {
    fn connect(&self) -> BoxStream<'static, StreamSignal>;
}

struct StreamSlot {
    generation: u64,
    handle: AbortHandle,
}

struct Core {
    machine: ConnectionMachine,
    stream: Option<StreamSlot>,
    next_generation: u64,
}

struct Shared {
    probe: Arc<dyn HealthProbe>,
    streams: Arc<dyn EventStreamConnector>,
    queue: Arc<RequestQueue>,
    dispatcher: EventDispatcher<dyn EventSink>,
    interval: Duration,
    timeout: Duration,
    core: Mutex<Core>,
    state_tx: watch::Sender<ConnectionState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Turns the heartbeat + event-stream pair into the connection state machine.
///
/// The heartbeat is the only authority that can force `disconnected`; stream
/// errors merely drop the stream, which the next successful heartbeat reopens.
/// Every transition is forwarded to the request queue and published on a
/// watch channel for the interface layer.
pub struct ConnectionSupervisor {
    shared: Arc<Shared>,
}

impl ConnectionSupervisor {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        streams: Arc<dyn EventStreamConnector>,
        queue: Arc<RequestQueue>,
        sink: Arc<dyn EventSink>,
        config: &SyncConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        queue.notify_state_change(ConnectionState::Connecting);
        Self {
            shared: Arc::new(Shared {
                probe,
                streams,
                queue,
                dispatcher: EventDispatcher::new(sink),
                interval: config.heartbeat_interval(),
                timeout: config.heartbeat_timeout(),
                core: Mutex::new(Core {
                    machine: ConnectionMachine::new(config.max_failures),
                    stream: None,
                    next_generation: 0,
                }),
                state_tx,
                heartbeat: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().machine.state()
    }

    pub fn workspace(&self) -> Option<String> {
        let core = self.shared.core.lock();
        core.machine.workspace().map(str::to_string)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.core.lock().machine.failures()
    }

    pub fn stream_open(&self) -> bool {
        self.shared.core.lock().stream.is_some()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .heartbeat
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Starts the heartbeat loop. The first probe runs immediately.
    pub fn start(&self) {
        let mut heartbeat = self.shared.heartbeat.lock();
        if heartbeat.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                shared.tick().await;
            }
        }));
        info!(
            target: "spatia.supervisor",
            interval_ms = self.shared.interval.as_millis() as u64,
            "heartbeat started"
        );
    }

    /// Stops the heartbeat loop and tears down any open stream.
    pub fn stop(&self) {
        if let Some(handle) = self.shared.heartbeat.lock().take() {
            handle.abort();
            info!(target: "spatia.supervisor", "heartbeat stopped");
        }
        let mut core = self.shared.core.lock();
        self.shared.teardown_stream(&mut core);
    }

    /// Runs one heartbeat probe and applies its outcome.
    pub async fn tick(&self) -> ConnectionState {
        self.shared.tick().await
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    async fn tick(self: &Arc<Self>) -> ConnectionState {
        let probe = tokio::time::timeout(self.timeout, self.probe.probe());
        let outcome = match probe.await {
            Ok(result) => result.map_err(|err| err.to_string()),
            Err(_) => Err(format!("health probe timed out after {:?}", self.timeout)),
        };

        let mut core = self.core.lock();
        let transition = match outcome {
            Ok(report) => core.machine.heartbeat_succeeded(report.workspace),
            Err(reason) => {
                let transition = core.machine.heartbeat_failed();
                warn!(
                    target: "spatia.supervisor",
                    failures = core.machine.failures(),
                    reason = %reason,
                    "heartbeat failed"
                );
                transition
            }
        };
        if let Some(transition) = transition {
            self.apply(&mut core, transition);
        }
        self.ensure_stream(&mut core);
        core.machine.state()
    }

    fn apply(&self, core: &mut Core, transition: Transition) {
        info!(
            target: "spatia.supervisor",
            from = %transition.from,
            to = %transition.to,
            workspace = core.machine.workspace().unwrap_or(""),
            "connection state changed"
        );
        if transition.to == ConnectionState::Disconnected {
            self.teardown_stream(core);
        }
        self.queue.notify_state_change(transition.to);
        self.state_tx.send_replace(transition.to);
    }

    fn ensure_stream(self: &Arc<Self>, core: &mut Core) {
        if !core.machine.state().is_ready() || core.stream.is_some() {
            return;
        }
        let generation = core.next_generation;
        core.next_generation += 1;
        debug!(target: "spatia.supervisor", generation, "opening event stream");

        let stream = self.streams.connect();
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shared.run_stream(generation, stream).await;
        });
        core.stream = Some(StreamSlot {
            generation,
            handle: handle.abort_handle(),
        });
    }

    fn teardown_stream(&self, core: &mut Core) {
        if let Some(slot) = core.stream.take() {
            slot.handle.abort();
            info!(
                target: "spatia.supervisor",
                generation = slot.generation,
                "event stream closed"
            );
        }
    }

    async fn run_stream(
        self: Arc<Self>,
        generation: u64,
        mut stream: BoxStream<'static, StreamSignal>,
    ) {
        while let Some(signal) = stream.next().await {
            match signal {
                StreamSignal::Opened => {
                    {
                        let mut core = self.core.lock();
                        let current = core.stream.as_ref().map(|slot| slot.generation);
                        if current != Some(generation) {
                            debug!(
                                target: "spatia.supervisor",
                                generation,
                                "ignoring stale stream"
                            );
                            return;
                        }
                        if let Some(transition) = core.machine.stream_opened() {
                            self.apply(&mut core, transition);
                        }
                    }
                    info!(target: "spatia.supervisor", generation, "event stream open");
                    self.dispatcher.request_resync();
                }
                StreamSignal::Frame(frame) => {
                    self.dispatcher.handle(&frame);
                }
                StreamSignal::Failed(reason) => {
                    warn!(
                        target: "spatia.supervisor",
                        generation,
                        reason = %reason,
                        "event stream failed; waiting for next heartbeat"
                    );
                    break;
                }
            }
        }

        let mut core = self.core.lock();
        if core.stream.as_ref().map(|slot| slot.generation) == Some(generation) {
            core.stream = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use crate::events::RawFrame;
    use crate::testing::{
        settle, ChannelStreams, RecordingDispatch, RecordingSink, ScriptedProbe, SilentStreams,
    };

    struct Harness {
        supervisor: ConnectionSupervisor,
        probe: Arc<ScriptedProbe>,
        streams: Arc<ChannelStreams>,
        sink: Arc<RecordingSink>,
        queue: Arc<RequestQueue>,
        dispatch: Arc<RecordingDispatch>,
    }

    fn harness() -> Harness {
        let config = SyncConfig::default();
        let probe = Arc::new(ScriptedProbe::default());
        let streams = Arc::new(ChannelStreams::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatch = Arc::new(RecordingDispatch::default());
        let queue = Arc::new(RequestQueue::new(
            dispatch.clone(),
            config.queue_capacity,
            config.queue_expiry(),
        ));
        let supervisor = ConnectionSupervisor::new(
            probe.clone(),
            streams.clone(),
            queue.clone(),
            sink.clone(),
            &config,
        );
        Harness {
            supervisor,
            probe,
            streams,
            sink,
            queue,
            dispatch,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_connects_and_opens_the_stream() {
        let h = harness();
        assert_eq!(h.supervisor.state(), ConnectionState::Connecting);

        assert_eq!(h.supervisor.tick().await, ConnectionState::Connected);
        assert_eq!(h.queue.state(), ConnectionState::Connected);
        assert_eq!(h.supervisor.workspace().as_deref(), Some("test-workspace"));
        assert_eq!(h.streams.opened(), 1);
        assert!(h.supervisor.stream_open());

        h.streams.send(StreamSignal::Opened);
        assert!(settle(|| h.sink.resyncs() == 1).await);
        assert_eq!(h.supervisor.state(), ConnectionState::Connected);

        // a healthy heartbeat never opens a second stream
        h.supervisor.tick().await;
        assert_eq!(h.streams.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn three_failures_disconnect_and_close_the_stream() {
        let h = harness();
        h.supervisor.tick().await;
        h.probe.push(&[false, false, false]);

        assert_eq!(h.supervisor.tick().await, ConnectionState::Connected);
        assert_eq!(h.supervisor.tick().await, ConnectionState::Connected);
        assert_eq!(h.supervisor.consecutive_failures(), 2);
        assert_eq!(h.supervisor.tick().await, ConnectionState::Disconnected);

        assert!(!h.supervisor.stream_open());
        assert!(settle(|| h.streams.latest_closed()).await);
        assert_eq!(h.queue.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn recovery_flushes_and_collapses_once_the_stream_opens() {
        let h = harness();
        let mut states = h.supervisor.subscribe();
        h.supervisor.tick().await;
        h.probe.push(&[false, false, false]);
        for _ in 0..3 {
            h.supervisor.tick().await;
        }
        assert_eq!(h.supervisor.state(), ConnectionState::Disconnected);

        let held = h.queue.get("/api/atoms");
        assert_eq!(h.queue.pending(), 1);

        assert_eq!(h.supervisor.tick().await, ConnectionState::Recovered);
        assert_eq!(h.queue.pending(), 0);
        held.await.expect("flushed on recovery");
        assert_eq!(h.dispatch.calls(), vec!["GET /api/atoms"]);
        assert_eq!(h.streams.opened(), 2);

        h.streams.send(StreamSignal::Opened);
        let connected = || h.supervisor.state() == ConnectionState::Connected;
        assert!(settle(connected).await);
        assert_eq!(h.sink.resyncs(), 1);
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_errors_do_not_override_a_healthy_heartbeat() {
        let h = harness();
        h.supervisor.tick().await;
        h.streams.send(StreamSignal::Opened);
        h.streams
            .send(StreamSignal::Frame(RawFrame::message(r#"{"type":"thread_new"}"#)));
        h.streams
            .send(StreamSignal::Failed("connection reset".into()));

        assert!(settle(|| !h.supervisor.stream_open()).await);
        assert_eq!(h.supervisor.state(), ConnectionState::Connected);
        assert_eq!(h.sink.resyncs(), 2);
        assert_eq!(h.sink.event_types(), vec!["thread_new"]);

        h.supervisor.tick().await;
        assert_eq!(h.streams.opened(), 2);
        assert!(h.supervisor.stream_open());
    }

    #[tokio::test(start_paused = true)]
    async fn a_superseded_stream_cannot_touch_state() {
        let h = harness();
        h.supervisor.tick().await;
        h.probe.push(&[false, false, false]);
        for _ in 0..3 {
            h.supervisor.tick().await;
        }
        assert_eq!(h.supervisor.tick().await, ConnectionState::Recovered);
        assert!(h.supervisor.stream_open());

        // generation 0 was torn down on disconnect; generation 1 is live
        let shared = Arc::clone(&h.supervisor.shared);
        let failed = futures::stream::iter(vec![StreamSignal::Failed("late error".into())]);
        shared.clone().run_stream(0, failed.boxed()).await;
        let opened = futures::stream::iter(vec![StreamSignal::Opened]);
        shared.run_stream(0, opened.boxed()).await;

        assert_eq!(h.supervisor.state(), ConnectionState::Recovered);
        assert_eq!(h.sink.resyncs(), 0);
        assert!(h.supervisor.stream_open());

        h.streams.send(StreamSignal::Opened);
        let connected = || h.supervisor.state() == ConnectionState::Connected;
        assert!(settle(connected).await);
        assert_eq!(h.sink.resyncs(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_polls_on_its_cadence_until_stopped() {
        let h = harness();
        h.supervisor.start();
        assert!(h.supervisor.is_running());
        tokio::time::sleep(Duration::from_millis(6_010)).await;
        assert_eq!(h.probe.probes(), 4);

        h.supervisor.stop();
        assert!(!h.supervisor.is_running());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.probe.probes(), 4);
        assert!(!h.supervisor.stream_open());
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self) -> SyncResult<HealthReport> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(SyncError::Network("unreachable".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeouts_count_as_failures() {
        let config = SyncConfig::default();
        let queue = Arc::new(RequestQueue::new(
            Arc::new(RecordingDispatch::default()),
            config.queue_capacity,
            config.queue_expiry(),
        ));
        let supervisor = ConnectionSupervisor::new(
            Arc::new(HangingProbe),
            Arc::new(SilentStreams),
            queue,
            Arc::new(RecordingSink::default()),
            &config,
        );

        let started = tokio::time::Instant::now();
        for _ in 0..3 {
            supervisor.tick().await;
        }
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(4_500));
        assert!(elapsed < Duration::from_secs(5));
    }
}
