use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::events::EventSink;
use crate::http::HttpTransport;
use crate::queue::{ApiResponse, RequestQueue, RequestSpec};
use crate::spatial::{ConflictSink, SharedScene, SpatialChecker};
use crate::state::ConnectionState;
use crate::supervisor::ConnectionSupervisor;

/// Wires the HTTP transport, request queue, supervisor and (optionally) the
/// spatial checker into one handle.
pub struct SyncClient {
    config: SyncConfig,
    queue: Arc<RequestQueue>,
    supervisor: ConnectionSupervisor,
    checker: Option<SpatialChecker>,
}

impl SyncClient {
    pub fn new(config: SyncConfig, sink: Arc<dyn EventSink>) -> SyncResult<Self> {
        let config = config.normalize()?;
        let transport = Arc::new(HttpTransport::new(&config)?);
        let queue = Arc::new(RequestQueue::new(
            transport.clone(),
            config.queue_capacity,
            config.queue_expiry(),
        ));
        let supervisor = ConnectionSupervisor::new(
            transport.clone(),
            transport,
            queue.clone(),
            sink,
            &config,
        );
        Ok(Self {
            config,
            queue,
            supervisor,
            checker: None,
        })
    }

    /// Attaches a spatial checker over `scene`, run at the configured cadence.
    pub fn with_scene(mut self, scene: SharedScene, sink: Option<Arc<dyn ConflictSink>>) -> Self {
        let interval = self.config.spatial_interval();
        self.checker = Some(match sink {
            Some(sink) => SpatialChecker::with_sink(scene, interval, sink),
            None => SpatialChecker::new(scene, interval),
        });
        self
    }

    pub fn start(&self) {
        info!(
            target: "spatia.supervisor",
            base_url = %self.config.base_url,
            "starting sync client"
        );
        self.supervisor.start();
        if let Some(checker) = &self.checker {
            checker.start();
        }
    }

    /// Stops the heartbeat, the event stream and the checker. Calls still
    /// queued keep their expiry timers and settle on their own.
    pub fn shutdown(&self) {
        self.supervisor.stop();
        if let Some(checker) = &self.checker {
            checker.stop();
        }
        info!(
            target: "spatia.supervisor",
            pending = self.queue.pending(),
            "sync client stopped"
        );
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn checker(&self) -> Option<&SpatialChecker> {
        self.checker.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.subscribe()
    }

    pub fn workspace(&self) -> Option<String> {
        self.supervisor.workspace()
    }

    pub async fn request(&self, request: RequestSpec) -> SyncResult<ApiResponse> {
        self.queue.request(request).await
    }
}
