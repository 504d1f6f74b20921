//! Spatia Sync: the client-side consistency layer shared by Spatia front ends.
//!
//! Responsibilities:
//! - supervising the heartbeat + event-stream pair and reducing it to a
//!   four-state connection machine
//! - deferring outbound calls until the connection is trusted, then replaying
//!   them in submission order
//! - classifying inbound stream events and requesting resynchronisation
//! - re-deriving spatial conflict flags over the locally held scene

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod queue;
pub mod spatial;
pub mod state;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use error::{ErrorKind, RemoteError, SyncError, SyncResult};
pub use events::{
    EventDispatcher, EventJournal, EventKind, EventSink, JournalEntry, RawFrame, StreamEvent,
};
pub use http::{HttpTransport, StreamSignal};
pub use queue::{
    ApiResponse, Dispatch, GeometryUpdate, PendingCall, QueueStats, RequestQueue, RequestSpec,
};
pub use reqwest::Method;
pub use spatial::{
    ConflictChange, ConflictSink, Point, Scene, SharedScene, Size, SpatialChecker, SpatialNode,
    Zone, DEFAULT_NODE_DOMAIN,
};
pub use state::{ConnectionMachine, ConnectionState, Transition};
pub use supervisor::{ConnectionSupervisor, EventStreamConnector, HealthProbe, HealthReport};
