use std::collections::VecDeque;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Default SSE event name for frames without an `event:` line.
pub const DEFAULT_EVENT_NAME: &str = "message";

/// One `event:`/`data:` frame as delivered by the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub event: String,
    pub data: String,
}

impl RawFrame {
    pub fn message(data: impl Into<String>) -> Self {
        Self {
            event: DEFAULT_EVENT_NAME.to_string(),
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    DbUpdate,
    Update,
    ThreadNew,
    WorldReset,
    EnvelopeUpdate,
    EnvelopeDelete,
    WorldEjected,
    Connected,
    EchoResponse,
    Other(String),
}

impl EventKind {
    pub fn parse(value: &str) -> EventKind {
        match value {
            "db_update" => EventKind::DbUpdate,
            "update" => EventKind::Update,
            "thread_new" => EventKind::ThreadNew,
            "world_reset" => EventKind::WorldReset,
            "envelope_update" => EventKind::EnvelopeUpdate,
            "envelope_delete" => EventKind::EnvelopeDelete,
            "world_ejected" => EventKind::WorldEjected,
            "connected" => EventKind::Connected,
            "echo_response" => EventKind::EchoResponse,
            other => EventKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventKind::DbUpdate => "db_update",
            EventKind::Update => "update",
            EventKind::ThreadNew => "thread_new",
            EventKind::WorldReset => "world_reset",
            EventKind::EnvelopeUpdate => "envelope_update",
            EventKind::EnvelopeDelete => "envelope_delete",
            EventKind::WorldEjected => "world_ejected",
            EventKind::Connected => "connected",
            EventKind::EchoResponse => "echo_response",
            EventKind::Other(name) => name.as_str(),
        }
    }

    /// Whether this event mandates a full resynchronisation.
    pub fn triggers_sync(&self) -> bool {
        matches!(
            self,
            EventKind::DbUpdate
                | EventKind::Update
                | EventKind::ThreadNew
                | EventKind::WorldReset
                | EventKind::EnvelopeUpdate
                | EventKind::EnvelopeDelete
                | EventKind::WorldEjected
        )
    }
}

/// A decoded stream message: its type plus every other top-level field.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub payload: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Event(StreamEvent),
    /// Not JSON, not an object, or no type from either the payload or the
    /// frame name. Treated as a catch-all sync trigger.
    Unparsable { reason: String },
}

pub fn decode(frame: &RawFrame) -> Decoded {
    let value: Value = match serde_json::from_str(&frame.data) {
        Ok(value) => value,
        Err(err) => {
            return Decoded::Unparsable {
                reason: err.to_string(),
            }
        }
    };
    let mut payload = match value {
        Value::Object(map) => map,
        other => {
            return Decoded::Unparsable {
                reason: format!("expected a JSON object, got {other}"),
            }
        }
    };
    let kind = match payload.remove("type") {
        Some(Value::String(kind)) => EventKind::parse(&kind),
        Some(other) => {
            return Decoded::Unparsable {
                reason: format!("type must be a string, got {other}"),
            }
        }
        None if !frame.event.is_empty() && frame.event != DEFAULT_EVENT_NAME => {
            EventKind::parse(&frame.event)
        }
        None => {
            return Decoded::Unparsable {
                reason: "missing type".to_string(),
            }
        }
    };
    Decoded::Event(StreamEvent { kind, payload })
}

/// External collaborator notified by the dispatcher.
pub trait EventSink: Send + Sync {
    /// Local state must be refetched. May be called redundantly.
    fn on_sync_required(&self);

    /// Every successfully decoded message, regardless of type.
    fn on_event(&self, _event: &StreamEvent) {}
}

impl<F> EventSink for F
where
    F: Fn() + Send + Sync,
{
    fn on_sync_required(&self) {
        (self)()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Observed,
    Resync,
    FailOpen,
}

pub struct EventDispatcher<S: ?Sized> {
    sink: std::sync::Arc<S>,
}

impl<S: EventSink + ?Sized> EventDispatcher<S> {
    pub fn new(sink: std::sync::Arc<S>) -> Self {
        Self { sink }
    }

    pub fn request_resync(&self) {
        self.sink.on_sync_required();
    }

    pub fn handle(&self, frame: &RawFrame) -> DispatchOutcome {
        match decode(frame) {
            Decoded::Event(event) => {
                self.sink.on_event(&event);
                if event.kind.triggers_sync() {
                    debug!(
                        target: "spatia.events",
                        kind = event.kind.as_str(),
                        "sync-triggering event received"
                    );
                    self.sink.on_sync_required();
                    DispatchOutcome::Resync
                } else {
                    DispatchOutcome::Observed
                }
            }
            Decoded::Unparsable { reason } => {
                warn!(
                    target: "spatia.events",
                    event = %frame.event,
                    reason = %reason,
                    "unparsable stream payload; resyncing"
                );
                self.sink.on_sync_required();
                DispatchOutcome::FailOpen
            }
        }
    }
}

impl<S: ?Sized> Clone for EventDispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            sink: std::sync::Arc::clone(&self.sink),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JournalEntry {
    pub received_at: SystemTime,
    pub kind: String,
    pub payload: Map<String, Value>,
}

/// Bounded, clearable log of observed events; oldest entries fall off first.
pub struct EventJournal {
    capacity: usize,
    entries: Mutex<VecDeque<JournalEntry>>,
}

impl EventJournal {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn record(&self, event: &StreamEvent) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(JournalEntry {
            received_at: SystemTime::now(),
            kind: event.kind.as_str().to_string(),
            payload: event.payload.clone(),
        });
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl EventSink for EventJournal {
    fn on_sync_required(&self) {}

    fn on_event(&self, event: &StreamEvent) {
        self.record(event);
    }
}
