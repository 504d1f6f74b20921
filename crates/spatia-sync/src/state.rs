use std::fmt;

/// Connection trust level as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Connecting,
    Connected,
    Disconnected,
    /// Heartbeat proved the server alive again after a disconnect; collapses to
    /// `Connected` once the event stream opens.
    Recovered,
}

impl ConnectionState {
    /// Calls dispatch immediately only in these states.
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Recovered)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Recovered => "recovered",
        }
    }

    /// Indicator text for the interface layer; `None` when nothing should show.
    pub fn banner(self) -> Option<&'static str> {
        match self {
            ConnectionState::Connecting => Some("CONNECTING..."),
            ConnectionState::Disconnected => Some("CONNECTION LOST - RECONNECTING"),
            ConnectionState::Connected | ConnectionState::Recovered => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Pure connection state machine. Every method returns the transition it
/// caused, if any, so the caller can apply side effects in one place.
#[derive(Debug, Clone)]
pub struct ConnectionMachine {
    state: ConnectionState,
    failures: u32,
    max_failures: u32,
    workspace: Option<String>,
}

impl ConnectionMachine {
    pub fn new(max_failures: u32) -> Self {
        Self {
            state: ConnectionState::Connecting,
            failures: 0,
            max_failures: max_failures.max(1),
            workspace: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn workspace(&self) -> Option<&str> {
        self.workspace.as_deref()
    }

    pub fn heartbeat_succeeded(&mut self, workspace: Option<String>) -> Option<Transition> {
        self.failures = 0;
        if workspace.is_some() {
            self.workspace = workspace;
        }
        match self.state {
            ConnectionState::Connecting => self.move_to(ConnectionState::Connected),
            ConnectionState::Disconnected => self.move_to(ConnectionState::Recovered),
            ConnectionState::Connected | ConnectionState::Recovered => None,
        }
    }

    pub fn heartbeat_failed(&mut self) -> Option<Transition> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max_failures {
            self.move_to(ConnectionState::Disconnected)
        } else {
            None
        }
    }

    pub fn stream_opened(&mut self) -> Option<Transition> {
        if self.state == ConnectionState::Recovered {
            self.move_to(ConnectionState::Connected)
        } else {
            None
        }
    }

    fn move_to(&mut self, to: ConnectionState) -> Option<Transition> {
        if self.state == to {
            return None;
        }
        let from = std::mem::replace(&mut self.state, to);
        Some(Transition { from, to })
    }
}
