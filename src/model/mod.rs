use std::fmt;
use std::time::Instant;

/// Lifecycle of one connection to the recording service.
///
/// `Closed` is terminal for a session; reconnecting means starting a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Identifying,
    Ready,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    Recording,
}

/// The recording transition a command is meant to achieve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Start,
    Stop,
}

impl Intent {
    /// Fixed correlation id. Only one command per intent is ever outstanding,
    /// so a sentinel is enough to match the response.
    pub fn correlation_id(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
        }
    }

    pub fn from_correlation_id(id: &str) -> Option<Self> {
        match id {
            "start" => Some(Self::Start),
            "stop" => Some(Self::Stop),
            _ => None,
        }
    }

    /// Recording state reached once the command is confirmed.
    pub fn target(self) -> RecordingState {
        match self {
            Self::Start => RecordingState::Recording,
            Self::Stop => RecordingState::Idle,
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.correlation_id())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCommand {
    pub correlation_id: String,
    pub intent: Intent,
    pub issued_at: Instant,
}

/// Consistent view of the shared state, taken under one lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    pub connection: ConnectionState,
    pub recording: RecordingState,
    pub pending: Option<Intent>,
}
