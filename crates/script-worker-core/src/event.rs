//! Events published by a session to its consumers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ActivityState, OutputUpdate};

/// Session event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Activity state changed.
    State { state: ActivityState },
    /// Output changed.
    Output { update: OutputUpdate },
    /// New graphical output frame.
    Figure { data_url: String },
    /// Script modified a file.
    DirtyFile { path: String },
    /// File content requested with `get_file`.
    File { path: String, data: Value },
    /// Host waits for a line of input.
    InputRequested { prompt: String },
    /// Free-form host status label.
    Status { label: String },
    /// Host paused at a breakpoint.
    Suspended { line: u32 },
    /// Breakpoint marker removed.
    SuspensionCleared { line: u32 },
    /// Execution finished normally.
    Terminated,
    /// Host was hard-stopped on request.
    Stopped,
    /// Watchdog killed the host.
    TimedOut,
    /// Host failed.
    HostFault { message: String },
}

impl SessionEvent {
    /// Rough size used to cap history.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        const OVERHEAD: usize = 16;
        let payload = match self {
            Self::State { state } => match state {
                ActivityState::AwaitingInput { prompt } => prompt.len(),
                ActivityState::Faulted { reason } => reason.len(),
                _ => 0,
            },
            Self::Output { update } => match update {
                OutputUpdate::Replace(text) | OutputUpdate::Append(text) => text.len(),
                OutputUpdate::Clear => 0,
            },
            Self::Figure { data_url: text }
            | Self::DirtyFile { path: text }
            | Self::InputRequested { prompt: text }
            | Self::Status { label: text }
            | Self::HostFault { message: text } => text.len(),
            Self::File { path, data } => path.len() + data.to_string().len(),
            Self::Suspended { .. }
            | Self::SuspensionCleared { .. }
            | Self::Terminated
            | Self::Stopped
            | Self::TimedOut => 0,
        };
        OVERHEAD + payload
    }
}
