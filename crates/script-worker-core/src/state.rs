//! Session activity state.

use serde::{Deserialize, Serialize};

/// What the session's host is doing right now.
///
/// "Busy" and "suspended" are derived from one value, so a host can never be
/// both computing and paused at a breakpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityState {
    /// No host, or a quiescent host.
    #[default]
    Idle,
    /// Host is warming up.
    Preloading,
    /// Host is executing user code.
    Running,
    /// Host is blocked on a line of input.
    AwaitingInput { prompt: String },
    /// Host is paused at a breakpoint.
    Suspended { line: u32 },
    /// Host died or could not be reached.
    Faulted { reason: String },
}

impl ActivityState {
    /// Host is computing and a terminal event is expected.
    #[must_use]
    pub const fn is_busy(&self) -> bool {
        matches!(self, Self::Preloading | Self::Running)
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }

    #[must_use]
    pub const fn suspended_line(&self) -> Option<u32> {
        match self {
            Self::Suspended { line } => Some(*line),
            _ => None,
        }
    }

    /// Pending input prompt, if any.
    #[must_use]
    pub fn prompt(&self) -> Option<&str> {
        match self {
            Self::AwaitingInput { prompt } => Some(prompt),
            _ => None,
        }
    }

    /// Short status label for display.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Idle => "ready",
            Self::Preloading => "startup",
            Self::Running => "running",
            Self::AwaitingInput { .. } => "input",
            Self::Suspended { .. } => "debug",
            Self::Faulted { .. } => "fault",
        }
    }
}
