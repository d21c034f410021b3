//! Session configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{HostOptions, OutputMode, event_log::DEFAULT_HISTORY_BYTES};

/// Default watchdog duration in seconds. Generous enough for heavy interpreter start-up.
pub const DEFAULT_TIMEOUT_SECS: i64 = 180;

/// Text printed to the output when the watchdog kills the host.
pub const DEFAULT_TIMEOUT_MESSAGE: &str = "\nTimeout\n";

/// Tuning knobs for one session.
///
/// Every field has a default, so partial JSON documents are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Watchdog duration in whole seconds; negative disables the watchdog.
    pub timeout_secs: i64,
    /// Output aggregation mode.
    pub output_mode: OutputMode,
    /// Ask the host to route input requests to the controller.
    pub handle_input: bool,
    /// Printed to the output on timeout; `None` prints nothing.
    pub timeout_message: Option<String>,
    /// Event history retained for late subscribers.
    pub history_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            output_mode: OutputMode::default(),
            handle_input: true,
            timeout_message: Some(DEFAULT_TIMEOUT_MESSAGE.to_string()),
            history_bytes: DEFAULT_HISTORY_BYTES,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON configuration document.
    ///
    /// # Errors
    /// Returns error if the document is not valid JSON or has mistyped fields.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    #[must_use]
    pub const fn with_timeout_secs(mut self, timeout_secs: i64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    #[must_use]
    pub const fn with_output_mode(mut self, output_mode: OutputMode) -> Self {
        self.output_mode = output_mode;
        self
    }

    #[must_use]
    pub const fn with_handle_input(mut self, handle_input: bool) -> Self {
        self.handle_input = handle_input;
        self
    }

    #[must_use]
    pub fn with_timeout_message(mut self, message: Option<impl Into<String>>) -> Self {
        self.timeout_message = message.map(Into::into);
        self
    }

    /// Watchdog duration, or `None` when disabled.
    #[must_use]
    pub fn watchdog_duration(&self) -> Option<Duration> {
        u64::try_from(self.timeout_secs).ok().map(Duration::from_secs)
    }

    /// Options sent to every new host.
    #[must_use]
    pub fn host_options(&self) -> HostOptions {
        HostOptions {
            handle_input: self.handle_input,
            inline_input: self.output_mode == OutputMode::Shared,
        }
    }
}
