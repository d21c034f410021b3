//! Output aggregation.

use serde::{Deserialize, Serialize};

/// How host output reaches the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The session owns the buffer and always hands out all of it.
    #[default]
    Private,
    /// The consumer owns the buffer (e.g. to echo input inline) and only gets increments.
    Shared,
}

/// Notification produced for every output change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum OutputUpdate {
    /// Overwrite displayed output with this text.
    Replace(String),
    /// Append this text to displayed output.
    Append(String),
    /// Clear displayed output.
    Clear,
}

/// Output buffer with replace-on-update (private) or append-only (shared) semantics.
#[derive(Debug, Clone, Default)]
pub struct OutputAggregator {
    mode: OutputMode,
    buffer: String,
}

impl OutputAggregator {
    #[must_use]
    pub const fn new(mode: OutputMode) -> Self {
        Self {
            mode,
            buffer: String::new(),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> OutputMode {
        self.mode
    }

    /// Aggregated text. Always empty in shared mode.
    #[must_use]
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Record incremental output.
    pub fn print(&mut self, text: &str) -> OutputUpdate {
        match self.mode {
            OutputMode::Private => {
                self.buffer.push_str(text);
                OutputUpdate::Replace(self.buffer.clone())
            }
            OutputMode::Shared => OutputUpdate::Append(text.to_string()),
        }
    }

    /// Reset output.
    pub fn clear(&mut self) -> OutputUpdate {
        match self.mode {
            OutputMode::Private => {
                self.buffer.clear();
                OutputUpdate::Replace(String::new())
            }
            OutputMode::Shared => OutputUpdate::Clear,
        }
    }
}
