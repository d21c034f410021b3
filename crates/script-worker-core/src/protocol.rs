//! Wire vocabulary exchanged between the controller and the execution host.
//!
//! Every message is a single JSON object whose `cmd` field carries the tag.
//! Host events whose tag starts with `cmd:` are custom extension messages and
//! decode as [`HostEvent::Custom`].

use std::{collections::BTreeSet, fmt, num::NonZeroU32, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

/// Tag prefix of custom host messages.
pub const CUSTOM_PREFIX: &str = "cmd:";

const EVENT_TAGS: [&str; 8] = [
    "print", "clear", "figure", "dirty", "file", "input", "status", "done",
];

/// Protocol error.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Message has no `cmd` tag")]
    MissingTag,
    #[error("Unknown message tag: {0}")]
    UnknownTag(String),
    #[error("Unknown debugger command: {0}")]
    UnknownDebugCommand(String),
}

/// Options sent to a freshly created host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostOptions {
    /// Host should ask the controller for input instead of failing.
    pub handle_input: bool,
    /// Consumer echoes input inline in a shared output buffer.
    pub inline_input: bool,
}

/// Debugger resume command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebugCommand {
    Next,
    Step,
    Return,
    Continue,
    Quit,
}

impl DebugCommand {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Next => "next",
            Self::Step => "step",
            Self::Return => "return",
            Self::Continue => "continue",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for DebugCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DebugCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "next" => Ok(Self::Next),
            "step" => Ok(Self::Step),
            "return" => Ok(Self::Return),
            "continue" => Ok(Self::Continue),
            "quit" => Ok(Self::Quit),
            other => Err(ProtocolError::UnknownDebugCommand(other.to_string())),
        }
    }
}

/// Ordered set of positive source line numbers.
///
/// Serialized as an ascending JSON array. Whether a line can actually hold a
/// breakpoint is up to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BreakpointSet(BTreeSet<NonZeroU32>);

impl BreakpointSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Add a line. Returns false for line 0 or a line already present.
    pub fn insert(&mut self, line: u32) -> bool {
        NonZeroU32::new(line).is_some_and(|line| self.0.insert(line))
    }

    /// Remove a line.
    pub fn remove(&mut self, line: u32) -> bool {
        NonZeroU32::new(line).is_some_and(|line| self.0.remove(&line))
    }

    #[must_use]
    pub fn contains(&self, line: u32) -> bool {
        NonZeroU32::new(line).is_some_and(|line| self.0.contains(&line))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lines in ascending order.
    pub fn lines(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().map(|line| line.get())
    }
}

impl FromIterator<u32> for BreakpointSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().filter_map(NonZeroU32::new).collect())
    }
}

/// Command sent from the controller to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum HostCommand {
    /// Sent once right after the host is created.
    Config { options: HostOptions },
    /// Execute source code.
    Run {
        code: String,
        #[serde(default)]
        breakpoints: BreakpointSet,
    },
    /// Warm up the interpreter without running user code.
    Preload,
    /// Answer a pending input request.
    Submit {
        #[serde(rename = "str")]
        text: String,
    },
    /// Abandon a pending input request.
    Cancel,
    /// Resume a suspended debugger.
    Debug { dbg: DebugCommand },
    /// Ask for the content of a file.
    Get { path: String },
    /// Write a file. Not acknowledged.
    Put { path: String, data: Value },
    /// Discard the current graphical output.
    ClearFigure,
}

impl HostCommand {
    /// Encode as a single JSON line (without the trailing newline).
    ///
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a JSON message.
    ///
    /// # Errors
    /// Returns error if the message is not a known command.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire tag of this command.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Run { .. } => "run",
            Self::Preload => "preload",
            Self::Submit { .. } => "submit",
            Self::Cancel => "cancel",
            Self::Debug { .. } => "debug",
            Self::Get { .. } => "get",
            Self::Put { .. } => "put",
            Self::ClearFigure => "clearFigure",
        }
    }
}

/// Event emitted by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum HostEvent {
    /// Incremental output text.
    Print { data: String },
    /// Output should be cleared.
    Clear,
    /// New graphical output frame (image data URL).
    Figure { data: String },
    /// A file was modified by the script.
    Dirty { data: String },
    /// Answer to a `get` command.
    File { path: String, data: Value },
    /// Host is blocked on a line of input.
    Input { prompt: String },
    /// Free-form status label.
    Status { status: String },
    /// Activity ended; `Some(line)` means paused at a breakpoint.
    Done { suspended_at: Option<u32> },
    /// `cmd:<name>` extension message.
    Custom { name: String, data: Value },
}

#[derive(Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
enum WireEvent {
    Print {
        data: String,
    },
    Clear,
    Figure {
        data: String,
    },
    Dirty {
        data: String,
    },
    File {
        path: String,
        #[serde(default)]
        data: Value,
    },
    Input {
        #[serde(default)]
        prompt: String,
    },
    Status {
        status: String,
    },
    Done {
        #[serde(rename = "suspendedAt", default)]
        suspended_at: Option<u32>,
    },
}

impl From<WireEvent> for HostEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Print { data } => Self::Print { data },
            WireEvent::Clear => Self::Clear,
            WireEvent::Figure { data } => Self::Figure { data },
            WireEvent::Dirty { data } => Self::Dirty { data },
            WireEvent::File { path, data } => Self::File { path, data },
            WireEvent::Input { prompt } => Self::Input { prompt },
            WireEvent::Status { status } => Self::Status { status },
            WireEvent::Done { suspended_at } => Self::Done { suspended_at },
        }
    }
}

impl TryFrom<Value> for HostEvent {
    type Error = ProtocolError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let tag = value
            .get("cmd")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingTag)?;

        if let Some(name) = tag.strip_prefix(CUSTOM_PREFIX) {
            return Ok(Self::Custom {
                name: name.to_string(),
                data: value.get("data").cloned().unwrap_or(Value::Null),
            });
        }
        if !EVENT_TAGS.contains(&tag) {
            return Err(ProtocolError::UnknownTag(tag.to_string()));
        }

        Ok(serde_json::from_value::<WireEvent>(value)?.into())
    }
}

impl From<HostEvent> for Value {
    fn from(event: HostEvent) -> Self {
        match event {
            HostEvent::Print { data } => json!({ "cmd": "print", "data": data }),
            HostEvent::Clear => json!({ "cmd": "clear" }),
            HostEvent::Figure { data } => json!({ "cmd": "figure", "data": data }),
            HostEvent::Dirty { data } => json!({ "cmd": "dirty", "data": data }),
            HostEvent::File { path, data } => json!({ "cmd": "file", "path": path, "data": data }),
            HostEvent::Input { prompt } => json!({ "cmd": "input", "prompt": prompt }),
            HostEvent::Status { status } => json!({ "cmd": "status", "status": status }),
            HostEvent::Done { suspended_at } => json!({ "cmd": "done", "suspendedAt": suspended_at }),
            HostEvent::Custom { name, data } => {
                json!({ "cmd": format!("{CUSTOM_PREFIX}{name}"), "data": data })
            }
        }
    }
}

impl HostEvent {
    /// Decode a JSON message.
    ///
    /// # Errors
    /// Returns error if the message is malformed or carries an unknown tag.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::try_from(value)
    }

    /// Decode a JSON message from raw bytes, as read off a host's stdout.
    ///
    /// # Errors
    /// Returns error if the bytes are not a JSON message with a known tag.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::try_from(value)
    }

    /// Encode as a single JSON line (without the trailing newline).
    #[must_use]
    pub fn to_json(&self) -> String {
        Value::from(self.clone()).to_string()
    }
}
