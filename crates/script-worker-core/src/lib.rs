//! Core abstractions for script worker sessions.
//!
//! This crate provides the fundamental building blocks:
//! - `HostCommand` / `HostEvent` - The controller/host wire vocabulary
//! - `HostLauncher` / `HostHandle` - The execution host contract
//! - `ActivityState` - Explicit session activity state
//! - `OutputAggregator` - Private or shared output buffering
//! - `EventLog` - Broadcast + history of session events
//! - `SessionConfig` - Session tuning knobs

pub mod config;
pub mod event;
pub mod event_log;
pub mod output;
pub mod protocol;
pub mod state;
pub mod traits;

pub use config::SessionConfig;
pub use event::SessionEvent;
pub use event_log::EventLog;
pub use output::{OutputAggregator, OutputMode, OutputUpdate};
pub use protocol::{BreakpointSet, DebugCommand, HostCommand, HostEvent, HostOptions, ProtocolError};
pub use state::ActivityState;
pub use traits::{HostConnection, HostError, HostHandle, HostLauncher, HostSignal, SessionId};
