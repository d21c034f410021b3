//! Session orchestration for script workers.
//!
//! Provides:
//! - `Session` - Activity state machine owning one host at a time
//! - `Watchdog` - Re-armable timeout that force-terminates runaway hosts
//! - `CommandRegistry` - Handlers for custom `cmd:<name>` host messages
//! - `SessionHandle` - Non-blocking handle to a session running on its own task

pub mod actor;
pub mod registry;
pub mod session;
pub mod watchdog;

pub use actor::{SessionError, SessionHandle, SessionSnapshot, spawn_session};
pub use registry::CommandRegistry;
pub use session::Session;
pub use watchdog::Watchdog;
