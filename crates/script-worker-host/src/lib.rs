//! Execution hosts for script worker sessions.
//!
//! Provides:
//! - `ProcessLauncher` - Host running as a child process speaking JSON lines
//! - `ChannelLauncher` - In-process host driven over tokio channels
//! - Command building utilities

pub mod channel;
pub mod command;
pub mod process;

pub use channel::{ChannelLauncher, HostPeer, LaunchStats};
pub use command::{CommandBuilder, CommandParts, resolve_executable_path};
pub use process::{HostProgram, ProcessLauncher};
