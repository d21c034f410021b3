//! Execution host contract.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{HostCommand, HostEvent, ProtocolError};

/// Session identifier.
pub type SessionId = Uuid;

/// Anything a host reports to its controller.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSignal {
    /// A protocol event.
    Event(HostEvent),
    /// Low-level failure outside the protocol (crash, unreadable stream, ...).
    Fault { message: String },
    /// The host went away on its own.
    Exited { code: Option<i32> },
}

impl From<HostEvent> for HostSignal {
    fn from(event: HostEvent) -> Self {
        Self::Event(event)
    }
}

/// Host error.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Launch failed: {0}")]
    LaunchFailed(String),
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),
    #[error("Host disconnected")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Controller-side handle to one running host.
#[async_trait]
pub trait HostHandle: Send {
    /// Queue a command. Never waits for the host.
    ///
    /// # Errors
    /// Returns error if the host can no longer receive commands.
    fn send(&self, command: HostCommand) -> Result<(), HostError>;

    /// Forcibly stop the host, abandoning all of its state.
    ///
    /// # Errors
    /// Returns error if the host could not be killed.
    async fn terminate(&mut self) -> Result<(), HostError>;
}

/// A freshly launched host: its handle and the stream of its signals.
pub struct HostConnection {
    /// Command side.
    pub handle: Box<dyn HostHandle>,
    /// Signal side. Dropping it discards anything still in flight.
    pub signals: mpsc::UnboundedReceiver<HostSignal>,
}

/// Factory for hosts.
#[async_trait]
pub trait HostLauncher: Send + Sync {
    /// Start a new host.
    async fn launch(&self) -> Result<HostConnection, HostError>;
}

#[async_trait]
impl<L> HostLauncher for Arc<L>
where
    L: HostLauncher + ?Sized,
{
    async fn launch(&self) -> Result<HostConnection, HostError> {
        (**self).launch().await
    }
}
