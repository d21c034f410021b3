//! Session task and its handle.
//!
//! A spawned session is a single task owning the [`Session`]. Consumer
//! requests, host signals and the watchdog deadline are processed one at a
//! time in arrival order, so no two of them ever observe each other half-done.

use std::sync::Arc;

use script_worker_core::{
    ActivityState, BreakpointSet, DebugCommand, EventLog, HostLauncher, SessionEvent, SessionId,
};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tracing::Instrument;

use crate::session::Session;

/// Session handle error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session task has shut down")]
    Closed,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub state: ActivityState,
    pub output: String,
    pub dirty_files: Vec<String>,
    pub watchdog_armed: bool,
}

#[derive(Debug)]
enum SessionRequest {
    Run {
        source: Option<String>,
        breakpoints: BreakpointSet,
    },
    Submit(String),
    Cancel,
    Debug(DebugCommand),
    Stop,
    GetFile(String),
    PutFile {
        path: String,
        data: Value,
    },
    ClearFigure,
    ClearOutput,
    Print(String),
    ResetDirtyFiles,
    Snapshot(oneshot::Sender<SessionSnapshot>),
    Shutdown,
}

/// Cloneable handle to a spawned session.
///
/// Commands are fire-and-forget: their effects are observed through the
/// event log. They fail only once the session task is gone.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    requests: mpsc::UnboundedSender<SessionRequest>,
    events: Arc<EventLog>,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Live events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Execute `source` with the given breakpoints.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn run(&self, source: impl Into<String>, breakpoints: BreakpointSet) -> Result<(), SessionError> {
        self.request(SessionRequest::Run {
            source: Some(source.into()),
            breakpoints,
        })
    }

    /// Warm up a host without running user code.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn preload(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Run {
            source: None,
            breakpoints: BreakpointSet::new(),
        })
    }

    /// Answer a pending input request.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn submit(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.request(SessionRequest::Submit(text.into()))
    }

    /// Abandon a pending input request.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn cancel(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Cancel)
    }

    /// Resume from a breakpoint.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn debug_resume(&self, command: DebugCommand) -> Result<(), SessionError> {
        self.request(SessionRequest::Debug(command))
    }

    /// Stop the running program.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn stop(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Stop)
    }

    /// Request a file from the host.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn get_file(&self, path: impl Into<String>) -> Result<(), SessionError> {
        self.request(SessionRequest::GetFile(path.into()))
    }

    /// Write a file on the host side.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn put_file(&self, path: impl Into<String>, data: Value) -> Result<(), SessionError> {
        self.request(SessionRequest::PutFile {
            path: path.into(),
            data,
        })
    }

    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn clear_figure(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::ClearFigure)
    }

    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn clear_output(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::ClearOutput)
    }

    /// Inject local text into the output stream.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn print(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.request(SessionRequest::Print(text.into()))
    }

    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn reset_dirty_files(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::ResetDirtyFiles)
    }

    /// Kill the host and end the session task.
    ///
    /// # Errors
    /// Returns error if the session task has already shut down.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        self.request(SessionRequest::Shutdown)
    }

    /// Current session state, output and bookkeeping.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.request(SessionRequest::Snapshot(tx))?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// # Errors
    /// Returns error if the session task has shut down.
    pub async fn state(&self) -> Result<ActivityState, SessionError> {
        Ok(self.snapshot().await?.state)
    }

    /// # Errors
    /// Returns error if the session task has shut down.
    pub async fn dirty_files(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.snapshot().await?.dirty_files)
    }

    fn request(&self, request: SessionRequest) -> Result<(), SessionError> {
        self.requests.send(request).map_err(|_| SessionError::Closed)
    }
}

/// Spawn `session` on its own task.
///
/// The task ends, killing its host, on [`SessionHandle::shutdown`] or once
/// every handle is dropped.
pub fn spawn_session<L>(session: Session<L>) -> (SessionHandle, JoinHandle<()>)
where
    L: HostLauncher + 'static,
{
    let (requests, request_rx) = mpsc::unbounded_channel();
    let handle = SessionHandle {
        id: session.id(),
        requests,
        events: session.events(),
    };

    let span = tracing::info_span!("session", id = %session.id());
    let task = tokio::spawn(run_session(session, request_rx).instrument(span));
    (handle, task)
}

async fn run_session<L: HostLauncher>(mut session: Session<L>, mut requests: mpsc::UnboundedReceiver<SessionRequest>) {
    tracing::info!("Session started");

    loop {
        let expired = session.watchdog().expired();
        tokio::select! {
            request = requests.recv() => {
                let Some(request) = request else {
                    break; // all handles dropped
                };
                if !apply(&mut session, request).await {
                    break;
                }
            }
            signal = session.next_signal() => session.handle_signal(signal).await,
            () = expired => session.on_watchdog().await,
        }
    }

    session.shutdown().await;
    tracing::info!("Session ended");
}

/// Apply one consumer request. Returns false on shutdown.
async fn apply<L: HostLauncher>(session: &mut Session<L>, request: SessionRequest) -> bool {
    match request {
        SessionRequest::Run { source, breakpoints } => session.run(source, breakpoints).await,
        SessionRequest::Submit(text) => session.submit(text).await,
        SessionRequest::Cancel => session.cancel().await,
        SessionRequest::Debug(command) => session.debug_resume(command).await,
        SessionRequest::Stop => session.stop().await,
        SessionRequest::GetFile(path) => session.get_file(path).await,
        SessionRequest::PutFile { path, data } => session.put_file(path, data).await,
        SessionRequest::ClearFigure => session.clear_figure().await,
        SessionRequest::ClearOutput => session.clear_output(),
        SessionRequest::Print(text) => session.print(&text),
        SessionRequest::ResetDirtyFiles => session.reset_dirty_files(),
        SessionRequest::Snapshot(reply) => {
            let _ = reply.send(SessionSnapshot {
                id: session.id(),
                state: session.state().clone(),
                output: session.output().to_string(),
                dirty_files: session.dirty_files().iter().cloned().collect(),
                watchdog_armed: session.watchdog().is_armed(),
            });
        }
        SessionRequest::Shutdown => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use script_worker_core::{HostCommand, HostEvent, SessionConfig};
    use script_worker_host::{ChannelLauncher, HostPeer};

    use super::*;

    async fn wait_for(events: &mut broadcast::Receiver<SessionEvent>, expected: &SessionEvent) {
        loop {
            if events.recv().await.unwrap() == *expected {
                return;
            }
        }
    }

    async fn next_peer(peers: &mut mpsc::UnboundedReceiver<HostPeer>) -> HostPeer {
        let mut peer = peers.recv().await.unwrap();
        assert!(matches!(peer.recv().await, Some(HostCommand::Config { .. })));
        peer
    }

    #[tokio::test]
    async fn test_input_round_trip_through_handle() {
        let (launcher, mut peers) = ChannelLauncher::new();
        let (handle, task) = spawn_session(Session::new(launcher, SessionConfig::default()));
        let mut events = handle.subscribe();

        handle.run("x = input('n?')\nprint(x)\n", BreakpointSet::new()).unwrap();
        let mut peer = next_peer(&mut peers).await;
        assert!(matches!(peer.recv().await, Some(HostCommand::Run { .. })));

        peer.emit(HostEvent::Input {
            prompt: "n?".to_string(),
        });
        wait_for(
            &mut events,
            &SessionEvent::InputRequested {
                prompt: "n?".to_string(),
            },
        )
        .await;

        handle.submit("5").unwrap();
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Submit {
                text: "5".to_string()
            })
        );
        peer.emit(HostEvent::Print {
            data: "5\n".to_string(),
        });
        peer.emit(HostEvent::Done { suspended_at: None });
        wait_for(&mut events, &SessionEvent::Terminated).await;

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ActivityState::Idle);
        assert_eq!(snapshot.output, "5\n");
        assert!(!snapshot.watchdog_armed);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(peer.is_terminated());
        assert!(handle.snapshot().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_runaway_program_times_out() {
        let (launcher, mut peers) = ChannelLauncher::new();
        let stats = launcher.stats();
        let config = SessionConfig::default().with_timeout_secs(1);
        let (handle, _task) = spawn_session(Session::new(launcher, config));
        let mut events = handle.subscribe();

        handle.run("while True: pass", BreakpointSet::new()).unwrap();
        let peer = next_peer(&mut peers).await;
        wait_for(&mut events, &SessionEvent::TimedOut).await;

        assert!(peer.is_terminated());
        assert_eq!(stats.live(), 0);
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ActivityState::Idle);
        assert!(snapshot.output.ends_with("\nTimeout\n"));
    }

    #[tokio::test]
    async fn test_handle_debug_shows_session_and_log() {
        let (launcher, _peers) = ChannelLauncher::new();
        let (handle, _task) = spawn_session(Session::new(launcher, SessionConfig::default()));

        let debug = format!("{handle:?}");
        assert!(debug.contains(&handle.id().to_string()), "{debug}");
        assert!(debug.contains("EventLog"), "{debug}");
    }

    #[tokio::test]
    async fn test_dropping_all_handles_ends_session() {
        let (launcher, mut peers) = ChannelLauncher::new();
        let (handle, task) = spawn_session(Session::new(launcher, SessionConfig::default()));

        handle.preload().unwrap();
        let peer = next_peer(&mut peers).await;
        drop(handle);

        task.await.unwrap();
        assert!(peer.is_terminated());
    }
}
