//! Session state machine.
//!
//! A [`Session`] owns at most one host at a time and turns the commands of its
//! consumer and the signals of its host into one consistent [`ActivityState`].
//! Commands that are illegal in the current state are ignored, not reported:
//! they are usually UI races (a second click on "submit") rather than bugs.

use std::{collections::BTreeSet, sync::Arc};

use script_worker_core::{
    ActivityState, BreakpointSet, DebugCommand, EventLog, HostCommand, HostConnection, HostError, HostEvent,
    HostLauncher, HostSignal, OutputAggregator, SessionConfig, SessionEvent, SessionId,
};
use serde_json::Value;
use uuid::Uuid;

use crate::{registry::CommandRegistry, watchdog::Watchdog};

/// Controller-side state of one host lifetime.
pub struct Session<L> {
    id: SessionId,
    launcher: L,
    config: SessionConfig,
    host: Option<HostConnection>,
    state: ActivityState,
    watchdog: Watchdog,
    output: OutputAggregator,
    dirty_files: BTreeSet<String>,
    registry: CommandRegistry,
    events: Arc<EventLog>,
}

impl<L: HostLauncher> Session<L> {
    /// Create a session. No host is started until the first `run` or `preload`.
    #[must_use]
    pub fn new(launcher: L, config: SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            launcher,
            watchdog: Watchdog::new(config.watchdog_duration()),
            output: OutputAggregator::new(config.output_mode),
            events: Arc::new(EventLog::new(config.history_bytes)),
            config,
            host: None,
            state: ActivityState::Idle,
            dirty_files: BTreeSet::new(),
            registry: CommandRegistry::new(),
        }
    }

    /// Install the custom command handlers.
    #[must_use]
    pub fn with_registry(mut self, registry: CommandRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    #[must_use]
    pub const fn state(&self) -> &ActivityState {
        &self.state
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    #[must_use]
    pub const fn is_suspended(&self) -> bool {
        self.state.is_suspended()
    }

    /// A host is alive.
    #[must_use]
    pub const fn has_host(&self) -> bool {
        self.host.is_some()
    }

    #[must_use]
    pub const fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    /// Aggregated output (private mode only).
    #[must_use]
    pub fn output(&self) -> &str {
        self.output.buffer()
    }

    /// Files reported modified since the last reset.
    #[must_use]
    pub const fn dirty_files(&self) -> &BTreeSet<String> {
        &self.dirty_files
    }

    pub fn reset_dirty_files(&mut self) {
        self.dirty_files.clear();
    }

    /// Event log consumers subscribe to.
    #[must_use]
    pub fn events(&self) -> Arc<EventLog> {
        Arc::clone(&self.events)
    }

    /// Execute `source`, or warm up the host when `source` is `None`.
    ///
    /// A busy or missing host is replaced by a fresh one first.
    pub async fn run(&mut self, source: Option<String>, breakpoints: BreakpointSet) {
        if self.host.is_none() || self.state.is_busy() {
            if let Err(e) = self.restart_host().await {
                self.fault(format!("failed to start host: {e}")).await;
                return;
            }
        }

        let (command, next) = match source {
            Some(code) => (HostCommand::Run { code, breakpoints }, ActivityState::Running),
            None => (HostCommand::Preload, ActivityState::Preloading),
        };
        if self.send(command).await {
            self.set_state(next);
            self.watchdog.arm();
        }
    }

    /// Warm up the host without running user code.
    pub async fn preload(&mut self) {
        self.run(None, BreakpointSet::new()).await;
    }

    /// Answer a pending input request.
    pub async fn submit(&mut self, text: impl Into<String>) {
        if self.state.prompt().is_none() {
            tracing::debug!(session = %self.id, state = self.state.label(), "Ignoring submit");
            return;
        }
        if self.send(HostCommand::Submit { text: text.into() }).await {
            self.set_state(ActivityState::Running);
            self.watchdog.arm();
        }
    }

    /// Abandon a pending input request, keeping the host alive.
    pub async fn cancel(&mut self) {
        if self.state.prompt().is_none() {
            tracing::debug!(session = %self.id, state = self.state.label(), "Ignoring cancel");
            return;
        }
        if self.send(HostCommand::Cancel).await {
            self.set_state(ActivityState::Idle);
        }
    }

    /// Resume a host suspended at a breakpoint.
    pub async fn debug_resume(&mut self, command: DebugCommand) {
        if !self.state.is_suspended() {
            tracing::debug!(session = %self.id, state = self.state.label(), %command, "Ignoring debugger command");
            return;
        }
        if self.send(HostCommand::Debug { dbg: command }).await {
            self.set_state(ActivityState::Running);
            self.watchdog.arm();
        }
    }

    /// Stop whatever the host is doing.
    ///
    /// A pending input request is cancelled softly. Otherwise the host is
    /// killed and a fresh one is preloaded right away.
    pub async fn stop(&mut self) {
        if self.state.prompt().is_some() {
            self.cancel().await;
            return;
        }
        if !self.retire_host().await {
            tracing::debug!(session = %self.id, "Nothing to stop");
            return;
        }

        tracing::info!(session = %self.id, "Host stopped");
        self.set_state(ActivityState::Idle);
        self.events.push(SessionEvent::Stopped);
        self.preload().await;
    }

    /// Ask the host for a file. The answer arrives as [`SessionEvent::File`].
    pub async fn get_file(&mut self, path: impl Into<String>) {
        self.send(HostCommand::Get { path: path.into() }).await;
    }

    /// Write a file on the host side. Not acknowledged.
    pub async fn put_file(&mut self, path: impl Into<String>, data: Value) {
        self.send(HostCommand::Put {
            path: path.into(),
            data,
        })
        .await;
    }

    pub async fn clear_figure(&mut self) {
        self.send(HostCommand::ClearFigure).await;
    }

    /// Inject local text into the output stream.
    pub fn print(&mut self, text: &str) {
        let update = self.output.print(text);
        self.events.push_output(update);
    }

    pub fn clear_output(&mut self) {
        let update = self.output.clear();
        self.events.push_output(update);
    }

    /// Kill the host, if any, leaving the session idle.
    pub async fn shutdown(&mut self) {
        if self.retire_host().await {
            self.set_state(ActivityState::Idle);
        }
    }

    /// Next signal of the current host; pending forever without a host.
    ///
    /// A host whose signal channel closed is reported as exited.
    pub async fn next_signal(&mut self) -> HostSignal {
        match self.host.as_mut() {
            Some(host) => host
                .signals
                .recv()
                .await
                .unwrap_or(HostSignal::Exited { code: None }),
            None => std::future::pending().await,
        }
    }

    /// Apply one host signal.
    pub async fn handle_signal(&mut self, signal: HostSignal) {
        match signal {
            HostSignal::Event(event) => self.handle_event(event),
            HostSignal::Fault { message } => self.fault(message).await,
            HostSignal::Exited { code } => {
                let message = match code {
                    Some(code) => format!("host exited with status {code}"),
                    None => "host exited".to_string(),
                };
                self.fault(message).await;
            }
        }
    }

    /// Watchdog deadline passed.
    ///
    /// A `done` may have won the race; only a still-busy host is killed.
    pub async fn on_watchdog(&mut self) {
        self.watchdog.disarm();
        if !self.state.is_busy() {
            return;
        }

        tracing::warn!(
            session = %self.id,
            timeout_secs = self.config.timeout_secs,
            "Host exceeded its time allowance, terminating"
        );
        self.retire_host().await;
        self.set_state(ActivityState::Idle);
        self.events.push(SessionEvent::TimedOut);
        if let Some(message) = self.config.timeout_message.clone() {
            self.print(&message);
        }
    }

    fn handle_event(&mut self, event: HostEvent) {
        tracing::trace!(session = %self.id, ?event, "Host event");
        match event {
            HostEvent::Print { data } => self.print(&data),
            HostEvent::Clear => self.clear_output(),
            HostEvent::Figure { data } => self.events.push(SessionEvent::Figure { data_url: data }),
            HostEvent::Dirty { data } => {
                self.dirty_files.insert(data.clone());
                self.events.push(SessionEvent::DirtyFile { path: data });
            }
            HostEvent::File { path, data } => self.events.push(SessionEvent::File { path, data }),
            HostEvent::Input { prompt } => self.await_input(prompt),
            HostEvent::Status { status } if status == "input" => {
                if self.state.prompt().is_none() {
                    self.await_input(String::new());
                }
            }
            HostEvent::Status { status } => self.events.push(SessionEvent::Status { label: status }),
            HostEvent::Done {
                suspended_at: Some(line),
            } => {
                self.watchdog.disarm();
                self.set_state(ActivityState::Suspended { line });
            }
            HostEvent::Done { suspended_at: None } => {
                self.watchdog.disarm();
                self.set_state(ActivityState::Idle);
                self.events.push(SessionEvent::Terminated);
            }
            HostEvent::Custom { name, data } => {
                if !self.registry.dispatch(&name, data) {
                    tracing::trace!(session = %self.id, command = %name, "No handler for custom command");
                }
            }
        }
    }

    fn await_input(&mut self, prompt: String) {
        self.watchdog.disarm();
        self.set_state(ActivityState::AwaitingInput {
            prompt: prompt.clone(),
        });
        self.events.push(SessionEvent::InputRequested { prompt });
    }

    /// Move to `next`, publishing the change. A suspension marker is always
    /// cleared before another one is published.
    fn set_state(&mut self, next: ActivityState) {
        if self.state == next {
            return;
        }
        if let Some(line) = self.state.suspended_line() {
            self.events.push(SessionEvent::SuspensionCleared { line });
        }

        tracing::debug!(session = %self.id, from = self.state.label(), to = next.label(), "State changed");
        self.state = next.clone();
        let suspended_at = next.suspended_line();
        self.events.push(SessionEvent::State { state: next });
        if let Some(line) = suspended_at {
            self.events.push(SessionEvent::Suspended { line });
        }
    }

    /// Send a command to the live host. Returns false if there is none or it is unreachable.
    async fn send(&mut self, command: HostCommand) -> bool {
        let Some(host) = self.host.as_ref() else {
            tracing::debug!(session = %self.id, cmd = command.tag(), "No host, dropping command");
            return false;
        };

        tracing::debug!(session = %self.id, cmd = command.tag(), "Sending command");
        match host.handle.send(command) {
            Ok(()) => true,
            Err(e) => {
                self.fault(format!("failed to send command: {e}")).await;
                false
            }
        }
    }

    async fn restart_host(&mut self) -> Result<(), HostError> {
        self.retire_host().await;

        let connection = self.launcher.launch().await?;
        connection.handle.send(HostCommand::Config {
            options: self.config.host_options(),
        })?;
        tracing::info!(session = %self.id, "Host launched");
        self.host = Some(connection);
        Ok(())
    }

    /// Terminate and drop the host together with its pending signals and deadline.
    /// Returns false if there was no host.
    async fn retire_host(&mut self) -> bool {
        self.watchdog.disarm();
        let Some(mut connection) = self.host.take() else {
            return false;
        };
        if let Err(e) = connection.handle.terminate().await {
            tracing::warn!(session = %self.id, "Failed to terminate host: {e}");
        }
        true
    }

    async fn fault(&mut self, message: String) {
        tracing::warn!(session = %self.id, "Host fault: {message}");
        self.retire_host().await;
        self.print(&format!("\n{message}\n"));
        self.events.push(SessionEvent::HostFault {
            message: message.clone(),
        });
        self.set_state(ActivityState::Faulted { reason: message });
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use script_worker_core::{HostOptions, OutputMode, OutputUpdate};
    use script_worker_host::{ChannelLauncher, HostPeer};
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    struct Harness {
        session: Session<ChannelLauncher>,
        peers: mpsc::UnboundedReceiver<HostPeer>,
    }

    impl Harness {
        fn new(config: SessionConfig) -> Self {
            let (launcher, peers) = ChannelLauncher::new();
            Self {
                session: Session::new(launcher, config),
                peers,
            }
        }

        /// Take the host launched last, checking its config handshake.
        async fn peer(&mut self) -> HostPeer {
            let mut peer = self.peers.recv().await.unwrap();
            assert!(matches!(peer.recv().await, Some(HostCommand::Config { .. })));
            peer
        }

        async fn deliver(&mut self, peer: &HostPeer, event: HostEvent) {
            assert!(peer.emit(event));
            let signal = self.session.next_signal().await;
            self.session.handle_signal(signal).await;
        }

        async fn run(&mut self, code: &str, breakpoints: &[u32]) {
            self.session
                .run(Some(code.to_string()), breakpoints.iter().copied().collect())
                .await;
        }

        fn history(&self) -> Vec<SessionEvent> {
            self.session.events().history()
        }

        fn count(&self, event: &SessionEvent) -> usize {
            self.history().iter().filter(|e| *e == event).count()
        }
    }

    fn print(data: &str) -> HostEvent {
        HostEvent::Print {
            data: data.to_string(),
        }
    }

    #[tokio::test]
    async fn test_run_sends_config_then_run() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("print(1)", &[3]).await;

        let mut peer = h.peers.recv().await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Config {
                options: HostOptions {
                    handle_input: true,
                    inline_input: false,
                },
            })
        );
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Run {
                code: "print(1)".to_string(),
                breakpoints: [3].into_iter().collect(),
            })
        );
        assert_eq!(h.session.state(), &ActivityState::Running);
        assert!(h.session.watchdog().is_armed());
    }

    #[tokio::test]
    async fn test_at_most_one_live_host_across_runs() {
        let mut h = Harness::new(SessionConfig::default());
        let stats = h.session.launcher.stats();

        h.run("while True: pass", &[]).await;
        let first = h.peer().await;
        h.run("while True: pass", &[]).await;
        let second = h.peer().await;
        h.run("print(2)", &[]).await;
        let _third = h.peer().await;

        assert!(first.is_terminated());
        assert!(second.is_terminated());
        assert_eq!(stats.launched(), 3);
        assert_eq!(stats.max_live(), 1);
        assert_eq!(stats.live(), 1);
    }

    #[tokio::test]
    async fn test_quiescent_host_is_reused() {
        let mut h = Harness::new(SessionConfig::default());
        let stats = h.session.launcher.stats();

        h.run("print(1)", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;
        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;

        h.run("print(2)", &[]).await;
        assert!(matches!(peer.recv().await, Some(HostCommand::Run { .. })));
        assert_eq!(stats.launched(), 1);
    }

    #[tokio::test]
    async fn test_input_scenario() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("x = input('n?')\n", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;

        h.deliver(
            &peer,
            HostEvent::Input {
                prompt: "n?".to_string(),
            },
        )
        .await;
        assert_eq!(
            h.session.state(),
            &ActivityState::AwaitingInput {
                prompt: "n?".to_string()
            }
        );
        assert!(!h.session.watchdog().is_armed());

        h.session.submit("5").await;
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Submit {
                text: "5".to_string()
            })
        );
        assert!(h.session.is_busy());
        assert!(h.session.watchdog().is_armed());

        h.deliver(&peer, print("5\n")).await;
        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;

        assert_eq!(h.session.state(), &ActivityState::Idle);
        assert_eq!(h.session.output(), "5\n");
        assert_eq!(h.count(&SessionEvent::Terminated), 1);
        assert_eq!(
            h.count(&SessionEvent::InputRequested {
                prompt: "n?".to_string()
            }),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_rearms_watchdog() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("x = input()", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;
        let run_deadline = h.session.watchdog().deadline();
        assert!(run_deadline.is_some());

        h.deliver(
            &peer,
            HostEvent::Input {
                prompt: String::new(),
            },
        )
        .await;
        assert!(!h.session.watchdog().is_armed());

        tokio::time::advance(Duration::from_secs(10)).await;
        h.session.submit("5").await;

        let submit_deadline = h.session.watchdog().deadline();
        assert!(h.session.watchdog().is_armed());
        assert!(submit_deadline > run_deadline);
        assert_eq!(
            submit_deadline.zip(run_deadline).map(|(s, r)| s - r),
            Some(Duration::from_secs(10))
        );
    }

    #[tokio::test]
    async fn test_huge_timeout_does_not_arm() {
        let mut h = Harness::new(SessionConfig::default().with_timeout_secs(i64::MAX));
        h.run("while True: pass", &[]).await;
        assert_eq!(h.session.state(), &ActivityState::Running);
        assert!(!h.session.watchdog().is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_while_busy_are_ignored() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("while True: pass", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;

        let deadline = h.session.watchdog().deadline();
        tokio::time::advance(Duration::from_secs(5)).await;

        h.session.submit("x").await;
        h.session.debug_resume(DebugCommand::Next).await;
        h.session.cancel().await;

        assert_eq!(peer.try_recv(), None);
        assert_eq!(h.session.watchdog().deadline(), deadline);
        assert_eq!(h.session.state(), &ActivityState::Running);
    }

    #[tokio::test]
    async fn test_cancel_keeps_host_alive() {
        let mut h = Harness::new(SessionConfig::default());
        let stats = h.session.launcher.stats();
        h.run("input()", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;
        h.deliver(
            &peer,
            HostEvent::Input {
                prompt: String::new(),
            },
        )
        .await;

        h.session.cancel().await;
        assert_eq!(peer.recv().await, Some(HostCommand::Cancel));
        assert_eq!(h.session.state(), &ActivityState::Idle);
        assert!(h.session.has_host());
        assert!(!h.session.watchdog().is_armed());
        assert_eq!(stats.terminated(), 0);
    }

    #[tokio::test]
    async fn test_stop_while_awaiting_input_cancels() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("input()", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;
        h.deliver(
            &peer,
            HostEvent::Status {
                status: "input".to_string(),
            },
        )
        .await;
        assert_eq!(h.session.state().prompt(), Some(""));

        h.session.stop().await;
        assert_eq!(peer.recv().await, Some(HostCommand::Cancel));
        assert!(!peer.is_terminated());
        assert_eq!(h.count(&SessionEvent::Stopped), 0);
    }

    #[tokio::test]
    async fn test_stop_kills_and_preloads_fresh_host() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("while True: pass", &[]).await;
        let old = h.peer().await;

        h.session.stop().await;
        assert!(old.is_terminated());

        let mut fresh = h.peer().await;
        assert_eq!(fresh.recv().await, Some(HostCommand::Preload));
        assert_eq!(h.session.state(), &ActivityState::Preloading);
        assert_eq!(h.count(&SessionEvent::Stopped), 1);
        assert_eq!(h.count(&SessionEvent::Terminated), 0);
    }

    #[tokio::test]
    async fn test_stop_while_suspended_clears_marker_first() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("a = 1\nb = 2\nc = 3\n", &[3]).await;
        let mut old = h.peer().await;
        old.recv().await;
        h.deliver(&old, HostEvent::Done { suspended_at: Some(3) }).await;
        let before = h.history().len();

        h.session.stop().await;
        assert!(old.is_terminated());
        let mut fresh = h.peer().await;
        assert_eq!(fresh.recv().await, Some(HostCommand::Preload));

        assert_eq!(
            h.history()[before..],
            [
                SessionEvent::SuspensionCleared { line: 3 },
                SessionEvent::State {
                    state: ActivityState::Idle
                },
                SessionEvent::Stopped,
                SessionEvent::State {
                    state: ActivityState::Preloading
                },
            ]
        );
        assert!(!h.session.is_suspended());
    }

    #[tokio::test]
    async fn test_stop_without_host_does_nothing() {
        let mut h = Harness::new(SessionConfig::default());
        h.session.stop().await;
        assert!(!h.session.has_host());
        assert!(h.history().is_empty());
    }

    #[tokio::test]
    async fn test_breakpoint_scenario() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("a = 1\nb = 2\nc = 3\n", &[3]).await;
        let mut peer = h.peer().await;
        peer.recv().await;

        h.deliver(&peer, HostEvent::Done { suspended_at: Some(3) }).await;
        assert_eq!(h.session.state(), &ActivityState::Suspended { line: 3 });
        assert!(!h.session.watchdog().is_armed());
        assert_eq!(h.count(&SessionEvent::Suspended { line: 3 }), 1);

        h.session.debug_resume(DebugCommand::Continue).await;
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Debug {
                dbg: DebugCommand::Continue
            })
        );
        assert_eq!(h.session.state(), &ActivityState::Running);
        assert!(h.session.watchdog().is_armed());

        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;
        assert_eq!(h.session.state(), &ActivityState::Idle);
        assert_eq!(h.count(&SessionEvent::Terminated), 1);
    }

    #[tokio::test]
    async fn test_suspension_markers_never_overlap() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("...", &[3, 5, 7]).await;
        let mut peer = h.peer().await;
        peer.recv().await;

        h.deliver(&peer, HostEvent::Done { suspended_at: Some(3) }).await;
        h.session.debug_resume(DebugCommand::Next).await;
        h.deliver(&peer, HostEvent::Done { suspended_at: Some(5) }).await;
        // A host reporting a new suspension without being resumed.
        h.deliver(&peer, HostEvent::Done { suspended_at: Some(7) }).await;
        h.session.debug_resume(DebugCommand::Quit).await;
        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;

        let markers: Vec<SessionEvent> = h
            .history()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    SessionEvent::Suspended { .. } | SessionEvent::SuspensionCleared { .. }
                )
            })
            .collect();
        assert_eq!(
            markers,
            vec![
                SessionEvent::Suspended { line: 3 },
                SessionEvent::SuspensionCleared { line: 3 },
                SessionEvent::Suspended { line: 5 },
                SessionEvent::SuspensionCleared { line: 5 },
                SessionEvent::Suspended { line: 7 },
                SessionEvent::SuspensionCleared { line: 7 },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_kills_busy_host() {
        let mut h = Harness::new(SessionConfig::default().with_timeout_secs(1));
        let stats = h.session.launcher.stats();
        h.run("while True: pass", &[]).await;
        let peer = h.peer().await;

        h.session.watchdog().expired().await;
        h.session.on_watchdog().await;

        assert!(peer.is_terminated());
        assert!(!h.session.has_host());
        assert!(!h.session.is_busy());
        assert_eq!(stats.live(), 0);
        assert_eq!(h.count(&SessionEvent::TimedOut), 1);
        assert_eq!(h.count(&SessionEvent::Terminated), 0);
        assert!(h.session.output().ends_with("\nTimeout\n"));
    }

    #[tokio::test]
    async fn test_watchdog_after_done_is_noop() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("print(1)", &[]).await;
        let mut peer = h.peer().await;
        peer.recv().await;
        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;

        h.session.on_watchdog().await;
        assert!(h.session.has_host());
        assert!(!peer.is_terminated());
        assert_eq!(h.count(&SessionEvent::TimedOut), 0);
    }

    #[tokio::test]
    async fn test_negative_timeout_disables_watchdog() {
        let mut h = Harness::new(SessionConfig::default().with_timeout_secs(-1));
        h.run("while True: pass", &[]).await;
        assert!(h.session.is_busy());
        assert!(!h.session.watchdog().is_armed());
    }

    #[tokio::test]
    async fn test_private_output_aggregates() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("...", &[]).await;
        let peer = h.peer().await;
        for event in [print("a"), print("b"), HostEvent::Clear, print("c")] {
            h.deliver(&peer, event).await;
        }

        assert_eq!(h.session.output(), "c");
        let last = h
            .history()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Output { update } => Some(update),
                _ => None,
            })
            .last();
        assert_eq!(last, Some(OutputUpdate::Replace("c".to_string())));
    }

    #[tokio::test]
    async fn test_shared_output_forwards_increments() {
        let mut h = Harness::new(SessionConfig::default().with_output_mode(OutputMode::Shared));
        h.run("...", &[]).await;
        let mut peer = h.peers.recv().await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Config {
                options: HostOptions {
                    handle_input: true,
                    inline_input: true,
                },
            })
        );
        for event in [print("a"), print("b"), HostEvent::Clear, print("c")] {
            h.deliver(&peer, event).await;
        }

        let updates: Vec<OutputUpdate> = h
            .history()
            .into_iter()
            .filter_map(|e| match e {
                SessionEvent::Output { update } => Some(update),
                _ => None,
            })
            .collect();
        assert_eq!(
            updates,
            vec![
                OutputUpdate::Append("a".to_string()),
                OutputUpdate::Append("b".to_string()),
                OutputUpdate::Clear,
                OutputUpdate::Append("c".to_string()),
            ]
        );
        assert_eq!(h.session.output(), "");
    }

    #[tokio::test]
    async fn test_custom_commands_reach_registry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let (launcher, peers) = ChannelLauncher::new();
        let session = Session::new(launcher, SessionConfig::default()).with_registry(
            CommandRegistry::new().with_command("log", move |data| sink.lock().unwrap().push(data)),
        );
        let mut h = Harness { session, peers };

        h.run("...", &[]).await;
        let peer = h.peer().await;
        for (name, data) in [("log", json!("first")), ("unknown", json!(0)), ("log", json!("second"))] {
            h.deliver(
                &peer,
                HostEvent::Custom {
                    name: name.to_string(),
                    data,
                },
            )
            .await;
        }

        assert_eq!(*seen.lock().unwrap(), vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_dirty_files_accumulate_until_reset() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("...", &[]).await;
        let peer = h.peer().await;
        for path in ["b.txt", "a.txt", "b.txt"] {
            h.deliver(
                &peer,
                HostEvent::Dirty {
                    data: path.to_string(),
                },
            )
            .await;
        }

        let dirty: Vec<&str> = h.session.dirty_files().iter().map(String::as_str).collect();
        assert_eq!(dirty, vec!["a.txt", "b.txt"]);

        h.deliver(&peer, HostEvent::Done { suspended_at: None }).await;
        assert_eq!(h.session.dirty_files().len(), 2);

        h.session.reset_dirty_files();
        assert!(h.session.dirty_files().is_empty());
    }

    #[tokio::test]
    async fn test_file_exchange() {
        let mut h = Harness::new(SessionConfig::default());
        h.session.get_file("early.txt").await;
        assert!(!h.session.has_host());

        h.session.preload().await;
        let mut peer = h.peer().await;
        assert_eq!(peer.recv().await, Some(HostCommand::Preload));

        h.session.put_file("data.csv", json!("1,2,3")).await;
        h.session.get_file("data.csv").await;
        h.session.clear_figure().await;
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Put {
                path: "data.csv".to_string(),
                data: json!("1,2,3"),
            })
        );
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Get {
                path: "data.csv".to_string()
            })
        );
        assert_eq!(peer.recv().await, Some(HostCommand::ClearFigure));

        h.deliver(
            &peer,
            HostEvent::File {
                path: "data.csv".to_string(),
                data: json!("1,2,3"),
            },
        )
        .await;
        assert_eq!(
            h.count(&SessionEvent::File {
                path: "data.csv".to_string(),
                data: json!("1,2,3"),
            }),
            1
        );
    }

    #[tokio::test]
    async fn test_host_fault_is_explicit_and_recoverable() {
        let mut h = Harness::new(SessionConfig::default());
        let stats = h.session.launcher.stats();
        h.run("...", &[]).await;
        let peer = h.peer().await;

        assert!(peer.fault("worker crashed"));
        let signal = h.session.next_signal().await;
        h.session.handle_signal(signal).await;

        assert_eq!(
            h.session.state(),
            &ActivityState::Faulted {
                reason: "worker crashed".to_string()
            }
        );
        assert!(!h.session.has_host());
        assert!(h.session.output().contains("worker crashed"));
        assert_eq!(
            h.count(&SessionEvent::HostFault {
                message: "worker crashed".to_string()
            }),
            1
        );

        h.run("print(1)", &[]).await;
        let _fresh = h.peer().await;
        assert_eq!(stats.launched(), 2);
        assert_eq!(h.session.state(), &ActivityState::Running);
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_a_fault() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("...", &[]).await;
        let peer = h.peer().await;

        assert!(peer.exit(Some(137)));
        let signal = h.session.next_signal().await;
        h.session.handle_signal(signal).await;

        assert!(matches!(
            h.session.state(),
            ActivityState::Faulted { reason } if reason.contains("137")
        ));
    }

    #[tokio::test]
    async fn test_launch_failure_faults() {
        let (launcher, peers) = ChannelLauncher::new();
        drop(peers);
        let mut session = Session::new(launcher, SessionConfig::default());

        session.run(Some("print(1)".to_string()), BreakpointSet::new()).await;
        assert!(matches!(session.state(), ActivityState::Faulted { .. }));
        assert!(!session.has_host());
    }

    #[tokio::test]
    async fn test_free_form_status_does_not_change_state() {
        let mut h = Harness::new(SessionConfig::default());
        h.run("...", &[]).await;
        let peer = h.peer().await;
        h.deliver(
            &peer,
            HostEvent::Status {
                status: "loading numpy".to_string(),
            },
        )
        .await;

        assert_eq!(h.session.state(), &ActivityState::Running);
        assert_eq!(
            h.count(&SessionEvent::Status {
                label: "loading numpy".to_string()
            }),
            1
        );
    }
}
