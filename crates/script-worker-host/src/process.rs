//! Host running as a child process.
//!
//! Commands are written to the child's stdin and events read from its stdout,
//! one JSON object per line. The child is spawned in its own process group so
//! that termination also takes down anything the interpreter started.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use script_worker_core::{HostCommand, HostConnection, HostError, HostEvent, HostHandle, HostLauncher, HostSignal};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::mpsc,
    task::JoinHandle,
};

use crate::command::{CommandBuildError, CommandBuilder};

/// Description of the host program to start.
#[derive(Debug, Clone)]
pub struct HostProgram {
    /// Command line.
    pub command: CommandBuilder,
    /// Working directory; inherits the controller's when `None`.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl HostProgram {
    /// Create a host program from a command line.
    #[must_use]
    pub fn new(command: CommandBuilder) -> Self {
        Self {
            command,
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Launches [`HostProgram`]s as child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: HostProgram,
}

impl ProcessLauncher {
    #[must_use]
    pub const fn new(program: HostProgram) -> Self {
        Self { program }
    }
}

#[async_trait]
impl HostLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<HostConnection, HostError> {
        let (executable, args) = self
            .program
            .command
            .build()
            .map_err(|e| HostError::LaunchFailed(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| match e {
                CommandBuildError::ExecutableNotFound(program) => HostError::ExecutableNotFound(program),
                other => HostError::LaunchFailed(other.to_string()),
            })?;

        let mut command = tokio::process::Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.program.working_dir {
            command.current_dir(dir);
        }
        command.envs(self.program.env.iter().map(|(k, v)| (k, v)));

        let mut child = command
            .group_spawn()
            .map_err(|e| HostError::LaunchFailed(format!("{}: {e}", executable.display())))?;
        tracing::info!(pid = ?child.id(), program = %executable.display(), "Host process started");

        let missing = |stream: &str| HostError::LaunchFailed(format!("{stream} not captured"));
        let stdin = child.inner().stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.inner().stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.inner().stderr.take().ok_or_else(|| missing("stderr"))?;

        let (signal_tx, signals) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let tasks = vec![
            tokio::spawn(write_loop(stdin, command_rx, signal_tx.clone())),
            tokio::spawn(read_loop(stdout, signal_tx)),
            tokio::spawn(log_stderr(stderr)),
        ];

        Ok(HostConnection {
            handle: Box::new(ProcessHost {
                child,
                commands: command_tx,
                tasks,
                killed: false,
            }),
            signals,
        })
    }
}

/// Handle to a host child process.
struct ProcessHost {
    child: AsyncGroupChild,
    commands: mpsc::UnboundedSender<HostCommand>,
    tasks: Vec<JoinHandle<()>>,
    killed: bool,
}

impl ProcessHost {
    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl HostHandle for ProcessHost {
    fn send(&self, command: HostCommand) -> Result<(), HostError> {
        self.commands.send(command).map_err(|_| HostError::Disconnected)
    }

    async fn terminate(&mut self) -> Result<(), HostError> {
        self.abort_tasks();
        if self.child.try_wait()?.is_none() {
            self.child.kill().await?;
        }
        self.killed = true;
        tracing::info!(pid = ?self.child.id(), "Host process terminated");
        Ok(())
    }
}

impl Drop for ProcessHost {
    fn drop(&mut self) {
        self.abort_tasks();
        if self.killed {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            tracing::debug!("Failed to kill host process group on drop: {e}");
        }
    }
}

async fn write_loop<W>(
    stdin: W,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    signals: mpsc::UnboundedSender<HostSignal>,
) where
    W: AsyncWrite + Unpin,
{
    let mut stdin = stdin;
    while let Some(command) = commands.recv().await {
        tracing::debug!(cmd = command.tag(), "Sending command to host");
        if let Err(e) = write_line(&mut stdin, &command).await {
            tracing::error!("Failed to write to host: {e}");
            let _ = signals.send(HostSignal::Fault {
                message: format!("failed to write to host: {e}"),
            });
            break;
        }
    }
}

async fn write_line<W>(stdin: &mut W, command: &HostCommand) -> Result<(), HostError>
where
    W: AsyncWrite + Unpin,
{
    let json = command.to_json()?;
    stdin.write_all(json.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await?;
    Ok(())
}

async fn read_loop<R>(stdout: R, signals: mpsc::UnboundedSender<HostSignal>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stdout);
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        let signal = match reader.read_until(b'\n', &mut buffer).await {
            Ok(0) => {
                let _ = signals.send(HostSignal::Exited { code: None });
                break;
            }
            Ok(_) => {
                let line = buffer.trim_ascii();
                if line.is_empty() {
                    continue;
                }
                match HostEvent::from_slice(line) {
                    Ok(event) => HostSignal::Event(event),
                    Err(e) => {
                        tracing::warn!("Ignoring malformed host message ({e}): {}", String::from_utf8_lossy(line));
                        continue;
                    }
                }
            }
            Err(e) => {
                tracing::error!("Error reading host stdout: {e}");
                let _ = signals.send(HostSignal::Fault {
                    message: format!("failed to read from host: {e}"),
                });
                break;
            }
        };

        if signals.send(signal).is_err() {
            break; // controller dropped this host
        }
    }
}

async fn log_stderr<R>(stderr: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::debug!(target: "script_worker_host::stderr", "{line}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Error reading host stderr: {e}");
                break;
            }
        }
    }
}
