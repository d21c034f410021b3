//! In-process host driven over tokio channels.
//!
//! Every launch hands a [`HostPeer`] to whoever holds the peer receiver. The
//! peer plays the host side: it reads commands and emits events. This is the
//! host of choice for embedders running their interpreter on a task of the
//! same process, and for tests scripting host behavior step by step.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use async_trait::async_trait;
use script_worker_core::{HostCommand, HostConnection, HostError, HostEvent, HostHandle, HostLauncher, HostSignal};
use tokio::sync::mpsc;

/// Launch bookkeeping shared between a launcher and its hosts.
#[derive(Debug, Default)]
pub struct LaunchStats {
    launched: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    terminated: AtomicUsize,
}

impl LaunchStats {
    /// Hosts launched so far.
    #[must_use]
    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Hosts neither terminated nor dropped.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live hosts observed.
    #[must_use]
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Hosts explicitly terminated.
    #[must_use]
    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    fn on_launch(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
    }
}

struct LiveGuard(Arc<LaunchStats>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Launcher producing in-process hosts.
pub struct ChannelLauncher {
    peers: mpsc::UnboundedSender<HostPeer>,
    stats: Arc<LaunchStats>,
}

impl ChannelLauncher {
    /// Create a launcher and the receiver of its host peers.
    ///
    /// Once the receiver is dropped, launches fail with [`HostError::Disconnected`].
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostPeer>) {
        let (peers, peer_rx) = mpsc::unbounded_channel();
        let launcher = Self {
            peers,
            stats: Arc::new(LaunchStats::default()),
        };
        (launcher, peer_rx)
    }

    /// Shared launch statistics.
    #[must_use]
    pub fn stats(&self) -> Arc<LaunchStats> {
        Arc::clone(&self.stats)
    }
}

#[async_trait]
impl HostLauncher for ChannelLauncher {
    async fn launch(&self) -> Result<HostConnection, HostError> {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let peer = HostPeer {
            commands: command_rx,
            signals: signal_tx,
            terminated: Arc::clone(&terminated),
        };
        self.peers.send(peer).map_err(|_| HostError::Disconnected)?;

        self.stats.on_launch();
        tracing::debug!(launched = self.stats.launched(), "In-process host launched");

        Ok(HostConnection {
            handle: Box::new(ChannelHost {
                commands: Some(command_tx),
                terminated,
                stats: Arc::clone(&self.stats),
                live: Some(LiveGuard(Arc::clone(&self.stats))),
            }),
            signals,
        })
    }
}

struct ChannelHost {
    commands: Option<mpsc::UnboundedSender<HostCommand>>,
    terminated: Arc<AtomicBool>,
    stats: Arc<LaunchStats>,
    live: Option<LiveGuard>,
}

#[async_trait]
impl HostHandle for ChannelHost {
    fn send(&self, command: HostCommand) -> Result<(), HostError> {
        self.commands
            .as_ref()
            .ok_or(HostError::Disconnected)?
            .send(command)
            .map_err(|_| HostError::Disconnected)
    }

    async fn terminate(&mut self) -> Result<(), HostError> {
        if self.live.take().is_some() {
            self.commands = None;
            self.terminated.store(true, Ordering::SeqCst);
            self.stats.terminated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Host side of an in-process host.
pub struct HostPeer {
    commands: mpsc::UnboundedReceiver<HostCommand>,
    signals: mpsc::UnboundedSender<HostSignal>,
    terminated: Arc<AtomicBool>,
}

impl HostPeer {
    /// Next command from the controller. `None` once the host was terminated or dropped.
    pub async fn recv(&mut self) -> Option<HostCommand> {
        self.commands.recv().await
    }

    /// Next command if one is already queued.
    pub fn try_recv(&mut self) -> Option<HostCommand> {
        self.commands.try_recv().ok()
    }

    /// Emit a protocol event. Returns false if the controller no longer listens.
    pub fn emit(&self, event: HostEvent) -> bool {
        self.signals.send(HostSignal::Event(event)).is_ok()
    }

    /// Report a low-level failure.
    pub fn fault(&self, message: impl Into<String>) -> bool {
        self.signals
            .send(HostSignal::Fault {
                message: message.into(),
            })
            .is_ok()
    }

    /// Report that the host went away on its own.
    pub fn exit(&self, code: Option<i32>) -> bool {
        self.signals.send(HostSignal::Exited { code }).is_ok()
    }

    /// The controller forcibly terminated this host.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}
