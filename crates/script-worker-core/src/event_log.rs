//! Broadcast + history event log for late subscribers.

use std::{
    collections::VecDeque,
    fmt,
    sync::{PoisonError, RwLock},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{OutputUpdate, SessionEvent};

/// Default history size limit (1 MB).
pub const DEFAULT_HISTORY_BYTES: usize = 1024 * 1024;

const CHANNEL_CAPACITY: usize = 4096;

struct StoredEvent {
    event: SessionEvent,
    bytes: usize,
}

struct Inner {
    history: VecDeque<StoredEvent>,
    total_bytes: usize,
}

/// Event log with broadcast and history support.
///
/// A consumer attaching mid-session receives the retained history first,
/// then live events.
pub struct EventLog {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<SessionEvent>,
    history_bytes: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_BYTES)
    }
}

impl EventLog {
    /// Create an event log retaining at most `history_bytes` of history.
    #[must_use]
    pub fn new(history_bytes: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                history: VecDeque::with_capacity(32),
                total_bytes: 0,
            }),
            sender,
            history_bytes,
        }
    }

    /// Publish an event to live subscribers and history.
    ///
    /// Sending and recording happen under the history lock, so a subscriber
    /// attaching through [`history_plus_stream`](Self::history_plus_stream)
    /// sees every event exactly once.
    pub fn push(&self, event: SessionEvent) {
        let bytes = event.approx_bytes();

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = self.sender.send(event.clone()); // live subscribers
        while inner.total_bytes.saturating_add(bytes) > self.history_bytes {
            if let Some(front) = inner.history.pop_front() {
                inner.total_bytes = inner.total_bytes.saturating_sub(front.bytes);
            } else {
                break;
            }
        }
        inner.history.push_back(StoredEvent { event, bytes });
        inner.total_bytes = inner.total_bytes.saturating_add(bytes);
    }

    /// Publish an output update.
    pub fn push_output(&self, update: OutputUpdate) {
        self.push(SessionEvent::Output { update });
    }

    /// Get a receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Snapshot of the retained history.
    #[must_use]
    pub fn history(&self) -> Vec<SessionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .iter()
            .map(|s| s.event.clone())
            .collect()
    }

    /// Stream that yields history first, then live events.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SessionEvent> {
        let (history, rx) = {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let history: Vec<SessionEvent> = inner.history.iter().map(|s| s.event.clone()).collect();
            (history, self.sender.subscribe())
        };

        let hist = futures::stream::iter(history);
        let live = BroadcastStream::new(rx).filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(e) => {
                    tracing::warn!("Event subscriber fell behind: {e}");
                    None
                }
            }
        });

        Box::pin(hist.chain(live))
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventLog")
            .field("history_bytes", &self.history_bytes)
            .field("retained", &inner.history.len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}
