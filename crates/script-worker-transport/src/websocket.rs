//! WebSocket bridge for browser clients.
//!
//! Each connection gets its own session. Session events, including the
//! history recorded before the page subscribed, are streamed to the page;
//! page messages are forwarded to the session handle.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use script_worker_core::{HostLauncher, SessionConfig};
use script_worker_session::{CommandRegistry, Session, spawn_session};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::protocol::{ClientMessage, ControlMessage, ServerMessage};

/// Shared state of the websocket routes.
pub struct WsState<L> {
    /// Launches one host per connection.
    pub launcher: Arc<L>,
    /// Configuration of every session.
    pub config: SessionConfig,
    /// Custom host commands forwarded to the page.
    pub forwarded_commands: Arc<[String]>,
}

impl<L> WsState<L> {
    #[must_use]
    pub fn new(launcher: Arc<L>, config: SessionConfig) -> Self {
        Self {
            launcher,
            config,
            forwarded_commands: Arc::from(Vec::new()),
        }
    }

    /// Forward these `cmd:<name>` host commands to the page as `custom` messages.
    #[must_use]
    pub fn with_forwarded_commands<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forwarded_commands = names.into_iter().map(Into::into).collect();
        self
    }
}

impl<L> Clone for WsState<L> {
    fn clone(&self) -> Self {
        Self {
            launcher: Arc::clone(&self.launcher),
            config: self.config.clone(),
            forwarded_commands: Arc::clone(&self.forwarded_commands),
        }
    }
}

/// WebSocket upgrade handler.
///
/// Use this as an Axum route handler.
pub async fn ws_handler<L>(ws: WebSocketUpgrade, State(state): State<WsState<L>>) -> impl IntoResponse
where
    L: HostLauncher + 'static,
{
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn health() -> &'static str {
    "ok"
}

async fn handle_socket<L>(socket: WebSocket, state: WsState<L>)
where
    L: HostLauncher + 'static,
{
    let (mut sender, mut receiver) = socket.split();

    // Channel for sending messages to the client
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let mut registry = CommandRegistry::new();
    for name in &*state.forwarded_commands {
        let (name, tx) = (name.clone(), tx.clone());
        registry.register(name.clone(), move |data| {
            let _ = tx.send(
                ControlMessage::Custom {
                    name: name.clone(),
                    data,
                }
                .into(),
            );
        });
    }

    let session = Session::new(Arc::clone(&state.launcher), state.config.clone()).with_registry(registry);
    let (handle, session_task) = spawn_session(session);
    tracing::info!(session = %handle.id(), "WebSocket client connected");
    let _ = tx.send(
        ControlMessage::SessionStarted {
            session_id: handle.id().to_string(),
        }
        .into(),
    );

    let events_tx = tx.clone();
    let mut events = handle.events().history_plus_stream();
    let forward_task = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if events_tx.send(event.into()).is_err() {
                break;
            }
        }
    });

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match msg.to_json() {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text.as_str().to_owned(),
            Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::error!("WebSocket error: {e}");
                break;
            }
        };

        let reply = ClientMessage::from_json(&text).and_then(|msg| msg.apply(&handle));
        match reply {
            Ok(Some(reply)) => {
                let _ = tx.send(reply);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Rejected client message: {e}");
                let _ = tx.send(ServerMessage::error(e.to_string()));
            }
        }
    }

    tracing::info!(session = %handle.id(), "WebSocket client disconnected");
    let _ = handle.shutdown();
    if let Err(e) = session_task.await {
        tracing::error!("Session task failed: {e}");
    }
    forward_task.abort();
    send_task.abort();
}

/// Create the websocket router with a `/health` check.
///
/// # Example
/// ```ignore
/// let app = Router::new()
///     .merge(create_ws_router(WsState::new(launcher, config)));
/// ```
#[must_use]
pub fn create_ws_router<L>(state: WsState<L>) -> Router
where
    L: HostLauncher + 'static,
{
    Router::new()
        .route("/ws", get(ws_handler::<L>))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
