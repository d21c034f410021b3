//! Wire protocol for page-server communication.

use script_worker_core::{DebugCommand, SessionEvent};
use script_worker_session::{SessionError, SessionHandle};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run a program.
    Run {
        code: String,
        #[serde(default)]
        breakpoints: Vec<u32>,
    },
    /// Warm up the interpreter.
    Preload,
    /// Answer an input request.
    Submit { text: String },
    /// Abandon an input request.
    Cancel,
    /// Debugger command while suspended.
    Debug { dbg: DebugCommand },
    /// Stop the running program.
    Stop,
    /// Request a file.
    GetFile { path: String },
    /// Write a file.
    PutFile { path: String, data: Value },
    ClearFigure,
    ClearOutput,
    /// Ping for keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse a message received from the page.
    ///
    /// # Errors
    /// Returns error if the text is not a valid client message.
    pub fn from_json(text: &str) -> Result<Self, TransportError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Forward this message to `session`. Returns the direct reply, if any.
    ///
    /// # Errors
    /// Returns error if the session task has shut down.
    pub fn apply(self, session: &SessionHandle) -> Result<Option<ServerMessage>, TransportError> {
        match self {
            Self::Run { code, breakpoints } => session.run(code, breakpoints.into_iter().collect())?,
            Self::Preload => session.preload()?,
            Self::Submit { text } => session.submit(text)?,
            Self::Cancel => session.cancel()?,
            Self::Debug { dbg } => session.debug_resume(dbg)?,
            Self::Stop => session.stop()?,
            Self::GetFile { path } => session.get_file(path)?,
            Self::PutFile { path, data } => session.put_file(path, data)?,
            Self::ClearFigure => session.clear_figure()?,
            Self::ClearOutput => session.clear_output()?,
            Self::Ping => return Ok(Some(ControlMessage::Pong.into())),
        }
        Ok(None)
    }
}

/// Server messages that are not session events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Connection is bound to a fresh session.
    SessionStarted { session_id: String },
    /// Custom host command forwarded to the page.
    Custom { name: String, data: Value },
    /// Error message.
    Error { message: String },
    /// Pong response.
    Pong,
}

/// Message from server to client.
///
/// Session events keep their own `type` tags, which never collide with
/// those of [`ControlMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event(SessionEvent),
    Control(ControlMessage),
}

impl ServerMessage {
    /// # Errors
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, TransportError> {
        Ok(serde_json::to_string(self)?)
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::Control(ControlMessage::Error {
            message: message.into(),
        })
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        Self::Event(event)
    }
}

impl From<ControlMessage> for ServerMessage {
    fn from(message: ControlMessage) -> Self {
        Self::Control(message)
    }
}

#[cfg(test)]
mod tests {
    use script_worker_core::{ActivityState, HostCommand, SessionConfig};
    use script_worker_host::ChannelLauncher;
    use script_worker_session::{Session, spawn_session};
    use serde_json::json;

    use super::*;

    #[test]
    fn test_client_message_parsing() {
        let msg = ClientMessage::from_json(r#"{"type":"run","code":"print(1)"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Run {
                code: "print(1)".to_string(),
                breakpoints: Vec::new(),
            }
        );

        let msg = ClientMessage::from_json(r#"{"type":"debug","dbg":"return"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Debug {
                dbg: DebugCommand::Return
            }
        );

        assert!(ClientMessage::from_json(r#"{"type":"resize"}"#).is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let event: ServerMessage = SessionEvent::Suspended { line: 3 }.into();
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"type": "suspended", "line": 3})
        );

        let pong: ServerMessage = ControlMessage::Pong.into();
        assert_eq!(pong.to_json().unwrap(), r#"{"type":"pong"}"#);

        let parsed: ServerMessage = serde_json::from_str(r#"{"type":"state","state":{"kind":"idle"}}"#).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Event(SessionEvent::State {
                state: ActivityState::Idle
            })
        );
        let parsed: ServerMessage = serde_json::from_str(r#"{"type":"custom","name":"beep","data":null}"#).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Control(ControlMessage::Custom {
                name: "beep".to_string(),
                data: Value::Null,
            })
        );
    }

    #[tokio::test]
    async fn test_apply_forwards_to_session() {
        let (launcher, mut peers) = ChannelLauncher::new();
        let (handle, _task) = spawn_session(Session::new(launcher, SessionConfig::default()));

        let reply = ClientMessage::Run {
            code: "print(1)".to_string(),
            breakpoints: vec![0, 4],
        }
        .apply(&handle)
        .unwrap();
        assert!(reply.is_none());

        let mut peer = peers.recv().await.unwrap();
        assert!(matches!(peer.recv().await, Some(HostCommand::Config { .. })));
        assert_eq!(
            peer.recv().await,
            Some(HostCommand::Run {
                code: "print(1)".to_string(),
                breakpoints: [4].into_iter().collect(),
            })
        );

        assert_eq!(
            ClientMessage::Ping.apply(&handle).unwrap(),
            Some(ServerMessage::Control(ControlMessage::Pong))
        );
    }

    #[tokio::test]
    async fn test_apply_after_shutdown_fails() {
        let (launcher, _peers) = ChannelLauncher::new();
        let (handle, task) = spawn_session(Session::new(launcher, SessionConfig::default()));
        handle.shutdown().unwrap();
        task.await.unwrap();

        assert!(matches!(
            ClientMessage::Stop.apply(&handle),
            Err(TransportError::Session(SessionError::Closed))
        ));
    }
}
