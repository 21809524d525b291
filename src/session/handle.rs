use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::event::SessionError;
use super::state::SessionState;
use crate::signaling::{JoinCode, PeerId};

const SESSION_COMMAND_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// Requests from the application to the coordinator task
pub enum SessionCommand {
    CreateRoom { reply: Reply<()> },
    JoinRoom { code: JoinCode, reply: Reply<()> },
    CloseRoom { reply: Reply<()> },
    SubmitAction {
        action: String,
        input: Value,
        reply: Reply<u64>,
    },
    RequestResync { reply: Reply<()> },
    Restart { reply: Reply<()> },
    Reconnect { peer: PeerId, reply: Reply<()> },
    State { reply: oneshot::Sender<SessionState> },
    Shutdown,
}

/// Cloneable front end of a running `SessionCoordinator`
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn channel() -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(SESSION_COMMAND_CAPACITY);
        (Self { tx }, rx)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SessionError::Shutdown)?;
        reply_rx.await.map_err(|_| SessionError::Shutdown)
    }

    pub async fn create_room(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::CreateRoom { reply })
            .await?
    }

    pub async fn join_room(&self, code: JoinCode) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::JoinRoom { code, reply })
            .await?
    }

    pub async fn close_room(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::CloseRoom { reply })
            .await?
    }

    /// Returns the action's sequence number
    pub async fn submit_action(
        &self,
        action: impl Into<String>,
        input: Value,
    ) -> Result<u64, SessionError> {
        let action = action.into();
        self.request(|reply| SessionCommand::SubmitAction {
            action,
            input,
            reply,
        })
        .await?
    }

    pub async fn request_resync(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::RequestResync { reply })
            .await?
    }

    pub async fn restart(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Restart { reply })
            .await?
    }

    pub async fn reconnect(&self, peer: PeerId) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Reconnect { peer, reply })
            .await?
    }

    /// Snapshot of the local view
    pub async fn state(&self) -> Result<SessionState, SessionError> {
        self.request(|reply| SessionCommand::State { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(SessionCommand::Shutdown).await;
    }
}
