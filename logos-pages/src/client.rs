//! WebSocket client for the page sync server.
//!
//! Used by integration tests and tooling. Every frame the server sends is
//! decoded into a [`ServerMessage`] and queued as an event in arrival order.

use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::model::{BlockId, CommentId, CursorPosition, NewComment, NotificationId, PageId, UserId};
use crate::protocol::{ClientMessage, Command, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

pub struct PageClient {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: mpsc::Sender<Message>,
    event_rx: mpsc::Receiver<ServerMessage>,
    user_id: Option<UserId>,
}

impl PageClient {
    /// Connect to `server_url` (e.g. `ws://127.0.0.1:9090`).
    ///
    /// Spawns background tasks for reading and writing frames.
    pub async fn connect(server_url: impl Into<String>) -> Result<Self, ProtocolError> {
        let server_url = server_url.into();
        let (ws_stream, _) = tokio_tungstenite::connect_async(&server_url)
            .await
            .map_err(|e| {
                log::warn!("Failed to connect to {server_url}: {e}");
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<Message>(256);
        let (event_tx, event_rx) = mpsc::channel::<ServerMessage>(256);
        let state = Arc::new(RwLock::new(ConnectionState::Connected));

        tokio::spawn(async move {
            while let Some(frame) = outgoing_rx.recv().await {
                let closing = matches!(frame, Message::Close(_));
                if ws_writer.send(frame).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_state = state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(message) => {
                            if event_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *reader_state.write().await = ConnectionState::Disconnected;
        });

        Ok(Self {
            server_url,
            state,
            outgoing_tx,
            event_rx,
            user_id: None,
        })
    }

    /// Send `Authenticate` and wait for the verdict.
    pub async fn authenticate(&mut self, credential: &str, wait: Duration) -> Result<UserId, ProtocolError> {
        self.send(ClientMessage::Authenticate {
            credential: credential.to_string(),
        })
        .await?;
        match self.next_event(wait).await? {
            ServerMessage::Authenticated { user_id } => {
                self.user_id = Some(user_id);
                Ok(user_id)
            }
            other => Err(ProtocolError::UnexpectedMessage(format!("{other:?}"))),
        }
    }

    pub async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        let bytes = message.encode()?;
        self.outgoing_tx
            .send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn command(&self, command: Command) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Command(command)).await
    }

    pub async fn join_page(&self, page_id: PageId) -> Result<(), ProtocolError> {
        self.command(Command::JoinPage { page_id }).await
    }

    pub async fn leave_page(&self, page_id: PageId) -> Result<(), ProtocolError> {
        self.command(Command::LeavePage { page_id }).await
    }

    pub async fn update_cursor(&self, page_id: PageId, cursor: CursorPosition) -> Result<(), ProtocolError> {
        self.command(Command::CursorUpdate { page_id, cursor }).await
    }

    pub async fn apply_update(
        &self,
        page_id: PageId,
        block_id: Option<BlockId>,
        content: impl Into<String>,
        version: u64,
    ) -> Result<(), ProtocolError> {
        self.command(Command::ApplyUpdate {
            page_id,
            block_id,
            content: content.into(),
            version,
        })
        .await
    }

    pub async fn add_comment(&self, page_id: PageId, comment: NewComment) -> Result<(), ProtocolError> {
        self.command(Command::AddComment { page_id, comment }).await
    }

    pub async fn resolve_comment(&self, page_id: PageId, comment_id: CommentId) -> Result<(), ProtocolError> {
        self.command(Command::ResolveComment { page_id, comment_id }).await
    }

    pub async fn mark_notification_read(&self, notification_id: NotificationId) -> Result<(), ProtocolError> {
        self.command(Command::MarkNotificationRead { notification_id }).await
    }

    pub async fn clear_notifications(&self) -> Result<(), ProtocolError> {
        self.command(Command::ClearNotifications).await
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Next server event, or `Timeout` if none arrives within `wait`.
    pub async fn next_event(&mut self, wait: Duration) -> Result<ServerMessage, ProtocolError> {
        match tokio::time::timeout(wait, self.event_rx.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ProtocolError::ConnectionClosed),
            Err(_) => Err(ProtocolError::Timeout),
        }
    }

    /// Skip events until one satisfies `pred`. `wait` bounds each event.
    pub async fn wait_for(
        &mut self,
        wait: Duration,
        pred: impl Fn(&ServerMessage) -> bool,
    ) -> Result<ServerMessage, ProtocolError> {
        loop {
            let message = self.next_event(wait).await?;
            if pred(&message) {
                return Ok(message);
            }
            log::trace!("Skipping {message:?}");
        }
    }

    /// Ask the server to close the connection.
    pub async fn close(&self) {
        let _ = self.outgoing_tx.send(Message::Close(None)).await;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The user this client authenticated as.
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
