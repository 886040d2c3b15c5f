//! Binary wire protocol for page sessions.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded
//! [`ClientMessage`] (client → server) or [`ServerMessage`]
//! (server → client). The first client frame must be
//! [`ClientMessage::Authenticate`].
//!
//! Page-scoped requests are expressed as a [`Command`], which the hub
//! dispatches through a single exhaustive match.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    BlockId, Comment, CommentId, CursorPosition, NewComment, Notification, NotificationId,
    PageId, PageSnapshot, UserId,
};

/// A request made on an authenticated connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    JoinPage {
        page_id: PageId,
    },
    LeavePage {
        page_id: PageId,
    },
    CursorUpdate {
        page_id: PageId,
        cursor: CursorPosition,
    },
    ApplyUpdate {
        page_id: PageId,
        block_id: Option<BlockId>,
        content: String,
        /// Version the client last observed.
        version: u64,
    },
    AddComment {
        page_id: PageId,
        comment: NewComment,
    },
    ResolveComment {
        page_id: PageId,
        comment_id: CommentId,
    },
    MarkNotificationRead {
        notification_id: NotificationId,
    },
    ClearNotifications,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    Authenticate { credential: String },
    Command(Command),
    Ping,
}

/// Reason tag carried by [`ServerMessage::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Authentication,
    NotAuthenticated,
    AlreadyAuthenticated,
    PageNotFound,
    AccessDenied,
    InsufficientPermission,
    VersionConflict,
    NotJoined,
    CommentNotFound,
    CommentsDisabled,
    NotificationNotFound,
    PageExists,
    InvalidMessage,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Authenticated {
        user_id: UserId,
    },
    /// Reply to the joiner.
    PageJoined {
        page_id: PageId,
        snapshot: PageSnapshot,
    },
    /// To every other member.
    UserJoined {
        page_id: PageId,
        user_id: UserId,
        active_users: Vec<UserId>,
    },
    /// To the remaining members.
    UserLeft {
        page_id: PageId,
        user_id: UserId,
        active_users: Vec<UserId>,
    },
    CursorMoved {
        page_id: PageId,
        user_id: UserId,
        cursor: CursorPosition,
    },
    PageUpdated {
        page_id: PageId,
        block_id: Option<BlockId>,
        content: String,
        user_id: UserId,
        version: u64,
    },
    /// Reply to the sender of an accepted update.
    UpdateAccepted {
        page_id: PageId,
        version: u64,
    },
    /// Reply to the sender of a stale update.
    VersionConflict {
        page_id: PageId,
        current_version: u64,
        server_content: Option<String>,
    },
    /// To every member, sender included.
    CommentAdded {
        page_id: PageId,
        comment: Comment,
    },
    CommentResolved {
        page_id: PageId,
        comment: Comment,
    },
    Notification(Notification),
    NotificationUpdated {
        id: NotificationId,
        read: bool,
    },
    NotificationsCleared,
    Error {
        kind: ErrorKind,
        message: String,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_frame<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Selection;
    use uuid::Uuid;

    #[test]
    fn test_command_frame_roundtrip() {
        let msg = ClientMessage::Command(Command::ApplyUpdate {
            page_id: Uuid::new_v4(),
            block_id: Some(Uuid::new_v4()),
            content: "{\"text\":\"hello\"}".into(),
            version: 41,
        });
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_cursor_frame_is_small() {
        let msg = ServerMessage::CursorMoved {
            page_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            cursor: CursorPosition {
                block_id: Some(Uuid::new_v4()),
                position: 120,
                selection: Some(Selection { anchor: 100, head: 120 }),
            },
        };
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 80, "cursor frame is {} bytes", encoded.len());
        assert_eq!(ServerMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(ClientMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_error_helper() {
        let msg = ServerMessage::error(ErrorKind::AccessDenied, "no grant");
        match msg {
            ServerMessage::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::AccessDenied);
                assert_eq!(message, "no grant");
            }
            other => panic!("Expected Error, got {other:?}"),
        }
    }
}
