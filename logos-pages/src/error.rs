//! Error kinds surfaced by collaboration operations.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{PageId, PermissionLevel, UserId};
use crate::protocol::ErrorKind;
use crate::storage::StoreError;

#[derive(Debug, Error)]
pub enum CollabError {
    /// Credential could not be verified. Terminates the connection.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Connection is not authenticated")]
    NotAuthenticated,

    #[error("Connection is already authenticated as {0}")]
    AlreadyAuthenticated(UserId),

    #[error("Page not found: {0}")]
    PageNotFound(PageId),

    #[error("Access denied to page {0}")]
    AccessDenied(PageId),

    #[error("Insufficient permission on page {page_id}: {required} required")]
    InsufficientPermission {
        page_id: PageId,
        required: PermissionLevel,
    },

    #[error("Version conflict: current version is {current_version}")]
    VersionConflict {
        current_version: u64,
        server_content: Option<String>,
    },

    #[error("Connection has not joined page {0}")]
    NotJoined(PageId),

    #[error("Comment not found: {0}")]
    CommentNotFound(Uuid),

    #[error("Comments are disabled on page {0}")]
    CommentsDisabled(PageId),

    #[error("Notification not found: {0}")]
    NotificationNotFound(Uuid),

    #[error("Page already shared: {0}")]
    PageExists(PageId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CollabError {
    /// Whether the connection that hit this error must be closed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CollabError::Authentication(_) | CollabError::Store(_))
    }

    /// Wire-level tag for the error event sent back to the client.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::Authentication(_) => ErrorKind::Authentication,
            CollabError::NotAuthenticated => ErrorKind::NotAuthenticated,
            CollabError::AlreadyAuthenticated(_) => ErrorKind::AlreadyAuthenticated,
            CollabError::PageNotFound(_) => ErrorKind::PageNotFound,
            CollabError::AccessDenied(_) => ErrorKind::AccessDenied,
            CollabError::InsufficientPermission { .. } => ErrorKind::InsufficientPermission,
            CollabError::VersionConflict { .. } => ErrorKind::VersionConflict,
            CollabError::NotJoined(_) => ErrorKind::NotJoined,
            CollabError::CommentNotFound(_) => ErrorKind::CommentNotFound,
            CollabError::CommentsDisabled(_) => ErrorKind::CommentsDisabled,
            CollabError::NotificationNotFound(_) => ErrorKind::NotificationNotFound,
            CollabError::PageExists(_) => ErrorKind::PageExists,
            CollabError::Store(_) => ErrorKind::Internal,
        }
    }
}
