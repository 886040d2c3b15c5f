//! Durable and ephemeral data shapes shared by every layer.
//!
//! Durable entities (sharing records, journal entries, comments,
//! notifications) live in a [`CollabStore`](crate::storage::CollabStore).
//! Ephemeral ones (cursors, snapshots) only ever exist in a
//! [`SessionStore`](crate::session::SessionStore) or on the wire.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

pub type PageId = Uuid;
pub type UserId = Uuid;
pub type BlockId = Uuid;
pub type ConnectionId = Uuid;
pub type CommentId = Uuid;
pub type NotificationId = Uuid;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ───────────────────────────────────────────────────────────────────
// Permissions
// ───────────────────────────────────────────────────────────────────

/// Totally ordered access level. Declaration order is the ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PermissionLevel {
    Viewer = 0,
    Commenter = 1,
    Editor = 2,
    Admin = 3,
}

impl PermissionLevel {
    pub const ALL: [PermissionLevel; 4] = [
        PermissionLevel::Viewer,
        PermissionLevel::Commenter,
        PermissionLevel::Editor,
        PermissionLevel::Admin,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Whether holding `self` is enough for an operation requiring `required`.
    pub fn satisfies(self, required: PermissionLevel) -> bool {
        self.ordinal() >= required.ordinal()
    }
}

impl std::fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PermissionLevel::Viewer => "viewer",
            PermissionLevel::Commenter => "commenter",
            PermissionLevel::Editor => "editor",
            PermissionLevel::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// One user's level on one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGrant {
    pub page_id: PageId,
    pub user_id: UserId,
    pub level: PermissionLevel,
    pub granted_by: UserId,
    pub granted_at: u64,
    pub last_modified: u64,
}

/// Sharing state of a page. At most one grant per user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSharingRecord {
    pub page_id: PageId,
    pub is_public: bool,
    pub allow_comments: bool,
    pub public_link: Option<String>,
    pub grants: Vec<AccessGrant>,
    pub last_edited_by: Option<UserId>,
    pub last_edited_at: Option<u64>,
}

impl PageSharingRecord {
    /// A private page whose only grant is `owner` at admin level.
    pub fn new(page_id: PageId, owner: UserId) -> Self {
        let now = now_millis();
        Self {
            page_id,
            is_public: false,
            allow_comments: true,
            public_link: None,
            grants: vec![AccessGrant {
                page_id,
                user_id: owner,
                level: PermissionLevel::Admin,
                granted_by: owner,
                granted_at: now,
                last_modified: now,
            }],
            last_edited_by: None,
            last_edited_at: None,
        }
    }

    pub fn grant_for(&self, user_id: UserId) -> Option<&AccessGrant> {
        self.grants.iter().find(|g| g.user_id == user_id)
    }

    pub fn grant_for_mut(&mut self, user_id: UserId) -> Option<&mut AccessGrant> {
        self.grants.iter_mut().find(|g| g.user_id == user_id)
    }

    /// Remove and return the grant held by `user_id`, if any.
    pub fn remove_grant(&mut self, user_id: UserId) -> Option<AccessGrant> {
        let idx = self.grants.iter().position(|g| g.user_id == user_id)?;
        Some(self.grants.remove(idx))
    }

    /// Level the user effectively holds: the explicit grant, else viewer on public pages.
    pub fn effective_level(&self, user_id: UserId) -> Option<PermissionLevel> {
        match self.grant_for(user_id) {
            Some(grant) => Some(grant.level),
            None if self.is_public => Some(PermissionLevel::Viewer),
            None => None,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Change journal
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    Create,
    Update,
    Delete,
    Move,
    Permission,
}

/// Structured detail attached to a journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalMetadata {
    Permission {
        user_id: UserId,
        old_level: Option<PermissionLevel>,
        new_level: Option<PermissionLevel>,
    },
    Visibility {
        is_public: bool,
    },
    Update {
        version: u64,
    },
}

/// An immutable audit record. `sequence` is assigned by the store on append
/// and orders entries that share a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub sequence: u64,
    pub page_id: PageId,
    pub block_id: Option<BlockId>,
    pub user_id: UserId,
    pub change_type: ChangeType,
    pub timestamp: u64,
    pub previous_content: Option<String>,
    pub new_content: Option<String>,
    pub metadata: Option<JournalMetadata>,
}

impl JournalEntry {
    pub fn new(page_id: PageId, user_id: UserId, change_type: ChangeType) -> Self {
        Self {
            sequence: 0,
            page_id,
            block_id: None,
            user_id,
            change_type,
            timestamp: now_millis(),
            previous_content: None,
            new_content: None,
            metadata: None,
        }
    }

    pub fn with_block(mut self, block_id: Option<BlockId>) -> Self {
        self.block_id = block_id;
        self
    }

    pub fn with_content(mut self, previous: Option<String>, new: Option<String>) -> Self {
        self.previous_content = previous;
        self.new_content = new;
        self
    }

    pub fn with_metadata(mut self, metadata: JournalMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ───────────────────────────────────────────────────────────────────
// Comments
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub page_id: PageId,
    pub block_id: BlockId,
    pub user_id: UserId,
    pub content: String,
    /// Root comments have no parent.
    pub parent_id: Option<CommentId>,
    pub mentions: Vec<UserId>,
    pub reactions: Vec<Reaction>,
    pub resolved_at: Option<u64>,
    pub resolved_by: Option<UserId>,
    pub is_edited: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Client-supplied part of a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewComment {
    pub block_id: BlockId,
    pub content: String,
    pub parent_id: Option<CommentId>,
    pub mentions: Vec<UserId>,
}

// ───────────────────────────────────────────────────────────────────
// Notifications
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    Mention,
    Comment,
    PageUpdated,
    PermissionGranted,
    PermissionRevoked,
    PermissionChanged,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationMetadata {
    Mention {
        mentioned_by: UserId,
        block_id: BlockId,
    },
    Comment {
        comment_id: CommentId,
        author: UserId,
    },
    Permission {
        level: Option<PermissionLevel>,
        changed_by: UserId,
    },
    Custom(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub user_id: UserId,
    pub page_id: PageId,
    pub message: String,
    pub metadata: Option<NotificationMetadata>,
    pub read: bool,
    pub created_at: u64,
}

// ───────────────────────────────────────────────────────────────────
// Ephemeral session state
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: u64,
    pub head: u64,
}

/// Where a user's caret is. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub block_id: Option<BlockId>,
    pub position: u64,
    pub selection: Option<Selection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCursor {
    pub user_id: UserId,
    pub cursor: CursorPosition,
}

/// What a joining connection sees of a page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSnapshot {
    /// Members in join order.
    pub active_users: Vec<UserId>,
    pub cursors: Vec<UserCursor>,
    pub version: u64,
}
