//! Durable storage for sharing records, journal, comments and notifications.
//!
//! ```text
//! ┌─────────────────────┐   CollabStore   ┌──────────────────┐
//! │ PermissionAuthority │ ──────────────► │ MemoryStore      │
//! │ ChangeJournal       │                 │  (tests, default)│
//! │ CommentService      │                 ├──────────────────┤
//! │ NotificationFanout  │                 │ RocksStore       │
//! └─────────────────────┘                 │  (RocksDB + LZ4) │
//!                                         └──────────────────┘
//! ```
//!
//! The store is a plain record store. Authorization, versioning and
//! fan-out are decided above it.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    BlockId, Comment, CommentId, JournalEntry, Notification, PageId, PageSharingRecord, UserId,
};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Record not found: {0}")]
    NotFound(Uuid),
    #[error("Record already exists: {0}")]
    AlreadyExists(Uuid),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Time window and paging for journal reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalQuery {
    /// Inclusive lower bound (ms since epoch).
    pub start: Option<u64>,
    /// Inclusive upper bound (ms since epoch).
    pub end: Option<u64>,
    pub limit: usize,
    pub skip: usize,
}

impl Default for JournalQuery {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            limit: 50,
            skip: 0,
        }
    }
}

impl JournalQuery {
    pub fn latest(limit: usize) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }

    fn in_window(&self, timestamp: u64) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp <= e)
    }
}

/// Which slice of the journal a read covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalScope {
    Page(PageId),
    Block(PageId, BlockId),
    User(UserId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalFilter {
    pub scope: JournalScope,
    pub query: JournalQuery,
}

impl JournalFilter {
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        let in_scope = match self.scope {
            JournalScope::Page(page) => entry.page_id == page,
            JournalScope::Block(page, block) => {
                entry.page_id == page && entry.block_id == Some(block)
            }
            JournalScope::User(user) => entry.user_id == user,
        };
        in_scope && self.query.in_window(entry.timestamp)
    }

    /// Order newest-first and apply skip/limit. Input order is irrelevant.
    pub fn paginate(&self, mut entries: Vec<JournalEntry>) -> Vec<JournalEntry> {
        entries.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        entries
            .into_iter()
            .skip(self.query.skip)
            .take(self.query.limit)
            .collect()
    }
}

/// Durable record store consumed by the collaboration core.
///
/// Implementations must be safe to call from many tasks at once; each
/// method is a single read or write and carries no cross-call atomicity.
pub trait CollabStore: Send + Sync {
    // ─── Sharing records ─────────────────────────────────────────────

    /// Insert a new record. Fails with `AlreadyExists` if the page has one.
    fn insert_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError>;
    fn load_sharing(&self, page_id: PageId) -> Result<Option<PageSharingRecord>, StoreError>;
    fn save_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError>;
    fn list_sharing(&self) -> Result<Vec<PageId>, StoreError>;

    // ─── Journal ─────────────────────────────────────────────────────

    /// Append an entry, assigning its sequence number. Returns the stored entry.
    fn append_journal(&self, entry: JournalEntry) -> Result<JournalEntry, StoreError>;
    /// Matching entries, newest first, paged per the filter's query.
    fn journal_entries(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>, StoreError>;
    /// `new_content` of the newest entry of the page whose `block_id` equals
    /// `block_id` and that carries content.
    fn latest_content(&self, page_id: PageId, block_id: Option<BlockId>) -> Result<Option<String>, StoreError>;

    // ─── Comments ────────────────────────────────────────────────────

    fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError>;
    fn load_comment(&self, comment_id: CommentId) -> Result<Option<Comment>, StoreError>;
    fn save_comment(&self, comment: &Comment) -> Result<(), StoreError>;
    /// All comments on a page, oldest first.
    fn comments_for_page(&self, page_id: PageId) -> Result<Vec<Comment>, StoreError>;

    // ─── Notifications ───────────────────────────────────────────────

    fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    /// All notifications for a user, newest first.
    fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, StoreError>;
    fn save_notification(&self, notification: &Notification) -> Result<(), StoreError>;
    /// Delete every notification of a user. Returns how many were removed.
    fn delete_notifications_for_user(&self, user_id: UserId) -> Result<u64, StoreError>;
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
