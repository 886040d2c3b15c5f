//! # logos-pages: Real-time page collaboration for Logos
//!
//! Shared editing sessions on pages: access control, live presence and
//! cursors, versioned content updates, comments and notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ PageClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │     Binary Proto    │             │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                     ┌──────┴──────┐
//!                                     │  CollabHub  │
//!                                     └──────┬──────┘
//!            ┌──────────────┬────────────────┼───────────────┬──────────────┐
//!            ▼              ▼                ▼               ▼              ▼
//!    ┌──────────────┐ ┌────────────┐ ┌──────────────┐ ┌────────────┐ ┌─────────────┐
//!    │ Permission   │ │ Change     │ │ Session      │ │ Page rooms │ │ Notification│
//!    │ Authority    │ │ Journal    │ │ Store        │ │ (fan-out)  │ │ Fanout      │
//!    └──────┬───────┘ └─────┬──────┘ └──────────────┘ └────────────┘ └──────┬──────┘
//!           └───────────────┴──────────► CollabStore ◄──────────────────────┘
//!                                     (memory / RocksDB)
//! ```
//!
//! ## Modules
//!
//! - [`permissions`]: Page sharing records and the access check
//! - [`hub`]: Connection events: join, leave, cursor, update, disconnect
//! - [`session`]: Ephemeral members, cursors and page versions
//! - [`journal`]: Append-only change history
//! - [`notifications`]: Persist-then-deliver notifications
//! - [`comments`]: Block comments, threads and reactions
//! - [`broadcast`]: Per-page publish/subscribe
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`server`] / [`client`]: WebSocket transport
//! - [`storage`]: Durable store trait with memory and RocksDB backends

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod comments;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod journal;
pub mod model;
pub mod notifications;
pub mod permissions;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{Authenticator, StaticTokenAuthenticator};
pub use broadcast::{Audience, BroadcastStats, PageRoom, RoomManager, Subscription};
pub use client::{ConnectionState, PageClient};
pub use comments::CommentService;
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionRegistry};
pub use error::CollabError;
pub use hub::CollabHub;
pub use journal::ChangeJournal;
pub use model::{
    AccessGrant, BlockId, ChangeType, Comment, CommentId, ConnectionId, CursorPosition,
    JournalEntry, JournalMetadata, NewComment, Notification, NotificationId, NotificationKind,
    NotificationMetadata, PageId, PageSharingRecord, PageSnapshot, PermissionLevel, Reaction,
    Selection, UserCursor, UserId,
};
pub use notifications::NotificationFanout;
pub use permissions::PermissionAuthority;
pub use protocol::{ClientMessage, Command, ErrorKind, ProtocolError, ServerMessage};
pub use server::{ServerStats, SyncServer};
pub use session::{InMemorySessionStore, PageLocks, SessionStore};
pub use storage::{
    CollabStore, JournalQuery, MemoryStore, RocksStore, StoreConfig, StoreError,
};
