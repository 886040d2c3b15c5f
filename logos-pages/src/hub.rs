//! The synchronization protocol handler.
//!
//! [`CollabHub`] owns every shared service and applies connection events
//! to them. The transport calls into it; nothing here touches sockets.
//!
//! ```text
//!                         ┌──────────────── CollabHub ────────────────┐
//! Connection ─Command──►  │ PageLocks ─► SessionStore (members,       │
//!                         │              cursors, versions)           │
//!                         │ PermissionAuthority ─► CollabStore        │
//!                         │ ChangeJournal ───────► CollabStore        │
//!                         │ RoomManager ─► PageRoom ─► Subscriptions ─┼─► outbound
//!                         │ NotificationFanout ─► ConnectionRegistry ─┼─► outbound
//!                         └───────────────────────────────────────────┘
//! ```
//!
//! Join, leave and update hold the page's lock for their whole step, so
//! two steps on the same page never interleave. Cursor moves skip the lock;
//! each user's cursor is last-write-wins.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::broadcast::{Audience, RoomManager};
use crate::comments::CommentService;
use crate::connection::{Connection, ConnectionRegistry};
use crate::error::CollabError;
use crate::journal::ChangeJournal;
use crate::model::{
    BlockId, ChangeType, Comment, CommentId, ConnectionId, CursorPosition, JournalEntry,
    JournalMetadata, NewComment, Notification, NotificationId, PageId, PageSnapshot,
    PermissionLevel, UserId,
};
use crate::notifications::NotificationFanout;
use crate::permissions::PermissionAuthority;
use crate::protocol::{Command, ServerMessage};
use crate::session::{InMemorySessionStore, PageLocks, SessionStore};
use crate::storage::{CollabStore, MemoryStore};

pub struct CollabHub {
    authenticator: Arc<dyn Authenticator>,
    sessions: Arc<dyn SessionStore>,
    locks: PageLocks,
    rooms: Arc<RoomManager>,
    connections: Arc<ConnectionRegistry>,
    journal: ChangeJournal,
    notifications: Arc<NotificationFanout>,
    authority: Arc<PermissionAuthority>,
    comments: CommentService,
}

impl CollabHub {
    pub fn new(
        store: Arc<dyn CollabStore>,
        sessions: Arc<dyn SessionStore>,
        authenticator: Arc<dyn Authenticator>,
        broadcast_capacity: usize,
    ) -> Self {
        let rooms = Arc::new(RoomManager::new(broadcast_capacity));
        let connections = Arc::new(ConnectionRegistry::new());
        let journal = ChangeJournal::new(store.clone());
        let notifications = Arc::new(NotificationFanout::new(store.clone(), connections.clone()));
        let authority = Arc::new(PermissionAuthority::new(
            store.clone(),
            journal.clone(),
            notifications.clone(),
        ));
        let comments = CommentService::new(store, authority.clone(), notifications.clone(), rooms.clone());

        Self {
            authenticator,
            sessions,
            locks: PageLocks::new(),
            rooms,
            connections,
            journal,
            notifications,
            authority,
            comments,
        }
    }

    /// A hub over a fresh [`MemoryStore`] and [`InMemorySessionStore`].
    pub fn in_memory(authenticator: Arc<dyn Authenticator>, broadcast_capacity: usize) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            Arc::new(InMemorySessionStore::new()),
            authenticator,
            broadcast_capacity,
        )
    }

    /// A new unauthenticated connection and the receiving end of its outbound queue.
    pub fn open_connection(&self, outbound_capacity: usize) -> (Connection, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(outbound_capacity);
        (Connection::new(tx), rx)
    }

    /// Verify `credential` and bind the connection to its user.
    ///
    /// A connection is bound once; later attempts are rejected and leave
    /// its identity and page sessions untouched.
    pub fn authenticate(&self, connection: &mut Connection, credential: &str) -> Result<UserId, CollabError> {
        if let Some(current) = connection.user_id() {
            log::warn!("Connection {} tried to re-authenticate as another user", connection.id());
            return Err(CollabError::AlreadyAuthenticated(current));
        }
        let user_id = self.authenticator.verify(credential)?;
        connection.set_user(user_id);
        self.connections
            .register(user_id, connection.id(), connection.outbound().clone());
        log::info!("Connection {} authenticated as {user_id}", connection.id());
        Ok(user_id)
    }

    /// Enter a page session.
    ///
    /// The page must exist and the user must hold at least viewer. Other
    /// members are told about the arrival; the joiner gets the snapshot.
    pub async fn join_page(&self, connection: &mut Connection, page_id: PageId) -> Result<PageSnapshot, CollabError> {
        let user_id = connection.require_user()?;
        self.authority.require_page(page_id)?;
        if !self
            .authority
            .has_permission(page_id, user_id, PermissionLevel::Viewer)?
        {
            log::warn!("{user_id} denied access to page {page_id}");
            return Err(CollabError::AccessDenied(page_id));
        }

        let _guard = self.locks.acquire(page_id).await;
        let snapshot = self.sessions.join(page_id, user_id);
        if !connection.has_joined(page_id) {
            let room = self.rooms.get_or_create(page_id).await;
            let subscription = room.subscribe(connection.id(), user_id, connection.outbound().clone());
            connection.add_subscription(subscription);
            room.publish(
                Audience::Others(connection.id()),
                ServerMessage::UserJoined {
                    page_id,
                    user_id,
                    active_users: snapshot.active_users.clone(),
                },
            );
        }

        log::info!(
            "{user_id} joined page {page_id} ({} active)",
            snapshot.active_users.len()
        );
        Ok(snapshot)
    }

    /// Leave a page session. Returns the members that remain.
    ///
    /// The user stays a member while another of their connections is still
    /// in the page.
    pub async fn leave_page(&self, connection: &mut Connection, page_id: PageId) -> Result<Vec<UserId>, CollabError> {
        let user_id = connection.require_user()?;
        let subscription = connection
            .take_subscription(page_id)
            .ok_or(CollabError::NotJoined(page_id))?;

        let guard = self.locks.acquire(page_id).await;
        drop(subscription);

        let still_present = match self.rooms.get(page_id).await {
            Some(room) => room.has_user(user_id),
            None => false,
        };
        let remaining = if still_present {
            self.sessions.snapshot(page_id).active_users
        } else {
            let remaining = self.sessions.leave(page_id, user_id).unwrap_or_default();
            self.rooms
                .publish(
                    page_id,
                    Audience::Others(connection.id()),
                    ServerMessage::UserLeft {
                        page_id,
                        user_id,
                        active_users: remaining.clone(),
                    },
                )
                .await;
            log::info!("{user_id} left page {page_id} ({} remaining)", remaining.len());
            remaining
        };

        if self.rooms.remove_if_empty(page_id).await {
            log::debug!("Room for page {page_id} closed");
        }
        drop(guard);
        self.locks.prune(page_id);
        Ok(remaining)
    }

    /// Move the user's cursor and show it to the other members.
    pub async fn update_cursor(
        &self,
        connection: &Connection,
        page_id: PageId,
        cursor: CursorPosition,
    ) -> Result<(), CollabError> {
        let user_id = connection.require_user()?;
        if !connection.has_joined(page_id) || !self.sessions.set_cursor(page_id, user_id, cursor.clone()) {
            return Err(CollabError::NotJoined(page_id));
        }
        log::trace!("Cursor of {user_id} on page {page_id} at {}", cursor.position);
        self.rooms
            .publish(
                page_id,
                Audience::Others(connection.id()),
                ServerMessage::CursorMoved {
                    page_id,
                    user_id,
                    cursor,
                },
            )
            .await;
        Ok(())
    }

    /// Apply a content update stamped with the version the client last saw.
    ///
    /// The user must be a member of the page. A stamp older than the page's
    /// version is rejected with the current version and the latest
    /// journaled content, and changes nothing. Otherwise the change is
    /// journaled, the version becomes `client_version + 1` and every member
    /// except `origin` is told. The version only moves once the durable
    /// writes have succeeded.
    ///
    /// Callers are responsible for the editor check; see [`submit_update`](Self::submit_update).
    pub async fn apply_update(
        &self,
        page_id: PageId,
        block_id: Option<BlockId>,
        content: String,
        user_id: UserId,
        client_version: u64,
        origin: Option<ConnectionId>,
    ) -> Result<u64, CollabError> {
        self.authority.require_page(page_id)?;

        let guard = self.locks.acquire(page_id).await;
        if !self.sessions.is_member(page_id, user_id) {
            return Err(CollabError::NotJoined(page_id));
        }
        let latest = self.journal.latest_content(page_id, block_id)?;
        let current_version = self.sessions.version(page_id);
        if client_version < current_version {
            log::warn!(
                "Stale update from {user_id} on page {page_id}: client {client_version}, current {current_version}"
            );
            return Err(CollabError::VersionConflict {
                current_version,
                server_content: latest,
            });
        }
        let version = client_version + 1;

        let change_type = if block_id.is_some() {
            ChangeType::Update
        } else {
            ChangeType::Create
        };
        let entry = self.journal.append(
            JournalEntry::new(page_id, user_id, change_type)
                .with_block(block_id)
                .with_content(latest, Some(content.clone()))
                .with_metadata(JournalMetadata::Update { version }),
        )?;
        self.authority
            .touch_last_edited(page_id, user_id, entry.timestamp)
            .await?;
        if let Err(current_version) = self.sessions.compare_and_advance(page_id, client_version) {
            log::error!("Version of page {page_id} moved to {current_version} outside its lock");
            return Err(CollabError::VersionConflict {
                current_version,
                server_content: Some(content),
            });
        }

        let audience = match origin {
            Some(connection_id) => Audience::Others(connection_id),
            None => Audience::Everyone,
        };
        self.rooms
            .publish(
                page_id,
                audience,
                ServerMessage::PageUpdated {
                    page_id,
                    block_id,
                    content,
                    user_id,
                    version,
                },
            )
            .await;
        drop(guard);

        log::debug!("Page {page_id} advanced to version {version} by {user_id}");
        Ok(version)
    }

    /// [`apply_update`](Self::apply_update) on behalf of a connection, after checking editor access.
    pub async fn submit_update(
        &self,
        connection: &Connection,
        page_id: PageId,
        block_id: Option<BlockId>,
        content: String,
        client_version: u64,
    ) -> Result<u64, CollabError> {
        let user_id = connection.require_user()?;
        self.authority.require_page(page_id)?;
        if !self
            .authority
            .has_permission(page_id, user_id, PermissionLevel::Editor)?
        {
            log::warn!("{user_id} tried to edit page {page_id} without editor access");
            return Err(CollabError::InsufficientPermission {
                page_id,
                required: PermissionLevel::Editor,
            });
        }
        if !connection.has_joined(page_id) {
            return Err(CollabError::NotJoined(page_id));
        }
        self.apply_update(page_id, block_id, content, user_id, client_version, Some(connection.id()))
            .await
    }

    pub async fn add_comment(
        &self,
        connection: &Connection,
        page_id: PageId,
        comment: NewComment,
    ) -> Result<Comment, CollabError> {
        let user_id = connection.require_user()?;
        self.comments.add_comment(page_id, user_id, comment).await
    }

    pub async fn resolve_comment(
        &self,
        connection: &Connection,
        page_id: PageId,
        comment_id: CommentId,
    ) -> Result<Comment, CollabError> {
        let user_id = connection.require_user()?;
        self.comments.resolve_comment(page_id, comment_id, user_id).await
    }

    pub async fn mark_notification_read(
        &self,
        connection: &Connection,
        notification_id: NotificationId,
    ) -> Result<Notification, CollabError> {
        let user_id = connection.require_user()?;
        self.notifications
            .mark_notification_read(user_id, notification_id)
            .await
    }

    pub async fn clear_notifications(&self, connection: &Connection) -> Result<u64, CollabError> {
        let user_id = connection.require_user()?;
        self.notifications.clear_notifications(user_id).await
    }

    /// Tear down a connection: leave every page it joined, then forget it.
    pub async fn disconnect(&self, mut connection: Connection) {
        let Some(user_id) = connection.user_id() else {
            return;
        };
        for page_id in connection.joined_pages() {
            if let Err(e) = self.leave_page(&mut connection, page_id).await {
                log::error!("Failed to leave page {page_id} for {user_id} on disconnect: {e}");
            }
        }
        self.connections.unregister(user_id, connection.id());
        log::info!("Connection {} of {user_id} disconnected", connection.id());
    }

    /// Run one command. The returned message, if any, is the reply for the
    /// sender; everything else reaches clients through rooms and the
    /// connection registry.
    pub async fn handle(
        &self,
        connection: &mut Connection,
        command: Command,
    ) -> Result<Option<ServerMessage>, CollabError> {
        match command {
            Command::JoinPage { page_id } => {
                let snapshot = self.join_page(connection, page_id).await?;
                Ok(Some(ServerMessage::PageJoined { page_id, snapshot }))
            }
            Command::LeavePage { page_id } => {
                self.leave_page(connection, page_id).await?;
                Ok(None)
            }
            Command::CursorUpdate { page_id, cursor } => {
                self.update_cursor(connection, page_id, cursor).await?;
                Ok(None)
            }
            Command::ApplyUpdate {
                page_id,
                block_id,
                content,
                version,
            } => match self
                .submit_update(connection, page_id, block_id, content, version)
                .await
            {
                Ok(version) => Ok(Some(ServerMessage::UpdateAccepted { page_id, version })),
                Err(CollabError::VersionConflict {
                    current_version,
                    server_content,
                }) => Ok(Some(ServerMessage::VersionConflict {
                    page_id,
                    current_version,
                    server_content,
                })),
                Err(e) => Err(e),
            },
            Command::AddComment { page_id, comment } => {
                self.add_comment(connection, page_id, comment).await?;
                Ok(None)
            }
            Command::ResolveComment { page_id, comment_id } => {
                self.resolve_comment(connection, page_id, comment_id).await?;
                Ok(None)
            }
            Command::MarkNotificationRead { notification_id } => {
                self.mark_notification_read(connection, notification_id).await?;
                Ok(None)
            }
            Command::ClearNotifications => {
                self.clear_notifications(connection).await?;
                Ok(None)
            }
        }
    }

    pub fn authority(&self) -> &Arc<PermissionAuthority> {
        &self.authority
    }

    pub fn journal(&self) -> &ChangeJournal {
        &self.journal
    }

    pub fn notifications(&self) -> &Arc<NotificationFanout> {
        &self.notifications
    }

    pub fn comments(&self) -> &CommentService {
        &self.comments
    }

    pub fn sessions(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }
}
