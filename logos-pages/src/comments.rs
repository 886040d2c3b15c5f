//! Block comments, threads and reactions.

use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::broadcast::{Audience, RoomManager};
use crate::error::CollabError;
use crate::model::{
    now_millis, Comment, CommentId, NewComment, NotificationKind, NotificationMetadata, PageId,
    PermissionLevel, Reaction, UserId,
};
use crate::notifications::NotificationFanout;
use crate::permissions::PermissionAuthority;
use crate::protocol::ServerMessage;
use crate::storage::CollabStore;

pub struct CommentService {
    store: Arc<dyn CollabStore>,
    authority: Arc<PermissionAuthority>,
    notifications: Arc<NotificationFanout>,
    rooms: Arc<RoomManager>,
    /// Serializes load-modify-save of existing comments.
    write_lock: Mutex<()>,
}

impl CommentService {
    pub fn new(
        store: Arc<dyn CollabStore>,
        authority: Arc<PermissionAuthority>,
        notifications: Arc<NotificationFanout>,
        rooms: Arc<RoomManager>,
    ) -> Self {
        Self {
            store,
            authority,
            notifications,
            rooms,
            write_lock: Mutex::new(()),
        }
    }

    /// Persist a comment and announce it to everyone in the page, author included.
    ///
    /// Only mentions of users who can view the page are kept. Mentioned users
    /// get a mention notification; other grant holders get a comment
    /// notification.
    pub async fn add_comment(
        &self,
        page_id: PageId,
        author: UserId,
        new: NewComment,
    ) -> Result<Comment, CollabError> {
        let record = self.authority.require_page(page_id)?;
        self.require(page_id, author, PermissionLevel::Commenter)?;
        if !record.allow_comments {
            return Err(CollabError::CommentsDisabled(page_id));
        }
        if let Some(parent_id) = new.parent_id {
            self.load_on_page(page_id, parent_id)?;
        }

        let now = now_millis();
        let mut mentions = Vec::with_capacity(new.mentions.len());
        for user_id in new.mentions {
            if mentions.contains(&user_id) {
                continue;
            }
            if self
                .authority
                .has_permission(page_id, user_id, PermissionLevel::Viewer)?
            {
                mentions.push(user_id);
            } else {
                log::debug!("Dropping mention of {user_id} without access to page {page_id}");
            }
        }
        let comment = Comment {
            id: Uuid::new_v4(),
            page_id,
            block_id: new.block_id,
            user_id: author,
            content: new.content,
            parent_id: new.parent_id,
            mentions,
            reactions: Vec::new(),
            resolved_at: None,
            resolved_by: None,
            is_edited: false,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_comment(&comment)?;
        log::debug!("Comment {} added to page {page_id} by {author}", comment.id);

        self.rooms
            .publish(
                page_id,
                Audience::Everyone,
                ServerMessage::CommentAdded {
                    page_id,
                    comment: comment.clone(),
                },
            )
            .await;

        for mentioned in comment.mentions.iter().filter(|u| **u != author) {
            if let Err(e) = self
                .notifications
                .send_mention_notification(author, *mentioned, page_id, comment.block_id)
                .await
            {
                log::error!("Failed to notify mention of {mentioned} on page {page_id}: {e}");
            }
        }
        let mut already_told = comment.mentions.clone();
        already_told.push(author);
        if let Err(e) = self
            .notifications
            .send_page_notification_excluding(
                page_id,
                NotificationKind::Comment,
                "New comment on a page you can access",
                Some(NotificationMetadata::Comment {
                    comment_id: comment.id,
                    author,
                }),
                &already_told,
            )
            .await
        {
            log::error!("Failed to notify page {page_id} about comment {}: {e}", comment.id);
        }

        Ok(comment)
    }

    /// Mark a comment resolved. Resolving twice keeps the first resolution.
    pub async fn resolve_comment(
        &self,
        page_id: PageId,
        comment_id: CommentId,
        user_id: UserId,
    ) -> Result<Comment, CollabError> {
        self.require(page_id, user_id, PermissionLevel::Commenter)?;
        let comment = {
            let _guard = self.write_lock.lock().await;
            let mut comment = self.load_on_page(page_id, comment_id)?;
            if comment.resolved_at.is_some() {
                return Ok(comment);
            }

            let now = now_millis();
            comment.resolved_at = Some(now);
            comment.resolved_by = Some(user_id);
            comment.updated_at = now;
            self.store.save_comment(&comment)?;
            comment
        };

        self.rooms
            .publish(
                page_id,
                Audience::Everyone,
                ServerMessage::CommentResolved {
                    page_id,
                    comment: comment.clone(),
                },
            )
            .await;
        Ok(comment)
    }

    /// Add the user's reaction of `kind`, or remove it if already present.
    pub async fn toggle_reaction(
        &self,
        page_id: PageId,
        comment_id: CommentId,
        user_id: UserId,
        kind: &str,
    ) -> Result<Comment, CollabError> {
        self.require(page_id, user_id, PermissionLevel::Commenter)?;
        let _guard = self.write_lock.lock().await;
        let mut comment = self.load_on_page(page_id, comment_id)?;

        let existing = comment
            .reactions
            .iter()
            .position(|r| r.user_id == user_id && r.kind == kind);
        match existing {
            Some(idx) => {
                comment.reactions.remove(idx);
            }
            None => comment.reactions.push(Reaction {
                user_id,
                kind: kind.to_string(),
            }),
        }
        comment.updated_at = now_millis();
        self.store.save_comment(&comment)?;
        Ok(comment)
    }

    /// All comments on the page, oldest first.
    pub fn list_comments(&self, page_id: PageId, user_id: UserId) -> Result<Vec<Comment>, CollabError> {
        self.authority.require_page(page_id)?;
        if !self
            .authority
            .has_permission(page_id, user_id, PermissionLevel::Viewer)?
        {
            return Err(CollabError::AccessDenied(page_id));
        }
        Ok(self.store.comments_for_page(page_id)?)
    }

    fn require(&self, page_id: PageId, user_id: UserId, required: PermissionLevel) -> Result<(), CollabError> {
        if self.authority.has_permission(page_id, user_id, required)? {
            Ok(())
        } else {
            Err(CollabError::InsufficientPermission { page_id, required })
        }
    }

    fn load_on_page(&self, page_id: PageId, comment_id: CommentId) -> Result<Comment, CollabError> {
        self.store
            .load_comment(comment_id)?
            .filter(|c| c.page_id == page_id)
            .ok_or(CollabError::CommentNotFound(comment_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::journal::ChangeJournal;
    use crate::storage::MemoryStore;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    struct Fixture {
        store: Arc<MemoryStore>,
        authority: Arc<PermissionAuthority>,
        rooms: Arc<RoomManager>,
        comments: CommentService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let notifications = Arc::new(NotificationFanout::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
        ));
        let authority = Arc::new(PermissionAuthority::new(
            store.clone(),
            ChangeJournal::new(store.clone()),
            notifications.clone(),
        ));
        let rooms = Arc::new(RoomManager::new(16));
        let comments = CommentService::new(store.clone(), authority.clone(), notifications, rooms.clone());
        Fixture {
            store,
            authority,
            rooms,
            comments,
        }
    }

    fn note(content: &str) -> NewComment {
        NewComment {
            block_id: Uuid::new_v4(),
            content: content.to_string(),
            parent_id: None,
            mentions: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_add_comment_broadcasts_to_everyone() {
        let f = fixture();
        let (owner, page) = (Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();

        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        let _sub = f.rooms.get_or_create(page).await.subscribe(conn, owner, tx);

        let comment = f.comments.add_comment(page, owner, note("first")).await.unwrap();
        let received = timeout(Duration::from_millis(200), rx.recv()).await.unwrap();
        assert_eq!(received, Some(ServerMessage::CommentAdded { page_id: page, comment }));
    }

    #[tokio::test]
    async fn test_viewer_cannot_comment() {
        let f = fixture();
        let (owner, viewer, page) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        f.authority
            .grant_permission(page, viewer, PermissionLevel::Viewer, owner)
            .await
            .unwrap();

        assert!(matches!(
            f.comments.add_comment(page, viewer, note("hi")).await,
            Err(CollabError::InsufficientPermission { required: PermissionLevel::Commenter, .. })
        ));
        assert!(f.store.comments_for_page(page).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_comments_disabled() {
        let f = fixture();
        let (owner, page) = (Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        f.authority.set_allow_comments(page, false, owner).await.unwrap();

        assert!(matches!(
            f.comments.add_comment(page, owner, note("hi")).await,
            Err(CollabError::CommentsDisabled(_))
        ));
    }

    #[tokio::test]
    async fn test_reply_parent_must_be_on_same_page() {
        let f = fixture();
        let owner = Uuid::new_v4();
        let (p1, p2) = (Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(p1, owner).await.unwrap();
        f.authority.create_page(p2, owner).await.unwrap();
        let root = f.comments.add_comment(p1, owner, note("root")).await.unwrap();

        let mut reply = note("reply");
        reply.parent_id = Some(root.id);
        assert!(f.comments.add_comment(p1, owner, reply.clone()).await.is_ok());
        assert!(matches!(
            f.comments.add_comment(p2, owner, reply).await,
            Err(CollabError::CommentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mentions_and_page_notifications() {
        let f = fixture();
        let (owner, editor, viewer, outsider, page) =
            (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        for (user, level) in [(editor, PermissionLevel::Editor), (viewer, PermissionLevel::Viewer)] {
            f.authority.grant_permission(page, user, level, owner).await.unwrap();
        }
        let before = |user| f.store.notifications_for_user(user).unwrap().len();
        let (editor_before, viewer_before) = (before(editor), before(viewer));

        let mut new = note("ping @viewer @outsider @me");
        new.mentions = vec![viewer, outsider, owner, viewer];
        let comment = f.comments.add_comment(page, owner, new).await.unwrap();
        assert_eq!(comment.mentions, vec![viewer, owner]);

        // No access, no mention.
        assert!(f.store.notifications_for_user(outsider).unwrap().is_empty());

        // The author is never notified about their own comment.
        assert!(f.store.notifications_for_user(owner).unwrap().is_empty());

        // A mentioned grant holder hears about the comment once.
        let viewer_notes = f.store.notifications_for_user(viewer).unwrap();
        assert_eq!(viewer_notes.len(), viewer_before + 1);
        assert_eq!(viewer_notes[0].kind, NotificationKind::Mention);

        let editor_notes = f.store.notifications_for_user(editor).unwrap();
        assert_eq!(editor_notes.len(), editor_before + 1);
        assert_eq!(editor_notes[0].kind, NotificationKind::Comment);
    }

    #[tokio::test]
    async fn test_concurrent_reactions_are_all_kept() {
        let f = Arc::new(fixture());
        let (owner, page) = (Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        let comment = f.comments.add_comment(page, owner, note("vote")).await.unwrap();

        let tasks: Vec<_> = (0..12)
            .map(|i| {
                let f = f.clone();
                tokio::spawn(async move {
                    f.comments
                        .toggle_reaction(page, comment.id, owner, &format!("r{i}"))
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = f.store.load_comment(comment.id).unwrap().unwrap();
        assert_eq!(stored.reactions.len(), 12);
    }

    #[tokio::test]
    async fn test_resolve_and_react() {
        let f = fixture();
        let (owner, page) = (Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        let comment = f.comments.add_comment(page, owner, note("fix this")).await.unwrap();

        let resolved = f.comments.resolve_comment(page, comment.id, owner).await.unwrap();
        assert_eq!(resolved.resolved_by, Some(owner));
        assert!(resolved.resolved_at.is_some());

        let reacted = f.comments.toggle_reaction(page, comment.id, owner, "+1").await.unwrap();
        assert_eq!(reacted.reactions.len(), 1);
        let cleared = f.comments.toggle_reaction(page, comment.id, owner, "+1").await.unwrap();
        assert!(cleared.reactions.is_empty());

        assert!(matches!(
            f.comments.resolve_comment(page, Uuid::new_v4(), owner).await,
            Err(CollabError::CommentNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_comments_requires_viewer() {
        let f = fixture();
        let (owner, stranger, page) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        f.authority.create_page(page, owner).await.unwrap();
        f.comments.add_comment(page, owner, note("a")).await.unwrap();
        f.comments.add_comment(page, owner, note("b")).await.unwrap();

        let listed = f.comments.list_comments(page, owner).unwrap();
        let contents: Vec<_> = listed.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b"]);

        assert!(matches!(
            f.comments.list_comments(page, stranger),
            Err(CollabError::AccessDenied(_))
        ));
    }
}
