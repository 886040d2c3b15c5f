//! Notification fan-out.
//!
//! Every notification is persisted first, then pushed to each live
//! connection of its recipient. A recipient with no connections finds it
//! on the next fetch. Read/clear changes are echoed only to the acting
//! user's own connections.

use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::connection::ConnectionRegistry;
use crate::error::CollabError;
use crate::model::{
    now_millis, BlockId, Notification, NotificationId, NotificationKind, NotificationMetadata,
    PageId, UserId,
};
use crate::protocol::ServerMessage;
use crate::storage::CollabStore;

pub struct NotificationFanout {
    store: Arc<dyn CollabStore>,
    connections: Arc<ConnectionRegistry>,
}

impl NotificationFanout {
    pub fn new(store: Arc<dyn CollabStore>, connections: Arc<ConnectionRegistry>) -> Self {
        Self { store, connections }
    }

    /// Persist a notification for `user_id` and push it to their live connections.
    pub async fn send_notification(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        page_id: PageId,
        message: impl Into<String>,
        metadata: Option<NotificationMetadata>,
    ) -> Result<Notification, CollabError> {
        let notification = Notification {
            id: Uuid::new_v4(),
            kind,
            user_id,
            page_id,
            message: message.into(),
            metadata,
            read: false,
            created_at: now_millis(),
        };
        self.store.insert_notification(&notification)?;

        let delivered = self
            .connections
            .deliver(user_id, &ServerMessage::Notification(notification.clone()));
        log::debug!(
            "Notification {} for {user_id} delivered to {delivered} connection(s)",
            notification.id
        );
        Ok(notification)
    }

    /// Notify every explicit grant holder of the page, except `exclude`.
    ///
    /// Public visibility does not widen the audience.
    pub async fn send_page_notification(
        &self,
        page_id: PageId,
        kind: NotificationKind,
        message: &str,
        metadata: Option<NotificationMetadata>,
        exclude: Option<UserId>,
    ) -> Result<Vec<Notification>, CollabError> {
        self.send_page_notification_excluding(page_id, kind, message, metadata, exclude.as_slice())
            .await
    }

    /// [`send_page_notification`](Self::send_page_notification) skipping every user in `exclude`.
    pub async fn send_page_notification_excluding(
        &self,
        page_id: PageId,
        kind: NotificationKind,
        message: &str,
        metadata: Option<NotificationMetadata>,
        exclude: &[UserId],
    ) -> Result<Vec<Notification>, CollabError> {
        let record = self
            .store
            .load_sharing(page_id)?
            .ok_or(CollabError::PageNotFound(page_id))?;

        let mut sent = Vec::new();
        for grant in record.grants.iter().filter(|g| !exclude.contains(&g.user_id)) {
            let notification = self
                .send_notification(grant.user_id, kind.clone(), page_id, message, metadata.clone())
                .await?;
            sent.push(notification);
        }
        Ok(sent)
    }

    pub async fn send_mention_notification(
        &self,
        mentioned_by: UserId,
        mentioned_user: UserId,
        page_id: PageId,
        block_id: BlockId,
    ) -> Result<Notification, CollabError> {
        self.send_notification(
            mentioned_user,
            NotificationKind::Mention,
            page_id,
            "You were mentioned in a comment",
            Some(NotificationMetadata::Mention {
                mentioned_by,
                block_id,
            }),
        )
        .await
    }

    /// Mark one of the user's notifications read and echo it to their connections.
    pub async fn mark_notification_read(
        &self,
        user_id: UserId,
        notification_id: NotificationId,
    ) -> Result<Notification, CollabError> {
        let mut notification = self
            .store
            .notifications_for_user(user_id)?
            .into_iter()
            .find(|n| n.id == notification_id)
            .ok_or(CollabError::NotificationNotFound(notification_id))?;

        notification.read = true;
        self.store.save_notification(&notification)?;

        self.connections.deliver(
            user_id,
            &ServerMessage::NotificationUpdated {
                id: notification_id,
                read: true,
            },
        );
        Ok(notification)
    }

    /// Delete all of the user's notifications and echo the clear to their connections.
    pub async fn clear_notifications(&self, user_id: UserId) -> Result<u64, CollabError> {
        let removed = self.store.delete_notifications_for_user(user_id)?;
        self.connections.deliver(user_id, &ServerMessage::NotificationsCleared);
        log::debug!("Cleared {removed} notification(s) for {user_id}");
        Ok(removed)
    }

    /// The user's notifications, newest first.
    pub fn list_notifications(&self, user_id: UserId, unread_only: bool) -> Result<Vec<Notification>, CollabError> {
        let mut notifications = self.store.notifications_for_user(user_id)?;
        if unread_only {
            notifications.retain(|n| !n.read);
        }
        Ok(notifications)
    }
}

/// Free-form metadata from string pairs.
pub fn custom_metadata<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> NotificationMetadata
where
    K: Into<String>,
    V: Into<String>,
{
    NotificationMetadata::Custom(
        pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect::<BTreeMap<_, _>>(),
    )
}
