//! In-process store. Used by tests and by servers started without a
//! storage path.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{CollabStore, JournalFilter, StoreError};
use crate::model::{
    BlockId, Comment, CommentId, JournalEntry, Notification, PageId, PageSharingRecord, UserId,
};

#[derive(Default)]
struct Tables {
    sharing: HashMap<PageId, PageSharingRecord>,
    journal: Vec<JournalEntry>,
    /// Insertion order doubles as creation order.
    comments: Vec<Comment>,
    notifications: Vec<Notification>,
}

/// `CollabStore` backed by hash maps behind one lock.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> R {
        let guard = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tables) -> R) -> R {
        let mut guard = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl CollabStore for MemoryStore {
    fn insert_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError> {
        self.write(|t| {
            if t.sharing.contains_key(&record.page_id) {
                return Err(StoreError::AlreadyExists(record.page_id));
            }
            t.sharing.insert(record.page_id, record.clone());
            Ok(())
        })
    }

    fn load_sharing(&self, page_id: PageId) -> Result<Option<PageSharingRecord>, StoreError> {
        Ok(self.read(|t| t.sharing.get(&page_id).cloned()))
    }

    fn save_sharing(&self, record: &PageSharingRecord) -> Result<(), StoreError> {
        self.write(|t| t.sharing.insert(record.page_id, record.clone()));
        Ok(())
    }

    fn list_sharing(&self) -> Result<Vec<PageId>, StoreError> {
        Ok(self.read(|t| t.sharing.keys().copied().collect()))
    }

    fn append_journal(&self, mut entry: JournalEntry) -> Result<JournalEntry, StoreError> {
        self.write(|t| {
            entry.sequence = t.journal.len() as u64;
            t.journal.push(entry.clone());
        });
        Ok(entry)
    }

    fn journal_entries(&self, filter: &JournalFilter) -> Result<Vec<JournalEntry>, StoreError> {
        let matching = self.read(|t| {
            t.journal
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        });
        Ok(filter.paginate(matching))
    }

    fn latest_content(&self, page_id: PageId, block_id: Option<BlockId>) -> Result<Option<String>, StoreError> {
        Ok(self.read(|t| {
            t.journal
                .iter()
                .rev()
                .filter(|e| e.page_id == page_id && e.block_id == block_id)
                .find_map(|e| e.new_content.clone())
        }))
    }

    fn insert_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.write(|t| {
            if t.comments.iter().any(|c| c.id == comment.id) {
                return Err(StoreError::AlreadyExists(comment.id));
            }
            t.comments.push(comment.clone());
            Ok(())
        })
    }

    fn load_comment(&self, comment_id: CommentId) -> Result<Option<Comment>, StoreError> {
        Ok(self.read(|t| t.comments.iter().find(|c| c.id == comment_id).cloned()))
    }

    fn save_comment(&self, comment: &Comment) -> Result<(), StoreError> {
        self.write(|t| match t.comments.iter_mut().find(|c| c.id == comment.id) {
            Some(existing) => *existing = comment.clone(),
            None => t.comments.push(comment.clone()),
        });
        Ok(())
    }

    fn comments_for_page(&self, page_id: PageId) -> Result<Vec<Comment>, StoreError> {
        Ok(self.read(|t| {
            t.comments
                .iter()
                .filter(|c| c.page_id == page_id)
                .cloned()
                .collect()
        }))
    }

    fn insert_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.write(|t| t.notifications.push(notification.clone()));
        Ok(())
    }

    fn notifications_for_user(&self, user_id: UserId) -> Result<Vec<Notification>, StoreError> {
        Ok(self.read(|t| {
            t.notifications
                .iter()
                .rev()
                .filter(|n| n.user_id == user_id)
                .cloned()
                .collect()
        }))
    }

    fn save_notification(&self, notification: &Notification) -> Result<(), StoreError> {
        self.write(|t| {
            match t.notifications.iter_mut().find(|n| n.id == notification.id) {
                Some(existing) => {
                    *existing = notification.clone();
                    Ok(())
                }
                None => Err(StoreError::NotFound(notification.id)),
            }
        })
    }

    fn delete_notifications_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        Ok(self.write(|t| {
            let before = t.notifications.len();
            t.notifications.retain(|n| n.user_id != user_id);
            (before - t.notifications.len()) as u64
        }))
    }
}
