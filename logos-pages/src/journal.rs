//! Append-only change journal.
//!
//! Entries are never updated or deleted; a correction is a new entry.
//! All reads return newest first.

use std::sync::Arc;

use crate::error::CollabError;
use crate::model::{BlockId, JournalEntry, PageId, UserId};
use crate::storage::{CollabStore, JournalFilter, JournalQuery, JournalScope};

#[derive(Clone)]
pub struct ChangeJournal {
    store: Arc<dyn CollabStore>,
}

impl ChangeJournal {
    pub fn new(store: Arc<dyn CollabStore>) -> Self {
        Self { store }
    }

    pub fn append(&self, entry: JournalEntry) -> Result<JournalEntry, CollabError> {
        let stored = self.store.append_journal(entry)?;
        log::debug!(
            "Journal #{} {:?} on page {} by {}",
            stored.sequence,
            stored.change_type,
            stored.page_id,
            stored.user_id
        );
        Ok(stored)
    }

    pub fn find_by_page(&self, page_id: PageId, query: JournalQuery) -> Result<Vec<JournalEntry>, CollabError> {
        self.find(JournalScope::Page(page_id), query)
    }

    /// Block history. Only `limit` and `skip` of `query` apply.
    pub fn find_by_block(
        &self,
        page_id: PageId,
        block_id: BlockId,
        query: JournalQuery,
    ) -> Result<Vec<JournalEntry>, CollabError> {
        let query = JournalQuery {
            start: None,
            end: None,
            ..query
        };
        self.find(JournalScope::Block(page_id, block_id), query)
    }

    pub fn find_by_user(&self, user_id: UserId, query: JournalQuery) -> Result<Vec<JournalEntry>, CollabError> {
        self.find(JournalScope::User(user_id), query)
    }

    /// Newest journaled content for the block, or for the whole page when `block_id` is `None`.
    pub fn latest_content(
        &self,
        page_id: PageId,
        block_id: Option<BlockId>,
    ) -> Result<Option<String>, CollabError> {
        Ok(self.store.latest_content(page_id, block_id)?)
    }

    fn find(&self, scope: JournalScope, query: JournalQuery) -> Result<Vec<JournalEntry>, CollabError> {
        Ok(self.store.journal_entries(&JournalFilter { scope, query })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChangeType, JournalMetadata, PermissionLevel};
    use crate::storage::MemoryStore;
    use uuid::Uuid;

    fn journal() -> ChangeJournal {
        ChangeJournal::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_find_by_page_newest_first_with_paging() {
        let journal = journal();
        let page = Uuid::new_v4();
        let user = Uuid::new_v4();
        for i in 0..5 {
            journal
                .append(
                    JournalEntry::new(page, user, ChangeType::Update)
                        .with_content(None, Some(format!("v{i}"))),
                )
                .unwrap();
        }

        let page_2 = journal
            .find_by_page(page, JournalQuery { limit: 2, skip: 2, ..JournalQuery::default() })
            .unwrap();
        let contents: Vec<_> = page_2.iter().filter_map(|e| e.new_content.clone()).collect();
        assert_eq!(contents, vec!["v2".to_string(), "v1".to_string()]);
    }

    #[test]
    fn test_find_by_user_spans_pages() {
        let journal = journal();
        let user = Uuid::new_v4();
        journal.append(JournalEntry::new(Uuid::new_v4(), user, ChangeType::Create)).unwrap();
        journal.append(JournalEntry::new(Uuid::new_v4(), user, ChangeType::Create)).unwrap();
        journal
            .append(JournalEntry::new(Uuid::new_v4(), Uuid::new_v4(), ChangeType::Create))
            .unwrap();

        assert_eq!(journal.find_by_user(user, JournalQuery::default()).unwrap().len(), 2);
    }

    #[test]
    fn test_latest_content_ignores_other_scopes() {
        let journal = journal();
        let page = Uuid::new_v4();
        let block = Uuid::new_v4();
        let user = Uuid::new_v4();

        journal
            .append(JournalEntry::new(page, user, ChangeType::Create).with_content(None, Some("page".into())))
            .unwrap();
        journal
            .append(
                JournalEntry::new(page, user, ChangeType::Update)
                    .with_block(Some(block))
                    .with_content(None, Some("block".into())),
            )
            .unwrap();
        journal
            .append(JournalEntry::new(page, user, ChangeType::Permission).with_metadata(
                JournalMetadata::Permission {
                    user_id: user,
                    old_level: None,
                    new_level: Some(PermissionLevel::Viewer),
                },
            ))
            .unwrap();

        assert_eq!(journal.latest_content(page, None).unwrap().as_deref(), Some("page"));
        assert_eq!(journal.latest_content(page, Some(block)).unwrap().as_deref(), Some("block"));
        assert_eq!(journal.latest_content(page, Some(Uuid::new_v4())).unwrap(), None);
    }
}
