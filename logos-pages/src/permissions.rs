//! Page access control.
//!
//! Checks are pure reads of the stored [`PageSharingRecord`]. Every
//! mutation re-reads the record and re-checks that the actor is an admin
//! at call time, so a revoked admin loses authority on their next call.
//! Mutations of one authority are serialized so that concurrent grants
//! never overwrite each other's read-modify-write.

use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::CollabError;
use crate::journal::ChangeJournal;
use crate::model::{
    now_millis, AccessGrant, ChangeType, JournalEntry, JournalMetadata, NotificationKind,
    NotificationMetadata, PageId, PageSharingRecord, PermissionLevel, UserId,
};
use crate::notifications::NotificationFanout;
use crate::storage::{CollabStore, StoreError};

pub struct PermissionAuthority {
    store: Arc<dyn CollabStore>,
    journal: ChangeJournal,
    notifications: Arc<NotificationFanout>,
    write_lock: Mutex<()>,
}

impl PermissionAuthority {
    pub fn new(
        store: Arc<dyn CollabStore>,
        journal: ChangeJournal,
        notifications: Arc<NotificationFanout>,
    ) -> Self {
        Self {
            store,
            journal,
            notifications,
            write_lock: Mutex::new(()),
        }
    }

    pub fn load(&self, page_id: PageId) -> Result<Option<PageSharingRecord>, CollabError> {
        Ok(self.store.load_sharing(page_id)?)
    }

    /// Like [`load`](Self::load) but a missing record is `PageNotFound`.
    pub fn require_page(&self, page_id: PageId) -> Result<PageSharingRecord, CollabError> {
        self.load(page_id)?.ok_or(CollabError::PageNotFound(page_id))
    }

    /// Whether `user_id` holds at least `required` on the page.
    ///
    /// Public pages grant viewer to everyone; anything above that needs an
    /// explicit grant. A page without a sharing record grants nothing.
    pub fn has_permission(
        &self,
        page_id: PageId,
        user_id: UserId,
        required: PermissionLevel,
    ) -> Result<bool, CollabError> {
        let Some(record) = self.load(page_id)? else {
            return Ok(false);
        };
        if record.is_public && required == PermissionLevel::Viewer {
            return Ok(true);
        }
        Ok(record
            .grant_for(user_id)
            .is_some_and(|g| g.level.satisfies(required)))
    }

    pub fn effective_level(&self, page_id: PageId, user_id: UserId) -> Result<Option<PermissionLevel>, CollabError> {
        Ok(self.load(page_id)?.and_then(|r| r.effective_level(user_id)))
    }

    pub fn list_page_users(&self, page_id: PageId) -> Result<Vec<AccessGrant>, CollabError> {
        Ok(self.require_page(page_id)?.grants)
    }

    /// Create the sharing record for a new page, owned by `owner` as admin.
    pub async fn create_page(&self, page_id: PageId, owner: UserId) -> Result<PageSharingRecord, CollabError> {
        let _guard = self.write_lock.lock().await;
        let record = PageSharingRecord::new(page_id, owner);
        self.store.insert_sharing(&record).map_err(|e| match e {
            StoreError::AlreadyExists(id) => CollabError::PageExists(id),
            other => CollabError::Store(other),
        })?;
        self.journal.append(JournalEntry::new(page_id, owner, ChangeType::Create))?;
        log::info!("Page {page_id} shared by owner {owner}");
        Ok(record)
    }

    /// Give `user_id` exactly `level` on the page, replacing any previous grant.
    pub async fn grant_permission(
        &self,
        page_id: PageId,
        user_id: UserId,
        level: PermissionLevel,
        granted_by: UserId,
    ) -> Result<AccessGrant, CollabError> {
        let grant = {
            let _guard = self.write_lock.lock().await;
            let mut record = self.load_as_admin(page_id, granted_by)?;

            record.remove_grant(user_id);
            let now = now_millis();
            let grant = AccessGrant {
                page_id,
                user_id,
                level,
                granted_by,
                granted_at: now,
                last_modified: now,
            };
            record.grants.push(grant.clone());
            self.store.save_sharing(&record)?;

            self.journal_permission(page_id, granted_by, user_id, None, Some(level))?;
            grant
        };

        log::info!("{granted_by} granted {level} on page {page_id} to {user_id}");
        self.notify(user_id, NotificationKind::PermissionGranted, page_id, Some(level), granted_by, format!("You were given {level} access"))
            .await;
        Ok(grant)
    }

    /// Remove the user's grant. Returns `false` (and journals nothing) if there was none.
    pub async fn revoke_permission(
        &self,
        page_id: PageId,
        user_id: UserId,
        revoked_by: UserId,
    ) -> Result<bool, CollabError> {
        {
            let _guard = self.write_lock.lock().await;
            let mut record = self.load_as_admin(page_id, revoked_by)?;

            let Some(previous) = record.remove_grant(user_id) else {
                return Ok(false);
            };
            self.store.save_sharing(&record)?;
            self.journal_permission(page_id, revoked_by, user_id, Some(previous.level), None)?;
        }

        log::info!("{revoked_by} revoked access on page {page_id} from {user_id}");
        self.notify(user_id, NotificationKind::PermissionRevoked, page_id, None, revoked_by, "Your access was removed".to_string())
            .await;
        Ok(true)
    }

    /// Change an existing grant's level in place. `None` if the user has no grant.
    pub async fn update_permission(
        &self,
        page_id: PageId,
        user_id: UserId,
        new_level: PermissionLevel,
        updated_by: UserId,
    ) -> Result<Option<AccessGrant>, CollabError> {
        let grant = {
            let _guard = self.write_lock.lock().await;
            let mut record = self.load_as_admin(page_id, updated_by)?;

            let Some(grant) = record.grant_for_mut(user_id) else {
                return Ok(None);
            };
            let old_level = grant.level;
            grant.level = new_level;
            grant.last_modified = now_millis();
            let updated = grant.clone();

            self.store.save_sharing(&record)?;
            self.journal_permission(page_id, updated_by, user_id, Some(old_level), Some(new_level))?;
            updated
        };

        self.notify(user_id, NotificationKind::PermissionChanged, page_id, Some(new_level), updated_by, format!("Your access changed to {new_level}"))
            .await;
        Ok(Some(grant))
    }

    pub async fn set_page_visibility(
        &self,
        page_id: PageId,
        is_public: bool,
        updated_by: UserId,
    ) -> Result<PageSharingRecord, CollabError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_as_admin(page_id, updated_by)?;
        record.is_public = is_public;
        self.store.save_sharing(&record)?;
        self.journal.append(
            JournalEntry::new(page_id, updated_by, ChangeType::Permission)
                .with_metadata(JournalMetadata::Visibility { is_public }),
        )?;
        log::info!("Page {page_id} visibility set to public={is_public} by {updated_by}");
        Ok(record)
    }

    pub async fn set_allow_comments(
        &self,
        page_id: PageId,
        allow: bool,
        updated_by: UserId,
    ) -> Result<PageSharingRecord, CollabError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_as_admin(page_id, updated_by)?;
        record.allow_comments = allow;
        self.store.save_sharing(&record)?;
        Ok(record)
    }

    /// Store a fresh public link token for the page and return it.
    pub async fn generate_public_link(&self, page_id: PageId, updated_by: UserId) -> Result<String, CollabError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_as_admin(page_id, updated_by)?;
        let link = Uuid::new_v4().simple().to_string();
        record.public_link = Some(link.clone());
        self.store.save_sharing(&record)?;
        Ok(link)
    }

    pub async fn revoke_public_link(&self, page_id: PageId, updated_by: UserId) -> Result<bool, CollabError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load_as_admin(page_id, updated_by)?;
        let had_link = record.public_link.take().is_some();
        self.store.save_sharing(&record)?;
        Ok(had_link)
    }

    /// Record who last edited the page.
    pub async fn touch_last_edited(&self, page_id: PageId, user_id: UserId, at: u64) -> Result<(), CollabError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.require_page(page_id)?;
        record.last_edited_by = Some(user_id);
        record.last_edited_at = Some(at);
        self.store.save_sharing(&record)?;
        Ok(())
    }

    fn load_as_admin(&self, page_id: PageId, actor: UserId) -> Result<PageSharingRecord, CollabError> {
        let insufficient = CollabError::InsufficientPermission {
            page_id,
            required: PermissionLevel::Admin,
        };
        let Some(record) = self.load(page_id)? else {
            return Err(insufficient);
        };
        match record.grant_for(actor) {
            Some(grant) if grant.level.satisfies(PermissionLevel::Admin) => Ok(record),
            _ => {
                log::warn!("{actor} attempted an admin change on page {page_id} without admin");
                Err(insufficient)
            }
        }
    }

    fn journal_permission(
        &self,
        page_id: PageId,
        actor: UserId,
        user_id: UserId,
        old_level: Option<PermissionLevel>,
        new_level: Option<PermissionLevel>,
    ) -> Result<(), CollabError> {
        self.journal.append(
            JournalEntry::new(page_id, actor, ChangeType::Permission).with_metadata(
                JournalMetadata::Permission {
                    user_id,
                    old_level,
                    new_level,
                },
            ),
        )?;
        Ok(())
    }

    async fn notify(
        &self,
        user_id: UserId,
        kind: NotificationKind,
        page_id: PageId,
        level: Option<PermissionLevel>,
        changed_by: UserId,
        message: String,
    ) {
        let metadata = NotificationMetadata::Permission { level, changed_by };
        if let Err(e) = self
            .notifications
            .send_notification(user_id, kind, page_id, message, Some(metadata))
            .await
        {
            log::error!("Failed to notify {user_id} about access change on page {page_id}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionRegistry;
    use crate::storage::{JournalQuery, MemoryStore};

    struct Fixture {
        store: Arc<MemoryStore>,
        journal: ChangeJournal,
        authority: PermissionAuthority,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let journal = ChangeJournal::new(store.clone());
        let notifications = Arc::new(NotificationFanout::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
        ));
        let authority = PermissionAuthority::new(store.clone(), journal.clone(), notifications);
        Fixture { store, journal, authority }
    }

    fn permission_entries(f: &Fixture, page: PageId) -> usize {
        f.journal
            .find_by_page(page, JournalQuery::latest(100))
            .unwrap()
            .iter()
            .filter(|e| e.change_type == ChangeType::Permission)
            .count()
    }

    #[tokio::test]
    async fn test_private_page_with_editor_grant() {
        let f = fixture();
        let (admin, u1, u2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();
        f.authority
            .grant_permission(page, u1, PermissionLevel::Editor, admin)
            .await
            .unwrap();

        assert!(f.authority.has_permission(page, u1, PermissionLevel::Viewer).unwrap());
        assert!(f.authority.has_permission(page, u1, PermissionLevel::Editor).unwrap());
        assert!(!f.authority.has_permission(page, u1, PermissionLevel::Admin).unwrap());
        assert!(!f.authority.has_permission(page, u2, PermissionLevel::Viewer).unwrap());
    }

    #[tokio::test]
    async fn test_levels_are_monotone() {
        let f = fixture();
        let admin = Uuid::new_v4();
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();

        for held in PermissionLevel::ALL {
            let user = Uuid::new_v4();
            f.authority.grant_permission(page, user, held, admin).await.unwrap();
            for high in PermissionLevel::ALL {
                if !f.authority.has_permission(page, user, high).unwrap() {
                    continue;
                }
                for low in PermissionLevel::ALL.iter().filter(|l| l.ordinal() <= high.ordinal()) {
                    assert!(f.authority.has_permission(page, user, *low).unwrap());
                }
            }
        }
    }

    #[tokio::test]
    async fn test_public_page_floor() {
        let f = fixture();
        let admin = Uuid::new_v4();
        let page = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();
        assert!(!f.authority.has_permission(page, stranger, PermissionLevel::Viewer).unwrap());

        f.authority.set_page_visibility(page, true, admin).await.unwrap();
        assert!(f.authority.has_permission(page, stranger, PermissionLevel::Viewer).unwrap());
        assert!(!f.authority.has_permission(page, stranger, PermissionLevel::Commenter).unwrap());
    }

    #[tokio::test]
    async fn test_admin_grants_commenter() {
        let f = fixture();
        let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, u1).await.unwrap();

        let grant = f
            .authority
            .grant_permission(page, u2, PermissionLevel::Commenter, u1)
            .await
            .unwrap();
        assert_eq!(grant.granted_by, u1);
        assert!(f.authority.has_permission(page, u2, PermissionLevel::Commenter).unwrap());
        assert!(!f.authority.has_permission(page, u2, PermissionLevel::Editor).unwrap());

        // The grantee was told.
        let notes = f.store.notifications_for_user(u2).unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, NotificationKind::PermissionGranted);
    }

    #[tokio::test]
    async fn test_grant_replaces_existing() {
        let f = fixture();
        let (admin, user) = (Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();

        f.authority.grant_permission(page, user, PermissionLevel::Viewer, admin).await.unwrap();
        f.authority.grant_permission(page, user, PermissionLevel::Editor, admin).await.unwrap();

        let grants: Vec<_> = f
            .authority
            .list_page_users(page)
            .unwrap()
            .into_iter()
            .filter(|g| g.user_id == user)
            .collect();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].level, PermissionLevel::Editor);

        let latest = &f.journal.find_by_page(page, JournalQuery::latest(1)).unwrap()[0];
        assert_eq!(
            latest.metadata,
            Some(JournalMetadata::Permission {
                user_id: user,
                old_level: None,
                new_level: Some(PermissionLevel::Editor),
            })
        );
    }

    #[tokio::test]
    async fn test_stalled_recipient_does_not_block_admin() {
        let store = Arc::new(MemoryStore::new());
        let connections = Arc::new(ConnectionRegistry::new());
        let notifications = Arc::new(NotificationFanout::new(store.clone(), connections.clone()));
        let authority = PermissionAuthority::new(store.clone(), ChangeJournal::new(store), notifications);
        let (admin, user, page) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        authority.create_page(page, admin).await.unwrap();

        // Never drained.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        connections.register(user, Uuid::new_v4(), tx);

        let steps = async {
            authority.grant_permission(page, user, PermissionLevel::Viewer, admin).await?;
            authority.update_permission(page, user, PermissionLevel::Editor, admin).await?;
            authority.revoke_permission(page, user, admin).await
        };
        let revoked = tokio::time::timeout(std::time::Duration::from_secs(2), steps)
            .await
            .expect("admin blocked by a stalled recipient")
            .unwrap();
        assert!(revoked);
        assert_eq!(authority.effective_level(page, user).unwrap(), None);
    }

    #[tokio::test]
    async fn test_non_admin_cannot_mutate() {
        let f = fixture();
        let (admin, editor, target) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();
        f.authority.grant_permission(page, editor, PermissionLevel::Editor, admin).await.unwrap();
        let before = permission_entries(&f, page);

        let err = f
            .authority
            .grant_permission(page, target, PermissionLevel::Viewer, editor)
            .await
            .unwrap_err();
        assert!(matches!(err, CollabError::InsufficientPermission { .. }));
        assert!(matches!(
            f.authority.revoke_permission(page, admin, editor).await,
            Err(CollabError::InsufficientPermission { .. })
        ));
        assert!(matches!(
            f.authority.set_page_visibility(page, true, editor).await,
            Err(CollabError::InsufficientPermission { .. })
        ));

        assert_eq!(permission_entries(&f, page), before);
        assert!(!f.authority.has_permission(page, target, PermissionLevel::Viewer).unwrap());
    }

    #[tokio::test]
    async fn test_revoked_admin_loses_authority_immediately() {
        let f = fixture();
        let (owner, deputy, target) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, owner).await.unwrap();
        f.authority.grant_permission(page, deputy, PermissionLevel::Admin, owner).await.unwrap();
        f.authority.grant_permission(page, target, PermissionLevel::Viewer, deputy).await.unwrap();

        f.authority.revoke_permission(page, deputy, owner).await.unwrap();
        assert!(f
            .authority
            .grant_permission(page, target, PermissionLevel::Editor, deputy)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_revoke_missing_grant_is_quiet() {
        let f = fixture();
        let admin = Uuid::new_v4();
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();
        let before = permission_entries(&f, page);

        assert!(!f.authority.revoke_permission(page, Uuid::new_v4(), admin).await.unwrap());
        assert_eq!(permission_entries(&f, page), before);
    }

    #[tokio::test]
    async fn test_revoke_journals_old_level() {
        let f = fixture();
        let (admin, user) = (Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();
        f.authority.grant_permission(page, user, PermissionLevel::Commenter, admin).await.unwrap();

        assert!(f.authority.revoke_permission(page, user, admin).await.unwrap());
        assert!(!f.authority.has_permission(page, user, PermissionLevel::Viewer).unwrap());
        let latest = &f.journal.find_by_page(page, JournalQuery::latest(1)).unwrap()[0];
        assert_eq!(
            latest.metadata,
            Some(JournalMetadata::Permission {
                user_id: user,
                old_level: Some(PermissionLevel::Commenter),
                new_level: None,
            })
        );
    }

    #[tokio::test]
    async fn test_update_permission() {
        let f = fixture();
        let (admin, user) = (Uuid::new_v4(), Uuid::new_v4());
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();

        assert!(f
            .authority
            .update_permission(page, user, PermissionLevel::Editor, admin)
            .await
            .unwrap()
            .is_none());

        f.authority.grant_permission(page, user, PermissionLevel::Viewer, admin).await.unwrap();
        let updated = f
            .authority
            .update_permission(page, user, PermissionLevel::Editor, admin)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.level, PermissionLevel::Editor);
        assert_eq!(
            f.authority.effective_level(page, user).unwrap(),
            Some(PermissionLevel::Editor)
        );
    }

    #[tokio::test]
    async fn test_create_page_twice() {
        let f = fixture();
        let page = Uuid::new_v4();
        f.authority.create_page(page, Uuid::new_v4()).await.unwrap();
        assert!(matches!(
            f.authority.create_page(page, Uuid::new_v4()).await,
            Err(CollabError::PageExists(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_page() {
        let f = fixture();
        let page = Uuid::new_v4();
        let user = Uuid::new_v4();
        assert!(!f.authority.has_permission(page, user, PermissionLevel::Viewer).unwrap());
        assert!(matches!(f.authority.list_page_users(page), Err(CollabError::PageNotFound(_))));
        assert!(matches!(
            f.authority.grant_permission(page, user, PermissionLevel::Viewer, user).await,
            Err(CollabError::InsufficientPermission { .. })
        ));
    }

    #[tokio::test]
    async fn test_public_link_and_comment_toggle() {
        let f = fixture();
        let admin = Uuid::new_v4();
        let page = Uuid::new_v4();
        f.authority.create_page(page, admin).await.unwrap();

        let link = f.authority.generate_public_link(page, admin).await.unwrap();
        assert_eq!(f.authority.require_page(page).unwrap().public_link, Some(link));
        assert!(f.authority.revoke_public_link(page, admin).await.unwrap());
        assert!(!f.authority.revoke_public_link(page, admin).await.unwrap());

        let record = f.authority.set_allow_comments(page, false, admin).await.unwrap();
        assert!(!record.allow_comments);
    }
}
