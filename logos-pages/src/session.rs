//! Ephemeral per-page session state: who is in a page, where their
//! cursors are, and the page's optimistic-concurrency version.
//!
//! ```text
//! PageId ──► PageSession
//!              ├── members:  [UserId]            (join order)
//!              ├── cursors:  UserId ─► CursorPosition
//!              └── version:  u64
//! ```
//!
//! A page entry is created lazily on first use and dropped as soon as its
//! last member leaves. Nothing here is persisted.
//!
//! [`SessionStore`] is the seam for swapping in a shared store; the
//! in-process [`InMemorySessionStore`] is the default. [`PageLocks`] gives
//! callers one async mutex per page so that a whole join, leave or update
//! step (registry mutation, journal append, broadcast) runs without
//! interleaving with another step on the same page.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OwnedMutexGuard;

use crate::model::{CursorPosition, PageId, PageSnapshot, UserCursor, UserId};

/// Storage for ephemeral session state.
pub trait SessionStore: Send + Sync {
    /// Add `user` to the page (no-op if present) and return the resulting snapshot.
    fn join(&self, page_id: PageId, user_id: UserId) -> PageSnapshot;

    /// Remove `user` and their cursor. Returns the remaining members, or
    /// `None` if the user was not a member. Drops the page entry when empty.
    fn leave(&self, page_id: PageId, user_id: UserId) -> Option<Vec<UserId>>;

    /// Overwrite the user's cursor. Returns `false` if the user is not a member.
    fn set_cursor(&self, page_id: PageId, user_id: UserId, cursor: CursorPosition) -> bool;

    fn snapshot(&self, page_id: PageId) -> PageSnapshot;

    fn is_member(&self, page_id: PageId, user_id: UserId) -> bool;

    /// Current version, 0 for an untracked page.
    fn version(&self, page_id: PageId) -> u64;

    /// Accept an update stamped with `client_version` if it is not stale.
    ///
    /// On success the version becomes `client_version + 1` and is returned.
    /// A stale stamp returns `Err(current)` and leaves the version untouched.
    /// Only pages with members carry a version; for any other page this
    /// creates nothing and returns `Err(0)`.
    fn compare_and_advance(&self, page_id: PageId, client_version: u64) -> Result<u64, u64>;

    /// Pages the user is currently a member of.
    fn pages_of(&self, user_id: UserId) -> Vec<PageId>;
}

#[derive(Debug, Default)]
struct PageSession {
    members: Vec<UserId>,
    cursors: HashMap<UserId, CursorPosition>,
    version: u64,
}

impl PageSession {
    fn snapshot(&self) -> PageSnapshot {
        let cursors = self
            .members
            .iter()
            .filter_map(|user_id| {
                self.cursors.get(user_id).map(|cursor| UserCursor {
                    user_id: *user_id,
                    cursor: cursor.clone(),
                })
            })
            .collect();
        PageSnapshot {
            active_users: self.members.clone(),
            cursors,
            version: self.version,
        }
    }
}

/// Process-local [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    pages: RwLock<HashMap<PageId, PageSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages with tracked state.
    pub fn tracked_pages(&self) -> usize {
        self.pages.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl SessionStore for InMemorySessionStore {
    fn join(&self, page_id: PageId, user_id: UserId) -> PageSnapshot {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let session = pages.entry(page_id).or_default();
        if !session.members.contains(&user_id) {
            session.members.push(user_id);
        }
        session.snapshot()
    }

    fn leave(&self, page_id: PageId, user_id: UserId) -> Option<Vec<UserId>> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let session = pages.get_mut(&page_id)?;
        let idx = session.members.iter().position(|u| *u == user_id)?;
        session.members.remove(idx);
        session.cursors.remove(&user_id);

        let remaining = session.members.clone();
        if remaining.is_empty() {
            pages.remove(&page_id);
        }
        Some(remaining)
    }

    fn set_cursor(&self, page_id: PageId, user_id: UserId, cursor: CursorPosition) -> bool {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        match pages.get_mut(&page_id) {
            Some(session) if session.members.contains(&user_id) => {
                session.cursors.insert(user_id, cursor);
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self, page_id: PageId) -> PageSnapshot {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages.get(&page_id).map(PageSession::snapshot).unwrap_or_default()
    }

    fn is_member(&self, page_id: PageId, user_id: UserId) -> bool {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages
            .get(&page_id)
            .is_some_and(|s| s.members.contains(&user_id))
    }

    fn version(&self, page_id: PageId) -> u64 {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages.get(&page_id).map_or(0, |s| s.version)
    }

    fn compare_and_advance(&self, page_id: PageId, client_version: u64) -> Result<u64, u64> {
        let mut pages = self.pages.write().unwrap_or_else(PoisonError::into_inner);
        let Some(session) = pages.get_mut(&page_id) else {
            return Err(0);
        };
        if client_version < session.version {
            return Err(session.version);
        }
        session.version = client_version + 1;
        Ok(session.version)
    }

    fn pages_of(&self, user_id: UserId) -> Vec<PageId> {
        let pages = self.pages.read().unwrap_or_else(PoisonError::into_inner);
        pages
            .iter()
            .filter(|(_, s)| s.members.contains(&user_id))
            .map(|(page_id, _)| *page_id)
            .collect()
    }
}

/// One async mutex per page.
#[derive(Default)]
pub struct PageLocks {
    locks: Mutex<HashMap<PageId, Arc<tokio::sync::Mutex<()>>>>,
}

impl PageLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `page_id`. Released when the guard drops.
    pub async fn acquire(&self, page_id: PageId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(page_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Forget the page's lock if nobody holds or waits on it.
    pub fn prune(&self, page_id: PageId) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(&page_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&page_id);
        }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
