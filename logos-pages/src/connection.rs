//! Live connections.
//!
//! A [`Connection`] is the server-side state of one client link:
//!
//! ```text
//! Unauthenticated ──authenticate──► Authenticated ──join──► Joined(p1, p2, …)
//!        │                               │                       │
//!        └───────────────────────────────┴──────disconnect───────┴──► gone
//! ```
//!
//! [`ConnectionRegistry`] is the `UserConnections` map used for
//! notification fan-out: user → connection → outbound queue.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::broadcast::Subscription;
use crate::error::CollabError;
use crate::model::{ConnectionId, PageId, UserId};
use crate::protocol::ServerMessage;

pub struct Connection {
    id: ConnectionId,
    user_id: Option<UserId>,
    outbound: mpsc::Sender<ServerMessage>,
    subscriptions: HashMap<PageId, Subscription>,
}

impl Connection {
    /// A fresh, unauthenticated connection writing to `outbound`.
    pub fn new(outbound: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: None,
            outbound,
            subscriptions: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// The authenticated user, or `NotAuthenticated`.
    pub fn require_user(&self) -> Result<UserId, CollabError> {
        self.user_id.ok_or(CollabError::NotAuthenticated)
    }

    pub fn is_authenticated(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn outbound(&self) -> &mpsc::Sender<ServerMessage> {
        &self.outbound
    }

    /// Queue a message for this connection only.
    pub async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    pub fn has_joined(&self, page_id: PageId) -> bool {
        self.subscriptions.contains_key(&page_id)
    }

    pub fn joined_pages(&self) -> Vec<PageId> {
        self.subscriptions.keys().copied().collect()
    }

    pub(crate) fn set_user(&mut self, user_id: UserId) {
        self.user_id = Some(user_id);
    }

    pub(crate) fn add_subscription(&mut self, subscription: Subscription) {
        self.subscriptions.insert(subscription.page_id(), subscription);
    }

    /// Remove the page's subscription. Dropping it unsubscribes.
    pub(crate) fn take_subscription(&mut self, page_id: PageId) -> Option<Subscription> {
        self.subscriptions.remove(&page_id)
    }
}

/// `UserConnections`: every live, authenticated connection per user.
#[derive(Default)]
pub struct ConnectionRegistry {
    users: RwLock<HashMap<UserId, HashMap<ConnectionId, mpsc::Sender<ServerMessage>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user_id: UserId, connection_id: ConnectionId, outbound: mpsc::Sender<ServerMessage>) {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        users.entry(user_id).or_default().insert(connection_id, outbound);
    }

    /// Forget a connection. The user entry goes away with its last connection.
    pub fn unregister(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        let Some(connections) = users.get_mut(&user_id) else {
            return false;
        };
        let removed = connections.remove(&connection_id).is_some();
        if connections.is_empty() {
            users.remove(&user_id);
        }
        removed
    }

    pub fn connection_count(&self, user_id: UserId) -> usize {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        users.get(&user_id).map_or(0, HashMap::len)
    }

    pub fn online_users(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Send `message` once to each of the user's connections.
    /// Returns how many connections accepted it.
    ///
    /// Never waits: a connection whose outbound queue is full misses the
    /// message, so one stalled client cannot hold up the sender.
    pub fn deliver(&self, user_id: UserId, message: &ServerMessage) -> usize {
        let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
        let Some(connections) = users.get(&user_id) else {
            return 0;
        };

        let mut delivered = 0;
        for (connection_id, target) in connections {
            match target.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    log::warn!("Outbound queue of connection {connection_id} is full, dropping message for {user_id}");
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }
}
