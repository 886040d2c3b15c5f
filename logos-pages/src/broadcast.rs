//! Per-page publish/subscribe.
//!
//! Each page gets one tokio broadcast channel. Envelopes record which
//! connection produced them so that "to everyone but the sender" is a
//! filter at the subscriber instead of a per-peer send loop.
//!
//! A connection's interest in a page is a [`Subscription`]: a forwarding
//! task that copies room envelopes into the connection's outbound queue.
//! Dropping the subscription aborts the task, so unsubscribe cannot be
//! forgotten.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::model::{ConnectionId, PageId, UserId};
use crate::protocol::ServerMessage;

/// Who in the room should see an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    Everyone,
    /// Everyone except this connection.
    Others(ConnectionId),
}

#[derive(Debug, Clone)]
pub struct RoomEnvelope {
    pub audience: Audience,
    pub message: ServerMessage,
}

impl RoomEnvelope {
    fn is_for(&self, connection_id: ConnectionId) -> bool {
        match self.audience {
            Audience::Everyone => true,
            Audience::Others(origin) => origin != connection_id,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_lagged: u64,
    pub subscribers: usize,
}

type Members = Arc<Mutex<HashMap<ConnectionId, UserId>>>;

/// The broadcast channel of one page, plus which connections listen on it.
pub struct PageRoom {
    page_id: PageId,
    sender: broadcast::Sender<Arc<RoomEnvelope>>,
    members: Members,
    messages_sent: AtomicU64,
    messages_lagged: Arc<AtomicU64>,
}

impl PageRoom {
    pub fn new(page_id: PageId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            page_id,
            sender,
            members: Arc::new(Mutex::new(HashMap::new())),
            messages_sent: AtomicU64::new(0),
            messages_lagged: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// Publish to the room. Returns the number of subscribers reached.
    pub fn publish(&self, audience: Audience, message: ServerMessage) -> usize {
        let envelope = Arc::new(RoomEnvelope { audience, message });
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.sender.send(envelope).unwrap_or(0)
    }

    /// Start forwarding room traffic addressed to `connection_id` into `outbound`.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Subscription {
        let mut rx = self.sender.subscribe();
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(connection_id, user_id);
        let page_id = self.page_id;
        let lagged = self.messages_lagged.clone();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if !envelope.is_for(connection_id) {
                            continue;
                        }
                        if outbound.send(envelope.message.clone()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        lagged.fetch_add(n, Ordering::Relaxed);
                        log::warn!("Connection {connection_id} lagged by {n} messages on page {page_id}");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Subscription {
            page_id,
            connection_id,
            members: self.members.clone(),
            task,
        }
    }

    /// Connections currently subscribed.
    pub fn subscriber_count(&self) -> usize {
        self.members.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether any connection of `user_id` is subscribed.
    pub fn has_user(&self, user_id: UserId) -> bool {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|u| *u == user_id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_lagged: self.messages_lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

/// A connection's live interest in one page.
pub struct Subscription {
    page_id: PageId,
    connection_id: ConnectionId,
    members: Members,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.members
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.connection_id);
        self.task.abort();
    }
}

/// Maps page IDs to rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<PageId, Arc<PageRoom>>>,
    capacity: usize,
}

impl RoomManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Get or create the room for a page.
    pub async fn get_or_create(&self, page_id: PageId) -> Arc<PageRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&page_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(page_id)
            .or_insert_with(|| Arc::new(PageRoom::new(page_id, self.capacity)))
            .clone()
    }

    pub async fn get(&self, page_id: PageId) -> Option<Arc<PageRoom>> {
        self.rooms.read().await.get(&page_id).cloned()
    }

    /// Publish to a page's room if it exists. Returns subscribers reached.
    pub async fn publish(&self, page_id: PageId, audience: Audience, message: ServerMessage) -> usize {
        match self.get(page_id).await {
            Some(room) => room.publish(audience, message),
            None => 0,
        }
    }

    /// Drop the room if nobody is subscribed.
    pub async fn remove_if_empty(&self, page_id: PageId) -> bool {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&page_id).is_some_and(|r| r.subscriber_count() == 0) {
            rooms.remove(&page_id);
            return true;
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
