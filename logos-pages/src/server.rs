//! WebSocket server in front of a [`CollabHub`].
//!
//! Architecture:
//! ```text
//!              ┌─────────── per connection ───────────┐
//! socket ──►   │ reader: decode ─► CollabHub::handle  │
//!              │           │                          │
//!              │           ▼                          │
//!              │   outbound mpsc ◄── room forwarders  │
//!              │           │   ◄── notification fan-out
//!              │           ▼                          │
//!              │ writer: encode ─► socket (+ pings)   │
//!              └──────────────────────────────────────┘
//! ```
//!
//! The first frame of a connection must be `Authenticate`. Anything else,
//! or a failed authentication, gets an error event and the socket closes.
//! After that, rejected commands are reported and the socket stays open
//! unless the error is fatal.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::Interval;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::Authenticator;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::CollabError;
use crate::hub::CollabHub;
use crate::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::session::InMemorySessionStore;
use crate::storage::{CollabStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_connections: u64,
    pub active_rooms: usize,
    pub online_users: usize,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    rejected_connections: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    hub: Arc<CollabHub>,
    counters: Arc<Counters>,
}

impl SyncServer {
    /// Build the server and its hub. Opens RocksDB when `storage_path` is set.
    pub fn new(config: ServerConfig, authenticator: Arc<dyn Authenticator>) -> Result<Self, StoreError> {
        let store: Arc<dyn CollabStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })?;
                log::info!("Using persistent store at {}", path.display());
                Arc::new(store)
            }
            None => Arc::new(MemoryStore::new()),
        };
        let hub = CollabHub::new(
            store,
            Arc::new(InMemorySessionStore::new()),
            authenticator,
            config.broadcast_capacity,
        );
        Ok(Self::with_hub(config, Arc::new(hub)))
    }

    /// Serve an existing hub.
    pub fn with_hub(config: ServerConfig, hub: Arc<CollabHub>) -> Self {
        Self {
            config,
            hub,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Page sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let counters = self.counters.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, hub, counters, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        hub: Arc<CollabHub>,
        counters: Arc<Counters>,
        config: ServerConfig,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("WebSocket connection established from {addr}");

        counters.total_connections.fetch_add(1, Ordering::Relaxed);
        counters.active_connections.fetch_add(1, Ordering::Relaxed);

        let (mut connection, mut outbound_rx) = hub.open_connection(config.outbound_capacity);
        let (control_tx, mut control_rx) = mpsc::channel::<Message>(16);

        // Writer: everything addressed to this connection goes through here.
        // It finishes once every outbound sender is gone.
        let mut heartbeat = (config.heartbeat_interval_secs > 0)
            .then(|| tokio::time::interval(Duration::from_secs(config.heartbeat_interval_secs)));
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = control_rx.recv() => {
                        if ws_sender.send(frame).await.is_err() {
                            return;
                        }
                    }
                    message = outbound_rx.recv() => {
                        let Some(message) = message else {
                            break;
                        };
                        match message.encode() {
                            Ok(bytes) => {
                                if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => log::error!("Failed to encode outbound message: {e}"),
                        }
                    }
                    _ = tick(&mut heartbeat) => {
                        if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Binary(data)) => {
                    counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    counters.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                    let keep_open = match ClientMessage::decode(&data) {
                        Ok(message) => Self::dispatch(&hub, &mut connection, message).await,
                        Err(e) => {
                            log::warn!("Failed to decode message from {addr}: {e}");
                            connection
                                .send(ServerMessage::error(ErrorKind::InvalidMessage, e.to_string()))
                                .await;
                            connection.is_authenticated()
                        }
                    };
                    if !keep_open {
                        counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = control_tx.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Connection closed from {addr}");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("WebSocket error from {addr}: {e}");
                    break;
                }
            }
        }

        drop(control_tx);
        hub.disconnect(connection).await;
        let _ = writer.await;
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        Ok(())
    }

    /// Apply one client message. Returns whether the connection stays open.
    async fn dispatch(hub: &CollabHub, connection: &mut Connection, message: ClientMessage) -> bool {
        match message {
            ClientMessage::Authenticate { credential } => match hub.authenticate(connection, &credential) {
                Ok(user_id) => {
                    connection.send(ServerMessage::Authenticated { user_id }).await;
                    true
                }
                Err(e) => {
                    log::warn!("Authentication failed for connection {}: {e}", connection.id());
                    report(connection, &e).await;
                    !e.is_fatal()
                }
            },
            _ if !connection.is_authenticated() => {
                report(connection, &CollabError::NotAuthenticated).await;
                false
            }
            ClientMessage::Ping => {
                connection.send(ServerMessage::Pong).await;
                true
            }
            ClientMessage::Command(command) => {
                log::debug!("Connection {} sent {command:?}", connection.id());
                match hub.handle(connection, command).await {
                    Ok(Some(reply)) => {
                        connection.send(reply).await;
                        true
                    }
                    Ok(None) => true,
                    Err(e) => {
                        report(connection, &e).await;
                        !e.is_fatal()
                    }
                }
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            total_bytes: self.counters.total_bytes.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            active_rooms: self.hub.rooms().room_count().await,
            online_users: self.hub.connections().online_users(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }
}

async fn report(connection: &Connection, error: &CollabError) {
    if !matches!(error, CollabError::VersionConflict { .. }) {
        log::warn!("Rejected request on connection {}: {error}", connection.id());
    }
    connection
        .send(ServerMessage::error(error.kind(), error.to_string()))
        .await;
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticTokenAuthenticator;

    fn authenticator() -> Arc<dyn Authenticator> {
        Arc::new(StaticTokenAuthenticator::new())
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::new(ServerConfig::default(), authenticator()).unwrap();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::new(ServerConfig::default(), authenticator()).unwrap();
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config, authenticator()).unwrap();

        let page = uuid::Uuid::new_v4();
        let owner = uuid::Uuid::new_v4();
        server.hub().authority().create_page(page, owner).await.unwrap();
        assert!(dir.path().join("db").exists());
    }

    #[tokio::test]
    async fn test_dispatch_requires_authentication_first() {
        let hub = CollabHub::in_memory(authenticator(), 16);
        let (mut conn, mut rx) = hub.open_connection(8);

        assert!(!SyncServer::dispatch(&hub, &mut conn, ClientMessage::Ping).await);
        match rx.try_recv() {
            Ok(ServerMessage::Error { kind, .. }) => assert_eq!(kind, ErrorKind::NotAuthenticated),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_ping_after_auth() {
        let tokens = Arc::new(StaticTokenAuthenticator::new());
        let user = uuid::Uuid::new_v4();
        tokens.insert("t", user);
        let hub = CollabHub::in_memory(tokens, 16);
        let (mut conn, mut rx) = hub.open_connection(8);

        let auth = ClientMessage::Authenticate { credential: "t".into() };
        assert!(SyncServer::dispatch(&hub, &mut conn, auth).await);
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Authenticated { user_id: user }));

        assert!(SyncServer::dispatch(&hub, &mut conn, ClientMessage::Ping).await);
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Pong));
    }

    #[tokio::test]
    async fn test_dispatch_reauthenticate_is_reported_not_fatal() {
        let tokens = Arc::new(StaticTokenAuthenticator::new());
        let (first, second) = (uuid::Uuid::new_v4(), uuid::Uuid::new_v4());
        tokens.insert("first", first);
        tokens.insert("second", second);
        let hub = CollabHub::in_memory(tokens, 16);
        let (mut conn, mut rx) = hub.open_connection(8);

        let auth = |credential: &str| ClientMessage::Authenticate { credential: credential.into() };
        assert!(SyncServer::dispatch(&hub, &mut conn, auth("first")).await);
        assert_eq!(rx.try_recv().ok(), Some(ServerMessage::Authenticated { user_id: first }));

        assert!(SyncServer::dispatch(&hub, &mut conn, auth("second")).await);
        match rx.try_recv() {
            Ok(ServerMessage::Error { kind, .. }) => assert_eq!(kind, ErrorKind::AlreadyAuthenticated),
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(conn.user_id(), Some(first));
    }
}
