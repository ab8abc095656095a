//! WebSocket sync server with room-based routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── RoomRegistry ── RoomHub (room_id) ── commit section ── MapStore
//! Client B ──┘                        │                                  (memory | RocksDB)
//!                                     └── ChangeFeed
//!                                            │
//!                          ┌─────────────────┼──────────────┐
//!                          ▼                 ▼              ▼
//!                       Client A          Client B       Client C
//! ```
//!
//! Each connection is one task running a `select!` over the socket and,
//! once joined, the room's change feed. The author of a change receives
//! its own event like everyone else.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use battlemap_core::{
    ChangeEvent, ChangeKind, ChangePayload, Mutation, SessionContext, SyncError, UserId,
};

use crate::feed::FeedSubscription;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::room::{CommitOutcome, HubConfig, RoomHub, RoomRegistry};
use crate::storage::{MapStore, MemoryStore, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum members per room
    pub max_members_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// How often stale members are reaped, in seconds
    pub heartbeat_interval_secs: u64,
    /// Members without a heartbeat for this long are inactive
    pub presence_timeout_secs: u64,
    /// Minimum interval between two writes of one entity by one user
    pub write_throttle_ms: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 64,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 15,
            presence_timeout_secs: 45,
            write_throttle_ms: 500,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `BATTLEMAP_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns. Unparseable values
    /// are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, fallback: T) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    log::warn!("Ignoring {key}={raw:?}: not a valid value");
                    fallback
                }),
                None => fallback,
            }
        }

        let defaults = Self::default();
        Self {
            bind_addr: lookup("BATTLEMAP_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_members_per_room: parsed(&lookup, "BATTLEMAP_MAX_MEMBERS", defaults.max_members_per_room),
            broadcast_capacity: parsed(&lookup, "BATTLEMAP_BROADCAST_CAPACITY", defaults.broadcast_capacity),
            heartbeat_interval_secs: parsed(&lookup, "BATTLEMAP_HEARTBEAT_SECS", defaults.heartbeat_interval_secs),
            presence_timeout_secs: parsed(&lookup, "BATTLEMAP_PRESENCE_TIMEOUT_SECS", defaults.presence_timeout_secs),
            write_throttle_ms: parsed(&lookup, "BATTLEMAP_WRITE_THROTTLE_MS", defaults.write_throttle_ms),
            storage_path: lookup("BATTLEMAP_STORAGE_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from),
        }
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_members: self.max_members_per_room,
            presence_timeout: Duration::from_secs(self.presence_timeout_secs),
            write_interval: Duration::from_millis(self.write_throttle_ms),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub rejected_mutations: u64,
    pub resyncs_requested: u64,
}

/// A connection that has joined a room.
struct Session {
    ctx: SessionContext,
    hub: Arc<RoomHub>,
    subscription: FeedSubscription,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    store: Arc<dyn MapStore>,
}

impl SyncServer {
    /// Create a server, opening RocksDB if `storage_path` is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn MapStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig::at(path.clone()))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn MapStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new(store.clone(), config.hub_config()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        })
    }

    /// Bring persisted rooms back after a restart. Nobody is connected yet,
    /// so every member still flagged active is marked inactive. Rooms are
    /// loaded lazily on first join. Returns the number of rooms on disk.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let rooms = self.store.list_rooms()?;
        let mut stale = 0;
        for room in &rooms {
            for mut member in self.store.list_members(room.id)? {
                if member.is_active {
                    member.is_active = false;
                    self.store.upsert_member(&member)?;
                    stale += 1;
                }
            }
        }
        log::info!(
            "Recovery complete: {} rooms, {} members marked inactive",
            rooms.len(),
            stale
        );
        Ok(rooms.len())
    }

    /// Recover, bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} rooms from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let reaper = self.spawn_reaper();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        reaper.abort();
        result
    }

    fn spawn_reaper(&self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let stats = self.stats.clone();
        let period = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let reaped = registry.reap_all(Instant::now()).await;
                if reaped > 0 {
                    log::debug!("Reaped {reaped} stale members");
                }
                let rooms = registry.room_count().await;
                stats.write().await.active_rooms = rooms;
            }
        })
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            &mut session,
            addr,
            &registry,
            &stats,
        )
        .await;

        // Cleanup: the member stays, inactive once its last connection is gone
        if let Some(session) = session.take() {
            Self::end_session(session, &registry, true).await;
        }

        let rooms = registry.room_count().await;
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
        s.active_rooms = rooms;

        result
    }

    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        session: &mut Option<Session>,
        addr: SocketAddr,
        registry: &Arc<RoomRegistry>,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            let reply = match ClientMessage::decode(&data) {
                                Ok(client_msg) => {
                                    Self::handle_message(client_msg, session, registry, stats).await
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {addr}: {e}");
                                    Some(ServerMessage::Error {
                                        request_id: None,
                                        error: SyncError::validation(e.to_string()),
                                    })
                                }
                            };
                            if let Some(reply) = reply {
                                send(ws_sender, &reply).await?;
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            return Ok(());
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        _ => {}
                    }
                }

                // Change feed of the joined room
                event = async {
                    match session.as_mut() {
                        Some(s) => s.subscription.rx.recv().await,
                        // Not joined yet: wait forever
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(current) = session.as_ref() else { continue };
                    match event {
                        Ok(event) => {
                            let ends = ends_session(&event, current.ctx.user_id);
                            send(ws_sender, &ServerMessage::Change(ChangeEvent::clone(&event))).await?;
                            if ends {
                                log::info!(
                                    "Session of {} in room {} ended by {:?} {}",
                                    current.ctx.user_id,
                                    current.ctx.room_id,
                                    event.kind,
                                    event.payload.class()
                                );
                                if let Some(ended) = session.take() {
                                    Self::end_session(ended, registry, false).await;
                                }
                                ws_sender.send(Message::Close(None)).await?;
                                return Ok(());
                            }
                        }
                        Err(RecvError::Lagged(missed)) => {
                            log::warn!(
                                "{} lagged by {missed} events in room {}, requesting resync",
                                current.ctx.user_id,
                                current.ctx.room_id
                            );
                            current.hub.feed().note_lag(missed);
                            stats.write().await.resyncs_requested += 1;
                            let msg = ServerMessage::ResyncRequired {
                                room_id: current.ctx.room_id,
                                missed,
                            };
                            send(ws_sender, &msg).await?;
                        }
                        Err(RecvError::Closed) => {
                            if let Some(ended) = session.take() {
                                Self::end_session(ended, registry, false).await;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Answer one client message. `None` means no reply.
    async fn handle_message(
        msg: ClientMessage,
        session: &mut Option<Session>,
        registry: &Arc<RoomRegistry>,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Option<ServerMessage> {
        match msg {
            ClientMessage::CreateRoom {
                request_id,
                user_id,
                display_name,
                name,
                map_id,
            } => {
                log::debug!("{display_name} ({user_id}) creating room {name:?}");
                Some(match registry.create_room(user_id, &name, &map_id).await {
                    Ok((room, _)) => ServerMessage::RoomCreated { request_id, room },
                    Err(error) => ServerMessage::Error {
                        request_id: Some(request_id),
                        error,
                    },
                })
            }

            ClientMessage::Join {
                request_id,
                user_id,
                display_name,
                room_id,
            } => {
                if let Some(previous) = session.take() {
                    Self::end_session(previous, registry, true).await;
                }
                match registry.join(room_id, user_id, &display_name).await {
                    Ok((hub, outcome)) => {
                        let reply = ServerMessage::Joined {
                            request_id,
                            room: outcome.room,
                            members: outcome.members,
                            seq: outcome.seq,
                        };
                        *session = Some(Session {
                            ctx: SessionContext::new(user_id, display_name, room_id),
                            hub,
                            subscription: outcome.subscription,
                        });
                        let rooms = registry.room_count().await;
                        stats.write().await.active_rooms = rooms;
                        Some(reply)
                    }
                    Err(error) => {
                        log::warn!("Join of {user_id} to room {room_id} rejected: {error}");
                        Some(ServerMessage::JoinRejected { request_id, error })
                    }
                }
            }

            ClientMessage::Leave => {
                if let Some(current) = session.take() {
                    if let Err(e) = current.hub.leave(current.ctx.user_id).await {
                        log::error!("Leave of {} failed: {e}", current.ctx.user_id);
                    }
                    Self::end_session(current, registry, false).await;
                }
                None
            }

            ClientMessage::Heartbeat => {
                if let Some(current) = session.as_ref() {
                    current.hub.heartbeat(current.ctx.user_id).await;
                }
                None
            }

            ClientMessage::FetchSnapshot { request_id, echelon } => {
                let Some(current) = session.as_ref() else {
                    return Some(not_joined(request_id));
                };
                Some(match current.hub.snapshot(echelon).await {
                    Ok(snap) => ServerMessage::Snapshot {
                        request_id,
                        room: snap.room,
                        echelon: snap.echelon,
                        seq: snap.seq,
                        units: snap.units,
                        drawings: snap.drawings,
                    },
                    Err(error) => ServerMessage::Error {
                        request_id: Some(request_id),
                        error,
                    },
                })
            }

            ClientMessage::Mutate { request_id, mutation } => {
                let Some(current) = session.as_ref() else {
                    return Some(ServerMessage::MutationRejected {
                        request_id,
                        error: SyncError::validation("join a room first"),
                    });
                };
                let label = mutation.label();
                let deletes_room = matches!(mutation, Mutation::DeleteRoom);
                match current.hub.commit(&current.ctx, mutation).await {
                    Ok(outcome) => {
                        if deletes_room {
                            registry.forget(current.ctx.room_id).await;
                        }
                        Some(ServerMessage::MutationAccepted {
                            request_id,
                            coalesced: matches!(outcome, CommitOutcome::Coalesced { .. }),
                        })
                    }
                    Err(error) => {
                        log::warn!(
                            "{} by {} in room {} rejected: {error}",
                            label,
                            current.ctx.user_id,
                            current.ctx.room_id
                        );
                        stats.write().await.rejected_mutations += 1;
                        Some(ServerMessage::MutationRejected { request_id, error })
                    }
                }
            }

            ClientMessage::Ping { nonce } => Some(ServerMessage::Pong { nonce }),
        }
    }

    /// Detach a session from its hub. `disconnect` keeps the member row
    /// (connection loss); otherwise the member is already gone.
    async fn end_session(session: Session, registry: &RoomRegistry, disconnect: bool) {
        let room_id = session.ctx.room_id;
        if disconnect {
            session
                .hub
                .disconnect(session.ctx.user_id, session.subscription.handle)
                .await;
        } else {
            session.hub.feed().unsubscribe(session.subscription.handle);
        }
        drop(session);
        registry.remove_if_idle(room_id).await;
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn MapStore> {
        &self.store
    }
}

/// The room was deleted, or this user was removed from it.
fn ends_session(event: &ChangeEvent, user_id: UserId) -> bool {
    match (&event.kind, &event.payload) {
        (ChangeKind::Delete, ChangePayload::Room(_)) => true,
        (ChangeKind::Delete, ChangePayload::Member(m)) => m.user_id == user_id,
        _ => false,
    }
}

fn not_joined(request_id: u64) -> ServerMessage {
    ServerMessage::Error {
        request_id: Some(request_id),
        error: SyncError::validation("join a room first"),
    }
}

async fn send(sink: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
