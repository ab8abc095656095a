//! WebSocket sync client for connecting to the battle map server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Request/response correlation by request id
//! - Change events pushed to the application over a channel
//! - Periodic heartbeats while connected
//!
//! Mutations are sent once. A timed-out write may still have committed, so
//! only connects and snapshot reads are retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use battlemap_core::{ChangeEvent, EchelonIndex, Mutation, Room, RoomMember, SyncError};

use crate::protocol::{ClientMessage, PeerInfo, ProtocolError, ServerMessage};
use crate::retry::RetryPolicy;
use crate::room::RoomSnapshot;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A committed change in the joined room, own changes included
    Change(ChangeEvent),
    /// Events were lost; every cached echelon must be refetched
    ResyncRequired { room_id: Uuid, missed: u64 },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: String,
    pub request_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub retry: RetryPolicy,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            request_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            retry: RetryPolicy::default(),
            event_capacity: 1024,
        }
    }
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }
}

/// Answer to a successful `Join`.
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub room: Room,
    pub members: Vec<RoomMember>,
    pub seq: u64,
}

/// How the server took a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationAck {
    Committed,
    /// Folded into a pending throttled write; the change event follows later.
    Coalesced,
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

/// The sync client.
pub struct SyncClient {
    /// Our identity
    peer: PeerInfo,

    config: ClientConfig,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to send messages to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,

    /// Requests waiting for their answer, by request id (or ping nonce)
    pending: PendingMap,

    next_request_id: AtomicU64,

    /// Bumped on every connect/disconnect so a stale reader task cannot
    /// tear down a newer connection
    generation: Arc<AtomicU64>,

    /// Room of the last successful join, rejoined after a reconnect
    joined_room: RwLock<Option<Uuid>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<SyncEvent>>,

    /// Event sender (held by connection task)
    event_tx: mpsc::Sender<SyncEvent>,

    heartbeat_task: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer: PeerInfo, config: ClientConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            peer,
            config,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU64::new(1),
            generation: Arc::new(AtomicU64::new(0)),
            joined_room: RwLock::new(None),
            event_rx: Some(event_rx),
            event_tx,
            heartbeat_task: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages and
    /// for heartbeats.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.shutdown_tasks();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.write().await = ConnectionState::Connecting;

        let connecting = tokio_tungstenite::connect_async(self.config.server_url.as_str());
        let ws_stream = match tokio::time::timeout(self.config.request_timeout, connecting).await {
            Ok(Ok((ws_stream, _))) => ws_stream,
            Ok(Err(e)) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
            Err(_) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::Timeout);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Heartbeat task: stops once the writer is gone
        if let Ok(beat) = ClientMessage::Heartbeat.encode() {
            let interval = self.config.heartbeat_interval;
            self.heartbeat_task = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if out_tx.send(beat.clone()).await.is_err() {
                        break;
                    }
                }
            }));
        }

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;
        log::info!("{} connected to {}", self.peer.display_name, self.config.server_url);

        // Reader task: route answers to waiting requests, pushes to the app
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let pending = self.pending.clone();
        let current = self.generation.clone();
        tokio::spawn(async move {
            let mut overflow = Overflow::default();
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => route(server_msg, &pending, &event_tx, &mut overflow).await,
                        Err(e) => log::warn!("Dropping undecodable server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            if current.load(Ordering::SeqCst) != generation {
                return;
            }
            // Connection lost: waiting requests fail with ConnectionClosed
            pending.lock().await.clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Connect, retrying transient failures with exponential backoff.
    pub async fn connect_with_retry(&mut self) -> Result<(), SyncError> {
        let policy = self.config.retry.clone();
        let attempts = policy.max_attempts.max(1);
        let mut delay = policy.initial_delay;
        let mut attempt = 1;
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    log::warn!(
                        "Connect attempt {attempt}/{attempts} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    *self.state.write().await = ConnectionState::Reconnecting;
                    tokio::time::sleep(delay).await;
                    delay = policy.next_delay(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Drop the connection. Waiting requests fail with `ConnectionClosed`.
    pub async fn disconnect(&mut self) {
        self.shutdown_tasks();
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.outgoing_tx = None;
        self.pending.lock().await.clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Reconnect and rejoin the last joined room. The caller must refetch
    /// every snapshot it shows afterwards.
    pub async fn rejoin(&mut self) -> Result<JoinedRoom, SyncError> {
        let room_id = (*self.joined_room.read().await)
            .ok_or_else(|| SyncError::validation("no room to rejoin"))?;
        self.disconnect().await;
        *self.state.write().await = ConnectionState::Reconnecting;
        self.connect_with_retry().await?;
        self.join(room_id).await
    }

    fn shutdown_tasks(&mut self) {
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }

    // ─── Requests ─────────────────────────────────────────────────────

    async fn send_raw(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let encoded = msg.encode()?;
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Send a request built around a fresh id and wait for its answer.
    async fn request<F>(&self, build: F) -> Result<ServerMessage, ProtocolError>
    where
        F: FnOnce(u64) -> ClientMessage,
    {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send_raw(&build(id)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::Timeout)
            }
        }
    }

    pub async fn create_room(&self, name: &str, map_id: &str) -> Result<Room, SyncError> {
        let answer = self
            .request(|request_id| ClientMessage::CreateRoom {
                request_id,
                user_id: self.peer.user_id,
                display_name: self.peer.display_name.clone(),
                name: name.to_string(),
                map_id: map_id.to_string(),
            })
            .await?;
        match answer {
            ServerMessage::RoomCreated { room, .. } => Ok(room),
            ServerMessage::Error { error, .. } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn join(&self, room_id: Uuid) -> Result<JoinedRoom, SyncError> {
        let answer = self
            .request(|request_id| ClientMessage::Join {
                request_id,
                user_id: self.peer.user_id,
                display_name: self.peer.display_name.clone(),
                room_id,
            })
            .await?;
        match answer {
            ServerMessage::Joined {
                room, members, seq, ..
            } => {
                *self.joined_room.write().await = Some(room.id);
                Ok(JoinedRoom { room, members, seq })
            }
            ServerMessage::JoinRejected { error, .. } | ServerMessage::Error { error, .. } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn leave(&self) -> Result<(), SyncError> {
        self.send_raw(&ClientMessage::Leave).await?;
        *self.joined_room.write().await = None;
        Ok(())
    }

    pub async fn heartbeat(&self) -> Result<(), SyncError> {
        Ok(self.send_raw(&ClientMessage::Heartbeat).await?)
    }

    pub async fn fetch_snapshot(&self, echelon: EchelonIndex) -> Result<RoomSnapshot, SyncError> {
        let answer = self
            .request(|request_id| ClientMessage::FetchSnapshot { request_id, echelon })
            .await?;
        match answer {
            ServerMessage::Snapshot {
                room,
                echelon,
                seq,
                units,
                drawings,
                ..
            } => Ok(RoomSnapshot {
                room,
                echelon,
                seq,
                units,
                drawings,
            }),
            ServerMessage::Error { error, .. } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    /// Snapshot read with the configured retry policy.
    pub async fn fetch_snapshot_with_retry(&self, echelon: EchelonIndex) -> Result<RoomSnapshot, SyncError> {
        self.config
            .retry
            .retry("snapshot", || self.fetch_snapshot(echelon))
            .await
    }

    /// Submit one mutation. Never retried.
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutationAck, SyncError> {
        let answer = self
            .request(|request_id| ClientMessage::Mutate { request_id, mutation })
            .await?;
        match answer {
            ServerMessage::MutationAccepted { coalesced, .. } => Ok(if coalesced {
                MutationAck::Coalesced
            } else {
                MutationAck::Committed
            }),
            ServerMessage::MutationRejected { error, .. } | ServerMessage::Error { error, .. } => Err(error),
            other => Err(unexpected(&other)),
        }
    }

    /// Round-trip time to the server.
    pub async fn ping(&self) -> Result<Duration, SyncError> {
        let started = Instant::now();
        match self.request(|nonce| ClientMessage::Ping { nonce }).await? {
            ServerMessage::Pong { .. } => Ok(started.elapsed()),
            other => Err(unexpected(&other)),
        }
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn peer(&self) -> &PeerInfo {
        &self.peer
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    pub async fn joined_room(&self) -> Option<Uuid> {
        *self.joined_room.read().await
    }

    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.shutdown_tasks();
    }
}

/// Events dropped because the application stopped draining its channel.
/// The reader never waits on the application, so replies keep flowing.
#[derive(Debug, Default)]
struct Overflow {
    room_id: Option<Uuid>,
    missed: u64,
}

impl Overflow {
    fn record(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Change(change) => {
                self.room_id = Some(change.room_id);
                self.missed += 1;
            }
            SyncEvent::ResyncRequired { room_id, missed } => {
                self.room_id = Some(room_id);
                self.missed += missed.max(1);
            }
            SyncEvent::Connected | SyncEvent::Disconnected => {}
        }
    }

    /// Deliver the pending resync notice once the channel has room.
    fn flush(&mut self, event_tx: &mpsc::Sender<SyncEvent>) -> bool {
        let Some(room_id) = self.room_id else {
            return true;
        };
        let notice = SyncEvent::ResyncRequired {
            room_id,
            missed: self.missed,
        };
        match event_tx.try_send(notice) {
            Ok(()) => {
                log::warn!("Dropped {} events for room {room_id}; resync required", self.missed);
                *self = Overflow::default();
                true
            }
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Closed(_)) => {
                *self = Overflow::default();
                true
            }
        }
    }
}

/// Hand an answer to its waiting request, or push it to the application.
async fn route(
    msg: ServerMessage,
    pending: &PendingMap,
    event_tx: &mpsc::Sender<SyncEvent>,
    overflow: &mut Overflow,
) {
    let caught_up = overflow.flush(event_tx);
    let key = match &msg {
        ServerMessage::Pong { nonce } => Some(*nonce),
        other => other.request_id(),
    };
    if let Some(id) = key {
        match pending.lock().await.remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(msg);
            }
            None => log::debug!("No request waiting for answer {id}"),
        }
        return;
    }

    let event = match msg {
        ServerMessage::Change(event) => SyncEvent::Change(event),
        ServerMessage::ResyncRequired { room_id, missed } => {
            log::warn!("Server dropped {missed} events for room {room_id}; resync required");
            SyncEvent::ResyncRequired { room_id, missed }
        }
        ServerMessage::Error { error, .. } => {
            log::warn!("Server error: {error}");
            return;
        }
        other => {
            log::debug!("Ignoring unsolicited {other:?}");
            return;
        }
    };
    if !caught_up {
        overflow.record(event);
        return;
    }
    match event_tx.try_send(event) {
        Ok(()) | Err(TrySendError::Closed(_)) => {}
        Err(TrySendError::Full(event)) => overflow.record(event),
    }
}

fn unexpected(msg: &ServerMessage) -> SyncError {
    let kind = format!("{msg:?}");
    let kind = kind.split([' ', '{', '(']).next().unwrap_or("unknown").to_string();
    ProtocolError::UnexpectedResponse(kind).into()
}
