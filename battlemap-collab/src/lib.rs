//! # battlemap-collab: turn-gated sync for the shared battle map
//!
//! A WebSocket server that owns the authoritative map per room, a client
//! that talks to it, and the client-side view that reconciles optimistic
//! edits with the room's change feed.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   WebSocket (bincode)   ┌──────────────┐
//! │ SyncClient   │ ◄─────────────────────► │ SyncServer   │
//! │ + MapView    │  Mutate / Change / ...  │              │
//! └──────────────┘                         └──────┬───────┘
//!                                                 │ RoomRegistry
//!                                          ┌──────┴───────┐
//!                                          │ RoomHub      │ commit section:
//!                                          │ (per room)   │ validate → gate →
//!                                          └──┬────────┬──┘ store → publish
//!                                             │        │
//!                                     ┌───────┴──┐  ┌──┴─────────┐
//!                                     │ MapStore │  │ ChangeFeed │ fan-out,
//!                                     │ mem/rocks│  │ seq'd      │ lag → resync
//!                                     └──────────┘  └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages (bincode + lz4)
//! - [`storage`]: the entity store trait and its two adapters
//! - [`feed`]: per-room ordered change fan-out
//! - [`presence`]: room membership and liveness
//! - [`room`]: the per-room commit section and the room registry
//! - [`server`]: WebSocket sync server
//! - [`client`]: WebSocket sync client
//! - [`reconcile`]: client-side cache, optimistic edits and animation
//! - [`retry`]: backoff for reads and reconnects

pub mod client;
pub mod feed;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod retry;
pub mod room;
pub mod server;
pub mod storage;

pub use client::{
    ClientConfig, ConnectionState, JoinedRoom, MutationAck, SyncClient, SyncEvent,
};
pub use feed::{ChangeFeed, FeedStats, FeedSubscription, SubscriptionHandle};
pub use presence::{MemberColor, PresenceManager, DEFAULT_PRESENCE_TIMEOUT};
pub use protocol::{ClientMessage, PeerInfo, ProtocolError, ServerMessage};
pub use reconcile::{EditId, EventOutcome, MapView, RenderedUnit, Vec2};
pub use retry::RetryPolicy;
pub use room::{CommitOutcome, HubConfig, JoinOutcome, RoomHub, RoomRegistry, RoomSnapshot};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{MapStore, MemoryStore, RocksStore, StoreConfig, StoreError};

pub use battlemap_core;
