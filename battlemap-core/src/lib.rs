//! # battlemap-core: domain model for the shared battle map
//!
//! Pure, I/O-free building blocks shared by the server and the client:
//!
//! - [`model`]: rooms, members, units and drawings
//! - [`echelon`]: the fixed set of time-phase slots entities live in
//! - [`event`]: the closed change-event type carried by the change feed
//! - [`mutation`]: every write a client can request
//! - [`gate`]: the write authorization rule
//! - [`turn`]: the room turn state machine
//! - [`throttle`]: per-(user, entity) write coalescing
//! - [`plan`]: plan snapshot export/import boundary object
//!
//! ```text
//!   intent ──► Mutation::validate ──► gate::authorize ──► store ──► ChangeEvent
//!                                        ▲
//!                                        │ reads
//!                                   Room (turn state)
//! ```

pub mod context;
pub mod echelon;
pub mod error;
pub mod event;
pub mod gate;
pub mod model;
pub mod mutation;
pub mod plan;
pub mod throttle;
pub mod turn;

pub use context::SessionContext;
pub use echelon::{EchelonIndex, ECHELON_COUNT};
pub use error::{DenyReason, SyncError};
pub use event::{ChangeEvent, ChangeKind, ChangePayload, EntityClass};
pub use gate::{authorize, authorize_admin, authorize_all, Decision};
pub use model::{
    now_millis, Drawing, DrawingPatch, Entity, EntityKind, EntityPatch, Point, Room, RoomMember,
    ShapeType, StrokeStyle, Unit, UnitPatch, UserId,
};
pub use mutation::Mutation;
pub use plan::{PlanSnapshot, PLAN_SCHEMA_VERSION};
pub use throttle::{Admission, Coalesce, WriteThrottle, DEFAULT_WRITE_INTERVAL};
pub use turn::TurnState;
