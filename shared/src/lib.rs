//! # Movement synchronization core
//!
//! Shared by the server and the client. Every moving entity owns a
//! [`MovementComposer`] that follows a planned route tick by tick, turns
//! towards each new path segment, and reconciles its local (dead-reckoned)
//! view with the updates received from the entity's authoritative replica.
//!
//! ## Modules
//!
//! - [`geometry`]: points, distances and the shortest-rotation rule
//! - [`planner`]: walkability grid, grid A* and path smoothing
//! - [`state`]: the kinematic record of one entity
//! - [`message`]: movement updates and the UDP wire protocol
//! - [`composer`]: the per-entity state machine and reconciliation protocol
//! - [`driver`]: one tokio task per entity serializing ticks and updates
//!
//! ## Replicas
//!
//! A *master* replica is authoritative: it plans routes and broadcasts an
//! update whenever its movement starts or stops. A *slave* replica only
//! mirrors; it simulates forward between updates and decides per update
//! whether to adopt the incoming state or keep its own trajectory.

pub mod composer;
pub mod driver;
pub mod geometry;
pub mod message;
pub mod planner;
pub mod state;

pub use composer::{
    Clock, EntityHandle, InsertionPoints, ManualClock, MovementComposer, MovementTuning,
    PendingAction, SystemClock,
};
pub use driver::{DriverCommand, SyncDriver};
pub use geometry::{angle, distance, distance_between, shortest_rotation, Point, Position};
pub use message::{Location, Motion, MovementUpdate, Packet};
pub use planner::{PathPlanner, PathPlanningContext, PlanError, WalkabilityGrid};
pub use state::{MotionPhase, MovementSnapshot, MovementState, PersistedMovement};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest UDP payload either side will read; the map travels in one datagram.
pub const MAX_PACKET_SIZE: usize = 65_507;

/// Distance (px) beyond which a slave adopts an incoming update wholesale
pub const MAX_DISTANCE_DELAY: f32 = 200.0;
/// Remaining turn (rad) above which an entity turns in place before stepping off
pub const TURN_DEFER_ANGLE: f64 = std::f64::consts::PI / 8.0;
/// Tick deltas (s) at or above this are treated as a stall and skipped
pub const MAX_TICK_DELTA: f64 = 0.8;
/// Elapsed times (ms) at or below this are treated as plain network latency
pub const LATENCY_COMPENSATION_THRESHOLD_MS: i32 = 500;
/// Inward offset (px) applied to room waypoints, except the last one
pub const ROOM_CORNER_OFFSET: i32 = 5;
/// Max distance (px) between a still update and a still slave for an in-place turn
pub const IN_PLACE_ROTATION_TOLERANCE: f32 = 1.0;

pub const DEFAULT_SPEED: f32 = 60.0;
pub const DEFAULT_ANGULAR_SPEED: f32 = 3.0;

/// Target reported when there is neither a path nor a persisted end point
pub const OFF_SCREEN_POINT: Point = Point::new(-100, -100);
