//! Movement updates and the client/server wire protocol
//!
//! Packets are serialized with bincode and carried over UDP.

use crate::geometry::Point;
use serde::{Deserialize, Serialize};

/// Spatial container an entity lives in.
///
/// Only rooms change how routes are planned (corner offset, progressive turns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Location {
    World(u32),
    Town(u32),
    Room(u32),
}

impl Location {
    pub fn is_room(&self) -> bool {
        matches!(self, Location::Room(_))
    }

    pub fn is_town(&self) -> bool {
        matches!(self, Location::Town(_))
    }

    pub fn is_world(&self) -> bool {
        matches!(self, Location::World(_))
    }
}

impl Default for Location {
    fn default() -> Self {
        Location::World(0)
    }
}

/// Whether the sender is walking when the update was built
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Motion {
    /// `delta_ms` is the time the sender has spent on its current trajectory.
    Moving { destination: Point, delta_ms: i32 },
    Stopped,
}

/// Movement state of one entity as seen by its sender
///
/// `primary_key` is present on updates built while the sender has no
/// configured planner, and on every update a master sends on its own
/// initiative. Receivers must accept both forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovementUpdate {
    pub primary_key: Option<String>,
    pub sync_id: u8,
    pub source: Point,
    pub orientation: f32,
    pub motion: Motion,
}

impl MovementUpdate {
    /// Update for an entity standing still at `source`.
    pub fn stopped(primary_key: Option<String>, sync_id: u8, source: Point, orientation: f32) -> Self {
        Self {
            primary_key,
            sync_id,
            source,
            orientation,
            motion: Motion::Stopped,
        }
    }

    pub fn is_moving(&self) -> bool {
        matches!(self.motion, Motion::Moving { .. })
    }

    pub fn destination(&self) -> Option<Point> {
        match self.motion {
            Motion::Moving { destination, .. } => Some(destination),
            Motion::Stopped => None,
        }
    }

    pub fn delta_ms(&self) -> i32 {
        match self.motion {
            Motion::Moving { delta_ms, .. } => delta_ms,
            Motion::Stopped => 0,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    // Client -> server
    Connect {
        client_version: u32,
        name: String,
    },
    MovementUpdate(MovementUpdate),
    ChangeLocation {
        location: Location,
    },
    /// Keeps an idle client from timing out.
    Heartbeat,
    Disconnect,

    // Server -> client
    Connected {
        client_id: u32,
        primary_key: String,
        sync_id: u8,
        location: Location,
        spawn: Point,
    },
    WorldInfo {
        tile_size: u32,
        footprint: u32,
        rows: Vec<String>,
    },
    EntityUpdate {
        primary_key: String,
        update: MovementUpdate,
    },
    EntityRemoved {
        primary_key: String,
    },
    LocationChanged {
        sync_id: u8,
        location: Location,
        position: Point,
    },
    Disconnected {
        reason: String,
    },
}
