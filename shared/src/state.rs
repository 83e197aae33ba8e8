//! Kinematic record of one moving entity

use crate::geometry::{Point, Position};
use crate::{DEFAULT_ANGULAR_SPEED, DEFAULT_SPEED, OFF_SCREEN_POINT};
use serde::{Deserialize, Serialize};

/// What the composer is doing on the current tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionPhase {
    Idle,
    Turning,
    Walking,
}

/// Position, heading and path progress of an entity.
///
/// `orientation` is unbounded: it accumulates across turns and is only
/// compared against targets brought onto its branch by
/// [`shortest_rotation`](crate::geometry::shortest_rotation).
#[derive(Debug, Clone)]
pub struct MovementState {
    pub position: Position,
    pub orientation: f64,
    /// Pixels per second
    pub speed: f32,
    /// Radians per second
    pub angular_speed: f32,

    pub path: Option<Vec<Point>>,
    /// Index of the waypoint currently walked towards
    pub path_index: usize,
    pub prev_point: Option<Point>,
    pub next_point: Option<Point>,
    pub next_angle: f64,

    pub walking_along_path: bool,
    pub turning_along_path: bool,
    pub realistic_rotations: bool,
    pub angular_direction: i8,

    /// Last known destination, kept across persistence when no path exists
    pub end_point: Option<Point>,
    /// Wall-clock ms at which the current trajectory began
    pub movement_time_stamp: u64,
    /// Wall-clock ms of the last simulated tick
    pub last_update_time: u64,

    pub use_ending_orientation_value: bool,
    pub ending_orientation: f64,
}

impl Default for MovementState {
    fn default() -> Self {
        Self {
            position: Position::default(),
            orientation: 0.0,
            speed: DEFAULT_SPEED,
            angular_speed: DEFAULT_ANGULAR_SPEED,
            path: None,
            path_index: 0,
            prev_point: None,
            next_point: None,
            next_angle: 0.0,
            walking_along_path: false,
            turning_along_path: false,
            realistic_rotations: false,
            angular_direction: 1,
            end_point: None,
            movement_time_stamp: 0,
            last_update_time: 0,
            use_ending_orientation_value: false,
            ending_orientation: 0.0,
        }
    }
}

impl MovementState {
    pub fn new(position: Position, orientation: f64) -> Self {
        Self {
            position,
            orientation,
            ..Default::default()
        }
    }

    /// Clears every path field, the end point and both motion flags.
    ///
    /// Position, orientation and the speeds are kept.
    pub fn reset(&mut self) {
        self.path = None;
        self.path_index = 0;
        self.prev_point = None;
        self.next_point = None;
        self.end_point = None;
        self.walking_along_path = false;
        self.turning_along_path = false;
    }

    pub fn phase(&self) -> MotionPhase {
        if self.walking_along_path {
            MotionPhase::Walking
        } else if self.turning_along_path {
            MotionPhase::Turning
        } else {
            MotionPhase::Idle
        }
    }

    /// True while translating along a path; an in-place turn does not count.
    pub fn is_moving(&self) -> bool {
        self.walking_along_path
    }

    /// Destination of the current trajectory.
    ///
    /// Falls back to the persisted end point, then to an off-screen sentinel.
    pub fn target_position(&self) -> Point {
        self.path
            .as_ref()
            .and_then(|path| path.last().copied())
            .or(self.end_point)
            .unwrap_or(OFF_SCREEN_POINT)
    }

    /// Current position rounded the way the wire format expects
    pub fn current_point(&self) -> Point {
        self.position.to_point()
    }

    pub fn snapshot(&self) -> MovementSnapshot {
        MovementSnapshot {
            position: self.position,
            orientation: self.orientation,
            moving: self.walking_along_path,
            turning: self.turning_along_path,
            target: self.target_position(),
        }
    }

    pub fn persist(&self) -> PersistedMovement {
        PersistedMovement {
            position: self.current_point(),
            orientation: self.orientation,
            walking_along_path: self.walking_along_path,
            end_point: Some(self.target_position()).filter(|p| *p != OFF_SCREEN_POINT),
            movement_time_stamp: self.movement_time_stamp,
        }
    }
}

/// Read-only view of an entity for rendering or logging
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementSnapshot {
    pub position: Position,
    pub orientation: f64,
    pub moving: bool,
    pub turning: bool,
    pub target: Point,
}

/// Movement fields worth saving with an entity.
///
/// Restoring a walking snapshot replays the remaining trajectory from
/// `movement_time_stamp` once the planner is available.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedMovement {
    pub position: Point,
    pub orientation: f64,
    pub walking_along_path: bool,
    pub end_point: Option<Point>,
    pub movement_time_stamp: u64,
}
