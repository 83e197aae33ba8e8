//! Planar helpers shared by the path planner and the movement composer.
//!
//! Waypoints and wire positions are integer pixel coordinates ([`Point`]),
//! while a moving entity keeps a sub-pixel [`Position`] between ticks.

use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI, TAU};

/// Integer pixel (or tile) coordinate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Sub-pixel position of a moving entity
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

impl Position {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Truncates towards zero, the same rounding the wire format uses.
    pub fn to_point(self) -> Point {
        Point::new(self.x as i32, self.y as i32)
    }
}

impl From<Point> for Position {
    fn from(p: Point) -> Self {
        Position::new(p.x as f32, p.y as f32)
    }
}

/// Euclidean distance between two points.
pub fn distance(a: Point, b: Point) -> f32 {
    let dx = (b.x - a.x) as f64;
    let dy = (b.y - a.y) as f64;
    (dx * dx + dy * dy).sqrt() as f32
}

/// Like [`distance`], but a missing operand counts as zero distance.
///
/// Path-end checks run against `prev_point`/`next_point`, which are unset
/// while the composer is idle.
pub fn distance_between(a: Option<Point>, b: Option<Point>) -> f32 {
    match (a, b) {
        (Some(a), Some(b)) => distance(a, b),
        _ => 0.0,
    }
}

/// Heading of the line `a -> b` against the horizontal, in `(-PI, PI]`.
///
/// The vertical case is resolved explicitly so that `angle((0,0),(0,10))`
/// is exactly `PI / 2`.
pub fn angle(a: Point, b: Point) -> f64 {
    if b.x == a.x {
        return if b.y > a.y {
            FRAC_PI_2
        } else if b.y < a.y {
            -FRAC_PI_2
        } else {
            0.0
        };
    }

    let angle = ((b.y - a.y) as f64 / (b.x - a.x) as f64).atan();

    if b.x < a.x {
        if angle > 0.0 {
            angle - PI
        } else {
            angle + PI
        }
    } else {
        angle
    }
}

/// Picks the branch of `target` nearest to `current` and the turn direction.
///
/// Orientation accumulates across many path segments, so the target is
/// shifted one full turn at a time rather than reduced with a single modulo.
/// The returned direction is `-1` when `current > target`, `+1` otherwise.
pub fn shortest_rotation(current: f64, target: f64) -> (f64, i8) {
    let mut target = target;

    while target - current > PI {
        target -= TAU;
    }
    while target - current < -PI {
        target += TAU;
    }

    let direction = if current > target { -1 } else { 1 };
    (target, direction)
}
