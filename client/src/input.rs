//! Where the local player wants to go next
//!
//! A headless client has no keyboard or mouse; destinations come from a
//! fixed waypoint loop or from random walkable tiles.

use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use shared::{PathPlanningContext, Point};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaypointError {
    #[error("waypoint '{0}' is not of the form x,y")]
    Malformed(String),
    #[error("no waypoints given")]
    Empty,
}

/// Parses `"x,y;x,y;..."` into pixel points.
pub fn parse_waypoints(text: &str) -> Result<Vec<Point>, WaypointError> {
    let points = text
        .split(';')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            let (x, y) = item
                .split_once(',')
                .ok_or_else(|| WaypointError::Malformed(item.to_string()))?;
            let x = x
                .trim()
                .parse()
                .map_err(|_| WaypointError::Malformed(item.to_string()))?;
            let y = y
                .trim()
                .parse()
                .map_err(|_| WaypointError::Malformed(item.to_string()))?;
            Ok(Point::new(x, y))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if points.is_empty() {
        return Err(WaypointError::Empty);
    }
    Ok(points)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntentMode {
    Idle,
    /// Visits the points in order, forever.
    Waypoints(Vec<Point>),
    /// Picks a random clear tile each time.
    Wander,
}

/// Produces the next destination whenever the local player stands still
pub struct MoveIntentSource {
    mode: IntentMode,
    next_index: usize,
    rng: StdRng,
}

impl MoveIntentSource {
    pub fn new(mode: IntentMode, seed: u64) -> Self {
        Self {
            mode,
            next_index: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn mode(&self) -> &IntentMode {
        &self.mode
    }

    /// Next destination, or `None` when idle or the map is not known yet for wandering.
    pub fn next_destination(&mut self, context: Option<&PathPlanningContext>) -> Option<Point> {
        match &self.mode {
            IntentMode::Idle => None,
            IntentMode::Waypoints(points) => {
                let point = *points.get(self.next_index % points.len().max(1))?;
                self.next_index = (self.next_index + 1) % points.len();
                Some(point)
            }
            IntentMode::Wander => {
                let context = context?;
                context
                    .grid()
                    .walkable_tiles()
                    .filter(|tile| context.is_clear(*tile))
                    .choose(&mut self.rng)
                    .map(|tile| context.to_pixel(tile))
            }
        }
    }
}
