//! Route planning over a static walkability mask
//!
//! The mask is expressed in tiles; routes come back in pixel space. A
//! [`PathPlanningContext`] bundles the mask with the tile size and the entity
//! footprint and is immutable once built. Hosts share it through a
//! [`PathPlanner`] handle, which starts out empty and is configured exactly
//! once (at world/server startup, or when a client receives the world info).
//! Until then every planning request reports [`PlanError::NotConfigured`] and
//! callers defer their work.

use crate::geometry::{angle, Point};
use crate::ROOM_CORNER_OFFSET;
use pathfinding::prelude::astar;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Cost of an axis-aligned step between two tiles
const STRAIGHT_COST: u32 = 10;
/// Cost of a diagonal step between two tiles
const DIAGONAL_COST: u32 = 14;
/// Sampling step (in tiles) of the line-of-sight check used when smoothing
const LINE_SAMPLE_STEP: f64 = 0.25;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error("path planning is not configured yet")]
    NotConfigured,

    #[error("path planning is already configured")]
    AlreadyConfigured,

    #[error("no walkable goal near tile ({x}, {y})")]
    InvalidGoal { x: i32, y: i32 },

    #[error("no route between the requested points")]
    NoRoute,

    #[error("invalid walkability mask: {0}")]
    InvalidMask(String),

    #[error("invalid planning parameter: {0}")]
    InvalidParameter(String),
}

/// Boolean walkability mask, one cell per tile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkabilityGrid {
    width: usize,
    height: usize,
    cells: Vec<bool>,
}

impl WalkabilityGrid {
    /// Builds a grid from row-major cells (`cells[y * width + x]`).
    pub fn new(width: usize, height: usize, cells: Vec<bool>) -> Result<Self, PlanError> {
        if width == 0 || height == 0 {
            return Err(PlanError::InvalidMask("grid must not be empty".to_string()));
        }
        if cells.len() != width * height {
            return Err(PlanError::InvalidMask(format!(
                "expected {} cells, got {}",
                width * height,
                cells.len()
            )));
        }

        Ok(Self {
            width,
            height,
            cells,
        })
    }

    /// A grid where every tile is walkable.
    pub fn open(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            cells: vec![true; width * height],
        }
    }

    /// An open field surrounded by a one-tile blocked border.
    pub fn bordered(width: usize, height: usize) -> Self {
        let mut grid = Self::open(width, height);
        for x in 0..width {
            grid.set(x, 0, false);
            grid.set(x, height.saturating_sub(1), false);
        }
        for y in 0..height {
            grid.set(0, y, false);
            grid.set(width.saturating_sub(1), y, false);
        }
        grid
    }

    /// Parses an ASCII mask: `.` is walkable, `#` is blocked.
    ///
    /// All rows must have the same length.
    pub fn from_rows<S: AsRef<str>>(rows: &[S]) -> Result<Self, PlanError> {
        let height = rows.len();
        let width = rows.first().map(|r| r.as_ref().chars().count()).unwrap_or(0);
        let mut cells = Vec::with_capacity(width * height);

        for (y, row) in rows.iter().enumerate() {
            let row = row.as_ref();
            if row.chars().count() != width {
                return Err(PlanError::InvalidMask(format!(
                    "row {} has {} columns, expected {}",
                    y,
                    row.chars().count(),
                    width
                )));
            }
            for (x, c) in row.chars().enumerate() {
                match c {
                    '.' => cells.push(true),
                    '#' => cells.push(false),
                    other => {
                        return Err(PlanError::InvalidMask(format!(
                            "unexpected '{}' at ({}, {})",
                            other, x, y
                        )))
                    }
                }
            }
        }

        Self::new(width, height, cells)
    }

    /// Renders the mask back into the ASCII form accepted by [`Self::from_rows`].
    pub fn to_rows(&self) -> Vec<String> {
        (0..self.height)
            .map(|y| {
                (0..self.width)
                    .map(|x| if self.cells[y * self.width + x] { '.' } else { '#' })
                    .collect()
            })
            .collect()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn set(&mut self, x: usize, y: usize, walkable: bool) {
        if x < self.width && y < self.height {
            self.cells[y * self.width + x] = walkable;
        }
    }

    /// Out-of-bounds tiles are never walkable.
    pub fn is_walkable(&self, x: i32, y: i32) -> bool {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return false;
        }
        self.cells[y as usize * self.width + x as usize]
    }

    /// Iterates over every walkable tile.
    pub fn walkable_tiles(&self) -> impl Iterator<Item = Point> + '_ {
        (0..self.height).flat_map(move |y| {
            (0..self.width).filter_map(move |x| {
                self.cells[y * self.width + x].then(|| Point::new(x as i32, y as i32))
            })
        })
    }
}

/// Immutable planning configuration: mask, tile size and entity footprint
#[derive(Debug, Clone)]
pub struct PathPlanningContext {
    grid: WalkabilityGrid,
    tile_size: i32,
    footprint: i32,
}

impl PathPlanningContext {
    /// `footprint` is the average entity size in tiles (at least 1).
    pub fn new(grid: WalkabilityGrid, tile_size: u32, footprint: u32) -> Result<Self, PlanError> {
        if tile_size == 0 {
            return Err(PlanError::InvalidParameter("tile size must be positive".to_string()));
        }
        if footprint == 0 {
            return Err(PlanError::InvalidParameter("footprint must be positive".to_string()));
        }

        Ok(Self {
            grid,
            tile_size: tile_size as i32,
            footprint: footprint as i32,
        })
    }

    pub fn grid(&self) -> &WalkabilityGrid {
        &self.grid
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size as u32
    }

    pub fn footprint(&self) -> u32 {
        self.footprint as u32
    }

    /// Pixel point to tile coordinate, truncating towards zero.
    ///
    /// Room waypoints sit a few pixels left of or above column and row 0;
    /// those still belong to tile 0.
    pub fn to_tile(&self, p: Point) -> Point {
        Point::new(p.x / self.tile_size, p.y / self.tile_size)
    }

    /// Tile coordinate to the pixel point at its top-left corner.
    pub fn to_pixel(&self, tile: Point) -> Point {
        Point::new(tile.x * self.tile_size, tile.y * self.tile_size)
    }

    fn span(&self) -> i32 {
        self.footprint - 1
    }

    /// True when an entity whose footprint starts at `tile` fits on walkable ground.
    pub fn is_clear(&self, tile: Point) -> bool {
        let span = self.span();
        self.grid.is_walkable(tile.x, tile.y)
            && self.grid.is_walkable(tile.x, tile.y + span)
            && self.grid.is_walkable(tile.x + span, tile.y)
            && self.grid.is_walkable(tile.x + span, tile.y + span)
    }

    /// True when the pixel point is a legal place to start a route from.
    pub fn is_valid_start(&self, p: Point) -> bool {
        self.is_clear(self.to_tile(p))
    }

    /// Nudges a blocked goal tile by one footprint towards the first clear neighbour.
    pub fn adjust_goal(&self, goal: Point) -> Option<Point> {
        if self.is_clear(goal) {
            return Some(goal);
        }

        let step = self.span().max(1);
        let probes = [
            (step, 0),
            (step, step),
            (0, step),
            (-step, step),
            (-step, 0),
            (-step, -step),
            (0, -step),
            (step, -step),
        ];

        probes
            .iter()
            .map(|&(dx, dy)| Point::new(goal.x + dx, goal.y + dy))
            .find(|&candidate| self.is_clear(candidate))
    }

    fn successors(&self, tile: &Point) -> Vec<(Point, u32)> {
        let mut next = Vec::with_capacity(8);
        for dy in -1..=1 {
            for dx in -1..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let candidate = Point::new(tile.x + dx, tile.y + dy);
                if self.is_clear(candidate) {
                    let cost = if dx != 0 && dy != 0 {
                        DIAGONAL_COST
                    } else {
                        STRAIGHT_COST
                    };
                    next.push((candidate, cost));
                }
            }
        }
        next
    }

    /// Raw 8-connected tile route, both ends included.
    pub fn search(&self, start: Point, goal: Point) -> Option<Vec<Point>> {
        astar(
            &start,
            |tile| self.successors(tile),
            |tile| {
                // Octile distance, consistent with the step costs above
                let dx = (goal.x - tile.x).unsigned_abs();
                let dy = (goal.y - tile.y).unsigned_abs();
                STRAIGHT_COST * dx.max(dy) + (DIAGONAL_COST - STRAIGHT_COST) * dx.min(dy)
            },
            |tile| *tile == goal,
        )
        .map(|(route, _)| route)
    }

    /// True when the straight line between two tiles only crosses clear tiles.
    pub fn line_walkable(&self, a: Point, b: Point) -> bool {
        if a == b {
            return true;
        }

        let heading = angle(a, b);
        let (sin, cos) = heading.sin_cos();
        let length = (((b.x - a.x) as f64).powi(2) + ((b.y - a.y) as f64).powi(2)).sqrt();

        let mut r = LINE_SAMPLE_STEP;
        while r < length {
            let x = (a.x as f64 + r * cos) as i32;
            let y = (a.y as f64 + r * sin) as i32;
            if !self.is_clear(Point::new(x, y)) {
                return false;
            }
            r += LINE_SAMPLE_STEP;
        }
        true
    }

    /// Drops every waypoint that the previous kept waypoint can see past.
    pub fn smooth(&self, route: Vec<Point>) -> Vec<Point> {
        if route.len() < 3 {
            return route;
        }

        let mut smoothed = Vec::with_capacity(route.len());
        let mut checkpoint = route[0];
        let mut index = 1;
        smoothed.push(checkpoint);

        while index + 1 < route.len() {
            if !self.line_walkable(checkpoint, route[index + 1]) {
                checkpoint = route[index];
                smoothed.push(checkpoint);
            }
            index += 1;
        }

        smoothed.push(route[index]);
        smoothed
    }

    /// Plans a pixel-space route from `from` to `to`.
    ///
    /// Inside rooms every waypoint but the last is pulled 5px up-left so that
    /// entities do not clip the room's corners.
    pub fn find_path(&self, from: Point, to: Point, in_room: bool) -> Result<Vec<Point>, PlanError> {
        let start = self.to_tile(from);
        let requested = self.to_tile(to);
        let goal = self.adjust_goal(requested).ok_or(PlanError::InvalidGoal {
            x: requested.x,
            y: requested.y,
        })?;

        let route = self.search(start, goal).ok_or(PlanError::NoRoute)?;
        let route = self.smooth(route);

        if route.len() < 2 {
            return Err(PlanError::NoRoute);
        }

        let last = route.len() - 1;
        Ok(route
            .into_iter()
            .enumerate()
            .map(|(i, tile)| {
                let p = self.to_pixel(tile);
                if in_room && i != last {
                    Point::new(p.x - ROOM_CORNER_OFFSET, p.y - ROOM_CORNER_OFFSET)
                } else {
                    p
                }
            })
            .collect())
    }
}

/// Shared, write-once handle to the process-wide planning context
///
/// Cloning the handle shares the same slot, so every composer created from it
/// sees the context as soon as one host configures it.
#[derive(Debug, Clone, Default)]
pub struct PathPlanner {
    context: Arc<OnceLock<PathPlanningContext>>,
}

impl PathPlanner {
    /// An unconfigured planner.
    pub fn new() -> Self {
        Self::default()
    }

    /// A planner configured from the start.
    pub fn configured(context: PathPlanningContext) -> Self {
        let planner = Self::new();
        let _ = planner.context.set(context);
        planner
    }

    pub fn configure(&self, context: PathPlanningContext) -> Result<(), PlanError> {
        self.context
            .set(context)
            .map_err(|_| PlanError::AlreadyConfigured)
    }

    pub fn is_configured(&self) -> bool {
        self.context.get().is_some()
    }

    pub fn context(&self) -> Option<&PathPlanningContext> {
        self.context.get()
    }

    pub fn find_path(&self, from: Point, to: Point, in_room: bool) -> Result<Vec<Point>, PlanError> {
        self.context
            .get()
            .ok_or(PlanError::NotConfigured)?
            .find_path(from, to, in_room)
    }

    /// An unconfigured planner accepts no start point.
    pub fn is_valid_start(&self, p: Point) -> bool {
        self.context
            .get()
            .map(|context| context.is_valid_start(p))
            .unwrap_or(false)
    }
}
