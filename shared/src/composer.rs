//! Per-entity movement state machine and master/slave reconciliation
//!
//! A [`MovementComposer`] owns one [`MovementState`] and is driven from two
//! directions: [`tick`](MovementComposer::tick) advances the simulation, and
//! [`set_update`](MovementComposer::set_update) folds in updates received from
//! the entity's other replicas. Both take `&mut self`; hosts that receive
//! updates concurrently with ticking wrap the composer in a
//! [`SyncDriver`](crate::driver::SyncDriver).

use crate::geometry::{angle, distance, distance_between, shortest_rotation, Point, Position};
use crate::message::{Location, Motion, MovementUpdate};
use crate::planner::PathPlanner;
use crate::state::{MovementSnapshot, MovementState, PersistedMovement};
use crate::{
    IN_PLACE_ROTATION_TOLERANCE, LATENCY_COMPENSATION_THRESHOLD_MS, MAX_DISTANCE_DELAY,
    MAX_TICK_DELTA, TURN_DEFER_ANGLE,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock source in milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// What a composer needs from the entity that owns it.
pub trait EntityHandle: Send + Sync {
    /// True for the authoritative replica.
    fn is_master(&self) -> bool;

    /// Hands an outbound update to the entity's connection. Must not block.
    fn send_message(&self, update: MovementUpdate);

    fn location(&self) -> Option<Location>;

    fn primary_key(&self) -> String;

    fn sync_id(&self) -> u8;

    /// Walking speed in px/s, when the entity overrides the composer's own.
    fn speed(&self) -> Option<f32> {
        None
    }
}

/// Per-location fallback spawn points.
pub trait InsertionPoints: Send + Sync {
    fn insertion_point(&self, location: &Location) -> Option<Point>;
}

/// Thresholds used by the state machine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementTuning {
    pub max_distance_delay: f32,
    pub turn_defer_angle: f64,
    pub max_tick_delta: f64,
    pub latency_compensation_threshold_ms: i32,
    pub in_place_rotation_tolerance: f32,
}

impl Default for MovementTuning {
    fn default() -> Self {
        Self {
            max_distance_delay: MAX_DISTANCE_DELAY,
            turn_defer_angle: TURN_DEFER_ANGLE,
            max_tick_delta: MAX_TICK_DELTA,
            latency_compensation_threshold_ms: LATENCY_COMPENSATION_THRESHOLD_MS,
            in_place_rotation_tolerance: IN_PLACE_ROTATION_TOLERANCE,
        }
    }
}

/// Work deferred until the planner is configured
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PendingAction {
    MoveTo(Point),
    ReconstructTrajectory {
        destination: Point,
        elapsed_ms: i32,
        /// Clock time at which the action was queued; the wait is added to `elapsed_ms`.
        queued_at: u64,
    },
}

pub struct MovementComposer {
    state: MovementState,
    planner: PathPlanner,
    entity: Arc<dyn EntityHandle>,
    world: Arc<dyn InsertionPoints>,
    clock: Arc<dyn Clock>,
    tuning: MovementTuning,
    pending: VecDeque<PendingAction>,
}

impl MovementComposer {
    pub fn new(
        entity: Arc<dyn EntityHandle>,
        world: Arc<dyn InsertionPoints>,
        planner: PathPlanner,
        position: Position,
        orientation: f64,
    ) -> Self {
        Self {
            state: MovementState::new(position, orientation),
            planner,
            entity,
            world,
            clock: Arc::new(SystemClock),
            tuning: MovementTuning::default(),
            pending: VecDeque::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_tuning(mut self, tuning: MovementTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Loads persisted movement fields.
    ///
    /// A snapshot taken mid-walk queues a reconstruction towards its end point,
    /// with the time elapsed since `movement_time_stamp`.
    pub fn restore(&mut self, persisted: PersistedMovement) {
        self.state.reset();
        self.state.position = persisted.position.into();
        self.state.orientation = persisted.orientation;
        self.state.end_point = persisted.end_point;
        self.state.movement_time_stamp = persisted.movement_time_stamp;

        if let (true, Some(destination)) = (persisted.walking_along_path, persisted.end_point) {
            let now = self.clock.now_ms();
            let elapsed_ms = clamp_ms(now.saturating_sub(persisted.movement_time_stamp));
            self.queue_reconstruct(destination, elapsed_ms, now);
        }
    }

    // Accessors

    pub fn state(&self) -> &MovementState {
        &self.state
    }

    pub fn tuning(&self) -> &MovementTuning {
        &self.tuning
    }

    pub fn position(&self) -> Position {
        self.state.position
    }

    pub fn orientation(&self) -> f64 {
        self.state.orientation
    }

    pub fn is_moving(&self) -> bool {
        self.state.is_moving()
    }

    pub fn target_position(&self) -> Point {
        self.state.target_position()
    }

    pub fn snapshot(&self) -> MovementSnapshot {
        self.state.snapshot()
    }

    /// Persisted fields, counting a pending reconstruction as a walk.
    pub fn persist(&self) -> PersistedMovement {
        let mut persisted = self.state.persist();
        if !persisted.walking_along_path {
            if let Some((destination, elapsed_ms)) = self.pending_reconstruct() {
                let elapsed = u64::try_from(elapsed_ms).unwrap_or(0);
                persisted.walking_along_path = true;
                persisted.end_point = Some(destination);
                persisted.movement_time_stamp = self.clock.now_ms().saturating_sub(elapsed);
            }
        }
        persisted
    }

    /// Destination and elapsed time of a trajectory waiting for the planner.
    fn pending_reconstruct(&self) -> Option<(Point, i32)> {
        let now = self.clock.now_ms();
        self.pending.iter().find_map(|action| match *action {
            PendingAction::ReconstructTrajectory {
                destination,
                elapsed_ms,
                queued_at,
            } => {
                let waited = clamp_ms(now.saturating_sub(queued_at));
                Some((destination, elapsed_ms.saturating_add(waited)))
            }
            PendingAction::MoveTo(_) => None,
        })
    }

    pub fn pending_actions(&self) -> impl Iterator<Item = &PendingAction> {
        self.pending.iter()
    }

    pub fn set_speed(&mut self, speed: f32) {
        self.state.speed = speed;
    }

    pub fn set_angular_speed(&mut self, angular_speed: f32) {
        self.state.angular_speed = angular_speed;
    }

    pub fn set_realistic_rotations(&mut self, realistic: bool) {
        self.state.realistic_rotations = realistic;
    }

    /// Teleports the entity and drops any current movement.
    pub fn set_position(&mut self, position: Position) {
        self.state.reset();
        self.state.position = position;
    }

    // Ticking

    /// Per-frame advance.
    ///
    /// Does nothing until the planner is configured; the first configured tick
    /// replays the pending queue before simulating.
    pub fn tick(&mut self) {
        if !self.planner.is_configured() {
            return;
        }
        self.process_pending();
        self.update_path_movement();
    }

    /// Replays deferred actions. Returns true when anything was replayed.
    pub fn process_pending(&mut self) -> bool {
        if self.pending.is_empty() || !self.planner.is_configured() {
            return false;
        }

        let now = self.clock.now_ms();
        while let Some(action) = self.pending.pop_front() {
            debug!("{}: replaying {:?}", self.entity.primary_key(), action);
            match action {
                PendingAction::MoveTo(destination) => self.move_to(destination),
                PendingAction::ReconstructTrajectory {
                    destination,
                    elapsed_ms,
                    queued_at,
                } => {
                    let waited = clamp_ms(now.saturating_sub(queued_at));
                    self.recreate_trajectory(destination, elapsed_ms.saturating_add(waited));
                }
            }
        }
        true
    }

    fn update_path_movement(&mut self) {
        if !self.state.turning_along_path && !self.state.walking_along_path {
            return;
        }

        let now = self.clock.now_ms();
        let delta = (now as i64 - self.state.last_update_time as i64) as f64 / 1000.0;
        self.state.last_update_time = now;

        // Stall or clock regression
        if delta >= self.tuning.max_tick_delta || delta < 0.0 {
            return;
        }

        if self.state.turning_along_path {
            let step = self.state.angular_direction as f64 * self.state.angular_speed as f64 * delta;
            self.state.orientation += step;

            let remaining =
                (self.state.next_angle - self.state.orientation) * self.state.angular_direction as f64;

            if remaining <= 0.0 {
                if self.path_exhausted() {
                    // In-place or final turn
                    self.state.orientation = self.state.next_angle;
                    self.state.use_ending_orientation_value = false;
                    self.state.reset();
                    return;
                }

                self.state.turning_along_path = false;
                if let Some(next) = self.state.next_point {
                    let heading = angle(self.state.current_point(), next);
                    self.state.orientation = shortest_rotation(self.state.orientation, heading).0;
                }
            } else if remaining > self.tuning.turn_defer_angle {
                return;
            }
        }

        if self.path_exhausted() {
            return;
        }

        let step = self.state.speed as f64 * delta;
        let (sin, cos) = self.state.orientation.sin_cos();
        self.state.position.x = (self.state.position.x as f64 + step * cos) as f32;
        self.state.position.y = (self.state.position.y as f64 + step * sin) as f32;

        let here = Some(self.state.current_point());
        let overshoot = distance_between(here, self.state.prev_point)
            - distance_between(self.state.next_point, self.state.prev_point);
        if overshoot < 0.0 {
            return;
        }

        self.state.path_index += 1;
        let next = self
            .state
            .path
            .as_ref()
            .and_then(|path| path.get(self.state.path_index).copied());

        match next {
            Some(next) => {
                self.state.prev_point = here;
                self.state.next_point = Some(next);
                self.update_angular_node();
            }
            None => self.finish_path(),
        }
    }

    /// Snaps onto the final waypoint and either starts the ending turn or stops.
    fn finish_path(&mut self) {
        if let Some(last) = self.state.next_point {
            self.state.position = last.into();
        }
        self.state.orientation = self.state.next_angle;

        if self.state.use_ending_orientation_value {
            if self.state.realistic_rotations {
                let (target, direction) =
                    shortest_rotation(self.state.orientation, self.state.ending_orientation);
                self.state.next_angle = target;
                self.state.angular_direction = direction;
                self.state.turning_along_path = true;
                return;
            }
            self.state.orientation = self.state.ending_orientation;
        }

        self.state.use_ending_orientation_value = false;
        self.stop_movement();
    }

    fn path_exhausted(&self) -> bool {
        match &self.state.path {
            Some(path) => self.state.path_index >= path.len(),
            None => true,
        }
    }

    // Movement control

    /// Plans a route from the current position and starts following it.
    pub fn move_to(&mut self, destination: Point) {
        if !self.planner.is_configured() {
            debug!(
                "{}: planner not configured, deferring move to {:?}",
                self.entity.primary_key(),
                destination
            );
            self.pending
                .retain(|action| !matches!(action, PendingAction::MoveTo(_)));
            self.pending.push_back(PendingAction::MoveTo(destination));
            return;
        }

        let mut start = self.state.current_point();
        if !self.planner.is_valid_start(start) {
            start = self.recover_start(start);
        }

        match self.planner.find_path(start, destination, self.in_room()) {
            Ok(path) => {
                self.update_movement_aspect();
                self.init_movement(path);
                if self.entity.is_master() {
                    self.broadcast();
                }
            }
            Err(e) => {
                debug!(
                    "{}: no movement towards {:?}: {}",
                    self.entity.primary_key(),
                    destination,
                    e
                );
                if self.state.walking_along_path {
                    self.stop_movement();
                } else {
                    self.state.reset();
                }
            }
        }
    }

    /// Moves an entity standing on blocked ground to its location's insertion point.
    fn recover_start(&mut self, invalid: Point) -> Point {
        let key = self.entity.primary_key();
        warn!("{}: invalid start point {:?}", key, invalid);

        let fallback = self
            .entity
            .location()
            .and_then(|location| self.world.insertion_point(&location));

        let start = match fallback {
            Some(point) => {
                info!("{}: found a new valid start point {:?}", key, point);
                point
            }
            None => {
                error!("{}: could not find a valid start point", key);
                Point::new(0, 0)
            }
        };

        self.state.position = start.into();
        start
    }

    /// Instant turn, not smoothed.
    pub fn rotate_to(&mut self, orientation: f64) {
        self.state.orientation = orientation;
        if self.entity.is_master() {
            self.broadcast();
        }
    }

    /// Rebuilds a trajectory towards `destination` for an entity that has
    /// already been travelling for `elapsed_ms`.
    pub fn recreate_trajectory(&mut self, destination: Point, elapsed_ms: i32) {
        if !self.planner.is_configured() {
            let now = self.clock.now_ms();
            self.queue_reconstruct(destination, elapsed_ms, now);
            return;
        }

        let from = self.state.current_point();
        match self.planner.find_path(from, destination, self.in_room()) {
            Ok(path) => {
                self.update_movement_aspect();
                if elapsed_ms > self.tuning.latency_compensation_threshold_ms {
                    self.init_movement_elapsed(path, elapsed_ms);
                } else {
                    self.init_movement(path);
                }
            }
            Err(e) => {
                info!(
                    "{}: failed to re-create path to {:?}: {}",
                    self.entity.primary_key(),
                    destination,
                    e
                );
                if self.entity.is_master() {
                    self.stop_movement();
                } else {
                    self.state.reset();
                }
            }
        }
    }

    /// Starts following `path` from the current position.
    pub fn init_movement(&mut self, path: Vec<Point>) {
        if path.len() < 2 {
            warn!("{}: invalid path {:?}", self.entity.primary_key(), path);
            self.state.reset();
            return;
        }

        let now = self.clock.now_ms();
        self.state.path_index = 1;
        self.state.last_update_time = now;
        self.state.movement_time_stamp = now;
        self.state.prev_point = Some(self.state.current_point());
        self.state.next_point = Some(path[1]);
        self.state.path = Some(path);

        self.update_angular_node();
        self.state.walking_along_path = true;
    }

    /// Starts following `path` at the point reached after `elapsed_ms` of travel
    /// from its first waypoint at the current speed.
    ///
    /// When the whole path would already be walked, the entity is left idle on
    /// the last waypoint.
    pub fn init_movement_elapsed(&mut self, path: Vec<Point>, elapsed_ms: i32) {
        if path.len() < 2 {
            self.state.reset();
            return;
        }

        let travelled = ((elapsed_ms as f32 / 1000.0) * self.state.speed) as f64;
        let mut covered = 0.0f64;
        let mut reached = None;

        for (i, segment) in path.windows(2).enumerate() {
            covered += distance(segment[0], segment[1]) as f64;
            if covered >= travelled {
                reached = Some((i, segment[0], segment[1]));
                break;
            }
        }

        if let Some((i, a0, a1)) = reached {
            let heading = angle(a0, a1);
            let back = covered - travelled;
            self.state.orientation = heading;
            self.state.position = Position::new(
                (a1.x as f64 - back * heading.cos()) as f32,
                (a1.y as f64 - back * heading.sin()) as f32,
            );

            let now = self.clock.now_ms();
            self.state.path_index = i + 1;
            self.state.prev_point = Some(a0);
            self.state.next_point = Some(a1);
            self.state.last_update_time = now;
            self.state.movement_time_stamp = now;
            self.state.path = Some(path);

            self.update_angular_node();
            self.state.walking_along_path = true;
            return;
        }

        let last = path.len() - 1;
        self.state.orientation = angle(path[last - 1], path[last]);
        self.state.position = path[last].into();

        if self.entity.is_master() {
            self.stop_movement();
        } else {
            self.state.reset();
        }
    }

    /// Resolves the heading of the segment `prev -> next` and the turn towards it.
    fn update_angular_node(&mut self) {
        let (Some(prev), Some(next)) = (self.state.prev_point, self.state.next_point) else {
            return;
        };

        let (target, direction) = shortest_rotation(self.state.orientation, angle(prev, next));
        self.state.next_angle = target;
        self.state.angular_direction = direction;

        if self.state.realistic_rotations {
            self.state.turning_along_path = true;
        } else {
            self.state.turning_along_path = false;
            self.state.orientation = target;
        }
    }

    fn update_movement_aspect(&mut self) {
        self.state.realistic_rotations = self.in_room();
        if let Some(speed) = self.entity.speed() {
            self.state.speed = speed;
        }
    }

    fn in_room(&self) -> bool {
        self.entity
            .location()
            .map(|location| location.is_room())
            .unwrap_or(false)
    }

    /// Drops the current movement and tells the other replicas if we are master.
    pub fn stop_movement(&mut self) {
        self.state.reset();
        if self.entity.is_master() {
            self.broadcast();
        }
    }

    fn queue_reconstruct(&mut self, destination: Point, elapsed_ms: i32, queued_at: u64) {
        self.pending
            .retain(|action| !matches!(action, PendingAction::ReconstructTrajectory { .. }));
        self.pending.push_back(PendingAction::ReconstructTrajectory {
            destination,
            elapsed_ms,
            queued_at,
        });
    }

    // Reconciliation

    /// Folds in an update from another replica of this entity.
    ///
    /// The caller has already checked the primary key and sync id.
    pub fn set_update(&mut self, update: &MovementUpdate) {
        self.state.use_ending_orientation_value = false;

        if !self.planner.is_configured() {
            self.adopt_unplanned(update);
            return;
        }

        let here = self.state.current_point();
        let take_update = match (self.state.walking_along_path, update.motion) {
            (true, Motion::Moving { destination, .. }) => {
                if distance(update.source, here) > self.tuning.max_distance_delay {
                    true
                } else {
                    match self.planner.find_path(here, destination, self.in_room()) {
                        Ok(path) => {
                            // Keep our own position, only the route changes
                            self.update_movement_aspect();
                            self.init_movement(path);
                            false
                        }
                        Err(_) => true,
                    }
                }
            }
            (true, Motion::Stopped) => {
                let target = self.state.target_position();
                if target != update.source
                    || distance(target, here) > self.tuning.max_distance_delay
                {
                    true
                } else {
                    self.state.use_ending_orientation_value = true;
                    self.state.ending_orientation = update.orientation as f64;
                    false
                }
            }
            (false, Motion::Stopped) if self.within_rotation_tolerance(update.source) => {
                self.start_in_place_turn(update.orientation as f64);
                false
            }
            _ => true,
        };

        if !take_update {
            return;
        }

        debug!(
            "{}: taking update at {:?}",
            self.entity.primary_key(),
            update.source
        );
        self.state.position = update.source.into();
        self.state.orientation = update.orientation as f64;

        match update.motion {
            Motion::Moving {
                destination,
                delta_ms,
            } => self.recreate_trajectory(destination, delta_ms),
            Motion::Stopped => self.state.reset(),
        }
    }

    /// Without a planner the update is adopted as-is and the route is rebuilt later.
    fn adopt_unplanned(&mut self, update: &MovementUpdate) {
        self.state.reset();
        self.state.position = update.source.into();
        self.state.orientation = update.orientation as f64;

        match update.motion {
            Motion::Moving {
                destination,
                delta_ms,
            } => {
                let now = self.clock.now_ms();
                self.state.end_point = Some(destination);
                self.state.movement_time_stamp = now;
                self.queue_reconstruct(destination, delta_ms, now);
            }
            Motion::Stopped => {
                self.pending
                    .retain(|action| !matches!(action, PendingAction::ReconstructTrajectory { .. }));
            }
        }
    }

    fn within_rotation_tolerance(&self, source: Point) -> bool {
        let tolerance = self.tuning.in_place_rotation_tolerance;
        (self.state.position.x - source.x as f32).abs() <= tolerance
            && (self.state.position.y - source.y as f32).abs() <= tolerance
    }

    fn start_in_place_turn(&mut self, orientation: f64) {
        let (target, direction) = shortest_rotation(self.state.orientation, orientation);
        self.state.path = None;
        self.state.next_angle = target;
        self.state.angular_direction = direction;
        self.state.turning_along_path = true;
        self.state.use_ending_orientation_value = true;
        self.state.last_update_time = self.clock.now_ms();
    }

    // Outbound updates

    /// Update describing the current state, for a peer that asked for it.
    ///
    /// The primary key is only attached while no planner is configured.
    pub fn get_update(&self) -> MovementUpdate {
        let key = if self.planner.is_configured() {
            None
        } else {
            Some(self.entity.primary_key())
        };
        self.movement_message(key)
    }

    fn movement_message(&self, primary_key: Option<String>) -> MovementUpdate {
        let motion = if self.state.walking_along_path {
            let now = self.clock.now_ms();
            Motion::Moving {
                destination: self.state.target_position(),
                delta_ms: clamp_ms(now.saturating_sub(self.state.movement_time_stamp)),
            }
        } else if let Some((destination, delta_ms)) = self.pending_reconstruct() {
            // Adopted without a planner, still walking as far as peers know
            Motion::Moving {
                destination,
                delta_ms,
            }
        } else {
            Motion::Stopped
        };

        MovementUpdate {
            primary_key,
            sync_id: self.entity.sync_id(),
            source: self.state.current_point(),
            orientation: self.state.orientation as f32,
            motion,
        }
    }

    fn broadcast(&self) {
        let update = self.movement_message(Some(self.entity.primary_key()));
        self.entity.send_message(update);
    }
}

fn clamp_ms(ms: u64) -> i32 {
    i32::try_from(ms).unwrap_or(i32::MAX)
}
