//! Authoritative world: every entity's movement replica on the server
//!
//! Players are slave replicas fed from their clients' updates. NPCs are
//! server-side masters that wander between random walkable tiles and
//! announce their movement through the outbound channel.

use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::IteratorRandom;
use rand::{Rng, SeedableRng};
use shared::{
    EntityHandle, InsertionPoints, Location, MovementComposer, MovementUpdate, PathPlanner,
    PathPlanningContext, Point, Position, SyncDriver,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Speed of wandering NPCs in px/s
pub const NPC_SPEED: f32 = 45.0;
/// Chance per wander round that an NPC picks a new destination
pub const NPC_WANDER_CHANCE: f64 = 0.3;

/// Movement update produced by a server-side master
pub type EntityEvent = (String, MovementUpdate);

/// Server-side view of an entity, as seen by its composer
pub struct ServerEntity {
    primary_key: String,
    master: bool,
    speed: Option<f32>,
    location: RwLock<Location>,
    sync_id: AtomicU8,
    outbound: mpsc::UnboundedSender<EntityEvent>,
}

impl ServerEntity {
    fn new(
        primary_key: String,
        master: bool,
        speed: Option<f32>,
        location: Location,
        outbound: mpsc::UnboundedSender<EntityEvent>,
    ) -> Self {
        Self {
            primary_key,
            master,
            speed,
            location: RwLock::new(location),
            sync_id: AtomicU8::new(0),
            outbound,
        }
    }

    fn set_location(&self, location: Location, sync_id: u8) {
        if let Ok(mut current) = self.location.write() {
            *current = location;
        }
        self.sync_id.store(sync_id, Ordering::SeqCst);
    }
}

impl EntityHandle for ServerEntity {
    fn is_master(&self) -> bool {
        self.master
    }

    fn send_message(&self, update: MovementUpdate) {
        if self
            .outbound
            .send((self.primary_key.clone(), update))
            .is_err()
        {
            debug!("{}: outbound channel closed", self.primary_key);
        }
    }

    fn location(&self) -> Option<Location> {
        self.location.read().ok().map(|location| *location)
    }

    fn primary_key(&self) -> String {
        self.primary_key.clone()
    }

    fn sync_id(&self) -> u8 {
        self.sync_id.load(Ordering::SeqCst)
    }

    fn speed(&self) -> Option<f32> {
        self.speed
    }
}

/// Insertion points per location, with a map-wide default
#[derive(Debug, Default)]
pub struct WorldInsertionPoints {
    points: RwLock<HashMap<Location, Point>>,
    default: Option<Point>,
}

impl WorldInsertionPoints {
    pub fn new(default: Option<Point>) -> Self {
        Self {
            points: RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn set(&self, location: Location, point: Point) {
        if let Ok(mut points) = self.points.write() {
            points.insert(location, point);
        }
    }
}

impl InsertionPoints for WorldInsertionPoints {
    fn insertion_point(&self, location: &Location) -> Option<Point> {
        self.points
            .read()
            .ok()
            .and_then(|points| points.get(location).copied())
            .or(self.default)
    }
}

struct WorldEntity {
    handle: Arc<ServerEntity>,
    driver: SyncDriver,
}

pub struct World {
    planner: PathPlanner,
    insertion_points: Arc<WorldInsertionPoints>,
    entities: HashMap<String, WorldEntity>,
    npcs: Vec<String>,
    outbound: mpsc::UnboundedSender<EntityEvent>,
    rng: StdRng,
}

impl World {
    /// Creates the world and the channel NPC updates are announced on.
    pub fn new(
        context: PathPlanningContext,
        seed: u64,
    ) -> (Self, mpsc::UnboundedReceiver<EntityEvent>) {
        let default_spawn = context
            .grid()
            .walkable_tiles()
            .find(|tile| context.is_clear(*tile))
            .map(|tile| context.to_pixel(tile));

        if default_spawn.is_none() {
            warn!("Map has no walkable tile, entities will spawn at the origin");
        }

        let (outbound, events) = mpsc::unbounded_channel();
        let world = Self {
            planner: PathPlanner::configured(context),
            insertion_points: Arc::new(WorldInsertionPoints::new(default_spawn)),
            entities: HashMap::new(),
            npcs: Vec::new(),
            outbound,
            rng: StdRng::seed_from_u64(seed),
        };
        (world, events)
    }

    pub fn planner(&self) -> &PathPlanner {
        &self.planner
    }

    pub fn insertion_points(&self) -> &WorldInsertionPoints {
        &self.insertion_points
    }

    pub fn insertion_point(&self, location: &Location) -> Point {
        self.insertion_points
            .insertion_point(location)
            .unwrap_or_default()
    }

    fn spawn(
        &mut self,
        primary_key: String,
        master: bool,
        speed: Option<f32>,
        location: Location,
        at: Point,
    ) {
        let handle = Arc::new(ServerEntity::new(
            primary_key.clone(),
            master,
            speed,
            location,
            self.outbound.clone(),
        ));
        let composer = MovementComposer::new(
            handle.clone(),
            self.insertion_points.clone(),
            self.planner.clone(),
            at.into(),
            0.0,
        );
        let driver = SyncDriver::spawn(composer);
        self.entities
            .insert(primary_key, WorldEntity { handle, driver });
    }

    /// Adds a client-controlled entity at its location's insertion point.
    pub fn spawn_player(&mut self, primary_key: &str, location: Location) -> Point {
        let spawn = self.insertion_point(&location);
        self.spawn(primary_key.to_string(), false, None, location, spawn);
        info!("Added {} at ({}, {})", primary_key, spawn.x, spawn.y);
        spawn
    }

    /// Adds `count` wandering NPCs on random walkable tiles.
    pub fn spawn_npcs(&mut self, count: usize) {
        for _ in 0..count {
            let Some(at) = self.random_clear_point() else {
                warn!("No room left for NPCs");
                return;
            };
            let primary_key = format!("npc#{}", self.npcs.len() + 1);
            self.spawn(
                primary_key.clone(),
                true,
                Some(NPC_SPEED),
                Location::default(),
                at,
            );
            debug!("Spawned {} at ({}, {})", primary_key, at.x, at.y);
            self.npcs.push(primary_key);
        }
    }

    pub fn remove_entity(&mut self, primary_key: &str) -> bool {
        self.npcs.retain(|key| key != primary_key);
        if self.entities.remove(primary_key).is_some() {
            info!("Removed {}", primary_key);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, primary_key: &str) -> bool {
        self.entities.contains_key(primary_key)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn npc_keys(&self) -> &[String] {
        &self.npcs
    }

    /// Hands a validated update to the entity's composer.
    pub fn apply_update(&self, primary_key: &str, update: MovementUpdate) -> bool {
        match self.entities.get(primary_key) {
            Some(entity) => entity.driver.apply_update(update),
            None => false,
        }
    }

    /// Teleports an entity to the insertion point of `location`.
    pub fn change_location(
        &self,
        primary_key: &str,
        location: Location,
        sync_id: u8,
    ) -> Option<Point> {
        let entity = self.entities.get(primary_key)?;
        let position = self.insertion_point(&location);
        entity.handle.set_location(location, sync_id);
        entity.driver.teleport(Position::from(position));
        Some(position)
    }

    pub fn tick(&self) {
        for entity in self.entities.values() {
            entity.driver.tick();
        }
    }

    /// Sends some NPCs towards a new random destination.
    pub fn wander_npcs(&mut self) {
        let npcs = self.npcs.clone();
        for key in npcs {
            if !self.rng.gen_bool(NPC_WANDER_CHANCE) {
                continue;
            }
            let Some(destination) = self.random_clear_point() else {
                return;
            };
            if let Some(entity) = self.entities.get(&key) {
                entity.driver.move_to(destination);
            }
        }
    }

    fn random_clear_point(&mut self) -> Option<Point> {
        let context = self.planner.context()?;
        context
            .grid()
            .walkable_tiles()
            .filter(|tile| context.is_clear(*tile))
            .choose(&mut self.rng)
            .map(|tile| context.to_pixel(tile))
    }

    /// Current update of every entity except `exclude`, for joining clients.
    pub async fn snapshots(&self, exclude: Option<&str>) -> Vec<EntityEvent> {
        let mut snapshots = Vec::with_capacity(self.entities.len());
        for (key, entity) in &self.entities {
            if Some(key.as_str()) == exclude {
                continue;
            }
            if let Some(update) = entity.driver.outbound_update().await {
                snapshots.push((key.clone(), update));
            }
        }
        snapshots
    }

    pub async fn snapshot_of(&self, primary_key: &str) -> Option<shared::MovementSnapshot> {
        self.entities.get(primary_key)?.driver.snapshot().await
    }
}
