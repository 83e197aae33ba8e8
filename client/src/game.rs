//! Client-side replicas: the local master and one slave per remote entity

use log::{debug, info};
use shared::{
    EntityHandle, InsertionPoints, Location, MovementComposer, MovementSnapshot, MovementUpdate,
    PathPlanner, PathPlanningContext, PlanError, Point, Position, SyncDriver, WalkabilityGrid,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Location and sync id of the connection, shared by every replica on this client
#[derive(Debug, Default)]
struct Session {
    location: RwLock<Location>,
    sync_id: AtomicU8,
    spawn: RwLock<Option<Point>>,
}

impl Session {
    fn location(&self) -> Option<Location> {
        self.location.read().ok().map(|location| *location)
    }

    fn set(&self, location: Location, sync_id: u8, spawn: Point) {
        if let Ok(mut current) = self.location.write() {
            *current = location;
        }
        if let Ok(mut current) = self.spawn.write() {
            *current = Some(spawn);
        }
        self.sync_id.store(sync_id, Ordering::SeqCst);
    }
}

impl InsertionPoints for Session {
    fn insertion_point(&self, _location: &Location) -> Option<Point> {
        self.spawn.read().ok().and_then(|spawn| *spawn)
    }
}

/// Entity as seen by a composer running on this client
struct ClientEntity {
    primary_key: String,
    session: Arc<Session>,
    /// Only the local player's entity has somewhere to send updates
    outbound: Option<mpsc::UnboundedSender<MovementUpdate>>,
}

impl EntityHandle for ClientEntity {
    fn is_master(&self) -> bool {
        self.outbound.is_some()
    }

    fn send_message(&self, update: MovementUpdate) {
        if let Some(outbound) = &self.outbound {
            if outbound.send(update).is_err() {
                debug!("{}: outbound channel closed", self.primary_key);
            }
        }
    }

    fn location(&self) -> Option<Location> {
        self.session.location()
    }

    fn primary_key(&self) -> String {
        self.primary_key.clone()
    }

    fn sync_id(&self) -> u8 {
        self.session.sync_id.load(Ordering::SeqCst)
    }
}

struct LocalPlayer {
    primary_key: String,
    driver: SyncDriver,
}

pub struct ClientGameState {
    planner: PathPlanner,
    session: Arc<Session>,
    local: Option<LocalPlayer>,
    remotes: HashMap<String, SyncDriver>,
    outbound: mpsc::UnboundedSender<MovementUpdate>,
}

impl ClientGameState {
    /// Also returns the receiver of the local player's outgoing updates.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MovementUpdate>) {
        let (outbound, updates) = mpsc::unbounded_channel();
        let state = Self {
            planner: PathPlanner::new(),
            session: Arc::new(Session::default()),
            local: None,
            remotes: HashMap::new(),
            outbound,
        };
        (state, updates)
    }

    pub fn planner(&self) -> &PathPlanner {
        &self.planner
    }

    pub fn primary_key(&self) -> Option<&str> {
        self.local.as_ref().map(|local| local.primary_key.as_str())
    }

    pub fn sync_id(&self) -> u8 {
        self.session.sync_id.load(Ordering::SeqCst)
    }

    pub fn location(&self) -> Location {
        self.session.location().unwrap_or_default()
    }

    pub fn remote_count(&self) -> usize {
        self.remotes.len()
    }

    /// Creates the local player's master replica. Must be called inside a tokio runtime.
    pub fn on_connected(
        &mut self,
        primary_key: String,
        sync_id: u8,
        location: Location,
        spawn: Point,
    ) {
        self.session.set(location, sync_id, spawn);
        self.remotes.clear();

        let entity = Arc::new(ClientEntity {
            primary_key: primary_key.clone(),
            session: self.session.clone(),
            outbound: Some(self.outbound.clone()),
        });
        let composer = MovementComposer::new(
            entity,
            self.session.clone(),
            self.planner.clone(),
            Position::from(spawn),
            0.0,
        );

        self.local = Some(LocalPlayer {
            primary_key,
            driver: SyncDriver::spawn(composer),
        });
    }

    /// Configures the planner from the map sent by the server.
    ///
    /// Movement requested before this point is replayed on the next tick.
    pub fn configure_world(
        &self,
        tile_size: u32,
        footprint: u32,
        rows: &[String],
    ) -> Result<(), PlanError> {
        let grid = WalkabilityGrid::from_rows(rows)?;
        info!(
            "World map {}x{} tiles, {}px per tile",
            grid.width(),
            grid.height(),
            tile_size
        );
        let context = PathPlanningContext::new(grid, tile_size, footprint)?;
        self.planner.configure(context)
    }

    /// Routes a relayed update to the slave replica of `primary_key`.
    ///
    /// Unknown entities get a replica created at the update's source.
    pub fn apply_remote_update(&mut self, primary_key: String, update: MovementUpdate) {
        if self.primary_key() == Some(primary_key.as_str()) {
            return;
        }

        if !self.remotes.contains_key(&primary_key) {
            debug!("New remote entity {}", primary_key);
            let entity = Arc::new(ClientEntity {
                primary_key: primary_key.clone(),
                session: self.session.clone(),
                outbound: None,
            });
            let composer = MovementComposer::new(
                entity,
                self.session.clone(),
                self.planner.clone(),
                Position::from(update.source),
                update.orientation as f64,
            );
            self.remotes
                .insert(primary_key.clone(), SyncDriver::spawn(composer));
        }

        if let Some(driver) = self.remotes.get(&primary_key) {
            driver.apply_update(update);
        }
    }

    pub fn remove_remote(&mut self, primary_key: &str) -> bool {
        self.remotes.remove(primary_key).is_some()
    }

    /// The server moved us: adopt its sync id and jump to the new position.
    pub fn on_location_changed(&mut self, sync_id: u8, location: Location, position: Point) {
        self.session.set(location, sync_id, position);
        // Remote replicas belonged to the previous location
        self.remotes.clear();
        if let Some(local) = &self.local {
            local.driver.teleport(Position::from(position));
        }
    }

    pub fn tick(&self) {
        if let Some(local) = &self.local {
            local.driver.tick();
        }
        for driver in self.remotes.values() {
            driver.tick();
        }
    }

    /// Asks the local master to walk to `destination`.
    pub fn move_local(&self, destination: Point) -> bool {
        match &self.local {
            Some(local) => local.driver.move_to(destination),
            None => false,
        }
    }

    pub async fn local_snapshot(&self) -> Option<MovementSnapshot> {
        self.local.as_ref()?.driver.snapshot().await
    }

    pub async fn remote_snapshot(&self, primary_key: &str) -> Option<MovementSnapshot> {
        self.remotes.get(primary_key)?.snapshot().await
    }
}
