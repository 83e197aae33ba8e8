//! Client connection management and movement-update validation
//!
//! This module handles the server-side bookkeeping of connected players:
//! - Client connection lifecycle (connect, disconnect, timeout)
//! - The rolling sync id each client's updates must carry
//! - Primary-key checks so a client can only move its own entity
//! - Client capacity management and address tracking

use log::info;
use shared::{Location, MovementUpdate};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Primary key of the entity a connected client controls.
pub fn player_key(client_id: u32) -> String {
    format!("player#{}", client_id)
}

/// Represents a connected client and the entity it controls
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Display name announced on connect
    pub name: String,
    /// Key of the entity this client is master of
    pub primary_key: String,
    /// Updates carrying any other value were built against an older location
    pub sync_id: u8,
    pub location: Location,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, name: String, location: Location) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            name,
            primary_key: player_key(id),
            sync_id: 0,
            location,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Checks if the client has exceeded the connection timeout
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }

    /// Advances the sync id; it wraps around after 255.
    pub fn bump_sync_id(&mut self) -> u8 {
        self.sync_id = self.sync_id.wrapping_add(1);
        self.sync_id
    }
}

/// Outcome of checking an incoming movement update against its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateCheck {
    Accepted,
    /// The update names an entity the sender does not control.
    ForeignKey,
    /// The update was built before the sender's last location change.
    StaleSync,
    UnknownClient,
}

/// Manages all connected clients
///
/// Enforces the server capacity limit and decides which movement updates may
/// reach the world simulation.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
}

impl ClientManager {
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr, name: &str, location: Location) -> Option<u32> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr, name.to_string(), location);
        info!(
            "Client {} ({}) connected from {}",
            client_id, client.name, addr
        );
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a client from the server
    ///
    /// Returns true if the client was found and removed, false if they were
    /// already gone.
    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get_client(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn touch(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.touch();
        }
    }

    /// Decides whether a movement update from `client_id` may be applied.
    ///
    /// Updates without a primary key are accepted as referring to the
    /// sender's own entity.
    pub fn validate_update(&mut self, client_id: u32, update: &MovementUpdate) -> UpdateCheck {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return UpdateCheck::UnknownClient;
        };
        client.touch();

        if let Some(key) = &update.primary_key {
            if *key != client.primary_key {
                return UpdateCheck::ForeignKey;
            }
        }

        if update.sync_id != client.sync_id {
            return UpdateCheck::StaleSync;
        }

        UpdateCheck::Accepted
    }

    /// Moves a client to another location and returns its new sync id.
    pub fn change_location(&mut self, client_id: u32, location: Location) -> Option<u8> {
        let client = self.clients.get_mut(&client_id)?;
        client.touch();
        client.location = location;
        Some(client.bump_sync_id())
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed client IDs so their entities can be dropped too.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timeout = Duration::from_secs(5);
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Gets all client IDs and their network addresses
    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
