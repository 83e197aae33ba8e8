//! Server network layer handling UDP communications and world loop coordination

use crate::client_manager::{player_key, ClientManager, UpdateCheck};
use crate::game::{EntityEvent, World};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    Location, MovementUpdate, Packet, PathPlanningContext, MAX_PACKET_SIZE, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: u32 },
    Shutdown,
}

/// Messages sent from the world loop to network tasks
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<u32>,
    },
}

/// Runtime settings of a [`Server`]
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_duration: Duration,
    pub max_clients: usize,
    pub npc_count: usize,
    /// How often NPCs may pick a new destination
    pub wander_interval: Duration,
    pub seed: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(50),
            max_clients: 32,
            npc_count: 0,
            wander_interval: Duration::from_secs(2),
            seed: 0,
        }
    }
}

/// Main server coordinating networking and the movement world
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    world: World,
    config: ServerConfig,
    tick: u64,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
    entity_rx: mpsc::UnboundedReceiver<EntityEvent>,
}

impl Server {
    /// Binds the socket and builds the world. Must be called inside a tokio runtime.
    pub async fn new(
        addr: &str,
        context: PathPlanningContext,
        config: ServerConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (mut world, entity_rx) = World::new(context, config.seed);
        world.spawn_npcs(config.npc_count);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            world,
            config,
            tick: 0,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
            entity_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Sender that stops [`Server::run`] when given [`ServerMessage::Shutdown`].
    pub fn control_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<u32>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    async fn client_at(&self, addr: SocketAddr) -> Option<u32> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    /// Drops a client's entity and tells everybody else.
    fn remove_player(&mut self, client_id: u32) {
        let primary_key = player_key(client_id);
        if self.world.remove_entity(&primary_key) {
            self.broadcast_packet(Packet::EntityRemoved { primary_key }, Some(client_id));
        }
    }

    /// Processes incoming packets and updates the world
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                name,
            } => {
                info!(
                    "Client {} connecting from {} (version: {})",
                    name, addr, client_version
                );
                self.handle_connect(client_version, &name, addr).await;
            }

            Packet::MovementUpdate(update) => {
                let Some(client_id) = self.client_at(addr).await else {
                    warn!("Movement update from unknown client at {}", addr);
                    return;
                };
                self.handle_movement_update(client_id, update).await;
            }

            Packet::ChangeLocation { location } => {
                let Some(client_id) = self.client_at(addr).await else {
                    warn!("Location change from unknown client at {}", addr);
                    return;
                };
                self.handle_change_location(client_id, location).await;
            }

            Packet::Heartbeat => {
                if self.client_at(addr).await.is_none() {
                    debug!("Heartbeat from unknown client at {}", addr);
                }
            }

            Packet::Disconnect => {
                let client_id = {
                    let clients = self.clients.read().await;
                    clients.find_client_by_addr(addr)
                };

                if let Some(client_id) = client_id {
                    let mut clients = self.clients.write().await;
                    clients.remove_client(&client_id);
                    drop(clients);
                    self.remove_player(client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn handle_connect(&mut self, client_version: u32, name: &str, addr: SocketAddr) {
        if client_version != PROTOCOL_VERSION {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Protocol version mismatch".to_string(),
                },
                addr,
            );
            return;
        }

        // Remove existing connection if present
        let existing_client_id = {
            let clients = self.clients.read().await;
            clients.find_client_by_addr(addr)
        };

        if let Some(existing_id) = existing_client_id {
            info!("Removing existing client {} from {}", existing_id, addr);
            let mut clients = self.clients.write().await;
            clients.remove_client(&existing_id);
            drop(clients);
            self.remove_player(existing_id);
        }

        let location = Location::default();
        let client_id = {
            let mut clients = self.clients.write().await;
            clients.add_client(addr, name, location)
        };

        let Some(client_id) = client_id else {
            self.send_packet(
                Packet::Disconnected {
                    reason: "Server full".to_string(),
                },
                addr,
            );
            return;
        };

        let primary_key = player_key(client_id);
        let spawn = self.world.spawn_player(&primary_key, location);

        self.send_packet(
            Packet::Connected {
                client_id,
                primary_key: primary_key.clone(),
                sync_id: 0,
                location,
                spawn,
            },
            addr,
        );

        if let Some(context) = self.world.planner().context() {
            self.send_packet(
                Packet::WorldInfo {
                    tile_size: context.tile_size(),
                    footprint: context.footprint(),
                    rows: context.grid().to_rows(),
                },
                addr,
            );
        }

        for (key, update) in self.world.snapshots(Some(&primary_key)).await {
            self.send_packet(
                Packet::EntityUpdate {
                    primary_key: key,
                    update,
                },
                addr,
            );
        }

        let arrival = MovementUpdate::stopped(Some(primary_key.clone()), 0, spawn, 0.0);
        self.broadcast_packet(
            Packet::EntityUpdate {
                primary_key,
                update: arrival,
            },
            Some(client_id),
        );
    }

    async fn handle_movement_update(&mut self, client_id: u32, update: MovementUpdate) {
        let check = {
            let mut clients = self.clients.write().await;
            clients.validate_update(client_id, &update)
        };

        let primary_key = player_key(client_id);
        match check {
            UpdateCheck::Accepted => {
                self.world.apply_update(&primary_key, update.clone());
                self.broadcast_packet(
                    Packet::EntityUpdate {
                        primary_key,
                        update,
                    },
                    Some(client_id),
                );
            }
            UpdateCheck::ForeignKey => {
                warn!(
                    "Client {} sent an update for {:?}, ignoring",
                    client_id, update.primary_key
                );
            }
            UpdateCheck::StaleSync => {
                debug!(
                    "Dropping update of {} with stale sync id {}",
                    primary_key, update.sync_id
                );
            }
            UpdateCheck::UnknownClient => {
                warn!("Update for unknown client {}", client_id);
            }
        }
    }

    async fn handle_change_location(&mut self, client_id: u32, location: Location) {
        let sync_id = {
            let mut clients = self.clients.write().await;
            clients.change_location(client_id, location)
        };
        let Some(sync_id) = sync_id else {
            return;
        };

        let primary_key = player_key(client_id);
        let Some(position) = self.world.change_location(&primary_key, location, sync_id) else {
            warn!("{} has no entity to move to {:?}", primary_key, location);
            return;
        };
        info!(
            "{} moved to {:?} at ({}, {})",
            primary_key, location, position.x, position.y
        );

        let addr = {
            let clients = self.clients.read().await;
            clients.get_client(client_id).map(|client| client.addr)
        };
        if let Some(addr) = addr {
            self.send_packet(
                Packet::LocationChanged {
                    sync_id,
                    location,
                    position,
                },
                addr,
            );
        }

        let arrival = MovementUpdate::stopped(Some(primary_key.clone()), sync_id, position, 0.0);
        self.broadcast_packet(
            Packet::EntityUpdate {
                primary_key,
                update: arrival,
            },
            Some(client_id),
        );
    }

    fn announce(&self, event: EntityEvent) {
        let (primary_key, update) = event;
        self.broadcast_packet(
            Packet::EntityUpdate {
                primary_key,
                update,
            },
            None,
        );
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        // Initialize concurrent tasks
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.config.tick_duration);
        let mut wander_interval = interval(self.config.wander_interval);

        info!(
            "Server started successfully with {} NPCs",
            self.world.npc_keys().len()
        );

        loop {
            tokio::select! {
                // Handle network events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                            self.remove_player(client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.broadcast_packet(Packet::Disconnected {
                                reason: "Server shutting down".to_string(),
                            }, None);
                            break;
                        }
                    }
                },

                // Movement started or stopped by a server-side master
                Some(event) = self.entity_rx.recv() => {
                    self.announce(event);
                },

                _ = tick_interval.tick() => {
                    self.world.tick();
                    self.tick += 1;

                    // Periodic performance monitoring
                    if self.tick % 200 == 0 {
                        let client_count = {
                            let clients = self.clients.read().await;
                            clients.len()
                        };
                        debug!("Tick {}: {} clients, {} entities",
                               self.tick, client_count, self.world.len());
                    }
                },

                _ = wander_interval.tick() => {
                    self.world.wander_npcs();
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Motion, Point, WalkabilityGrid};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio_test::assert_ok;

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    async fn create_test_server(max_clients: usize) -> Server {
        let context =
            PathPlanningContext::new(WalkabilityGrid::bordered(20, 15), 16, 1).unwrap();
        let config = ServerConfig {
            max_clients,
            ..ServerConfig::default()
        };
        assert_ok!(Server::new("127.0.0.1:0", context, config).await)
    }

    fn drain(server: &mut Server) -> Vec<GameMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = server.game_rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    fn connect_packet(version: u32) -> Packet {
        Packet::Connect {
            client_version: version,
            name: "alice".to_string(),
        }
    }

    #[test]
    fn test_server_message_creation() {
        let addr = test_addr(8080);
        let msg = ServerMessage::PacketReceived {
            packet: connect_packet(1),
            addr,
        };

        match msg {
            ServerMessage::PacketReceived { packet: p, addr: a } => {
                assert_eq!(a, addr);
                match p {
                    Packet::Connect { client_version, .. } => {
                        assert_eq!(client_version, 1);
                    }
                    _ => panic!("Unexpected packet type"),
                }
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[test]
    fn test_game_message_broadcast() {
        let msg = GameMessage::BroadcastPacket {
            packet: Packet::EntityRemoved {
                primary_key: "player#3".to_string(),
            },
            exclude: Some(5),
        };

        match msg {
            GameMessage::BroadcastPacket { packet: p, exclude } => {
                assert_eq!(exclude, Some(5));
                assert!(matches!(p, Packet::EntityRemoved { .. }));
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_connect_sends_world_and_announces_player() {
        let mut server = create_test_server(4).await;

        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        let messages = drain(&mut server);

        match &messages[0] {
            GameMessage::SendPacket {
                packet: Packet::Connected {
                    client_id,
                    primary_key,
                    spawn,
                    ..
                },
                ..
            } => {
                assert_eq!(*client_id, 1);
                assert_eq!(primary_key, "player#1");
                assert_eq!(*spawn, Point::new(16, 16));
            }
            other => panic!("Unexpected first message: {:?}", other),
        }

        match &messages[1] {
            GameMessage::SendPacket {
                packet: Packet::WorldInfo { tile_size, rows, .. },
                ..
            } => {
                assert_eq!(*tile_size, 16);
                assert_eq!(rows.len(), 15);
            }
            other => panic!("Unexpected second message: {:?}", other),
        }

        match messages.last() {
            Some(GameMessage::BroadcastPacket {
                packet: Packet::EntityUpdate { primary_key, update },
                exclude,
            }) => {
                assert_eq!(primary_key, "player#1");
                assert_eq!(*exclude, Some(1));
                assert_eq!(update.motion, Motion::Stopped);
            }
            other => panic!("Unexpected last message: {:?}", other),
        }

        assert!(server.world().contains("player#1"));
    }

    #[tokio::test]
    async fn test_connect_version_mismatch() {
        let mut server = create_test_server(4).await;

        server.handle_packet(connect_packet(99), test_addr(9001)).await;
        let messages = drain(&mut server);

        assert_eq!(messages.len(), 1);
        match &messages[0] {
            GameMessage::SendPacket {
                packet: Packet::Disconnected { reason },
                ..
            } => assert_eq!(reason, "Protocol version mismatch"),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert!(server.world().is_empty());
    }

    #[tokio::test]
    async fn test_connect_server_full() {
        let mut server = create_test_server(1).await;

        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        drain(&mut server);
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9002)).await;

        let messages = drain(&mut server);
        assert!(matches!(
            &messages[0],
            GameMessage::SendPacket { packet: Packet::Disconnected { .. }, .. }
        ));
        assert_eq!(server.world().len(), 1);
    }

    #[tokio::test]
    async fn test_movement_update_is_relayed() {
        let mut server = create_test_server(4).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        drain(&mut server);

        let update = MovementUpdate {
            primary_key: Some("player#1".to_string()),
            sync_id: 0,
            source: Point::new(16, 16),
            orientation: 0.0,
            motion: Motion::Moving {
                destination: Point::new(160, 16),
                delta_ms: 0,
            },
        };
        server
            .handle_packet(Packet::MovementUpdate(update.clone()), test_addr(9001))
            .await;

        let messages = drain(&mut server);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            GameMessage::BroadcastPacket {
                packet: Packet::EntityUpdate { primary_key, update: relayed },
                exclude,
            } => {
                assert_eq!(primary_key, "player#1");
                assert_eq!(relayed, &update);
                assert_eq!(*exclude, Some(1));
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        let snapshot = server.world().snapshot_of("player#1").await.unwrap();
        assert!(snapshot.moving);
    }

    #[tokio::test]
    async fn test_foreign_and_stale_updates_are_dropped() {
        let mut server = create_test_server(4).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        drain(&mut server);

        let foreign = MovementUpdate::stopped(Some("npc#1".to_string()), 0, Point::new(16, 16), 0.0);
        server
            .handle_packet(Packet::MovementUpdate(foreign), test_addr(9001))
            .await;

        let stale = MovementUpdate::stopped(None, 7, Point::new(16, 16), 0.0);
        server
            .handle_packet(Packet::MovementUpdate(stale), test_addr(9001))
            .await;

        assert!(drain(&mut server).is_empty());
    }

    #[tokio::test]
    async fn test_change_location_bumps_sync_id() {
        let mut server = create_test_server(4).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        drain(&mut server);

        server
            .handle_packet(
                Packet::ChangeLocation {
                    location: Location::Room(2),
                },
                test_addr(9001),
            )
            .await;

        let messages = drain(&mut server);
        match &messages[0] {
            GameMessage::SendPacket {
                packet: Packet::LocationChanged { sync_id, location, .. },
                ..
            } => {
                assert_eq!(*sync_id, 1);
                assert_eq!(*location, Location::Room(2));
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        // Updates built before the move no longer apply
        let old = MovementUpdate::stopped(None, 0, Point::new(16, 16), 0.0);
        server
            .handle_packet(Packet::MovementUpdate(old), test_addr(9001))
            .await;
        assert!(drain(&mut server).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_removes_entity() {
        let mut server = create_test_server(4).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        drain(&mut server);

        server.handle_packet(Packet::Disconnect, test_addr(9001)).await;

        let messages = drain(&mut server);
        assert!(matches!(
            &messages[0],
            GameMessage::BroadcastPacket { packet: Packet::EntityRemoved { .. }, .. }
        ));
        assert!(server.world().is_empty());
        assert!(server.clients.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replaces_previous_session() {
        let mut server = create_test_server(4).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;
        server.handle_packet(connect_packet(PROTOCOL_VERSION), test_addr(9001)).await;

        assert!(!server.world().contains("player#1"));
        assert!(server.world().contains("player#2"));
        assert_eq!(server.clients.read().await.len(), 1);
    }

    #[test]
    fn test_tick_duration_validation() {
        let config = ServerConfig::default();
        assert!(config.tick_duration.as_millis() > 0);
        assert!(config.tick_duration < config.wander_interval);
    }
}
