//! Integration tests for the movement synchronization components
//!
//! These tests validate master/slave replication across composers and the
//! real UDP server loop.

use assert_approx_eq::assert_approx_eq;
use bincode::{deserialize, serialize};
use shared::{
    EntityHandle, InsertionPoints, Location, ManualClock, Motion, MovementComposer,
    MovementUpdate, Packet, PathPlanner, PathPlanningContext, Point, Position, WalkabilityGrid,
    PROTOCOL_VERSION,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_test::assert_ok;

fn open_context() -> PathPlanningContext {
    PathPlanningContext::new(WalkabilityGrid::bordered(30, 20), 16, 1).unwrap()
}

/// MASTER / SLAVE REPLICATION TESTS
mod replication_tests {
    use super::*;

    struct Replica {
        master: bool,
        location: Location,
        outbox: Mutex<Vec<MovementUpdate>>,
    }

    impl Replica {
        fn new(master: bool, location: Location) -> Arc<Self> {
            Arc::new(Self {
                master,
                location,
                outbox: Mutex::new(Vec::new()),
            })
        }

        fn take(&self) -> Vec<MovementUpdate> {
            std::mem::take(&mut *self.outbox.lock().unwrap())
        }
    }

    impl EntityHandle for Replica {
        fn is_master(&self) -> bool {
            self.master
        }

        fn send_message(&self, update: MovementUpdate) {
            self.outbox.lock().unwrap().push(update);
        }

        fn location(&self) -> Option<Location> {
            Some(self.location)
        }

        fn primary_key(&self) -> String {
            "player#1".to_string()
        }

        fn sync_id(&self) -> u8 {
            0
        }
    }

    struct NoInsertion;

    impl InsertionPoints for NoInsertion {
        fn insertion_point(&self, _location: &Location) -> Option<Point> {
            None
        }
    }

    fn composer(
        entity: Arc<Replica>,
        planner: &PathPlanner,
        clock: &Arc<ManualClock>,
        at: Point,
    ) -> MovementComposer {
        let mut composer = MovementComposer::new(
            entity,
            Arc::new(NoInsertion),
            planner.clone(),
            Position::from(at),
            0.0,
        )
        .with_clock(clock.clone());
        composer.set_speed(60.0);
        composer
    }

    /// Tests that a slave fed the master's updates walks in lockstep with it
    #[test]
    fn slave_follows_master_broadcasts() {
        let planner = PathPlanner::configured(open_context());
        let clock = Arc::new(ManualClock::new(10_000));

        let master_entity = Replica::new(true, Location::World(0));
        let slave_entity = Replica::new(false, Location::World(0));
        let mut master = composer(master_entity.clone(), &planner, &clock, Point::new(16, 16));
        let mut slave = composer(slave_entity.clone(), &planner, &clock, Point::new(16, 16));

        master.move_to(Point::new(160, 16));
        let started = master_entity.take();
        assert_eq!(started.len(), 1);
        for update in &started {
            slave.set_update(update);
        }
        assert!(slave.is_moving());

        for _ in 0..10 {
            clock.advance(100);
            master.tick();
            slave.tick();
        }
        assert_approx_eq!(master.position().x, 76.0, 1e-3);
        assert_approx_eq!(slave.position().x, master.position().x, 1e-3);

        for _ in 0..20 {
            clock.advance(100);
            master.tick();
            slave.tick();
            for update in master_entity.take() {
                slave.set_update(&update);
            }
        }

        assert!(!master.is_moving());
        assert!(!slave.is_moving());
        assert_eq!(master.position(), Position::new(160.0, 16.0));
        assert_eq!(slave.position(), Position::new(160.0, 16.0));
        // Slaves never broadcast
        assert!(slave_entity.take().is_empty());
    }

    /// Tests that a late update is fast-forwarded along the route
    #[test]
    fn late_update_is_compensated() {
        let planner = PathPlanner::configured(open_context());
        let clock = Arc::new(ManualClock::new(10_000));
        let mut slave = composer(
            Replica::new(false, Location::World(0)),
            &planner,
            &clock,
            Point::new(300, 200),
        );

        let update = MovementUpdate {
            primary_key: None,
            sync_id: 0,
            source: Point::new(16, 16),
            orientation: 0.0,
            motion: Motion::Moving {
                destination: Point::new(400, 16),
                delta_ms: 1_000,
            },
        };
        slave.set_update(&update);

        assert!(slave.is_moving());
        assert_approx_eq!(slave.position().x, 76.0, 1e-3);
        assert_approx_eq!(slave.position().y, 16.0, 1e-3);
    }

    /// Tests that a replica without a map keeps the update and replays it later
    #[test]
    fn unconfigured_slave_catches_up() {
        let planner = PathPlanner::new();
        let clock = Arc::new(ManualClock::new(10_000));
        let mut slave = composer(
            Replica::new(false, Location::World(0)),
            &planner,
            &clock,
            Point::new(16, 16),
        );

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
        slave.set_update(&update);
        assert!(!slave.is_moving());
        assert_eq!(slave.target_position(), Point::new(160, 16));

        // Map arrives 1s later; the wait counts as travel time
        clock.advance(1_000);
        assert_ok!(planner.configure(open_context()));
        slave.tick();

        assert!(slave.is_moving());
        assert_approx_eq!(slave.position().x, 76.0, 1e-3);
    }
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;
    use server::network::{Server, ServerConfig, ServerMessage};
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    async fn start_server(npc_count: usize) -> (SocketAddr, mpsc::UnboundedSender<ServerMessage>) {
        let config = ServerConfig {
            tick_duration: Duration::from_millis(20),
            npc_count,
            wander_interval: Duration::from_millis(100),
            seed: 1,
            ..ServerConfig::default()
        };
        let mut server = Server::new("127.0.0.1:0", open_context(), config)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let control = server.control_handle();

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        (addr, control)
    }

    async fn send(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) {
        let data = serialize(packet).unwrap();
        socket.send_to(&data, addr).await.unwrap();
    }

    /// Receives packets until `pick` accepts one, failing after two seconds.
    async fn expect<T>(socket: &UdpSocket, mut pick: impl FnMut(Packet) -> Option<T>) -> T {
        let mut buf = vec![0u8; shared::MAX_PACKET_SIZE];
        let wait = async {
            loop {
                let (size, _) = socket.recv_from(&mut buf).await.unwrap();
                let packet: Packet = deserialize(&buf[..size]).unwrap();
                if let Some(found) = pick(packet) {
                    return found;
                }
            }
        };
        timeout(Duration::from_secs(2), wait)
            .await
            .expect("Timed out waiting for packet")
    }

    async fn join(addr: SocketAddr, name: &str) -> (UdpSocket, String) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        send(
            &socket,
            addr,
            &Packet::Connect {
                client_version: PROTOCOL_VERSION,
                name: name.to_string(),
            },
        )
        .await;

        let key = expect(&socket, |packet| match packet {
            Packet::Connected { primary_key, .. } => Some(primary_key),
            _ => None,
        })
        .await;
        (socket, key)
    }

    /// Tests the connect handshake over a real socket
    #[tokio::test]
    async fn handshake_delivers_world() {
        let (addr, control) = start_server(0).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(
            &socket,
            addr,
            &Packet::Connect {
                client_version: PROTOCOL_VERSION,
                name: "alice".to_string(),
            },
        )
        .await;

        let mut connected = None;
        let mut world = None;
        while connected.is_none() || world.is_none() {
            expect(&socket, |packet| match packet {
                Packet::Connected { primary_key, spawn, .. } => {
                    connected = Some((primary_key, spawn));
                    Some(())
                }
                Packet::WorldInfo { tile_size, rows, .. } => {
                    world = Some((tile_size, rows));
                    Some(())
                }
                _ => None,
            })
            .await;
        }

        let (primary_key, spawn) = connected.unwrap();
        assert_eq!(primary_key, "player#1");
        assert_eq!(spawn, Point::new(16, 16));

        let (tile_size, rows) = world.unwrap();
        assert_eq!(tile_size, 16);
        assert_eq!(WalkabilityGrid::from_rows(&rows).unwrap().width(), 30);

        control.send(ServerMessage::Shutdown).unwrap();
    }

    /// Tests that an old client version is turned away
    #[tokio::test]
    async fn version_mismatch_is_rejected() {
        let (addr, _control) = start_server(0).await;
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        send(
            &socket,
            addr,
            &Packet::Connect {
                client_version: PROTOCOL_VERSION + 1,
                name: "old".to_string(),
            },
        )
        .await;

        let reason = expect(&socket, |packet| match packet {
            Packet::Disconnected { reason } => Some(reason),
            _ => None,
        })
        .await;
        assert_eq!(reason, "Protocol version mismatch");
    }

    /// Tests that one client's movement reaches the other client
    #[tokio::test]
    async fn movement_is_relayed_between_clients() {
        let (addr, _control) = start_server(0).await;
        let (alice, alice_key) = join(addr, "alice").await;
        let (bob, _bob_key) = join(addr, "bob").await;

        let update = MovementUpdate {
            primary_key: Some(alice_key.clone()),
            sync_id: 0,
            source: Point::new(16, 16),
            orientation: 0.0,
            motion: Motion::Moving {
                destination: Point::new(160, 16),
                delta_ms: 0,
            },
        };
        send(&alice, addr, &Packet::MovementUpdate(update.clone())).await;

        let relayed = expect(&bob, |packet| match packet {
            Packet::EntityUpdate {
                primary_key,
                update,
            } if primary_key == alice_key && update.is_moving() => Some(update),
            _ => None,
        })
        .await;
        assert_eq!(relayed, update);
    }

    /// Tests that server-side NPCs announce their wandering
    #[tokio::test]
    async fn npc_moves_are_announced() {
        let (addr, _control) = start_server(3).await;
        let (socket, _key) = join(addr, "watcher").await;

        let (key, update) = expect(&socket, |packet| match packet {
            Packet::EntityUpdate {
                primary_key,
                update,
            } if primary_key.starts_with("npc#") && update.is_moving() => {
                Some((primary_key, update))
            }
            _ => None,
        })
        .await;

        assert!(key.starts_with("npc#"));
        assert!(update.destination().is_some());
    }

    /// Tests that leaving removes the entity for everyone else
    #[tokio::test]
    async fn disconnect_is_announced() {
        let (addr, _control) = start_server(0).await;
        let (alice, alice_key) = join(addr, "alice").await;
        let (bob, _bob_key) = join(addr, "bob").await;

        send(&alice, addr, &Packet::Disconnect).await;

        let removed = expect(&bob, |packet| match packet {
            Packet::EntityRemoved { primary_key } => Some(primary_key),
            _ => None,
        })
        .await;
        assert_eq!(removed, alice_key);
    }
}

/// CLIENT STATE TESTS
mod client_tests {
    use super::*;
    use client::game::ClientGameState;
    use client::input::{parse_waypoints, IntentMode, MoveIntentSource};

    /// Tests that waypoint intents drive the local master once the map is known
    #[tokio::test]
    async fn waypoint_intent_moves_local_player() {
        let (mut state, mut updates) = ClientGameState::new();
        state.on_connected("player#1".to_string(), 0, Location::World(0), Point::new(16, 16));
        state
            .configure_world(16, 1, &WalkabilityGrid::bordered(30, 20).to_rows())
            .unwrap();

        let waypoints = parse_waypoints("160,16;160,160").unwrap();
        let mut intents = MoveIntentSource::new(IntentMode::Waypoints(waypoints), 0);

        let destination = intents
            .next_destination(state.planner().context())
            .unwrap();
        assert!(state.move_local(destination));

        let update = updates.recv().await.unwrap();
        assert_eq!(update.destination(), Some(Point::new(160, 16)));

        let snapshot = state.local_snapshot().await.unwrap();
        assert!(snapshot.moving);
    }
}
