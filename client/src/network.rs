use crate::game::ClientGameState;
use crate::input::MoveIntentSource;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{MovementUpdate, Packet, MAX_PACKET_SIZE, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{interval, sleep};

pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    name: String,
    client_id: Option<u32>,
    connected: bool,

    game_state: ClientGameState,
    outbound_rx: mpsc::UnboundedReceiver<MovementUpdate>,
    intents: MoveIntentSource,

    tick_duration: Duration,
    fake_ping_ms: u64,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        name: &str,
        fake_ping_ms: u64,
        intents: MoveIntentSource,
        tick_duration: Duration,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;
        let (game_state, outbound_rx) = ClientGameState::new();

        Ok(Client {
            socket,
            server_addr,
            name: name.to_string(),
            client_id: None,
            connected: false,
            game_state,
            outbound_rx,
            intents,
            tick_duration,
            fake_ping_ms,
        })
    }

    pub fn game_state(&self) -> &ClientGameState {
        &self.game_state
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server as {}...", self.name);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            name: self.name.clone(),
        };
        self.send_packet(&packet).await?;

        Ok(())
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        if self.fake_ping_ms > 0 {
            sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
        }

        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected {
                client_id,
                primary_key,
                sync_id,
                location,
                spawn,
            } => {
                info!(
                    "Connected! Client ID: {}, playing {} at ({}, {})",
                    client_id, primary_key, spawn.x, spawn.y
                );
                self.client_id = Some(client_id);
                self.connected = true;
                self.game_state
                    .on_connected(primary_key, sync_id, location, spawn);
            }

            Packet::WorldInfo {
                tile_size,
                footprint,
                rows,
            } => {
                if let Err(e) = self.game_state.configure_world(tile_size, footprint, &rows) {
                    warn!("Ignoring world info: {}", e);
                }
            }

            Packet::EntityUpdate {
                primary_key,
                update,
            } => {
                self.game_state.apply_remote_update(primary_key, update);
            }

            Packet::EntityRemoved { primary_key } => {
                if self.game_state.remove_remote(&primary_key) {
                    info!("{} left", primary_key);
                }
            }

            Packet::LocationChanged {
                sync_id,
                location,
                position,
            } => {
                info!("Moved to {:?} at ({}, {})", location, position.x, position.y);
                self.game_state
                    .on_location_changed(sync_id, location, position);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    /// Picks a new destination once the local player has come to rest.
    async fn next_intent(&mut self) {
        if !self.connected {
            return;
        }
        let Some(snapshot) = self.game_state.local_snapshot().await else {
            return;
        };
        if snapshot.moving || snapshot.turning {
            return;
        }

        if let Some(destination) = self
            .intents
            .next_destination(self.game_state.planner().context())
        {
            debug!("Heading to ({}, {})", destination.x, destination.y);
            self.game_state.move_local(destination);
        }
    }

    async fn report(&self) {
        if let Some(snapshot) = self.game_state.local_snapshot().await {
            info!(
                "At ({:.1}, {:.1}) facing {:.2} rad{}, {} remote entities",
                snapshot.position.x,
                snapshot.position.y,
                snapshot.orientation,
                if snapshot.moving { ", walking" } else { "" },
                self.game_state.remote_count()
            );
        }
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut tick_interval = interval(self.tick_duration);
        let mut intent_interval = interval(Duration::from_millis(500));
        let mut heartbeat_interval = interval(Duration::from_secs(1));

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            if self.fake_ping_ms > 0 {
                                sleep(Duration::from_millis(self.fake_ping_ms / 2)).await;
                            }

                            if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                                self.handle_packet(packet).await;
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                // Our master started or stopped moving
                Some(update) = self.outbound_rx.recv() => {
                    if self.connected {
                        if let Err(e) = self.send_packet(&Packet::MovementUpdate(update)).await {
                            error!("Error sending movement update: {}", e);
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.game_state.tick();
                },

                _ = intent_interval.tick() => {
                    self.next_intent().await;
                },

                _ = heartbeat_interval.tick() => {
                    if self.connected {
                        if let Err(e) = self.send_packet(&Packet::Heartbeat).await {
                            error!("Error sending heartbeat: {}", e);
                        }
                        self.report().await;
                    }
                },

                _ = &mut shutdown => {
                    info!("Received Ctrl+C, leaving");
                    break;
                },
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}
