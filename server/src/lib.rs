//! # Movement Server Library
//!
//! Authoritative side of the movement synchronization system. The server
//! keeps one movement replica per entity, relays client movement updates to
//! every other client and runs the wandering NPCs it is master of.
//!
//! ## Replicas on the server
//!
//! Players are masters on their own client and slaves here: every accepted
//! update is folded into the server replica, which dead-reckons the player
//! between updates, and then relayed to the other clients. NPCs are masters
//! on the server; their composers announce every start and stop through the
//! world's outbound channel.
//!
//! ## Module Organization
//!
//! - `client_manager`: connection lifecycle, timeouts, and the primary-key and
//!   sync-id checks that decide which updates reach the world
//! - `game`: the [`game::World`] holding every entity's driver, the insertion
//!   points and the NPC wander logic
//! - `network`: UDP socket, packet dispatch and the main select loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use shared::{PathPlanningContext, WalkabilityGrid};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context = PathPlanningContext::new(WalkabilityGrid::bordered(64, 48), 16, 1)?;
//!     let config = ServerConfig {
//!         npc_count: 4,
//!         ..ServerConfig::default()
//!     };
//!
//!     let mut server = Server::new("127.0.0.1:8080", context, config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! The loop runs three background tasks next to the world: a network
//! receiver, a network sender handling direct sends and broadcasts, and a
//! timeout checker that drops clients silent for more than five seconds.

pub mod client_manager;
pub mod game;
pub mod network;
