//! # Movement Client Library
//!
//! Headless client of the movement synchronization system. It controls one
//! entity as master and mirrors every other entity the server relays as a
//! slave replica, dead-reckoning all of them between updates.
//!
//! ## Connection flow
//!
//! 1. `Connect` is answered with `Connected` (our primary key, sync id and
//!    spawn point) and `WorldInfo` (the walkability map).
//! 2. The map configures the shared path planner. Moves requested earlier
//!    were queued by the composer and are replayed on the next tick.
//! 3. Every start and stop of the local master is sent as a
//!    `MovementUpdate`; `EntityUpdate` packets feed the remote replicas.
//! 4. `LocationChanged` teleports the local player and bumps the sync id so
//!    updates built for the previous location are rejected by the server.
//!
//! ## Module Organization
//!
//! - `game`: [`game::ClientGameState`], owning the local master and the
//!   remote slaves, each behind its own [`shared::SyncDriver`]
//! - `input`: [`input::MoveIntentSource`], choosing destinations from a
//!   waypoint loop or random walkable tiles
//! - `network`: UDP socket, packet dispatch and the client select loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::input::{IntentMode, MoveIntentSource};
//! use client::network::Client;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let intents = MoveIntentSource::new(IntentMode::Wander, 42);
//!     let mut client = Client::new(
//!         "127.0.0.1:8080",
//!         "alice",
//!         0,
//!         intents,
//!         Duration::from_millis(33),
//!     )
//!     .await?;
//!
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod game;
pub mod input;
pub mod network;
