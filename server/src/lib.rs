//! # Presence Server Library
//!
//! This library provides the server side of the multiplayer presence service.
//! It keeps track of which players are online, where they are standing, which
//! way they are facing and which monster leads their party, and shares that
//! picture with every connected client.
//!
//! ## Core Responsibilities
//!
//! ### Session Bookkeeping
//! Every connected player owns one session in the [`registry::SessionRegistry`].
//! Sessions are created on connect, refreshed by position reports and removed
//! on disconnect or after a period without movement.
//!
//! ### Inactivity Eviction
//! A background sweep task scans the registry on a fixed interval and evicts
//! players whose last real state change is older than the timeout. A client
//! that keeps sending the exact same position is considered idle.
//!
//! ### State Broadcasting
//! The network layer regularly sends the full list of players to every peer
//! and answers on-demand world-state queries.
//!
//! ## Module Organization
//!
//! ### Registry Module (`registry`)
//! - Session identifier allocation (monotonic, never reused)
//! - Position, map, direction and party snapshot storage
//! - Snapshot queries that copy state out under the lock
//! - The cancellable sweep task and its configuration
//!
//! ### Chat Module (`chat`)
//! - Bounded history of chat lines relayed between players
//!
//! ### Network Module (`network`)
//! - UDP socket management and packet processing
//! - Mapping of client addresses onto sessions
//! - Rejection of updates for unknown sessions so clients reconnect
//! - Periodic world-state broadcast
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut server = Server::bind(ServerConfig::default()).await?;
//!
//!     // Runs until a shutdown handle fires:
//!     // - Receives connect, update, list, chat and disconnect packets
//!     // - Broadcasts the world state on every tick
//!     // - Evicts idle sessions in the background
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! Using the registry on its own:
//!
//! ```rust
//! use server::registry::{RegistryConfig, SessionRegistry};
//! use shared::Direction;
//!
//! # tokio_test::block_on(async {
//! let registry = SessionRegistry::new(RegistryConfig::default()).unwrap();
//! let id = registry.register().await;
//! assert!(registry.update(id, 3.0, 4.0, "town.tmx", Direction::Up, None).await);
//! assert_eq!(registry.list().await[&id].map, "town.tmx");
//! registry.unregister(id).await;
//! # });
//! ```

pub mod chat;
pub mod network;
pub mod registry;
