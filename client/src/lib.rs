//! # Presence Client Library
//!
//! Headless client side of the multiplayer presence service. It keeps one
//! session alive on the server by reporting the local player's position,
//! map, facing direction and party leader, and keeps a local roster of the
//! other players the server tells us about.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! - UDP socket management and connection handshake
//! - Periodic state heartbeats
//! - Automatic re-registration after the server rejects an update
//! - Chat send/receive and history
//!
//! ### Roster Module (`roster`)
//! - Remote players from the latest world-state snapshot
//! - Movement detection between snapshots
//! - Per-map filtering and proximity queries
//!
//! ## Reconnection
//!
//! The server evicts sessions that stop moving. When that happens the next
//! update is answered with `Rejected`; the client drops its session id and
//! the following heartbeat sends a fresh `Connect` instead of an update.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{LocalState, PresenceClient};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let mut client = PresenceClient::new("127.0.0.1:8080").await?;
//!
//!     let mut x = 0.0;
//!     client
//!         .run(Duration::from_millis(100), || {
//!             x += 1.0;
//!             LocalState {
//!                 x,
//!                 ..LocalState::new("town.tmx")
//!             }
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod roster;
