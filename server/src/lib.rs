//! # Arena Server Library
//!
//! Authoritative server for a multiplayer space arena. Clients fly craft
//! around a bounded sector strewn with obstacles, fire projectiles at each
//! other and are destroyed on contact. The server owns the canonical world
//! and arbitrates every collision.
//!
//! ## Channels
//!
//! ### Unreliable channel (UDP)
//! Fixed 24-byte datagrams carry JOIN and UPDATE positions from clients and
//! projectile positions from the server. Accepted updates are forwarded to
//! every other registered endpoint. Lost datagrams are simply superseded by
//! the next one.
//!
//! ### Reliable channel (TCP)
//! One connection per client carries registration, the obstacle list, FIRE
//! and EXIT commands, and removal notices for destroyed craft and
//! projectiles.
//!
//! ## Module Organization
//!
//! ### World Module (`world`)
//! Craft, projectiles and obstacles plus the collision and projectile-step
//! rules. No I/O.
//!
//! ### Registry and Broadcast Modules (`registry`, `broadcast`)
//! Who receives forwarded datagrams and removal notices, and best-effort
//! fanout to all of them.
//!
//! ### Ingest Module (`ingest`)
//! The datagram receive loop.
//!
//! ### Session Module (`session`)
//! The per-connection state machine for the reliable channel.
//!
//! ### Scheduler Module (`scheduler`)
//! Steps projectiles on a fixed interval.
//!
//! ### Network Module (`network`)
//! Binds both channels and runs everything until shutdown.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(ServerConfig::default()).await?;
//!     let shutdown = server.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.trigger();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod broadcast;
pub mod config;
pub mod error;
pub mod ingest;
pub mod network;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod shutdown;
pub mod world;
