//! # Session Server Library
//!
//! This library is the session-and-dispatch core of a multiplayer game server.
//! It terminates a datagram protocol for many concurrent clients, keeps track
//! of who is connected, protects itself from abusive or malfunctioning
//! clients, and hands every accepted message to the subsystem that owns it.
//!
//! ## Core Responsibilities
//!
//! ### Client Tracking
//! Every connected peer is registered once and can be found by any of the
//! identities the protocol uses:
//! - Stable identity (guid) across reconnects
//! - Network id and slot id assigned at registration
//! - Transport peer handle, UDP endpoint and TCP endpoint
//! - Connection token used during the handshake
//!
//! ### Abuse Protection
//! Each message type is gated by named token-bucket limiters keyed by the
//! sender. A soft limiter silently drops excess traffic; a stricter flood
//! limiter disconnects the client with a classified drop reason. Limits are
//! console variables (`rateLimiter_<name>_rate`, `rateLimiter_<name>_burst`)
//! and can be changed while the server runs.
//!
//! ### Host Arbitration
//! When the server does not simulate the world itself, one client is elected
//! host, either by announcing itself while nobody alive holds the role or by
//! collecting enough votes from other clients.
//!
//! ### Dispatch
//! Inbound datagrams are routed through a tag-to-handler table. Handlers run
//! their rate-limit gates on the network context, then hand remaining work to
//! the main or sync context where needed.
//!
//! ## Module Organization
//!
//! ### Registry (`client`, `client_registry`)
//! The client record and the multi-index directory that owns it. All indices
//! are updated under one lock, so readers never observe a half-removed client.
//!
//! ### Rate Limiting (`rate_limiter`)
//! Token buckets, per-key limiters and the store that binds named limiters to
//! console variables.
//!
//! ### Server Shell (`game_server`, `execution`, `events`)
//! Broadcast, drop and out-of-band send, the frame accumulator that turns
//! irregular polls into fixed logical ticks, and the execution contexts.
//!
//! ### Protocol (`handlers`, `host`, `out_of_band`)
//! Per-message handlers, host arbitration and the plaintext pre-connection
//! commands (`connect`, `getinfo`, `getstatus`, `rcon`).
//!
//! ### Transport (`network`)
//! UDP socket tasks and the poll loop.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::collaborators::Collaborators;
//! use server::config::ServerConfig;
//! use server::network::NetworkServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         host: "127.0.0.1".to_string(),
//!         port: 30120,
//!         ..ServerConfig::default()
//!     };
//!
//!     // Runs until ctrl-c, then drops every client with a shutdown reason
//!     let server = NetworkServer::bind(config, Collaborators::default()).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod client_registry;
pub mod collaborators;
pub mod config;
pub mod console;
pub mod drop_reason;
pub mod error;
pub mod events;
pub mod execution;
pub mod game_server;
pub mod handlers;
pub mod host;
pub mod network;
pub mod out_of_band;
pub mod rate_limiter;
