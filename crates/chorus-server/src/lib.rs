//! # chorus-server
//!
//! Real-time room chat over WebSocket, fanned out across processes through a
//! publish/subscribe backplane.
//!
//! - [`message`]: wire envelope and JSON codec
//! - [`client`]: per-connection actor (inbound loop, outbound loop, keepalive)
//! - [`room`]: per-room actor owning membership and fan-out
//! - [`hub`]: process-wide registry of connections and rooms
//! - [`backplane`]: topic-per-room pub/sub used for cross-process delivery
//!   (Redis between processes, in-memory within one)
//! - [`server`]: axum router (upgrade endpoint, health, static files)
//!
//! Every actor owns its state and is driven only through its mailbox.

#![deny(unsafe_code)]

pub mod backplane;
pub mod client;
pub mod config;
pub mod health;
pub mod hub;
pub mod message;
pub mod room;
pub mod server;

pub use backplane::{
    connect_backplane, Backplane, BackplaneError, LocalBackplane, RedisBackplane,
};
pub use config::{load_config, ServerConfig};
pub use hub::{spawn_hub, HubHandle, HubStats};
pub use server::{start, AppState, ServerHandle};
