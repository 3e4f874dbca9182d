//! # chorus-core
//!
//! Types shared by every chorus crate:
//! - branded ids for connections and rooms
//! - the [`Identity`] capability carried by message senders
//! - protocol constants and private-room naming

#![deny(unsafe_code)]

pub mod identity;
pub mod ids;
pub mod protocol;

pub use identity::{Identity, Peer};
pub use ids::{ClientId, RoomId};
