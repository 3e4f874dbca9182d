//! # chorus-store
//!
//! Persistence collaborator for the hub: durable room and user records.
//!
//! The hub only talks to the [`RoomRepository`] and [`UserRepository`]
//! traits; [`RoomRepo`] and [`UserRepo`] implement them over a shared
//! SQLite [`Database`].

#![deny(unsafe_code)]

pub mod database;
pub mod error;
pub mod repository;
pub mod rooms;
pub mod schema;
pub mod users;

pub use database::Database;
pub use error::StoreError;
pub use repository::{RoomRecord, RoomRepository, UserRecord, UserRepository};
pub use rooms::RoomRepo;
pub use users::UserRepo;
