//! Wire envelope and its JSON codec.
//!
//! One envelope is one JSON object:
//!
//! ```text
//! {"action":"send-message","message":"hi","target":{"id":..,"name":..,"private":false},"sender":{"id":..,"name":..}}
//! ```
//!
//! `sender` is polymorphic in memory: decoding always yields a value-only
//! [`Sender::Peer`], and the connection actor replaces it with the live
//! [`Sender::Client`] before routing. Both encode to the same `{id, name}`.

use chorus_core::{Identity, Peer};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::error;

use crate::client::ClientHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    SendMessage,
    JoinRoom,
    LeaveRoom,
    JoinRoomPrivate,
    UserJoin,
    UserLeft,
    RoomJoined,
}

/// Reference to a room as carried in `target`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub private: bool,
}

/// Who a message is attributed to.
#[derive(Clone, Debug)]
pub enum Sender {
    /// Identity read off the wire or out of storage.
    Peer(Peer),
    /// A connection attached to this process.
    Client(ClientHandle),
}

impl Sender {
    pub fn to_peer(&self) -> Peer {
        match self {
            Self::Peer(peer) => peer.clone(),
            Self::Client(client) => Peer::of(client),
        }
    }
}

impl Identity for Sender {
    fn id(&self) -> &str {
        match self {
            Self::Peer(peer) => peer.id(),
            Self::Client(client) => client.id(),
        }
    }

    fn name(&self) -> &str {
        match self {
            Self::Peer(peer) => peer.name(),
            Self::Client(client) => client.name(),
        }
    }
}

impl PartialEq for Sender {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id() && self.name() == other.name()
    }
}

impl Serialize for Sender {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Sender", 2)?;
        state.serialize_field("id", self.id())?;
        state.serialize_field("name", self.name())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for Sender {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Peer::deserialize(deserializer).map(Sender::Peer)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub target: Option<RoomRef>,
    #[serde(default)]
    pub sender: Option<Sender>,
}

impl Envelope {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            message: String::new(),
            target: None,
            sender: None,
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: RoomRef) -> Self {
        self.target = Some(target);
        self
    }

    #[must_use]
    pub fn with_sender(mut self, sender: Sender) -> Self {
        self.sender = Some(sender);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// Serialize an envelope for the wire.
///
/// Never fails: a serialization error is logged and yields an empty payload.
pub fn encode(envelope: &Envelope) -> String {
    serde_json::to_string(envelope).unwrap_or_else(|e| {
        error!(action = ?envelope.action, error = %e, "failed to encode envelope");
        String::new()
    })
}

pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    Ok(serde_json::from_slice(bytes)?)
}
