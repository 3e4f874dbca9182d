//! The minimal identity capability every message sender exposes.

use serde::{Deserialize, Serialize};

/// Anything that can be named as the sender of a message.
pub trait Identity {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
}

/// A value-only identity, as read off the wire or out of storage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Peer {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

impl Peer {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Snapshot any identity into an owned value.
    pub fn of(identity: &impl Identity) -> Self {
        Self::new(identity.id(), identity.name())
    }
}

impl Identity for Peer {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }
}
