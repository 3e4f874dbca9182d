//! Registry hub: the process-wide directory of connections and rooms.
//!
//! A single command loop owns every map, so lookups and room creation for a
//! given name are linearized. A second task forwards the general backplane
//! topic (presence and private invites) into the same loop.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use chorus_core::protocol::GENERAL_TOPIC;
use chorus_core::{ClientId, Identity, Peer, RoomId};
use chorus_store::{RoomRepository, UserRepository};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::backplane::{Backplane, Subscription};
use crate::client::{ClientCommand, ClientHandle};
use crate::message::{decode, encode, Action, Envelope, Sender};
use crate::room::{spawn_room, RoomHandle};

const HUB_MAILBOX: usize = 1024;

enum HubCommand {
    Register(ClientHandle, oneshot::Sender<()>),
    Unregister(ClientId, oneshot::Sender<()>),
    FindRoomById(RoomId, oneshot::Sender<Option<RoomHandle>>),
    FindRoomByName(String, oneshot::Sender<Option<RoomHandle>>),
    FindUserById(ClientId, oneshot::Sender<Option<ClientHandle>>),
    FindOrCreateRoom {
        name: String,
        private: bool,
        reply: oneshot::Sender<RoomHandle>,
    },
    General(Bytes),
    Stats(oneshot::Sender<HubStats>),
}

/// Snapshot of the hub's directories.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HubStats {
    pub connections: usize,
    pub rooms: usize,
    pub known_users: usize,
}

/// Cloneable address of the hub loop.
///
/// Every method resolves to a "not found" value once the loop has stopped.
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl std::fmt::Debug for HubCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Register(..) => "Register",
            Self::Unregister(..) => "Unregister",
            Self::FindRoomById(..) => "FindRoomById",
            Self::FindRoomByName(..) => "FindRoomByName",
            Self::FindUserById(..) => "FindUserById",
            Self::FindOrCreateRoom { .. } => "FindOrCreateRoom",
            Self::General(..) => "General",
            Self::Stats(..) => "Stats",
        };
        f.write_str(name)
    }
}

impl HubHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> HubCommand) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(make(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn register(&self, client: ClientHandle) {
        self.request(|reply| HubCommand::Register(client, reply)).await;
    }

    pub async fn unregister(&self, id: ClientId) {
        self.request(|reply| HubCommand::Unregister(id, reply)).await;
    }

    pub async fn find_room_by_id(&self, id: &str) -> Option<RoomHandle> {
        let id = RoomId::from_raw(id);
        self.request(|reply| HubCommand::FindRoomById(id, reply))
            .await
            .flatten()
    }

    pub async fn find_room_by_name(&self, name: &str) -> Option<RoomHandle> {
        let name = name.to_owned();
        self.request(|reply| HubCommand::FindRoomByName(name, reply))
            .await
            .flatten()
    }

    /// Look up a connection attached to this process.
    pub async fn find_user_by_id(&self, id: &str) -> Option<ClientHandle> {
        let id = ClientId::from_raw(id);
        self.request(|reply| HubCommand::FindUserById(id, reply))
            .await
            .flatten()
    }

    pub async fn find_or_create_room(&self, name: &str, private: bool) -> Option<RoomHandle> {
        let name = name.to_owned();
        self.request(|reply| HubCommand::FindOrCreateRoom {
            name,
            private,
            reply,
        })
        .await
    }

    pub async fn stats(&self) -> HubStats {
        self.request(HubCommand::Stats).await.unwrap_or_default()
    }
}

/// Start the hub loop and its general-topic listener.
///
/// The presence directory is seeded from the user repository.
pub async fn spawn_hub(
    backplane: Arc<dyn Backplane>,
    room_repo: Arc<dyn RoomRepository>,
    user_repo: Arc<dyn UserRepository>,
) -> HubHandle {
    let (tx, rx) = mpsc::channel(HUB_MAILBOX);

    let users = match user_repo.get_all_users() {
        Ok(records) => records.iter().map(Peer::of).collect(),
        Err(e) => {
            warn!(error = %e, "could not load users");
            Vec::new()
        }
    };

    match backplane.subscribe(GENERAL_TOPIC).await {
        Ok(subscription) => {
            tokio::spawn(forward_general(subscription, tx.downgrade()));
        }
        Err(e) => error!(topic = GENERAL_TOPIC, error = %e, "general subscription failed"),
    }

    let hub = Hub {
        backplane,
        room_repo,
        user_repo,
        clients: HashMap::new(),
        rooms_by_id: HashMap::new(),
        rooms_by_name: HashMap::new(),
        users,
    };
    info!(known_users = hub.users.len(), "hub started");
    tokio::spawn(hub.run(rx));
    HubHandle { tx }
}

async fn forward_general(mut subscription: Subscription, mailbox: mpsc::WeakSender<HubCommand>) {
    while let Some(payload) = subscription.next().await {
        let Some(tx) = mailbox.upgrade() else { return };
        if tx.send(HubCommand::General(payload)).await.is_err() {
            return;
        }
    }
    warn!(topic = GENERAL_TOPIC, "general subscription ended");
}

struct Hub {
    backplane: Arc<dyn Backplane>,
    room_repo: Arc<dyn RoomRepository>,
    user_repo: Arc<dyn UserRepository>,
    clients: HashMap<ClientId, ClientHandle>,
    rooms_by_id: HashMap<RoomId, RoomHandle>,
    rooms_by_name: HashMap<String, RoomHandle>,
    /// Users known to be online on any process.
    users: Vec<Peer>,
}

impl Hub {
    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                HubCommand::Register(client, reply) => {
                    self.register(client).await;
                    let _ = reply.send(());
                }
                HubCommand::Unregister(id, reply) => {
                    self.unregister(&id).await;
                    let _ = reply.send(());
                }
                HubCommand::FindRoomById(id, reply) => {
                    let _ = reply.send(self.rooms_by_id.get(&id).cloned());
                }
                HubCommand::FindRoomByName(name, reply) => {
                    let _ = reply.send(self.rooms_by_name.get(&name).cloned());
                }
                HubCommand::FindUserById(id, reply) => {
                    let _ = reply.send(self.clients.get(&id).cloned());
                }
                HubCommand::FindOrCreateRoom {
                    name,
                    private,
                    reply,
                } => {
                    let room = self.find_or_create_room(&name, private).await;
                    let _ = reply.send(room);
                }
                HubCommand::General(payload) => self.handle_general(&payload),
                HubCommand::Stats(reply) => {
                    let _ = reply.send(HubStats {
                        connections: self.clients.len(),
                        rooms: self.rooms_by_id.len(),
                        known_users: self.users.len(),
                    });
                }
            }
        }
        debug!("hub stopped");
    }

    async fn register(&mut self, client: ClientHandle) {
        if let Err(e) = self.user_repo.add_user(client.client_id(), client.name()) {
            warn!(client_id = %client.client_id(), error = %e, "could not persist user");
        }

        let joined = Envelope::new(Action::UserJoin).with_sender(Sender::Client(client.clone()));
        self.publish_general(&joined).await;

        for user in &self.users {
            let presence = Envelope::new(Action::UserJoin).with_sender(Sender::Peer(user.clone()));
            client.try_deliver(Arc::from(encode(&presence)));
        }

        debug!(client_id = %client.client_id(), "client registered");
        self.clients.insert(client.client_id().clone(), client);
    }

    async fn unregister(&mut self, id: &ClientId) {
        let Some(client) = self.clients.remove(id) else {
            return;
        };
        if let Err(e) = self.user_repo.remove_user(id) {
            warn!(client_id = %id, error = %e, "could not remove user");
        }

        let left = Envelope::new(Action::UserLeft).with_sender(Sender::Client(client));
        self.publish_general(&left).await;
        debug!(client_id = %id, "client unregistered");
    }

    async fn find_or_create_room(&mut self, name: &str, private: bool) -> RoomHandle {
        if let Some(room) = self.rooms_by_name.get(name) {
            return room.clone();
        }

        let (id, private) = match self.room_repo.find_room_by_name(name) {
            Ok(Some(record)) => (record.id, record.private),
            Ok(None) => self.persist_room(name, private),
            Err(e) => {
                warn!(room = %name, error = %e, "room lookup failed");
                (RoomId::new(), private)
            }
        };

        let room = spawn_room(id, name, private, self.backplane.clone()).await;
        self.rooms_by_id.insert(room.id().clone(), room.clone());
        self.rooms_by_name.insert(name.to_owned(), room.clone());
        room
    }

    /// Persist a new room and read it back, so a process that raced us to the
    /// same name leaves both sides with the stored id.
    fn persist_room(&self, name: &str, private: bool) -> (RoomId, bool) {
        let id = RoomId::new();
        if let Err(e) = self.room_repo.add_room(&id, name, private) {
            warn!(room = %name, error = %e, "could not persist room");
            return (id, private);
        }
        match self.room_repo.find_room_by_name(name) {
            Ok(Some(record)) => (record.id, record.private),
            Ok(None) => (id, private),
            Err(e) => {
                warn!(room = %name, error = %e, "room lookup failed");
                (id, private)
            }
        }
    }

    fn handle_general(&mut self, payload: &Bytes) {
        let envelope = match decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = GENERAL_TOPIC, error = %e, "dropping general payload");
                return;
            }
        };

        match envelope.action {
            Action::UserJoin => {
                if let Some(sender) = &envelope.sender {
                    if !self.users.iter().any(|u| u.id == sender.id()) {
                        self.users.push(sender.to_peer());
                    }
                }
                self.relay(payload);
            }
            Action::UserLeft => {
                if let Some(sender) = &envelope.sender {
                    self.users.retain(|u| u.id != sender.id());
                }
                self.relay(payload);
            }
            Action::JoinRoomPrivate => {
                let Some(target) = envelope.target else {
                    return;
                };
                let Some(client) = self.clients.get(&ClientId::from_raw(envelope.message)) else {
                    return;
                };
                let inviter = envelope.sender.map(|s| s.to_peer()).unwrap_or_default();
                client.command(ClientCommand::JoinPrivate {
                    room_name: target.name,
                    inviter,
                });
            }
            _ => {}
        }
    }

    /// Forward a general payload to every local connection.
    fn relay(&self, payload: &Bytes) {
        let Ok(text) = std::str::from_utf8(payload) else {
            return;
        };
        let text: Arc<str> = Arc::from(text);
        for client in self.clients.values() {
            client.try_deliver(text.clone());
        }
    }

    async fn publish_general(&self, envelope: &Envelope) {
        let payload = encode(envelope);
        if payload.is_empty() {
            return;
        }
        if let Err(e) = self.backplane.publish(GENERAL_TOPIC, Bytes::from(payload)).await {
            warn!(topic = GENERAL_TOPIC, error = %e, "general publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::LocalBackplane;
    use crate::client::test_support::TestClient;
    use chorus_store::{Database, RoomRepo, StoreError, UserRecord, UserRepo};
    use std::time::Duration;

    async fn hub_with(backplane: Arc<dyn Backplane>, db: &Database) -> HubHandle {
        spawn_hub(
            backplane,
            Arc::new(RoomRepo::new(db.clone())),
            Arc::new(UserRepo::new(db.clone())),
        )
        .await
    }

    async fn fresh_hub() -> HubHandle {
        hub_with(
            Arc::new(LocalBackplane::new()),
            &Database::in_memory().unwrap(),
        )
        .await
    }

    #[tokio::test]
    async fn register_then_unregister() {
        let hub = fresh_hub().await;
        let alice = TestClient::new("alice");
        let id = alice.handle.id().to_owned();

        hub.register(alice.handle.clone()).await;
        assert_eq!(hub.find_user_by_id(&id).await.unwrap().name(), "alice");
        assert_eq!(hub.stats().await.connections, 1);

        hub.unregister(alice.handle.client_id().clone()).await;
        hub.unregister(alice.handle.client_id().clone()).await;
        assert!(hub.find_user_by_id(&id).await.is_none());
        assert_eq!(hub.stats().await.connections, 0);
    }

    #[tokio::test]
    async fn concurrent_creates_converge_on_one_room() {
        let hub = fresh_hub().await;
        let (a, b) = tokio::join!(
            hub.find_or_create_room("lobby", false),
            hub.find_or_create_room("lobby", false)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert_eq!(hub.stats().await.rooms, 1);

        let by_id = hub.find_room_by_id(a.id().as_str()).await.unwrap();
        assert_eq!(by_id.name(), "lobby");
        assert!(hub.find_room_by_name("lobby").await.is_some());
        assert!(hub.find_room_by_name("nowhere").await.is_none());
    }

    #[tokio::test]
    async fn rooms_are_rehydrated_from_the_repository() {
        let db = Database::in_memory().unwrap();
        let first = hub_with(Arc::new(LocalBackplane::new()), &db).await;
        let created = first.find_or_create_room("secret", true).await.unwrap();

        let second = hub_with(Arc::new(LocalBackplane::new()), &db).await;
        assert!(second.find_room_by_name("secret").await.is_none());
        let loaded = second.find_or_create_room("secret", false).await.unwrap();
        assert_eq!(loaded.id(), created.id());
        assert!(loaded.is_private());
    }

    #[tokio::test]
    async fn newcomer_receives_presence_replay_and_own_join() {
        let db = Database::in_memory().unwrap();
        UserRepo::new(db.clone())
            .add_user(&ClientId::from_raw("user_old"), "olga")
            .unwrap();
        let hub = hub_with(Arc::new(LocalBackplane::new()), &db).await;

        let mut alice = TestClient::new("alice");
        hub.register(alice.handle.clone()).await;

        let replay = alice.next().await;
        assert_eq!(replay.action, Action::UserJoin);
        assert_eq!(replay.sender.unwrap().name(), "olga");

        let own = alice.next().await;
        assert_eq!(own.action, Action::UserJoin);
        assert_eq!(own.sender.unwrap().id(), alice.handle.id());
        assert_eq!(hub.stats().await.known_users, 2);
    }

    #[tokio::test]
    async fn presence_follows_joins_and_leaves_across_hubs() {
        let bp: Arc<dyn Backplane> = Arc::new(LocalBackplane::new());
        let here = hub_with(bp.clone(), &Database::in_memory().unwrap()).await;
        let there = hub_with(bp, &Database::in_memory().unwrap()).await;

        let mut alice = TestClient::new("alice");
        here.register(alice.handle.clone()).await;
        alice.next_matching(Action::UserJoin).await;

        let bob = TestClient::new("bob");
        there.register(bob.handle.clone()).await;
        let joined = alice.next_matching(Action::UserJoin).await;
        assert_eq!(joined.sender.unwrap().name(), "bob");

        there.unregister(bob.handle.client_id().clone()).await;
        let left = alice.next_matching(Action::UserLeft).await;
        assert_eq!(left.sender.unwrap().id(), bob.handle.id());
        assert_eq!(here.stats().await.known_users, 1);
    }

    #[tokio::test]
    async fn private_invite_reaches_local_target_only() {
        let bp: Arc<dyn Backplane> = Arc::new(LocalBackplane::new());
        let hub = hub_with(bp.clone(), &Database::in_memory().unwrap()).await;
        let mut bob = TestClient::new("bob");
        let mut carol = TestClient::new("carol");
        hub.register(bob.handle.clone()).await;
        hub.register(carol.handle.clone()).await;

        let invite = Envelope::new(Action::JoinRoomPrivate)
            .with_message(bob.handle.id())
            .with_target(crate::message::RoomRef {
                id: "room_p".into(),
                name: "pair".into(),
                private: true,
            })
            .with_sender(Sender::Peer(Peer::new("user_alice", "alice")));
        bp.publish(GENERAL_TOPIC, Bytes::from(encode(&invite)))
            .await
            .unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(1), bob.control.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            cmd,
            ClientCommand::JoinPrivate {
                room_name: "pair".into(),
                inviter: Peer::new("user_alice", "alice"),
            }
        );
        assert!(carol.control.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_general_payload_is_ignored() {
        let bp: Arc<dyn Backplane> = Arc::new(LocalBackplane::new());
        let hub = hub_with(bp.clone(), &Database::in_memory().unwrap()).await;
        bp.publish(GENERAL_TOPIC, Bytes::from_static(b"garbage"))
            .await
            .unwrap();
        assert_eq!(hub.stats().await, HubStats::default());
    }

    struct BrokenUsers;

    impl UserRepository for BrokenUsers {
        fn add_user(&self, _: &ClientId, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }

        fn remove_user(&self, _: &ClientId) -> Result<(), StoreError> {
            Err(StoreError::Database("disk full".into()))
        }

        fn find_user_by_id(&self, _: &ClientId) -> Result<Option<UserRecord>, StoreError> {
            Err(StoreError::Database("disk full".into()))
        }

        fn get_all_users(&self) -> Result<Vec<UserRecord>, StoreError> {
            Err(StoreError::Database("disk full".into()))
        }
    }

    #[tokio::test]
    async fn repository_failures_do_not_stop_the_hub() {
        let db = Database::in_memory().unwrap();
        let hub = spawn_hub(
            Arc::new(LocalBackplane::new()),
            Arc::new(RoomRepo::new(db)),
            Arc::new(BrokenUsers),
        )
        .await;

        let alice = TestClient::new("alice");
        hub.register(alice.handle.clone()).await;
        assert!(hub.find_user_by_id(alice.handle.id()).await.is_some());
        hub.unregister(alice.handle.client_id().clone()).await;
        assert!(hub.find_or_create_room("lobby", false).await.is_some());
    }
}
