//! Room actor: membership and fan-out for one named room.
//!
//! A room never delivers a broadcast directly. `Broadcast` publishes to the
//! room's backplane topic, and every payload arriving on that topic (from
//! this process or any other) is fanned out to local members as `Deliver`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use chorus_core::protocol::welcome_message;
use chorus_core::{ClientId, Identity, RoomId};
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::backplane::{Backplane, Subscription};
use crate::client::ClientHandle;
use crate::message::{encode, Action, Envelope, RoomRef};

const ROOM_MAILBOX: usize = 256;
const MAX_IN_FLIGHT: usize = 1024;

#[derive(Debug)]
pub(crate) enum RoomCommand {
    Register(ClientHandle),
    Unregister(ClientId),
    Broadcast(Envelope),
    Deliver(Bytes),
}

/// Cloneable address of a running room.
#[derive(Clone, Debug)]
pub struct RoomHandle {
    id: RoomId,
    name: Arc<str>,
    private: bool,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn id(&self) -> &RoomId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Wire reference to this room.
    pub fn target(&self) -> RoomRef {
        RoomRef {
            id: self.id.to_string(),
            name: self.name.to_string(),
            private: self.private,
        }
    }

    pub async fn register(&self, client: ClientHandle) {
        self.send(RoomCommand::Register(client)).await;
    }

    pub async fn unregister(&self, id: ClientId) {
        self.send(RoomCommand::Unregister(id)).await;
    }

    pub async fn broadcast(&self, envelope: Envelope) {
        self.send(RoomCommand::Broadcast(envelope)).await;
    }

    async fn send(&self, cmd: RoomCommand) {
        if self.tx.send(cmd).await.is_err() {
            debug!(room = %self.name, "room loop has stopped");
        }
    }
}

/// Start a room and its backplane subscription.
///
/// The subscription is established before this returns, so a publish made
/// after `spawn_room` completes is always delivered to the room.
pub async fn spawn_room(
    id: RoomId,
    name: &str,
    private: bool,
    backplane: Arc<dyn Backplane>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(ROOM_MAILBOX);
    let handle = RoomHandle {
        id: id.clone(),
        name: Arc::from(name),
        private,
        tx,
    };

    match backplane.subscribe(name).await {
        Ok(subscription) => {
            tokio::spawn(forward_subscription(
                subscription,
                handle.tx.downgrade(),
                name.to_owned(),
            ));
        }
        Err(e) => error!(room = %name, error = %e, "room subscription failed"),
    }

    let room = Room {
        id,
        name: name.to_owned(),
        private,
        backplane,
        members: HashMap::new(),
        published: 0,
        in_flight: VecDeque::new(),
    };
    tokio::spawn(room.run(rx));
    info!(room = %name, private, "room started");
    handle
}

async fn forward_subscription(
    mut subscription: Subscription,
    mailbox: mpsc::WeakSender<RoomCommand>,
    name: String,
) {
    while let Some(payload) = subscription.next().await {
        let Some(tx) = mailbox.upgrade() else { return };
        if tx.send(RoomCommand::Deliver(payload)).await.is_err() {
            return;
        }
    }
    // The room is still running but will hear nothing more from other processes.
    warn!(room = %name, "room subscription ended");
}

struct Member {
    client: ClientHandle,
    /// Own publishes up to this sequence predate the member and are withheld.
    since: u64,
}

struct Room {
    id: RoomId,
    name: String,
    private: bool,
    backplane: Arc<dyn Backplane>,
    members: HashMap<ClientId, Member>,
    /// Count of successful publishes from this room.
    published: u64,
    /// Own publishes not yet seen back on the subscription, oldest first.
    in_flight: VecDeque<(u64, Bytes)>,
}

impl Room {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCommand::Register(client) => self.register(client).await,
                RoomCommand::Unregister(id) => {
                    if self.members.remove(&id).is_some() {
                        debug!(room = %self.name, client_id = %id, "member left");
                    }
                }
                RoomCommand::Broadcast(envelope) => self.publish(&envelope).await,
                RoomCommand::Deliver(payload) => self.deliver(payload).await,
            }
        }
        debug!(room = %self.name, "room stopped");
    }

    async fn register(&mut self, client: ClientHandle) {
        let id = client.client_id().clone();
        if self.members.contains_key(&id) {
            return;
        }

        if !self.private {
            let notice = Envelope::new(Action::SendMessage)
                .with_message(welcome_message(client.name()))
                .with_target(self.target());
            self.publish(&notice).await;
        }

        debug!(room = %self.name, client_id = %id, "member joined");
        self.members.insert(
            id,
            Member {
                client,
                since: self.published,
            },
        );
    }

    async fn publish(&mut self, envelope: &Envelope) {
        let payload = encode(envelope);
        if payload.is_empty() {
            return;
        }
        let payload = Bytes::from(payload);
        match self.backplane.publish(&self.name, payload.clone()).await {
            Ok(()) => {
                self.published += 1;
                if self.in_flight.len() == MAX_IN_FLIGHT {
                    self.in_flight.pop_front();
                }
                self.in_flight.push_back((self.published, payload));
            }
            Err(e) => warn!(room = %self.name, error = %e, "publish failed"),
        }
    }

    /// Sequence of `payload` if it is one of this room's own publishes.
    ///
    /// Entries ahead of the match were lost on the subscription and are dropped.
    fn own_sequence(&mut self, payload: &Bytes) -> Option<u64> {
        let pos = self.in_flight.iter().position(|(_, p)| p == payload)?;
        self.in_flight.drain(..pos);
        self.in_flight.pop_front().map(|(seq, _)| seq)
    }

    async fn deliver(&mut self, payload: Bytes) {
        let text: Arc<str> = match std::str::from_utf8(&payload) {
            Ok(text) => Arc::from(text),
            Err(e) => {
                warn!(room = %self.name, error = %e, "dropping non-utf8 payload");
                return;
            }
        };
        let seq = self.own_sequence(&payload);

        let mut closed = Vec::new();
        for (id, member) in &self.members {
            if seq.is_some_and(|s| s <= member.since) {
                continue;
            }
            if !member.client.deliver(text.clone()).await {
                closed.push(id.clone());
            }
        }

        for id in closed {
            self.members.remove(&id);
            debug!(room = %self.name, client_id = %id, "pruned closed member");
        }
        trace!(room = %self.name, members = self.members.len(), "delivered");
    }

    fn target(&self) -> RoomRef {
        RoomRef {
            id: self.id.to_string(),
            name: self.name.clone(),
            private: self.private,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backplane::test_support::FailingPublish;
    use crate::backplane::LocalBackplane;
    use crate::client::test_support::TestClient;
    use crate::message::Sender;

    fn say(client: &TestClient, text: &str) -> Envelope {
        Envelope::new(Action::SendMessage)
            .with_message(text)
            .with_sender(Sender::Client(client.handle.clone()))
    }

    async fn lobby(backplane: Arc<dyn Backplane>) -> RoomHandle {
        spawn_room(RoomId::from_raw("room_lobby"), "lobby", false, backplane).await
    }

    #[tokio::test]
    async fn sender_receives_own_broadcast() {
        let room = lobby(Arc::new(LocalBackplane::new())).await;
        let mut alice = TestClient::new("alice");
        room.register(alice.handle.clone()).await;

        room.broadcast(say(&alice, "hi")).await;

        let got = alice.next().await;
        assert_eq!(got.message, "hi");
        assert_eq!(got.sender.unwrap().name(), "alice");
    }

    #[tokio::test]
    async fn join_notice_reaches_existing_members_only() {
        let room = lobby(Arc::new(LocalBackplane::new())).await;
        let mut bob = TestClient::new("bob");
        let mut alice = TestClient::new("alice");
        room.register(bob.handle.clone()).await;
        room.register(alice.handle.clone()).await;

        let notice = bob.next().await;
        assert_eq!(notice.action, Action::SendMessage);
        assert_eq!(notice.message, "alice joined the room");
        assert_eq!(notice.target.unwrap().name, "lobby");
        assert!(notice.sender.is_none());

        room.broadcast(say(&bob, "welcome")).await;
        // Alice's first frame is the broadcast, not her own join notice.
        assert_eq!(alice.next().await.message, "welcome");
        assert_eq!(bob.next().await.message, "welcome");
    }

    #[tokio::test]
    async fn private_room_has_no_join_notice() {
        let bp: Arc<dyn Backplane> = Arc::new(LocalBackplane::new());
        let room = spawn_room(RoomId::new(), "user_auser_b", true, bp).await;
        let mut a = TestClient::new("a");
        let b = TestClient::new("b");
        room.register(a.handle.clone()).await;
        room.register(b.handle.clone()).await;

        a.assert_quiet().await;
    }

    #[tokio::test]
    async fn double_register_is_ignored() {
        let room = lobby(Arc::new(LocalBackplane::new())).await;
        let mut bob = TestClient::new("bob");
        let alice = TestClient::new("alice");
        room.register(bob.handle.clone()).await;
        room.register(alice.handle.clone()).await;
        room.register(alice.handle.clone()).await;

        assert_eq!(bob.next().await.message, "alice joined the room");
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let room = lobby(Arc::new(LocalBackplane::new())).await;
        let mut alice = TestClient::new("alice");
        let mut bob = TestClient::new("bob");
        room.register(alice.handle.clone()).await;
        room.register(bob.handle.clone()).await;
        alice.next_matching(Action::SendMessage).await;

        room.unregister(bob.handle.client_id().clone()).await;
        room.unregister(bob.handle.client_id().clone()).await;
        room.broadcast(say(&alice, "still here")).await;

        assert_eq!(alice.next().await.message, "still here");
        bob.assert_quiet().await;
    }

    #[tokio::test]
    async fn rooms_sharing_a_backplane_see_each_others_broadcasts() {
        let bp: Arc<dyn Backplane> = Arc::new(LocalBackplane::new());
        let here = lobby(bp.clone()).await;
        let there = lobby(bp).await;

        let mut alice = TestClient::new("alice");
        let mut bob = TestClient::new("bob");
        here.register(alice.handle.clone()).await;
        alice.assert_quiet().await;
        there.register(bob.handle.clone()).await;

        // Bob's join notice crosses to alice's room; bob never sees it.
        assert_eq!(alice.next().await.message, "bob joined the room");

        here.broadcast(say(&alice, "across")).await;
        assert_eq!(alice.next().await.message, "across");
        let got = bob.next().await;
        assert_eq!(got.message, "across");
        assert_eq!(got.sender.unwrap().id(), alice.handle.id());
    }

    #[tokio::test]
    async fn publish_failure_keeps_room_alive() {
        let bp = Arc::new(FailingPublish(LocalBackplane::new()));
        let room = lobby(bp.clone()).await;
        let mut alice = TestClient::new("alice");
        room.register(alice.handle.clone()).await;
        room.broadcast(say(&alice, "lost")).await;
        alice.assert_quiet().await;

        // Payloads published by other processes still arrive.
        bp.0
            .publish("lobby", Bytes::from(encode(&say(&alice, "from afar"))))
            .await
            .unwrap();
        assert_eq!(alice.next().await.message, "from afar");
    }

    #[tokio::test]
    async fn closed_members_are_pruned() {
        let bp = Arc::new(LocalBackplane::new());
        let room = lobby(bp.clone()).await;
        let mut alice = TestClient::new("alice");
        let mut gone = TestClient::new("gone");
        room.register(gone.handle.clone()).await;
        room.register(alice.handle.clone()).await;
        gone.close();

        room.broadcast(say(&alice, "one")).await;
        room.broadcast(say(&alice, "two")).await;

        assert_eq!(alice.next().await.message, "one");
        assert_eq!(alice.next().await.message, "two");
    }

    #[tokio::test]
    async fn target_describes_room() {
        let room = spawn_room(
            RoomId::from_raw("room_x"),
            "x",
            true,
            Arc::new(LocalBackplane::new()),
        )
        .await;
        assert_eq!(
            room.target(),
            RoomRef {
                id: "room_x".into(),
                name: "x".into(),
                private: true
            }
        );
    }
}
