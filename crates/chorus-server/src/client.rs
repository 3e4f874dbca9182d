//! Connection actor: one per WebSocket.
//!
//! The inbound side ([`Client::run`]) reads frames, stamps them with the
//! connection's identity and routes them to the hub or a room. The outbound
//! side ([`write_pump`]) drains the connection's queue onto the socket and
//! keeps the peer alive with pings.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use bytes::Bytes;
use chorus_core::protocol::{private_room_name, FRAME_DELIMITER, GENERAL_TOPIC};
use chorus_core::{ClientId, Identity, Peer, RoomId};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::backplane::Backplane;
use crate::hub::HubHandle;
use crate::message::{decode, encode, Action, Envelope, Sender};
use crate::room::RoomHandle;

const CONTROL_MAILBOX: usize = 16;

/// Commands the hub sends to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    /// Join a private room another user has opened with this connection.
    JoinPrivate { room_name: String, inviter: Peer },
}

/// Address of a connection actor.
///
/// Holds only a weak reference to the outbound queue: the queue closes as
/// soon as the actor drops its own sender, however many handles are alive.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    name: Arc<str>,
    outbound: mpsc::WeakSender<Arc<str>>,
    control: mpsc::Sender<ClientCommand>,
}

impl ClientHandle {
    pub fn client_id(&self) -> &ClientId {
        &self.id
    }

    /// Queue a payload, waiting for space. Returns false once the queue is closed.
    pub async fn deliver(&self, payload: Arc<str>) -> bool {
        match self.outbound.upgrade() {
            Some(tx) => tx.send(payload).await.is_ok(),
            None => false,
        }
    }

    /// Queue a payload without waiting. A full queue drops the payload.
    pub fn try_deliver(&self, payload: Arc<str>) -> bool {
        let Some(tx) = self.outbound.upgrade() else {
            return false;
        };
        match tx.try_send(payload) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %self.id, "send queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn command(&self, cmd: ClientCommand) -> bool {
        match self.control.try_send(cmd) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(client_id = %self.id, "control mailbox full, dropping command");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

impl Identity for ClientHandle {
    fn id(&self) -> &str {
        self.id.as_str()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Receiving ends owned by the two halves of a connection.
pub struct Mailboxes {
    pub outbound: mpsc::Receiver<Arc<str>>,
    pub control: mpsc::Receiver<ClientCommand>,
}

/// Create a handle plus the strong outbound sender and both receivers.
pub(crate) fn channels(
    name: &str,
    send_buffer: usize,
) -> (ClientHandle, mpsc::Sender<Arc<str>>, Mailboxes) {
    let (out_tx, out_rx) = mpsc::channel(send_buffer.max(1));
    let (ctl_tx, ctl_rx) = mpsc::channel(CONTROL_MAILBOX);
    let handle = ClientHandle {
        id: ClientId::new(),
        name: Arc::from(name),
        outbound: out_tx.downgrade(),
        control: ctl_tx,
    };
    let mailboxes = Mailboxes {
        outbound: out_rx,
        control: ctl_rx,
    };
    (handle, out_tx, mailboxes)
}

/// Write and read deadlines for one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepAlive {
    /// Bound on any single socket write.
    pub write_wait: Duration,
    /// Silence allowed between pongs before the connection is dropped.
    pub pong_wait: Duration,
    /// Interval between pings; shorter than `pong_wait`.
    pub ping_period: Duration,
}

impl KeepAlive {
    pub fn new(write_wait: Duration, pong_wait: Duration) -> Self {
        Self {
            write_wait,
            pong_wait,
            ping_period: (pong_wait * 9 / 10).max(Duration::from_millis(1)),
        }
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(60))
    }
}

/// Inbound half of a connection and the memberships it holds.
pub struct Client {
    handle: ClientHandle,
    hub: HubHandle,
    backplane: Arc<dyn Backplane>,
    rooms: HashMap<RoomId, RoomHandle>,
    /// The only strong sender onto the outbound queue. `None` once disconnected.
    outbound: Option<mpsc::Sender<Arc<str>>>,
}

impl Client {
    pub fn new(
        name: &str,
        hub: HubHandle,
        backplane: Arc<dyn Backplane>,
        send_buffer: usize,
    ) -> (Self, Mailboxes) {
        let (handle, outbound, mailboxes) = channels(name, send_buffer);
        let client = Self {
            handle,
            hub,
            backplane,
            rooms: HashMap::new(),
            outbound: Some(outbound),
        };
        (client, mailboxes)
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    /// Read frames until the socket closes, errors or misses the pong deadline,
    /// then tear the connection down.
    pub async fn run<St, E>(
        mut self,
        mut socket: St,
        mut control: mpsc::Receiver<ClientCommand>,
        keepalive: KeepAlive,
    ) where
        St: Stream<Item = Result<WsMessage, E>> + Unpin,
        E: fmt::Display,
    {
        let Some(writer) = self.outbound.clone() else {
            return;
        };
        let deadline = time::sleep(keepalive.pong_wait);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                frame = socket.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.handle_frame(text.as_str().as_bytes()).await,
                    Some(Ok(WsMessage::Binary(data))) => self.handle_frame(&data).await,
                    Some(Ok(WsMessage::Pong(_))) => {
                        deadline.as_mut().reset(Instant::now() + keepalive.pong_wait);
                    }
                    Some(Ok(WsMessage::Ping(_))) => {}
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(client_id = %self.handle.id, error = %e, "socket read failed");
                        break;
                    }
                },
                Some(cmd) = control.recv() => self.handle_command(cmd).await,
                () = &mut deadline => {
                    info!(client_id = %self.handle.id, "pong deadline expired");
                    break;
                }
                () = writer.closed() => {
                    debug!(client_id = %self.handle.id, "write pump stopped");
                    break;
                }
            }
        }

        drop(writer);
        self.disconnect().await;
    }

    pub(crate) async fn handle_frame(&mut self, bytes: &[u8]) {
        let mut envelope = match decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(client_id = %self.handle.id, error = %e, "dropping inbound frame");
                return;
            }
        };
        envelope.sender = Some(Sender::Client(self.handle.clone()));

        match envelope.action {
            Action::SendMessage => self.handle_send_message(envelope).await,
            Action::JoinRoom => self.handle_join_room(envelope).await,
            Action::LeaveRoom => self.handle_leave_room(envelope).await,
            Action::JoinRoomPrivate => self.handle_join_room_private(envelope).await,
            other => trace!(client_id = %self.handle.id, action = ?other, "ignoring action"),
        }
    }

    async fn handle_send_message(&mut self, mut envelope: Envelope) {
        let Some(target) = envelope.target.as_ref() else {
            return;
        };
        let room = match self.hub.find_room_by_id(&target.id).await {
            Some(room) => room,
            None => {
                let name = if target.name.is_empty() {
                    &target.id
                } else {
                    &target.name
                };
                match self.hub.find_room_by_name(name).await {
                    Some(room) => room,
                    None => return,
                }
            }
        };
        envelope.target = Some(room.target());
        room.broadcast(envelope).await;
    }

    async fn handle_join_room(&mut self, envelope: Envelope) {
        let name = envelope.message.trim();
        if name.is_empty() {
            return;
        }
        self.join_room(name, None).await;
    }

    async fn handle_leave_room(&mut self, envelope: Envelope) {
        let key = if envelope.message.is_empty() {
            match envelope.target {
                Some(target) => target.id,
                None => return,
            }
        } else {
            envelope.message
        };

        let room = match self.hub.find_room_by_id(&key).await {
            Some(room) => room,
            None => match self.hub.find_room_by_name(&key).await {
                Some(room) => room,
                None => return,
            },
        };
        self.rooms.remove(room.id());
        room.unregister(self.handle.id.clone()).await;
    }

    async fn handle_join_room_private(&mut self, envelope: Envelope) {
        let target_id = envelope.message;
        if target_id == self.handle.id.as_str() {
            return;
        }
        let Some(target) = self.hub.find_user_by_id(&target_id).await else {
            return;
        };

        let name = private_room_name(self.handle.id.as_str(), target.id());
        let Some(room) = self.join_room(&name, Some(Peer::of(&target))).await else {
            return;
        };

        let invite = Envelope::new(Action::JoinRoomPrivate)
            .with_message(target_id)
            .with_target(room.target())
            .with_sender(Sender::Client(self.handle.clone()));
        let payload = encode(&invite);
        if payload.is_empty() {
            return;
        }
        if let Err(e) = self.backplane.publish(GENERAL_TOPIC, Bytes::from(payload)).await {
            warn!(client_id = %self.handle.id, error = %e, "private invite not published");
        }
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        match cmd {
            ClientCommand::JoinPrivate { room_name, inviter } => {
                self.join_room(&room_name, Some(inviter)).await;
            }
        }
    }

    /// Join a room by name, creating it if needed.
    ///
    /// `peer` marks a private join and names the other participant. A join
    /// whose privacy differs from the existing room's is refused.
    pub async fn join_room(&mut self, name: &str, peer: Option<Peer>) -> Option<RoomHandle> {
        let private = peer.is_some();
        let room = self.hub.find_or_create_room(name, private).await?;
        if room.is_private() != private {
            debug!(
                client_id = %self.handle.id,
                room = %name,
                private,
                "refusing join across room privacy"
            );
            return None;
        }

        if !self.rooms.contains_key(room.id()) {
            self.rooms.insert(room.id().clone(), room.clone());
            room.register(self.handle.clone()).await;
            self.notify_room_joined(&room, peer).await;
        }
        Some(room)
    }

    async fn notify_room_joined(&self, room: &RoomHandle, peer: Option<Peer>) {
        let mut envelope = Envelope::new(Action::RoomJoined).with_target(room.target());
        envelope.sender = peer.map(Sender::Peer);
        let payload = encode(&envelope);
        if payload.is_empty() {
            return;
        }
        if let Some(tx) = &self.outbound {
            let _ = tx.send(Arc::from(payload)).await;
        }
    }

    /// Leave the hub and every room, then close the outbound queue.
    ///
    /// Runs once; later calls do nothing.
    pub async fn disconnect(&mut self) {
        let Some(outbound) = self.outbound.take() else {
            return;
        };
        self.hub.unregister(self.handle.id.clone()).await;
        for (_, room) in self.rooms.drain() {
            room.unregister(self.handle.id.clone()).await;
        }
        drop(outbound);
        info!(client_id = %self.handle.id, name = %self.handle.name, "client disconnected");
    }
}

/// Drain the outbound queue onto the socket and ping on a fixed interval.
///
/// Payloads already queued behind the one being sent go into the same frame,
/// separated by `*`. Queue closure sends a Close frame; any failed or
/// timed-out write ends the pump.
pub async fn write_pump<S>(mut sink: S, mut rx: mpsc::Receiver<Arc<str>>, keepalive: KeepAlive)
where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    let mut ticker = time::interval_at(
        Instant::now() + keepalive.ping_period,
        keepalive.ping_period,
    );

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(first) => {
                    let frame = coalesce(first, &mut rx);
                    if !write(&mut sink, WsMessage::Text(frame.into()), keepalive.write_wait).await {
                        return;
                    }
                }
                None => {
                    write(&mut sink, WsMessage::Close(None), keepalive.write_wait).await;
                    return;
                }
            },
            _ = ticker.tick() => {
                if !write(&mut sink, WsMessage::Ping(Bytes::new()), keepalive.write_wait).await {
                    return;
                }
                trace!("sent ping");
            }
        }
    }
}

fn coalesce(first: Arc<str>, rx: &mut mpsc::Receiver<Arc<str>>) -> String {
    let pending = rx.len();
    let mut frame = String::from(&*first);
    for _ in 0..pending {
        match rx.try_recv() {
            Ok(next) => {
                frame.push(char::from(FRAME_DELIMITER));
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

async fn write<S>(sink: &mut S, msg: WsMessage, wait: Duration) -> bool
where
    S: Sink<WsMessage> + Unpin,
    S::Error: fmt::Display,
{
    match time::timeout(wait, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "socket write failed");
            false
        }
        Err(_) => {
            debug!("socket write timed out");
            false
        }
    }
}

/// Run a connection end to end on an upgraded socket.
pub async fn serve(
    socket: WebSocket,
    name: String,
    hub: HubHandle,
    backplane: Arc<dyn Backplane>,
    keepalive: KeepAlive,
    send_buffer: usize,
) {
    let (client, mailboxes) = Client::new(&name, hub.clone(), backplane, send_buffer);
    let handle = client.handle().clone();
    info!(client_id = %handle.id, name = %name, "client connected");

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, mailboxes.outbound, keepalive));

    hub.register(handle).await;
    client.run(stream, mailboxes.control, keepalive).await;

    if let Err(e) = writer.await {
        warn!(error = %e, "write pump panicked");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A connection without a socket: a handle plus direct access to its queues.
    pub(crate) struct TestClient {
        pub handle: ClientHandle,
        outbound: Option<mpsc::Sender<Arc<str>>>,
        rx: mpsc::Receiver<Arc<str>>,
        pub control: mpsc::Receiver<ClientCommand>,
    }

    impl TestClient {
        pub fn new(name: &str) -> Self {
            let (handle, outbound, mailboxes) = channels(name, 64);
            Self {
                handle,
                outbound: Some(outbound),
                rx: mailboxes.outbound,
                control: mailboxes.control,
            }
        }

        pub async fn next(&mut self) -> Envelope {
            next_envelope(&mut self.rx).await
        }

        /// Skip ahead to the next envelope carrying `action`.
        pub async fn next_matching(&mut self, action: Action) -> Envelope {
            loop {
                let envelope = self.next().await;
                if envelope.action == action {
                    return envelope;
                }
            }
        }

        pub async fn assert_quiet(&mut self) {
            assert_quiet(&mut self.rx).await;
        }

        /// Drop the strong sender, closing the queue.
        pub fn close(&mut self) {
            drop(self.outbound.take());
            self.rx.close();
        }
    }

    pub(crate) async fn next_envelope(rx: &mut mpsc::Receiver<Arc<str>>) -> Envelope {
        let payload = time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("queue closed");
        decode(payload.as_bytes()).expect("undecodable payload")
    }

    pub(crate) async fn assert_quiet(rx: &mut mpsc::Receiver<Arc<str>>) {
        if let Ok(Some(payload)) = time::timeout(Duration::from_millis(100), rx.recv()).await {
            panic!("unexpected message: {payload}");
        }
    }
}
