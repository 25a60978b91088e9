// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-connection user state and the roster that owns it. A user's
//! ingress session outlives its server binding: kicks and handovers
//! cancel the inner session only.

use crate::gameserver::GameServer;
use crate::gameserver::ServerClient;
use crate::ingress::{Connection, NetworkStatus};
use crate::spaces::SpaceInstance;
use log::{debug, info, warn};
use netutil::{Session, Topic};
use protocol::message::color;
use protocol::proxy::MessageProxy;
use protocol::{ClientId, Message, MessageCode, RawPacket};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// How long a game server gets to accept a connecting client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for a correlated response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Outgoing queue depth. Unbounded growth would mean the ingress writer
/// has stalled, so past this the gateway drops instead of buffering.
const OUTGOING_QUEUE: usize = 1000;

#[derive(Debug, Error)]
pub enum UserError {
    #[error("failed to assign client id")]
    ClientIdExhausted,
    #[error("client not connected to cluster")]
    NotConnected,
    #[error("outgoing queue is full")]
    QueueFull,
    #[error("outgoing packet was dropped")]
    SendDropped,
    #[error("timed out waiting for response")]
    ResponseTimeout,
    #[error("session ended")]
    Cancelled,
}

/// The user's relationship to a game server.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// An outgoing packet paired with a completion channel the ingress
/// writer reports the send result on.
pub struct OutgoingPacket {
    pub channel: u8,
    pub messages: Vec<Message>,
    pub done: oneshot::Sender<Result<(), UserError>>,
}

#[derive(Clone)]
pub struct ConnectionEvent {
    pub server: Arc<GameServer>,
}

struct UserState {
    name: String,
    status: UserStatus,
    server: Option<Arc<GameServer>>,
    server_client: Option<Arc<ServerClient>>,
    server_session: Session,
    space: Option<Arc<SpaceInstance>>,
    delay_messages: bool,
    /// The last handshake banner broadcast to this client.
    last_info: Option<Message>,
}

pub struct User {
    pub id: ClientId,
    session_id: String,
    /// The ingress connection's lifetime.
    pub session: Session,
    pub connection: Arc<dyn Connection>,
    /// Messages arriving from the client.
    pub from: MessageProxy,
    /// Messages on their way to the client.
    pub to_proxy: MessageProxy,
    pub raw_from: Topic<RawPacket>,
    pub raw_to: Topic<RawPacket>,
    pub server_events: Topic<ConnectionEvent>,
    to: mpsc::Sender<OutgoingPacket>,
    to_receiver: Mutex<Option<mpsc::Receiver<OutgoingPacket>>>,
    state: RwLock<UserState>,
    /// Separate from the main state lock so queueing can never invert
    /// lock order with it.
    queue: Mutex<Vec<String>>,
    orchestrator: Weak<UserOrchestrator>,
}

impl User {
    /// The displayed session handle.
    pub fn session_prefix(&self) -> &str {
        &self.session_id[..5]
    }

    pub fn name(&self) -> String {
        self.state.read().unwrap().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state.write().unwrap().name = name.to_owned();
    }

    pub fn status(&self) -> UserStatus {
        self.state.read().unwrap().status
    }

    pub fn server(&self) -> Option<Arc<GameServer>> {
        self.state.read().unwrap().server.clone()
    }

    pub fn server_client(&self) -> Option<Arc<ServerClient>> {
        self.state.read().unwrap().server_client.clone()
    }

    pub fn server_session(&self) -> Session {
        self.state.read().unwrap().server_session.clone()
    }

    pub fn space(&self) -> Option<Arc<SpaceInstance>> {
        self.state.read().unwrap().space.clone()
    }

    pub fn set_space(&self, space: Option<Arc<SpaceInstance>>) {
        self.state.write().unwrap().space = space;
    }

    pub fn last_info(&self) -> Option<Message> {
        self.state.read().unwrap().last_info.clone()
    }

    pub fn set_last_info(&self, info: Message) {
        self.state.write().unwrap().last_info = Some(info);
    }

    /// The name the user sees for wherever they are: their space, their
    /// server, or the bare bridge.
    pub fn server_name(&self) -> String {
        if let Some(space) = self.space() {
            return space.id().to_owned();
        }
        if let Some(server) = self.server() {
            return server.formatted_reference();
        }
        "web".to_owned()
    }

    pub fn reference(&self) -> String {
        format!("{} ({})", self.name(), self.server_name())
    }

    /// The ingress writer's half of the outgoing queue. Taken once.
    pub fn take_outgoing(&self) -> Option<mpsc::Receiver<OutgoingPacket>> {
        self.to_receiver.lock().unwrap().take()
    }

    pub fn send_channel(
        &self,
        channel: u8,
        messages: Vec<Message>,
    ) -> oneshot::Receiver<Result<(), UserError>> {
        let (done, result) = oneshot::channel();
        let packet = OutgoingPacket {
            channel,
            messages,
            done,
        };
        if let Err(mpsc::error::TrySendError::Full(packet)) = self.to.try_send(packet) {
            warn!("[{}] outgoing queue full, dropping packet", self.session_prefix());
            let _ = packet.done.send(Err(UserError::QueueFull));
        }
        result
    }

    pub fn send(&self, messages: Vec<Message>) -> oneshot::Receiver<Result<(), UserError>> {
        self.send_channel(1, messages)
    }

    pub async fn send_sync(&self, messages: Vec<Message>) -> Result<(), UserError> {
        self.send(messages)
            .await
            .unwrap_or(Err(UserError::SendDropped))
    }

    /// Starts buffering user-facing chat, e.g. while a map loads.
    pub fn delay_messages(&self) {
        self.state.write().unwrap().delay_messages = true;
    }

    /// Stops buffering and drains the backlog in arrival order.
    pub fn restore_messages(&self) {
        self.state.write().unwrap().delay_messages = false;
        let backlog: Vec<String> = {
            let mut queue = self.queue.lock().unwrap();
            std::mem::take(&mut *queue)
        };
        for message in backlog {
            self.send_message(&message);
        }
    }

    fn send_message(&self, text: &str) {
        let _ = self.send(vec![Message::ServerMessage {
            text: text.to_owned(),
        }]);
    }

    fn queue_message(&self, text: &str) {
        let delayed = self.state.read().unwrap().delay_messages;
        if delayed {
            self.queue.lock().unwrap().push(text.to_owned());
            return;
        }
        self.send_message(text);
    }

    /// A status line with the gateway's chat prefix.
    pub fn message(&self, text: &str) {
        self.queue_message(&format!("{} {}", color::magenta("~>"), text));
    }

    pub fn raw_message(&self, text: &str) {
        self.queue_message(text);
    }

    /// Sends `messages` and waits for the next inbound message of `code`.
    pub async fn response(
        &self,
        session: &Session,
        code: MessageCode,
        messages: Vec<Message>,
    ) -> Result<Message, UserError> {
        self.response_timeout(session, RESPONSE_TIMEOUT, code, messages)
            .await
    }

    pub async fn response_timeout(
        &self,
        session: &Session,
        duration: Duration,
        code: MessageCode,
        messages: Vec<Message>,
    ) -> Result<Message, UserError> {
        // Subscribe before the request leaves so the reply cannot race us.
        let mut replies = self.from.subscribe();
        let _ = self.send(messages);

        let wait = async {
            loop {
                match replies.recv().await {
                    Some(message) if message.code() == code => break Ok(message),
                    Some(_) => continue,
                    None => break Err(UserError::Cancelled),
                }
            }
        };

        tokio::select! {
            _ = session.cancelled() => Err(UserError::Cancelled),
            result = tokio::time::timeout(duration, wait) => match result {
                Ok(inner) => inner,
                Err(_) => Err(UserError::ResponseTimeout),
            },
        }
    }

    pub fn connect(self: &Arc<Self>, server: &Arc<GameServer>) -> Result<mpsc::Receiver<bool>, UserError> {
        self.connect_to_server(server, "", false, false)
    }

    pub fn connect_to_space(
        self: &Arc<Self>,
        server: &Arc<GameServer>,
        id: &str,
    ) -> Result<mpsc::Receiver<bool>, UserError> {
        self.connect_to_server(server, id, false, true)
    }

    /// Binds the user to `server`, tearing down any current binding
    /// first. The returned channel yields once: whether the server
    /// admitted the client within the connect window.
    pub fn connect_to_server(
        self: &Arc<Self>,
        server: &Arc<GameServer>,
        target: &str,
        should_copy: bool,
        _is_space: bool,
    ) -> Result<mpsc::Receiver<bool>, UserError> {
        if self.connection.network_status() == NetworkStatus::Disconnected {
            warn!("client not connected to cluster but attempted connect");
            return Err(UserError::NotConnected);
        }

        self.delay_messages();

        if let Some(old_server) = self.server() {
            old_server.leave(self.id);
            self.server_session().cancel();

            // The client is about to stop hearing from these peers; tell
            // it to forget them.
            if let Some(orchestrator) = self.orchestrator.upgrade() {
                let mut roster = orchestrator.state.write().unwrap();
                if let Some(users) = roster.servers.get_mut(&old_server.id) {
                    let mut remaining = Vec::with_capacity(users.len());
                    for other in users.drain(..) {
                        if Arc::ptr_eq(&other, self) {
                            continue;
                        }
                        let _ = self.send(vec![Message::ClientDisconnected {
                            client: other.id.into(),
                        }]);
                        remaining.push(other);
                    }
                    *users = remaining;
                }
            }
        }

        let server_session = self.session.child();
        {
            let mut state = self.state.write().unwrap();
            state.space = None;
            state.server = Some(server.clone());
            state.status = UserStatus::Connecting;
            state.server_session = server_session.clone();
        }

        let (client, mut admitted) = server.connect(self.id);
        self.state.write().unwrap().server_client = Some(client);

        let server_name = if target.is_empty() {
            server.reference()
        } else {
            target.to_owned()
        };
        self.connection
            .connect(&server_name, server.hidden, should_copy);

        let (connected_tx, connected_rx) = mpsc::channel(1);
        let user = self.clone();
        let server = server.clone();
        tokio::spawn(async move {
            let admitted_fut = async {
                loop {
                    if *admitted.borrow() {
                        break true;
                    }
                    if admitted.changed().await.is_err() {
                        break false;
                    }
                }
            };

            tokio::select! {
                // A handover cancels the binding session, ending the wait
                // the same way the timeout does.
                _ = server_session.cancelled() => {
                    user.restore_messages();
                    let _ = connected_tx.try_send(false);
                }
                result = tokio::time::timeout(CONNECT_TIMEOUT, admitted_fut) => match result {
                    Ok(true) => {
                        user.state.write().unwrap().status = UserStatus::Connected;

                        if let Some(orchestrator) = user.orchestrator.upgrade() {
                            let mut roster = orchestrator.state.write().unwrap();
                            let users = roster.servers.entry(server.id).or_default();
                            users.retain(|other| !Arc::ptr_eq(other, &user));
                            users.push(user.clone());
                        }

                        let _ = connected_tx.try_send(true);
                        user.server_events.publish(ConnectionEvent {
                            server: server.clone(),
                        });
                    }
                    _ => {
                        user.restore_messages();
                        let _ = connected_tx.try_send(false);
                    }
                },
                _ = user.session.cancelled() => {
                    let _ = connected_tx.try_send(false);
                }
            }
        });

        Ok(connected_rx)
    }

    /// Marks the user disconnected and cancels the server binding. Runs
    /// both when the ingress drops and when the server kicks the user;
    /// the ingress connection itself stays up.
    pub fn disconnect_from_server(&self) {
        if let Some(server) = self.server() {
            server.leave(self.id);
            if let Some(orchestrator) = self.orchestrator.upgrade() {
                let mut roster = orchestrator.state.write().unwrap();
                if let Some(users) = roster.servers.get_mut(&server.id) {
                    users.retain(|other| other.id != self.id);
                }
            }
        }

        let server_session = {
            let mut state = self.state.write().unwrap();
            state.server = None;
            state.server_client = None;
            state.space = None;
            state.status = UserStatus::Disconnected;
            state.server_session.clone()
        };
        server_session.cancel();
    }
}

struct Roster {
    users: Vec<Arc<User>>,
    servers: HashMap<u32, Vec<Arc<User>>>,
}

/// Owns every live user and the per-server membership index.
pub struct UserOrchestrator {
    state: RwLock<Roster>,
}

impl UserOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(Roster {
                users: Vec::new(),
                servers: HashMap::new(),
            }),
        })
    }

    /// Rejection-samples an unused 16-bit id from the thread CSPRNG. The
    /// caller holds the roster lock, so concurrent joins cannot draw the
    /// same id.
    fn alloc_client_id(users: &[Arc<User>]) -> Result<ClientId, UserError> {
        let mut rng = rand::thread_rng();
        for _ in 0..u16::MAX {
            let candidate = ClientId(rng.gen());
            if users.iter().any(|user| user.id == candidate) {
                continue;
            }
            return Ok(candidate);
        }
        Err(UserError::ClientIdExhausted)
    }

    pub fn add_user(
        self: &Arc<Self>,
        connection: Arc<dyn Connection>,
    ) -> Result<Arc<User>, UserError> {
        let session = connection.session().clone();
        let (to, to_receiver) = mpsc::channel(OUTGOING_QUEUE);

        let user = {
            let mut state = self.state.write().unwrap();
            let id = Self::alloc_client_id(&state.users)?;
            let session_id = hash_string(&format!("{}-{}", id, connection.host()));

            let user = Arc::new(User {
                id,
                session_id,
                session: session.clone(),
                from: MessageProxy::new(),
                to_proxy: MessageProxy::new(),
                raw_from: Topic::new(),
                raw_to: Topic::new(),
                server_events: Topic::new(),
                to,
                to_receiver: Mutex::new(Some(to_receiver)),
                state: RwLock::new(UserState {
                    name: "unnamed".to_owned(),
                    status: UserStatus::Disconnected,
                    server: None,
                    server_client: None,
                    server_session: session.child(),
                    space: None,
                    delay_messages: false,
                    last_info: None,
                }),
                queue: Mutex::new(Vec::new()),
                orchestrator: Arc::downgrade(self),
                connection,
            });
            state.users.push(user.clone());
            user
        };

        let orchestrator = self.clone();
        let polled = user.clone();
        tokio::spawn(async move {
            polled.session.cancelled().await;
            orchestrator.remove_user(&polled);
            debug!("[{}] user reaped", polled.session_prefix());
        });

        info!(
            "[{}] user joined via {}",
            user.session_prefix(),
            user.connection.device_type()
        );
        Ok(user)
    }

    /// Drops the user from the roster and from every per-server bucket.
    pub fn remove_user(&self, user: &Arc<User>) {
        let mut state = self.state.write().unwrap();
        state.users.retain(|other| !Arc::ptr_eq(other, user));
        for users in state.servers.values_mut() {
            users.retain(|other| !Arc::ptr_eq(other, user));
        }
    }

    /// Rosters stay small; a scan beats bookkeeping.
    pub fn find_user(&self, id: ClientId) -> Option<Arc<User>> {
        self.state
            .read()
            .unwrap()
            .users
            .iter()
            .find(|user| user.id == id)
            .cloned()
    }

    pub fn users(&self) -> Vec<Arc<User>> {
        self.state.read().unwrap().users.clone()
    }

    pub fn server_users(&self, server: &GameServer) -> Vec<Arc<User>> {
        self.state
            .read()
            .unwrap()
            .servers
            .get(&server.id)
            .cloned()
            .unwrap_or_default()
    }
}

fn hash_string(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}
