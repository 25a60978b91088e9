// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The capability surface the gateway consumes from a game-server
//! instance, plus the pool that creates instances from named presets.
//! Each instance owns the relay that fans traffic out between its
//! clients.

use crate::commands::{CommandError, CommandGroup};
use crate::config::{InfoConfig, PresetConfig};
use crate::relay::{Publisher, Relay, RelayError, SendFn};
use crate::serverinfo::ServerInfoService;
use log::{debug, info, warn};
use netutil::{Session, Topic};
use protocol::message::color;
use protocol::{ClientId, Message};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::watch;

pub const MODE_FFA: i32 = 0;
pub const MODE_COOP: i32 = 1;

const EMPTY_MAP_SIZE: i32 = 10;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no preset named {0:?}")]
    UnknownPreset(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// A batch of messages on a transport channel, as delivered to one client.
pub type Batch = (u8, Vec<Message>);

/// An edit performed by a client, mirrored into the hosting space's
/// editing state.
#[derive(Clone, Debug)]
pub struct EditEvent {
    pub client: ClientId,
    pub message: Message,
}

/// One client's seat on a game server. Outgoing traffic (relay flushes,
/// server chat) fans out through `outgoing`; the publishers feed the
/// client's own traffic into the relay.
pub struct ServerClient {
    pub cn: ClientId,
    pub name: RwLock<String>,
    outgoing: Arc<Topic<Batch>>,
    positions: Publisher,
    packets: Publisher,
    connected: watch::Sender<bool>,
}

impl ServerClient {
    pub fn subscribe(&self) -> netutil::Subscriber<Batch> {
        self.outgoing.subscribe()
    }

    pub fn message(&self, text: &str) {
        self.outgoing.publish((
            1,
            vec![Message::ServerMessage {
                text: text.to_owned(),
            }],
        ));
    }

    pub async fn publish_positions(&self, batch: Vec<Message>) -> Result<(), RelayError> {
        self.positions.publish(batch).await
    }

    pub async fn publish_packets(&self, batch: Vec<Message>) -> Result<(), RelayError> {
        self.packets.publish(batch).await
    }
}

struct ServerState {
    description: String,
    map: String,
    mode: i32,
    paused: bool,
    speed: i32,
    max_clients: i32,
    password_mode: i32,
    time_left: i32,
}

/// One game-server instance. Opaque to the orchestration layer beyond
/// this surface.
pub struct GameServer {
    pub id: u32,
    pub port: u16,
    pub hidden: bool,
    pub session: Session,
    pub alias: RwLock<String>,
    pub edits: Topic<EditEvent>,
    pub commands: CommandGroup<Arc<ServerClient>>,
    relay: Relay,
    state: RwLock<ServerState>,
    clients: Mutex<HashMap<ClientId, Arc<ServerClient>>>,
    started: Instant,
    /// When false, `connect` leaves the admission signal low until
    /// `admit` runs; models a server still loading its map.
    admit_immediately: std::sync::atomic::AtomicBool,
}

impl GameServer {
    fn new(id: u32, port: u16, hidden: bool, session: Session, preset: &PresetConfig) -> Self {
        let relay = Relay::start(session.clone());
        Self {
            id,
            port,
            hidden,
            session,
            alias: RwLock::new(String::new()),
            edits: Topic::new(),
            commands: CommandGroup::new("server"),
            relay,
            state: RwLock::new(ServerState {
                description: preset.description.clone(),
                map: String::new(),
                mode: MODE_FFA,
                paused: false,
                speed: 100,
                max_clients: preset.max_clients,
                password_mode: 0,
                time_left: 0,
            }),
            clients: Mutex::new(HashMap::new()),
            started: Instant::now(),
            admit_immediately: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Holds new seats in the connecting state until `admit` runs.
    pub fn defer_admission(&self) {
        self.admit_immediately.store(false, Ordering::Relaxed);
    }

    /// Seats a client and returns its handle plus the admission signal.
    /// The caller decides how long to wait on the signal.
    pub fn connect(&self, cn: ClientId) -> (Arc<ServerClient>, watch::Receiver<bool>) {
        let outgoing = Arc::new(Topic::new());
        let sink = outgoing.clone();
        let send: SendFn = Box::new(move |channel, batch| {
            sink.publish((channel, batch));
        });
        let (positions, packets) = self.relay.add_client(cn, send);

        let (connected, signal) = watch::channel(false);
        let client = Arc::new(ServerClient {
            cn,
            name: RwLock::new(String::new()),
            outgoing,
            positions,
            packets,
            connected,
        });

        self.clients.lock().unwrap().insert(cn, client.clone());

        if self.admit_immediately.load(Ordering::Relaxed) {
            let _ = client.connected.send(true);
        }

        debug!("client {} connected to server {}", cn, self.reference());
        (client, signal)
    }

    /// Raises the admission signal for a deferred seat.
    pub fn admit(&self, cn: ClientId) {
        if let Some(client) = self.clients.lock().unwrap().get(&cn) {
            let _ = client.connected.send(true);
        }
    }

    /// Unseats a client. Absent cns are ignored; double-leaves are normal.
    pub fn leave(&self, cn: ClientId) {
        self.relay.remove_client(cn);
        if self.clients.lock().unwrap().remove(&cn).is_some() {
            debug!("client {} left server {}", cn, self.reference());
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn change_map(&self, mode: i32, name: &str) {
        {
            let mut state = self.state.write().unwrap();
            state.mode = mode;
            state.map = name.to_owned();
        }
        info!("server {} changing map to {}", self.reference(), name);
        self.broadcast(Message::MapChange {
            name: name.to_owned(),
            mode,
            has_items: false,
        });
    }

    /// Clears the map; used before streaming edit state into a space.
    pub fn empty_map(&self) {
        {
            let mut state = self.state.write().unwrap();
            state.mode = MODE_COOP;
            state.map.clear();
        }
        self.broadcast(Message::NewMap {
            size: EMPTY_MAP_SIZE,
        });
    }

    pub fn set_description(&self, description: &str) {
        self.state.write().unwrap().description = description.to_owned();
    }

    pub fn description(&self) -> String {
        self.state.read().unwrap().description.clone()
    }

    pub fn map(&self) -> String {
        self.state.read().unwrap().map.clone()
    }

    pub fn num_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client(&self, cn: ClientId) -> Option<Arc<ServerClient>> {
        self.clients.lock().unwrap().get(&cn).cloned()
    }

    /// Server-wide chat line.
    pub fn message(&self, text: &str) {
        self.broadcast(Message::ServerMessage {
            text: text.to_owned(),
        });
    }

    fn broadcast(&self, message: Message) {
        let clients = self.clients.lock().unwrap();
        for client in clients.values() {
            client.outgoing.publish((1, vec![message.clone()]));
        }
    }

    /// A display name that stays unambiguous when two clients share a
    /// name.
    pub fn unique_name(&self, client: &ServerClient) -> String {
        let name = client.name.read().unwrap().clone();
        let clients = self.clients.lock().unwrap();
        let clash = clients
            .values()
            .any(|other| other.cn != client.cn && *other.name.read().unwrap() == name);
        if clash {
            format!("{} ({})", name, client.cn)
        } else {
            name
        }
    }

    /// The server's public handle: its alias when set, otherwise a
    /// port-qualified fallback.
    pub fn reference(&self) -> String {
        let alias = self.alias.read().unwrap();
        if alias.is_empty() {
            format!(":{}", self.port)
        } else {
            alias.clone()
        }
    }

    pub fn formatted_reference(&self) -> String {
        color::blue(&self.reference())
    }

    /// Routes one client-originated message: edits mirror into the edit
    /// stream, `#` chat goes to the command registry, everything else is
    /// the relay's business.
    pub fn handle_client_message(&self, client: &Arc<ServerClient>, message: &Message) {
        if message.code().is_edit() {
            self.edits.publish(EditEvent {
                client: client.cn,
                message: message.clone(),
            });
            return;
        }

        if let Message::Text { text } = message {
            if let Some(line) = text.strip_prefix('#') {
                match self.commands.dispatch(client, &self.session, line) {
                    Ok(()) => {}
                    Err(CommandError::Unknown(name)) => {
                        client.message(&format!("unknown command {:?}", name));
                    }
                    Err(err) => {
                        client.message(&err.to_string());
                    }
                }
            }
        }
    }
}

impl crate::serverinfo::InfoProvider for GameServer {
    fn server_info(&self) -> protocol::extinfo::ServerInfo {
        let state = self.state.read().unwrap();
        protocol::extinfo::ServerInfo {
            num_clients: self.num_clients() as i32,
            game_paused: state.paused,
            game_mode: state.mode,
            time_left: state.time_left,
            max_clients: state.max_clients,
            password_mode: state.password_mode,
            game_speed: state.speed,
            map: state.map.clone(),
            description: state.description.clone(),
        }
    }

    fn client_info(&self) -> Vec<protocol::extinfo::ClientExtInfo> {
        let clients = self.clients.lock().unwrap();
        let mut infos: Vec<protocol::extinfo::ClientExtInfo> = clients
            .values()
            .map(|client| protocol::extinfo::ClientExtInfo {
                client: client.cn.into(),
                name: client.name.read().unwrap().clone(),
                team: "good".to_owned(),
                health: 100,
                ..Default::default()
            })
            .collect();
        infos.sort_by_key(|info| info.client);
        infos
    }

    fn team_info(&self) -> protocol::extinfo::TeamInfo {
        let state = self.state.read().unwrap();
        protocol::extinfo::TeamInfo {
            is_deathmatch: state.mode != MODE_COOP,
            game_mode: state.mode,
            time_left: state.time_left,
            scores: Vec::new(),
        }
    }

    fn uptime(&self) -> i32 {
        self.started.elapsed().as_secs() as i32
    }
}

/// The pool the orchestration layer asks for fresh game servers.
pub struct ServerManager {
    session: Session,
    presets: Vec<PresetConfig>,
    base_port: u16,
    /// When set, every instance gets an info responder on its sibling
    /// port for as long as the instance lives.
    info: Option<InfoConfig>,
    next_id: AtomicU32,
    servers: Mutex<Vec<Arc<GameServer>>>,
}

impl ServerManager {
    pub fn new(
        session: Session,
        presets: Vec<PresetConfig>,
        base_port: u16,
        info: Option<InfoConfig>,
    ) -> Self {
        Self {
            session,
            presets,
            base_port,
            info,
            next_id: AtomicU32::new(0),
            servers: Mutex::new(Vec::new()),
        }
    }

    fn preset(&self, name: &str) -> Result<&PresetConfig, ServerError> {
        if name.is_empty() {
            return self
                .presets
                .iter()
                .find(|preset| preset.default)
                .or_else(|| self.presets.first())
                .ok_or_else(|| ServerError::UnknownPreset(String::new()));
        }
        self.presets
            .iter()
            .find(|preset| preset.name == name)
            .ok_or_else(|| ServerError::UnknownPreset(name.to_owned()))
    }

    /// Creates a fresh instance from the named preset (empty name picks
    /// the default preset). The instance dies with `session`.
    pub fn new_server(
        self: &Arc<Self>,
        session: &Session,
        preset: &str,
        hidden: bool,
    ) -> Result<Arc<GameServer>, ServerError> {
        let preset = self.preset(preset)?.clone();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Each instance claims a pair: game port and game port + 1 for the
        // info responder.
        let port = self.base_port + (id as u16) * 2;

        let server = Arc::new(GameServer::new(
            id,
            port,
            hidden,
            session.child(),
            &preset,
        ));
        self.servers.lock().unwrap().push(server.clone());

        let manager = self.clone();
        let watched = server.clone();
        tokio::spawn(async move {
            watched.session.cancelled().await;
            manager
                .servers
                .lock()
                .unwrap()
                .retain(|other| other.id != watched.id);
            debug!("server {} reaped", watched.reference());
        });

        if let Some(info) = &self.info {
            let service = Arc::new(ServerInfoService::new(server.clone(), &info.master));
            let info_session = server.session.child();
            let register = info.register_master;
            tokio::spawn(async move {
                if let Err(err) = service.serve(info_session, port + 1, register).await {
                    warn!("server info responder on port {} failed: {}", port + 1, err);
                }
            });
        }

        info!("created server {} on port {}", server.reference(), port);
        Ok(server)
    }

    pub fn servers(&self) -> Vec<Arc<GameServer>> {
        self.servers.lock().unwrap().clone()
    }

    pub fn find_by_alias(&self, alias: &str) -> Option<Arc<GameServer>> {
        self.servers
            .lock()
            .unwrap()
            .iter()
            .find(|server| *server.alias.read().unwrap() == alias)
            .cloned()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn shutdown(&self) {
        self.session.cancel();
        let count = self.servers.lock().unwrap().len();
        if count > 0 {
            warn!("shutting down with {} live servers", count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresetConfig;
    use protocol::MessageCode;

    fn manager() -> Arc<ServerManager> {
        Arc::new(ServerManager::new(
            Session::new(),
            vec![PresetConfig {
                name: "lobby".to_owned(),
                description: "the lobby".to_owned(),
                max_clients: 128,
                default: true,
            }],
            28785,
            None,
        ))
    }

    #[tokio::test]
    async fn seats_and_unseats_clients() {
        let manager = manager();
        let session = Session::new();
        let server = manager.new_server(&session, "", false).unwrap();

        let (client, signal) = server.connect(ClientId(3));
        assert!(*signal.borrow());
        assert_eq!(server.num_clients(), 1);
        assert_eq!(client.cn, ClientId(3));

        server.leave(ClientId(3));
        server.leave(ClientId(3));
        assert_eq!(server.num_clients(), 0);
    }

    #[tokio::test]
    async fn unique_names_disambiguate() {
        let manager = manager();
        let session = Session::new();
        let server = manager.new_server(&session, "", false).unwrap();

        let (a, _) = server.connect(ClientId(1));
        let (b, _) = server.connect(ClientId(2));
        *a.name.write().unwrap() = "unnamed".to_owned();
        *b.name.write().unwrap() = "unnamed".to_owned();

        assert_eq!(server.unique_name(&a), "unnamed (1)");

        *b.name.write().unwrap() = "other".to_owned();
        assert_eq!(server.unique_name(&a), "unnamed");
    }

    #[tokio::test]
    async fn edits_reach_the_edit_stream() {
        let manager = manager();
        let session = Session::new();
        let server = manager.new_server(&session, "", false).unwrap();
        let (client, _) = server.connect(ClientId(5));

        let mut edits = server.edits.subscribe();
        server.handle_client_message(
            &client,
            &Message::Raw {
                code: MessageCode::EditFace,
                data: vec![1, 2, 3],
            },
        );

        let event = edits.recv().await.unwrap();
        assert_eq!(event.client, ClientId(5));
        assert_eq!(event.message.code(), MessageCode::EditFace);
    }

    #[tokio::test]
    async fn unknown_preset_is_an_error() {
        let manager = manager();
        let session = Session::new();
        assert!(matches!(
            manager.new_server(&session, "nope", false),
            Err(ServerError::UnknownPreset(_))
        ));
    }
}
