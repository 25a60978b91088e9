// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Named persistent spaces. A space wraps a game server with durable
//! identity and edit history; preset spaces come from configuration and
//! may cycle maps on their own.

use crate::assets::AssetFetcher;
use crate::commands::{Command, CommandError, Handler};
use crate::config::{LinkConfig, PresetSpaceConfig};
use crate::gameserver::{GameServer, ServerError, ServerManager, MODE_COOP};
use crate::user::UserError;
use log::{error, info, warn};
use netutil::Session;
use protocol::{ClientId, Message, Packet};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;

/// How often dirty edit state is checkpointed in the background.
const SAVE_INTERVAL: Duration = Duration::from_secs(30);

/// Explore mode advances on its own this often.
const EXPLORE_CYCLE: Duration = Duration::from_secs(3 * 60);

/// The servinfo line must fit the engine's browser row.
const SERVER_INFO_LIMIT: usize = 25;
const REFERENCE_LIMIT: usize = 16;

#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("ambiguous reference")]
    Ambiguous,
    #[error("found map, but unsupported")]
    MapUnsupported,
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    User(#[from] UserError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpaceLink {
    pub teleport: i32,
    pub teledest: i32,
    pub destination: String,
}

impl From<&LinkConfig> for SpaceLink {
    fn from(link: &LinkConfig) -> Self {
        Self {
            teleport: link.teleport,
            teledest: link.teledest,
            destination: link.destination.clone(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SpaceConfig {
    pub alias: String,
    pub description: String,
    pub map: String,
    #[serde(default)]
    pub links: Vec<SpaceLink>,
}

/// A user-authored space as stored on disk: a config document plus a map
/// blob next to it.
pub struct UserSpace {
    id: String,
    config: RwLock<SpaceConfig>,
    map_blob: Option<PathBuf>,
}

impl UserSpace {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> SpaceConfig {
        self.config.read().unwrap().clone()
    }

    /// The space's public handle: alias if set, else the id prefix.
    pub fn reference(&self) -> String {
        let config = self.config.read().unwrap();
        if config.alias.is_empty() {
            self.id[..5.min(self.id.len())].to_owned()
        } else {
            config.alias.clone()
        }
    }

    pub fn map_data(&self) -> Result<Vec<u8>, SpaceError> {
        match &self.map_blob {
            Some(path) => Ok(std::fs::read(path)?),
            None => Ok(Vec::new()),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SpaceDocument {
    id: String,
    #[serde(flatten)]
    config: SpaceConfig,
    #[serde(default)]
    map_blob: Option<PathBuf>,
}

/// The user-space universe: one JSON document per space under a
/// directory.
pub struct Verse {
    spaces: RwLock<HashMap<String, Arc<UserSpace>>>,
}

impl Verse {
    pub fn load(dir: &PathBuf) -> Result<Self, SpaceError> {
        let mut spaces = HashMap::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(dir)? {
                let path = entry?.path();
                if path.extension().map_or(true, |ext| ext != "json") {
                    continue;
                }
                let document: SpaceDocument = serde_json::from_slice(&std::fs::read(&path)?)?;
                let space = Arc::new(UserSpace {
                    id: document.id.clone(),
                    config: RwLock::new(document.config),
                    map_blob: document.map_blob,
                });
                spaces.insert(document.id, space);
            }
        }
        info!("loaded {} user spaces", spaces.len());
        Ok(Self {
            spaces: RwLock::new(spaces),
        })
    }

    pub fn empty() -> Self {
        Self {
            spaces: RwLock::new(HashMap::new()),
        }
    }

    pub fn add(&self, id: &str, config: SpaceConfig) -> Arc<UserSpace> {
        let space = Arc::new(UserSpace {
            id: id.to_owned(),
            config: RwLock::new(config),
            map_blob: None,
        });
        self.spaces
            .write()
            .unwrap()
            .insert(id.to_owned(), space.clone());
        space
    }

    /// Finds a space by exact id, id prefix, or alias.
    pub fn find_space(&self, id: &str) -> Option<Arc<UserSpace>> {
        let spaces = self.spaces.read().unwrap();
        if let Some(space) = spaces.get(id) {
            return Some(space.clone());
        }
        spaces
            .values()
            .find(|space| {
                space.id.starts_with(id) || space.config.read().unwrap().alias == id
            })
            .cloned()
    }
}

/// Persists checkpointed edit state; the serialization format belongs to
/// the collaborator behind this seam.
pub trait EditStore: Send + Sync {
    fn load(&self, id: &str) -> Result<Vec<u8>, SpaceError>;
    fn save(&self, id: &str, data: &[u8]) -> Result<(), SpaceError>;
}

pub struct FsEditStore {
    dir: PathBuf,
}

impl FsEditStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl EditStore for FsEditStore {
    fn load(&self, id: &str) -> Result<Vec<u8>, SpaceError> {
        Ok(std::fs::read(self.dir.join(id))?)
    }

    fn save(&self, id: &str, data: &[u8]) -> Result<(), SpaceError> {
        std::fs::create_dir_all(&self.dir)?;
        Ok(std::fs::write(self.dir.join(id), data)?)
    }
}

struct EditState {
    map: Vec<u8>,
    ops: Packet,
    edits: u64,
    dirty: bool,
    open_edit: bool,
}

/// Cooperative edit history for one space, checkpointed across sessions.
pub struct EditingState {
    space_id: String,
    store: Arc<dyn EditStore>,
    state: Mutex<EditState>,
}

impl EditingState {
    pub fn new(store: Arc<dyn EditStore>, space_id: &str) -> Self {
        Self {
            space_id: space_id.to_owned(),
            store,
            state: Mutex::new(EditState {
                map: Vec::new(),
                ops: Packet::new(),
                edits: 0,
                dirty: false,
                open_edit: true,
            }),
        }
    }

    pub fn load_map(&self, data: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.map = data;
    }

    pub fn is_open_edit(&self) -> bool {
        self.state.lock().unwrap().open_edit
    }

    pub fn set_open_edit(&self, open: bool) {
        self.state.lock().unwrap().open_edit = open;
    }

    pub fn edit_count(&self) -> u64 {
        self.state.lock().unwrap().edits
    }

    /// Folds one client edit into the history.
    pub fn process(&self, _client: ClientId, message: &Message) {
        if !message.code().is_edit() {
            return;
        }
        let mut state = self.state.lock().unwrap();
        message.encode(&mut state.ops);
        state.edits += 1;
        state.dirty = true;
    }

    /// Writes the current state through the store. No-op when clean.
    pub fn checkpoint(&self) -> Result<(), SpaceError> {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            if !state.dirty {
                return Ok(());
            }
            let mut blob = state.map.clone();
            blob.extend_from_slice(state.ops.as_bytes());
            state.dirty = false;
            blob
        };
        self.store.save(&self.space_id, &snapshot)
    }

    /// Background checkpointer; runs until the owning session ends.
    pub async fn save_periodically(self: Arc<Self>, session: Session) {
        let mut tick = tokio::time::interval(SAVE_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = session.cancelled() => return,
                _ = tick.tick() => {
                    if let Err(err) = self.checkpoint() {
                        warn!("periodic checkpoint for {} failed: {}", self.space_id, err);
                    }
                }
            }
        }
    }
}

/// Cuts `s` to at most `max` bytes without splitting a character; the
/// cut backs up to the nearest boundary, so the result may be shorter.
fn truncate_to_boundary(s: &str, mut max: usize) -> &str {
    if max >= s.len() {
        return s;
    }
    while !s.is_char_boundary(max) {
        max -= 1;
    }
    &s[..max]
}

/// Builds the public servinfo line: the description plus a bracketed
/// reference, truncated from the description's right edge to fit.
pub fn compose_server_info(description: &str, alias: &str, id: &str) -> String {
    let reference = if alias.is_empty() {
        truncate_to_boundary(id, 5)
    } else {
        truncate_to_boundary(alias, REFERENCE_LIMIT)
    };

    let tail = format!(" [{}]", reference);
    let overshoot = (tail.len() + description.len()) as isize - SERVER_INFO_LIMIT as isize;
    let description = if overshoot > 0 {
        truncate_to_boundary(description, description.len() - overshoot as usize)
    } else {
        description
    };

    format!("{}{}", description, tail)
}

/// A live space: a named wrapper over one game server.
pub struct SpaceInstance {
    pub session: Session,
    id: String,
    pub config: RwLock<SpaceConfig>,
    pub space: Option<Arc<UserSpace>>,
    pub preset: Option<PresetSpaceConfig>,
    pub editing: Option<Arc<EditingState>>,
    pub server: Arc<GameServer>,
}

impl SpaceInstance {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_open_edit(&self) -> bool {
        self.editing
            .as_ref()
            .map(|editing| editing.is_open_edit())
            .unwrap_or(false)
    }

    fn refresh_config(&self) {
        if let Some(space) = &self.space {
            *self.config.write().unwrap() = space.config();
        }
    }

    pub fn description(&self) -> String {
        self.refresh_config();
        self.config.read().unwrap().description.clone()
    }

    pub fn alias(&self) -> String {
        self.refresh_config();
        self.config.read().unwrap().alias.clone()
    }

    pub fn map_name(&self) -> String {
        self.refresh_config();
        self.config.read().unwrap().map.clone()
    }

    pub fn links(&self) -> Vec<SpaceLink> {
        self.refresh_config();
        self.config.read().unwrap().links.clone()
    }

    /// The composed servinfo line for this space.
    pub fn server_info(&self) -> String {
        compose_server_info(&self.description(), &self.alias(), &self.id)
    }

    /// Forwards every edit the server observes into the editing state.
    pub async fn poll_edits(self: Arc<Self>) {
        let mut edits = self.server.edits.subscribe();
        loop {
            tokio::select! {
                _ = self.session.cancelled() => return,
                event = edits.recv() => {
                    let Some(event) = event else { return };
                    if let Some(editing) = &self.editing {
                        editing.process(event.client, &event.message);
                    }
                }
            }
        }
    }
}

/// Owns every live space instance.
pub struct SpaceManager {
    pub session: Session,
    instances: RwLock<HashMap<String, Arc<SpaceInstance>>>,
    verse: Arc<Verse>,
    servers: Arc<ServerManager>,
    maps: Arc<AssetFetcher>,
    edit_store: Arc<dyn EditStore>,
}

impl SpaceManager {
    pub fn new(
        servers: Arc<ServerManager>,
        verse: Arc<Verse>,
        maps: Arc<AssetFetcher>,
        edit_store: Arc<dyn EditStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session: Session::new(),
            instances: RwLock::new(HashMap::new()),
            verse,
            servers,
            maps,
            edit_store,
        })
    }

    /// Resolves an id against user spaces first, then against known maps.
    /// Maps are implicitly spaces but hosting them is not supported yet.
    pub fn search_space(&self, id: &str) -> Result<Arc<UserSpace>, SpaceError> {
        if let Some(space) = self.verse.find_space(id) {
            return Ok(space);
        }
        if self.maps.find_map(id).is_some() {
            return Err(SpaceError::MapUnsupported);
        }
        Err(SpaceError::Ambiguous)
    }

    pub fn find_instance(&self, server: &GameServer) -> Option<Arc<SpaceInstance>> {
        self.instances
            .read()
            .unwrap()
            .values()
            .find(|instance| instance.server.id == server.id)
            .cloned()
    }

    /// Reaps the instance when its session ends: one final checkpoint,
    /// then removal from the manager.
    async fn watch_instance(self: Arc<Self>, instance: Arc<SpaceInstance>) {
        tokio::select! {
            _ = self.session.cancelled() => return,
            _ = instance.session.cancelled() => {}
        }

        if let Some(editing) = &instance.editing {
            if let Err(err) = editing.checkpoint() {
                warn!("final checkpoint for {} failed: {}", instance.id(), err);
            }
        }

        let mut instances = self.instances.write().unwrap();
        instances.retain(|_, other| !Arc::ptr_eq(other, &instance));
    }

    /// Returns the live instance for `id`, starting one if needed.
    pub fn start_space(self: &Arc<Self>, id: &str) -> Result<Arc<SpaceInstance>, SpaceError> {
        let mut instances = self.instances.write().unwrap();

        let space = match self.search_space(id) {
            Ok(space) => space,
            Err(err) => {
                error!("could not find space {}: {}", id, err);
                return Err(err);
            }
        };

        if let Some(instance) = instances.get(space.id()) {
            return Ok(instance.clone());
        }

        let config = space.config();
        let map_data = space.map_data()?;

        let editing = Arc::new(EditingState::new(self.edit_store.clone(), space.id()));
        editing.load_map(map_data);

        let session = self.session.child();
        tokio::spawn(editing.clone().save_periodically(session.clone()));

        let server = self.servers.new_server(&session, "", true)?;
        *server.alias.write().unwrap() = space.reference();
        server.set_description(&compose_server_info(
            &config.description,
            &config.alias,
            space.id(),
        ));
        server.empty_map();

        let instance = Arc::new(SpaceInstance {
            session,
            id: space.id().to_owned(),
            config: RwLock::new(config),
            space: Some(space.clone()),
            preset: None,
            editing: Some(editing),
            server,
        });

        tokio::spawn(self.clone().watch_instance(instance.clone()));
        tokio::spawn(instance.clone().poll_edits());

        instances.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    /// Boots a space from static configuration; these exist for the
    /// lifetime of the process unless reaped.
    pub fn start_preset_space(
        self: &Arc<Self>,
        preset: &PresetSpaceConfig,
    ) -> Result<Arc<SpaceInstance>, SpaceError> {
        let mut instances = self.instances.write().unwrap();

        let id = preset.alias.clone();
        let links: Vec<SpaceLink> = preset.links.iter().map(SpaceLink::from).collect();

        let session = self.session.child();
        let server = self.servers.new_server(&session, &preset.preset, true)?;
        *server.alias.write().unwrap() = preset.alias.clone();

        if preset.description.is_empty() {
            server.set_description(&format!("Cubegate [{}]", preset.alias));
        } else {
            server.set_description(&preset.description);
        }

        info!("started space {}", preset.alias);

        if preset.explore_mode {
            tokio::spawn(do_explore_mode(
                server.clone(),
                self.maps.clone(),
                preset.explore_mode_skip.clone(),
            ));
        }

        let instance = Arc::new(SpaceInstance {
            session,
            id: id.clone(),
            config: RwLock::new(SpaceConfig {
                alias: preset.alias.clone(),
                description: preset.description.clone(),
                map: String::new(),
                links,
            }),
            space: None,
            preset: Some(preset.clone()),
            editing: None,
            server,
        });

        tokio::spawn(self.clone().watch_instance(instance.clone()));

        instances.insert(id, instance.clone());
        Ok(instance)
    }
}

fn eligible_map<'a>(
    pool: &'a [crate::assets::GameMap],
    current: &str,
) -> Vec<&'a crate::assets::GameMap> {
    pool.iter()
        .filter(|map| {
            !map.name.is_empty()
                && map.name != current
                && !map.name.contains('.')
                && !map.name.contains(' ')
                && !map.has_cfg
        })
        .collect()
}

/// Map cycling for preset spaces: a `#skip` vote command plus a fallback
/// timer. Votes clear on every cycle.
pub async fn do_explore_mode(
    server: Arc<GameServer>,
    fetcher: Arc<AssetFetcher>,
    skip_root: String,
) {
    let pool = fetcher.get_maps(&skip_root);
    if pool.is_empty() {
        warn!("explore mode enabled but no maps are available");
        return;
    }

    let skips: Arc<Mutex<HashSet<ClientId>>> = Arc::new(Mutex::new(HashSet::new()));

    let cycle: Arc<dyn Fn() + Send + Sync> = {
        let server = server.clone();
        let pool = pool.clone();
        let skips = skips.clone();
        Arc::new(move || {
            let current = server.map();
            let eligible = eligible_map(&pool, &current);
            let Some(pick) = eligible
                .get(rand::thread_rng().gen_range(0..eligible.len().max(1)))
            else {
                return;
            };
            server.change_map(MODE_COOP, &pick.name);
            skips.lock().unwrap().clear();
        })
    };

    let registered: Result<(), CommandError> = server.commands.register(Command {
        name: "skip".to_owned(),
        description: "vote to skip to the next map".to_owned(),
        handler: Handler::Client(Box::new({
            let server = Arc::downgrade(&server);
            let skips = skips.clone();
            let cycle = cycle.clone();
            move |client| {
                let Some(server) = server.upgrade() else {
                    return;
                };

                if skips.lock().unwrap().contains(&client.cn) {
                    client.message("you have already voted to skip");
                    return;
                }

                let name = server.unique_name(client);
                server.message(&format!(
                    "{} voted to skip to the next map (say #skip to vote)",
                    name
                ));

                skips.lock().unwrap().insert(client.cn);

                let num_clients = server.num_clients();
                let votes = skips.lock().unwrap().len();
                if votes > num_clients / 2 || (num_clients == 1 && votes == 1) {
                    cycle();
                }
            }
        })),
    });
    if let Err(err) = registered {
        error!("could not register explore command: {}", err);
    }

    cycle();

    let mut tick = tokio::time::interval(EXPLORE_CYCLE);
    tick.tick().await;
    loop {
        tokio::select! {
            _ = server.session.cancelled() => return,
            _ = tick.tick() => cycle(),
        }
    }
}
