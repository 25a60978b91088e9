// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MASTER: &str = "master.sauerbraten.org:28787";

fn default_web_port() -> u16 {
    28780
}

fn default_base_port() -> u16 {
    28785
}

fn default_master() -> String {
    DEFAULT_MASTER.to_owned()
}

fn default_max_clients() -> i32 {
    128
}

fn default_enabled() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngressConfig {
    /// Port the WebSocket bridge listens on.
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    /// First game port; each server claims a game/info port pair above it.
    #[serde(default = "default_base_port")]
    pub base_port: u16,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            base_port: default_base_port(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub register_master: bool,
    /// The master directory; passed through, never read ambiently.
    #[serde(default = "default_master")]
    pub master: String,
}

impl Default for InfoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            register_master: false,
            master: default_master(),
        }
    }
}

/// A named game-server template the pool builds instances from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresetConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_max_clients")]
    pub max_clients: i32,
    #[serde(default)]
    pub default: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    pub teleport: i32,
    pub teledest: i32,
    pub destination: String,
}

/// A space fixed at process start.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PresetSpaceConfig {
    pub alias: String,
    #[serde(default)]
    pub description: String,
    /// Which pool preset hosts it; empty picks the default.
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub explore_mode: bool,
    /// Root whose maps explore mode must not pick.
    #[serde(default)]
    pub explore_mode_skip: String,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootSpec {
    Fs { path: PathBuf },
    Packaged { cache: PathBuf, index_url: String },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub ingress: IngressConfig,
    #[serde(default)]
    pub info: InfoConfig,
    #[serde(default)]
    pub presets: Vec<PresetConfig>,
    #[serde(default)]
    pub spaces: Vec<PresetSpaceConfig>,
    #[serde(default)]
    pub assets: Vec<RootSpec>,
    /// Where user-space documents live.
    #[serde(default)]
    pub verse_dir: PathBuf,
    /// Where edit checkpoints land.
    #[serde(default)]
    pub edits_dir: PathBuf,
}

impl GatewayConfig {
    pub fn load(path: &PathBuf) -> Result<Self, std::io::Error> {
        let raw = std::fs::read(path)?;
        serde_json::from_slice(&raw).map_err(std::io::Error::other)
    }

    /// A runnable configuration when no file is given: one public lobby
    /// preset, info responder on, no master registration.
    pub fn fallback() -> Self {
        Self {
            presets: vec![PresetConfig {
                name: "lobby".to_owned(),
                description: "lobby".to_owned(),
                max_clients: default_max_clients(),
                default: true,
            }],
            verse_dir: PathBuf::from("verse"),
            edits_dir: PathBuf::from("edits"),
            ..Default::default()
        }
    }
}
