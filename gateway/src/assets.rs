// SPDX-FileCopyrightText: 2021 Softbear, Inc.
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Asset roots. A root resolves engine paths to bytes; the gateway only
//! consumes the lookup surface, the heavy fetch/minify tooling lives in
//! the companion dump utility.

use log::warn;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("path {0:?} not found in root")]
    NotFound(String),
    #[error("missing index blob {0:?}")]
    MissingIndex(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Parse(#[from] serde_json::Error),
}

pub fn sha256_hex(input: &str) -> String {
    Sha256::digest(input.as_bytes())
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Where asset bytes come from: a plain directory or a packaged remote
/// snapshot addressed through a content-addressed cache.
pub trait Root: Send + Sync {
    /// Identifies the root for filtering, e.g. explore mode's skip list.
    fn label(&self) -> String;
    fn exists(&self, path: &str) -> bool;
    fn read_file(&self, path: &str) -> Result<Vec<u8>, AssetError>;
    /// A stable handle for the asset, usable across gateway restarts.
    fn reference(&self, path: &str) -> Result<String, AssetError>;
}

/// An absolute directory on the local filesystem.
pub struct FsRoot {
    base: PathBuf,
}

impl FsRoot {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base.join(path)
    }
}

impl Root for FsRoot {
    fn label(&self) -> String {
        self.base.display().to_string()
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        Ok(std::fs::read(self.resolve(path))?)
    }

    fn reference(&self, path: &str) -> Result<String, AssetError> {
        if !self.exists(path) {
            return Err(AssetError::NotFound(path.to_owned()));
        }
        Ok(format!("fs:{}", self.resolve(path).display()))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackAsset {
    pub id: String,
    pub path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackMap {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub has_cfg: bool,
}

/// The index blob of a packaged snapshot.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PackIndex {
    #[serde(default)]
    pub assets: Vec<PackAsset>,
    #[serde(default)]
    pub maps: Vec<PackMap>,
}

/// A packaged snapshot: blobs named by asset id under a cache directory,
/// with the index blob itself addressed by the sha-256 of its source URL.
pub struct PackagedRoot {
    index_url: String,
    cache: PathBuf,
    index: PackIndex,
}

impl PackagedRoot {
    pub fn open(cache: impl Into<PathBuf>, index_url: &str) -> Result<Self, AssetError> {
        let cache = cache.into();
        let blob = cache.join(sha256_hex(index_url));
        if !blob.exists() {
            return Err(AssetError::MissingIndex(index_url.to_owned()));
        }
        let index: PackIndex = serde_json::from_slice(&std::fs::read(blob)?)?;
        Ok(Self {
            index_url: index_url.to_owned(),
            cache,
            index,
        })
    }

    pub fn maps(&self) -> &[PackMap] {
        &self.index.maps
    }

    fn asset(&self, path: &str) -> Option<&PackAsset> {
        self.index.assets.iter().find(|asset| asset.path == path)
    }
}

impl Root for PackagedRoot {
    fn label(&self) -> String {
        self.index_url.clone()
    }

    fn exists(&self, path: &str) -> bool {
        self.asset(path).is_some()
    }

    fn read_file(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let asset = self
            .asset(path)
            .ok_or_else(|| AssetError::NotFound(path.to_owned()))?;
        Ok(std::fs::read(self.cache.join(&asset.id))?)
    }

    fn reference(&self, path: &str) -> Result<String, AssetError> {
        let asset = self
            .asset(path)
            .ok_or_else(|| AssetError::NotFound(path.to_owned()))?;
        Ok(format!("id:{}", asset.id))
    }
}

/// A map known to some root.
#[derive(Clone, Debug)]
pub struct GameMap {
    pub name: String,
    pub path: String,
    pub has_cfg: bool,
    pub root: String,
}

/// Aggregated view over every configured root.
pub struct AssetFetcher {
    roots: Vec<Arc<dyn Root>>,
    maps: Vec<GameMap>,
}

impl AssetFetcher {
    pub fn new(roots: Vec<Arc<dyn Root>>, packaged: &[Arc<PackagedRoot>]) -> Self {
        let mut maps = Vec::new();
        for root in packaged {
            for map in root.maps() {
                maps.push(GameMap {
                    name: map.name.clone(),
                    path: map.path.clone(),
                    has_cfg: map.has_cfg,
                    root: root.label(),
                });
            }
        }
        Self { roots, maps }
    }

    /// A fetcher over a fixed map list, for callers that already know
    /// their pool.
    pub fn from_maps(maps: Vec<GameMap>) -> Self {
        Self {
            roots: Vec::new(),
            maps,
        }
    }

    pub fn find_map(&self, name: &str) -> Option<&GameMap> {
        self.maps
            .iter()
            .find(|map| map.name == name)
            .or_else(|| self.maps.iter().find(|map| map.name.starts_with(name)))
    }

    /// Every known map except those from the named root.
    pub fn get_maps(&self, skip_root: &str) -> Vec<GameMap> {
        self.maps
            .iter()
            .filter(|map| map.root != skip_root)
            .cloned()
            .collect()
    }

    pub fn read_file(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        for root in &self.roots {
            if root.exists(path) {
                return root.read_file(path);
            }
        }
        warn!("asset {} not found in any root", path);
        Err(AssetError::NotFound(path.to_owned()))
    }
}
