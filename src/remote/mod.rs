// src/remote/mod.rs

//! Remote registry and the interface remotes are consumed through
//!
//! The registry (`remotes.json` under the cache root) is an *ordered*
//! list of named remotes; the first enabled entry is the default.
//! Disabled remotes stay registered but are skipped by everything that
//! iterates remotes.
//!
//! The rest of the crate never talks wire formats: it sees remotes only
//! through the [`RemoteSource`] trait (version listings, revision
//! pinning, manifest fetch, recipe fetch into the cache). The shipped
//! implementations are [`http::HttpRemoteSource`] for static-file
//! layouts and [`memory::MemoryRemoteSource`] for embedding and tests.

pub mod http;
pub mod memory;
pub mod proxy;

use crate::cache::DataCache;
use crate::error::{Error, Result};
use crate::manifest::FileTreeManifest;
use crate::reference::RecipeReference;
use crate::version::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// Registry file name under the cache root
pub const REMOTES_FILE: &str = "remotes.json";

fn default_verify_ssl() -> bool {
    true
}

/// One configured remote
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub url: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl Remote {
    /// Create an enabled remote, validating the URL
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let url = url.into();
        if name.is_empty() {
            return Err(Error::ParseError("remote name cannot be empty".to_string()));
        }
        Url::parse(&url)
            .map_err(|e| Error::ParseError(format!("invalid remote url '{}': {}", url, e)))?;
        Ok(Self {
            name,
            url,
            verify_ssl: true,
            disabled: false,
        })
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    remotes: Vec<Remote>,
}

/// Ordered collection of remotes
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    remotes: Vec<Remote>,
}

impl RemoteRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `remotes.json`; a missing file yields an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("no remotes registry at {}, starting empty", path.display());
            return Ok(Self::new());
        }
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::IoError(format!("Failed to read {}: {e}", path.display())))?;
        let file: RegistryFile = serde_json::from_str(&contents)
            .map_err(|e| Error::ParseError(format!("invalid remotes registry: {e}")))?;
        Ok(Self {
            remotes: file.remotes,
        })
    }

    /// Write the registry to `remotes.json`
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = RegistryFile {
            remotes: self.remotes.clone(),
        };
        let contents = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::ParseError(format!("failed to encode remotes registry: {e}")))?;
        fs::write(path, contents)
            .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", path.display())))
    }

    /// All remotes in order, disabled ones included
    pub fn all(&self) -> &[Remote] {
        &self.remotes
    }

    /// Enabled remotes in registry order
    pub fn enabled(&self) -> Vec<&Remote> {
        self.remotes.iter().filter(|r| !r.disabled).collect()
    }

    /// The default remote: the first enabled entry
    pub fn default_remote(&self) -> Option<&Remote> {
        self.remotes.iter().find(|r| !r.disabled)
    }

    /// Look up a remote by name
    pub fn get(&self, name: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.name == name)
    }

    /// Append a remote; duplicate names and duplicate URLs are rejected
    pub fn add(&mut self, remote: Remote) -> Result<()> {
        if self.get(&remote.name).is_some() {
            return Err(Error::AlreadyExists(format!("remote '{}'", remote.name)));
        }
        if self.remotes.iter().any(|r| r.url == remote.url) {
            return Err(Error::AlreadyExists(format!(
                "remote url '{}' (registered as another name)",
                remote.url
            )));
        }
        info!("added remote '{}' -> {}", remote.name, remote.url);
        self.remotes.push(remote);
        Ok(())
    }

    /// Remove a remote by name
    pub fn remove(&mut self, name: &str) -> Result<Remote> {
        let index = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::DoesNotExist(format!("remote '{}'", name)))?;
        info!("removed remote '{}'", name);
        Ok(self.remotes.remove(index))
    }

    /// Rename a remote, keeping its position
    pub fn rename(&mut self, name: &str, new_name: &str) -> Result<()> {
        if self.get(new_name).is_some() {
            return Err(Error::AlreadyExists(format!("remote '{}'", new_name)));
        }
        let remote = self
            .remotes
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::DoesNotExist(format!("remote '{}'", name)))?;
        remote.name = new_name.to_string();
        Ok(())
    }

    /// Enable or disable a remote
    pub fn set_disabled(&mut self, name: &str, disabled: bool) -> Result<()> {
        let remote = self
            .remotes
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::DoesNotExist(format!("remote '{}'", name)))?;
        remote.disabled = disabled;
        Ok(())
    }

    /// Move a remote to a new position in the order
    pub fn move_to(&mut self, name: &str, index: usize) -> Result<()> {
        let from = self
            .remotes
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| Error::DoesNotExist(format!("remote '{}'", name)))?;
        let remote = self.remotes.remove(from);
        let index = index.min(self.remotes.len());
        self.remotes.insert(index, remote);
        Ok(())
    }
}

/// The capability surface a remote exposes to the resolver and proxy
pub trait RemoteSource: Send + Sync {
    /// The remote's registry name
    fn name(&self) -> &str;

    /// Versions available for the reference's name/user/channel identity
    fn versions(&self, sample: &RecipeReference) -> Result<Vec<Version>>;

    /// Pin an un-revisioned reference to the remote's latest recipe
    /// revision; `NotFound` when the remote has no such reference.
    fn latest_recipe_revision(&self, reference: &RecipeReference) -> Result<RecipeReference>;

    /// The manifest of a pinned recipe revision
    fn recipe_manifest(&self, reference: &RecipeReference) -> Result<FileTreeManifest>;

    /// Download a recipe's export tree into the cache, returning the
    /// pinned reference of what was fetched.
    fn fetch_recipe(
        &self,
        reference: &RecipeReference,
        cache: &DataCache,
    ) -> Result<RecipeReference>;
}
