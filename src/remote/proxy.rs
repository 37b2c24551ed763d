// src/remote/proxy.rs

//! Recipe lookup classification: cache, update check, or download
//!
//! For each reference the graph builder needs, the proxy decides where
//! the recipe comes from and classifies the outcome into the status the
//! resolver annotates its node with. First matching rule wins:
//!
//! | condition | status |
//! |---|---|
//! | not in local cache | `Downloaded` (or `NotFound` error) |
//! | in cache, updates not requested | `InCache` |
//! | in cache, no remote known | `NoRemote` |
//! | in cache, remote lost the recipe | `NotInRemote` |
//! | manifests equal | `InCache` |
//! | remote newer, `update` | `Updated` (local evicted, re-fetched) |
//! | remote newer, no `update` | `Updateable` |
//! | local newer (ties favor the cache) | `Newer` |

use crate::cache::DataCache;
use crate::error::{Error, Result};
use crate::graph::RecipeStatus;
use crate::manifest::FileTreeManifest;
use crate::reference::RecipeReference;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

use super::RemoteSource;

/// Outcome of a recipe lookup
#[derive(Debug)]
pub struct RecipeResult {
    /// The declarative recipe file to load
    pub recipe_path: PathBuf,
    pub status: RecipeStatus,
    /// The remote involved, when one was
    pub remote: Option<String>,
    /// The reference pinned to a concrete recipe revision
    pub reference: RecipeReference,
}

/// Serves recipe lookups from cache and remotes
pub struct RemoteProxy<'a> {
    cache: &'a DataCache,
    sources: &'a [Arc<dyn RemoteSource>],
}

impl<'a> RemoteProxy<'a> {
    pub fn new(cache: &'a DataCache, sources: &'a [Arc<dyn RemoteSource>]) -> Self {
        Self { cache, sources }
    }

    fn source(&self, name: &str) -> Option<&Arc<dyn RemoteSource>> {
        self.sources.iter().find(|s| s.name() == name)
    }

    /// Obtain a recipe, classifying how it was served.
    ///
    /// `check_updates` consults the selected remote's manifest without
    /// changing the cache; `update` additionally replaces the local copy
    /// when the remote is newer.
    pub fn get_recipe(
        &self,
        reference: &RecipeReference,
        check_updates: bool,
        update: bool,
        selected_remote: Option<&str>,
    ) -> Result<RecipeResult> {
        let check_updates = check_updates || update;

        let local = if reference.revision.is_some() {
            match self.cache.recipe_row(reference) {
                Ok(_) => Some(reference.clone()),
                Err(Error::DoesNotExist(_)) => None,
                Err(e) => return Err(e),
            }
        } else {
            self.cache.latest_recipe_revision(reference)?
        };

        // Not on disk: must be retrieved from remotes
        let Some(local_ref) = local else {
            let (remote, new_ref) = self.download_recipe(reference, selected_remote)?;
            let recipe_layout = self.cache.recipe_layout(&new_ref)?;
            return Ok(RecipeResult {
                recipe_path: recipe_layout.recipe_file(),
                status: RecipeStatus::Downloaded,
                remote: Some(remote),
                reference: new_ref,
            });
        };

        let recipe_layout = self.cache.recipe_layout(&local_ref)?;
        let recipe_path = recipe_layout.recipe_file();
        let row = self.cache.recipe_row(&local_ref)?;
        let cur_remote = row.remote;
        let selected = selected_remote.map(str::to_string).or_else(|| cur_remote.clone());

        if !check_updates {
            return Ok(RecipeResult {
                recipe_path,
                status: RecipeStatus::InCache,
                remote: cur_remote,
                reference: local_ref,
            });
        }

        let source = selected.as_deref().and_then(|name| self.source(name));
        let Some(source) = source else {
            return Ok(RecipeResult {
                recipe_path,
                status: RecipeStatus::NoRemote,
                remote: None,
                reference: local_ref,
            });
        };

        // Revisions are content hashes, so the manifest of the pinned
        // revision can never drift; the update check compares against
        // whatever the remote now serves as its latest revision.
        let remote_manifest = source
            .latest_recipe_revision(&local_ref.without_revision())
            .and_then(|latest| source.recipe_manifest(&latest));
        let remote_manifest = match remote_manifest {
            Ok(manifest) => manifest,
            Err(Error::NotFound(_)) => {
                return Ok(RecipeResult {
                    recipe_path,
                    status: RecipeStatus::NotInRemote,
                    remote: Some(source.name().to_string()),
                    reference: local_ref,
                })
            }
            Err(e) => return Err(e),
        };
        let local_manifest = FileTreeManifest::load(&recipe_layout.export())?;

        let status = if remote_manifest == local_manifest {
            RecipeStatus::InCache
        } else if remote_manifest.time() > local_manifest.time() {
            if update {
                info!("Retrieving from remote '{}'...", source.name());
                self.cache.remove_recipe(&local_ref)?;
                // Unpinned fetch so the remote serves its latest revision
                let new_ref = source.fetch_recipe(&local_ref.without_revision(), self.cache)?;
                let recipe_layout = self.cache.recipe_layout(&new_ref)?;
                return Ok(RecipeResult {
                    recipe_path: recipe_layout.recipe_file(),
                    status: RecipeStatus::Updated,
                    remote: Some(source.name().to_string()),
                    reference: new_ref,
                });
            }
            RecipeStatus::Updateable
        } else {
            // Equal timestamps with different content resolve in favor
            // of the cache
            RecipeStatus::Newer
        };

        Ok(RecipeResult {
            recipe_path,
            status,
            remote: Some(source.name().to_string()),
            reference: local_ref,
        })
    }

    fn download_recipe(
        &self,
        reference: &RecipeReference,
        selected_remote: Option<&str>,
    ) -> Result<(String, RecipeReference)> {
        if let Some(name) = selected_remote {
            let source = self
                .source(name)
                .ok_or_else(|| Error::NotFound(format!("no remote named '{}'", name)))?;
            info!("Retrieving from server '{}'", name);
            let new_ref = source.fetch_recipe(reference, self.cache).map_err(|e| match e {
                Error::NotFound(_) => Error::NotFound(format!(
                    "{} was not found in remote '{}'",
                    reference.base_str(),
                    name
                )),
                other => other,
            })?;
            return Ok((name.to_string(), new_ref));
        }

        info!("Not found in local cache, looking in remotes...");
        if self.sources.is_empty() {
            return Err(Error::NotFound(format!(
                "{}: no remote defined",
                reference.base_str()
            )));
        }

        for source in self.sources {
            debug!("Trying with '{}'...", source.name());
            match source.fetch_recipe(reference, self.cache) {
                Ok(new_ref) => return Ok((source.name().to_string(), new_ref)),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(Error::NotFound(format!(
            "Unable to find '{}' in remotes",
            reference.base_str()
        )))
    }
}
