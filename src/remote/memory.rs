// src/remote/memory.rs

//! In-memory remote source for embedding and tests
//!
//! Holds recipe trees as byte maps and serves the full `RemoteSource`
//! surface from them. Revisions are derived exactly like the cache's
//! export flow (combined manifest hash), so a recipe fetched from here
//! is indistinguishable from one exported locally. Every call that a
//! real remote would answer over the network increments a request
//! counter, which lets tests assert that an operation stayed local.

use crate::cache::{layout, DataCache};
use crate::error::{Error, Result};
use crate::manifest::FileTreeManifest;
use crate::reference::RecipeReference;
use crate::version::Version;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tracing::debug;

use super::RemoteSource;

struct StoredRecipe {
    reference: RecipeReference,
    files: BTreeMap<String, Vec<u8>>,
    manifest: FileTreeManifest,
}

/// A `RemoteSource` backed by process memory
pub struct MemoryRemoteSource {
    name: String,
    recipes: Mutex<Vec<StoredRecipe>>,
    requests: AtomicUsize,
    clock: AtomicI64,
}

impl MemoryRemoteSource {
    /// Create an empty source with a registry name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            recipes: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
            clock: AtomicI64::new(1),
        }
    }

    /// Store a recipe tree under a base reference; the revision is the
    /// combined manifest hash of the files. Returns the pinned reference.
    pub fn add_recipe(&self, reference: &str, files: &[(&str, &[u8])]) -> Result<RecipeReference> {
        let base = RecipeReference::parse(reference)?;
        let files: BTreeMap<String, Vec<u8>> = files
            .iter()
            .map(|(path, bytes)| (path.to_string(), bytes.to_vec()))
            .collect();

        let sums = files
            .iter()
            .map(|(path, bytes)| (path.clone(), crate::hash::md5(bytes)))
            .collect();
        let manifest = FileTreeManifest::new(self.clock.fetch_add(1, Ordering::Relaxed), sums);
        let pinned = base.with_revision(manifest.combined_hash());

        let mut recipes = self.recipes.lock().unwrap();
        recipes.retain(|r| r.reference != pinned);
        recipes.push(StoredRecipe {
            reference: pinned.clone(),
            files,
            manifest,
        });
        debug!("memory remote '{}' now serves {}", self.name, pinned);
        Ok(pinned)
    }

    /// Convenience for a one-file declarative recipe
    pub fn add_recipe_json(&self, reference: &str, recipe_json: &str) -> Result<RecipeReference> {
        self.add_recipe(
            reference,
            &[(layout::RECIPE_FILE, recipe_json.as_bytes())],
        )
    }

    /// Number of calls answered so far (a stand-in for network requests)
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    fn count(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
    }

    fn find_latest(&self, reference: &RecipeReference) -> Option<RecipeReference> {
        let recipes = self.recipes.lock().unwrap();
        recipes
            .iter()
            .filter(|r| r.reference.base_str() == reference.base_str())
            .last()
            .map(|r| r.reference.clone())
    }
}

impl RemoteSource for MemoryRemoteSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn versions(&self, sample: &RecipeReference) -> Result<Vec<Version>> {
        self.count();
        let recipes = self.recipes.lock().unwrap();
        let mut versions: Vec<Version> = recipes
            .iter()
            .filter(|r| r.reference.same_identity(sample))
            .map(|r| r.reference.version.clone())
            .collect();
        versions.dedup();
        Ok(versions)
    }

    fn latest_recipe_revision(&self, reference: &RecipeReference) -> Result<RecipeReference> {
        self.count();
        self.find_latest(reference)
            .ok_or_else(|| Error::NotFound(format!("{} not in remote '{}'", reference, self.name)))
    }

    fn recipe_manifest(&self, reference: &RecipeReference) -> Result<FileTreeManifest> {
        self.count();
        let recipes = self.recipes.lock().unwrap();
        recipes
            .iter()
            .find(|r| &r.reference == reference)
            .map(|r| r.manifest.clone())
            .ok_or_else(|| Error::NotFound(format!("{} not in remote '{}'", reference, self.name)))
    }

    fn fetch_recipe(
        &self,
        reference: &RecipeReference,
        cache: &DataCache,
    ) -> Result<RecipeReference> {
        self.count();
        let pinned = if reference.revision.is_some() {
            reference.clone()
        } else {
            self.find_latest(reference).ok_or_else(|| {
                Error::NotFound(format!("{} not in remote '{}'", reference, self.name))
            })?
        };

        let (files, manifest) = {
            let recipes = self.recipes.lock().unwrap();
            let stored = recipes
                .iter()
                .find(|r| r.reference == pinned)
                .ok_or_else(|| {
                    Error::NotFound(format!("{} not in remote '{}'", pinned, self.name))
                })?;
            (stored.files.clone(), stored.manifest.clone())
        };

        let recipe_layout = cache.create_recipe_layout(&pinned, Some(&self.name))?;
        for (path, bytes) in &files {
            let dest = recipe_layout.export().join(path);
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::IoError(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            std::fs::write(&dest, bytes)
                .map_err(|e| Error::IoError(format!("Failed to write {}: {e}", dest.display())))?;
        }
        manifest.save(&recipe_layout.export())?;

        debug!("fetched {} from memory remote '{}'", pinned, self.name);
        Ok(pinned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_pin() {
        let source = MemoryRemoteSource::new("mem");
        let pinned = source
            .add_recipe_json("zlib/1.0", "{\"name\": \"zlib\", \"version\": \"1.0\"}")
            .unwrap();
        assert!(pinned.revision.is_some());

        let base = RecipeReference::parse("zlib/1.0").unwrap();
        assert_eq!(source.latest_recipe_revision(&base).unwrap(), pinned);
    }

    #[test]
    fn test_versions_listing() {
        let source = MemoryRemoteSource::new("mem");
        source.add_recipe_json("lib/1.0", "{}").unwrap();
        source.add_recipe_json("lib/2.0", "{}").unwrap();
        source.add_recipe_json("lib/1.0@corp/stable", "{}").unwrap();

        let sample = RecipeReference::parse("lib/1.0").unwrap();
        let versions = source.versions(&sample).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn test_fetch_into_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DataCache::new(dir.path().join("cache")).unwrap();

        let source = MemoryRemoteSource::new("mem");
        let pinned = source
            .add_recipe_json("zlib/1.0", "{\"name\": \"zlib\", \"version\": \"1.0\"}")
            .unwrap();

        let base = RecipeReference::parse("zlib/1.0").unwrap();
        let fetched = source.fetch_recipe(&base, &cache).unwrap();
        assert_eq!(fetched, pinned);

        let recipe_layout = cache.recipe_layout(&fetched).unwrap();
        assert!(recipe_layout.recipe_file().exists());

        // The served manifest matches what the cache would recompute
        let recomputed = FileTreeManifest::create(&recipe_layout.export()).unwrap();
        assert_eq!(recomputed.combined_hash(), fetched.revision.unwrap());

        let row = cache.recipe_row(&pinned).unwrap();
        assert_eq!(row.remote.as_deref(), Some("mem"));
    }

    #[test]
    fn test_request_counter() {
        let source = MemoryRemoteSource::new("mem");
        source.add_recipe_json("zlib/1.0", "{}").unwrap();
        assert_eq!(source.request_count(), 0);

        let base = RecipeReference::parse("zlib/1.0").unwrap();
        let _ = source.versions(&base);
        let _ = source.latest_recipe_revision(&base);
        assert_eq!(source.request_count(), 2);
    }

    #[test]
    fn test_missing_reference() {
        let source = MemoryRemoteSource::new("mem");
        let base = RecipeReference::parse("absent/1.0").unwrap();
        assert!(matches!(
            source.latest_recipe_revision(&base),
            Err(Error::NotFound(_))
        ));
    }
}
