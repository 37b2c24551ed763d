// src/context.rs

//! The per-call context threaded through every entry point
//!
//! There is no global state anywhere in this crate: the cache, the
//! remote registry, the materialized remote sources, both profiles, the
//! recipe loader and the progress sink all travel together in a
//! [`Context`] constructed by the embedder (or the CLI) and passed by
//! reference.

use crate::cache::DataCache;
use crate::error::Result;
use crate::profile::Profile;
use crate::progress::{ProgressTracker, SilentProgress};
use crate::recipe::{JsonRecipeLoader, RecipeLoader};
use crate::remote::http::HttpRemoteSource;
use crate::remote::{RemoteRegistry, RemoteSource, REMOTES_FILE};
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

/// Everything one resolution or install call needs
pub struct Context {
    pub cache: DataCache,
    pub registry: RemoteRegistry,
    /// Materialized sources for the registry's enabled remotes, in order
    pub sources: Vec<Arc<dyn RemoteSource>>,
    pub loader: Arc<dyn RecipeLoader>,
    pub profile_host: Profile,
    pub profile_build: Profile,
    pub progress: Arc<dyn ProgressTracker>,
}

impl Context {
    /// Open a context over a cache root: loads `remotes.json` from the
    /// root and materializes an HTTP source per enabled remote.
    /// Disabled remotes are skipped silently, with a single warning for
    /// the whole build.
    pub fn new(cache_root: &Path) -> Result<Self> {
        let cache = DataCache::new(cache_root)?;
        let registry = RemoteRegistry::load(&cache_root.join(REMOTES_FILE))?;

        let disabled = registry.all().iter().filter(|r| r.disabled).count();
        if disabled > 0 {
            warn!("skipping {} disabled remote(s)", disabled);
        }

        let mut sources: Vec<Arc<dyn RemoteSource>> = Vec::new();
        for remote in registry.enabled() {
            sources.push(Arc::new(HttpRemoteSource::new(remote.clone())?));
        }

        Ok(Self {
            cache,
            registry,
            sources,
            loader: Arc::new(JsonRecipeLoader),
            profile_host: Profile::new(),
            profile_build: Profile::new(),
            progress: Arc::new(SilentProgress::new()),
        })
    }

    /// Replace the materialized sources (embedders and tests supply
    /// their own `RemoteSource` implementations this way)
    pub fn with_sources(mut self, sources: Vec<Arc<dyn RemoteSource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Set the host and build profiles
    pub fn with_profiles(mut self, host: Profile, build: Profile) -> Self {
        self.profile_host = host;
        self.profile_build = build;
        self
    }

    /// Set the progress sink
    pub fn with_progress(mut self, progress: Arc<dyn ProgressTracker>) -> Self {
        self.progress = progress;
        self
    }

    /// Persist the registry back to `remotes.json` under the cache root
    pub fn save_registry(&self) -> Result<()> {
        self.registry.save(&self.cache.root().join(REMOTES_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::Remote;

    #[test]
    fn test_new_context_over_empty_root() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = Context::new(&dir.path().join("cache")).unwrap();
        assert!(ctx.sources.is_empty());
        assert!(ctx.registry.all().is_empty());
    }

    #[test]
    fn test_sources_follow_registry_order_and_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");

        let mut registry = RemoteRegistry::new();
        registry
            .add(Remote::new("first", "https://first.example.com").unwrap())
            .unwrap();
        registry
            .add(Remote::new("second", "https://second.example.com").unwrap())
            .unwrap();
        registry.set_disabled("first", true).unwrap();
        std::fs::create_dir_all(&root).unwrap();
        registry.save(&root.join(REMOTES_FILE)).unwrap();

        let ctx = Context::new(&root).unwrap();
        assert_eq!(ctx.sources.len(), 1);
        assert_eq!(ctx.sources[0].name(), "second");
    }

    #[test]
    fn test_registry_roundtrip_through_context() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");

        let mut ctx = Context::new(&root).unwrap();
        ctx.registry
            .add(Remote::new("origin", "https://origin.example.com").unwrap())
            .unwrap();
        ctx.save_registry().unwrap();

        let reloaded = Context::new(&root).unwrap();
        assert_eq!(reloaded.registry.all().len(), 1);
        assert_eq!(reloaded.sources.len(), 1);
    }
}
