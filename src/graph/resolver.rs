// src/graph/resolver.rs

//! Version range resolution
//!
//! Turns `name/[>=1.0 <2.0]@user/channel` into a concrete version by
//! scanning the local cache first and, when the cache cannot satisfy
//! the range (or an update was requested), each enabled remote's
//! listing. The greatest satisfying version wins under semver ordering;
//! when several recipe revisions share the winning version, the cache
//! database breaks the tie by latest timestamp, then lexicographically
//! greatest revision.
//!
//! Resolutions are memoized for the lifetime of one graph build so the
//! same range resolves identically across diamond merges.

use crate::cache::DataCache;
use crate::error::{Error, Result};
use crate::reference::RecipeReference;
use crate::remote::RemoteSource;
use crate::version::Version;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Range resolver with per-graph-build memoization
pub struct VersionResolver<'a> {
    cache: &'a DataCache,
    sources: &'a [Arc<dyn RemoteSource>],
    memo: HashMap<String, RecipeReference>,
}

impl<'a> VersionResolver<'a> {
    pub fn new(cache: &'a DataCache, sources: &'a [Arc<dyn RemoteSource>]) -> Self {
        Self {
            cache,
            sources,
            memo: HashMap::new(),
        }
    }

    /// Resolve a possibly-ranged reference to a concrete version.
    ///
    /// Concrete references pass through untouched. With `update`, remote
    /// listings are consulted even when the cache already satisfies the
    /// range, so a newer remote version can win.
    pub fn resolve(&mut self, reference: &RecipeReference, update: bool) -> Result<RecipeReference> {
        let Some(range) = reference.version.as_range() else {
            return Ok(reference.clone());
        };

        let key = reference.base_str();
        if let Some(hit) = self.memo.get(&key) {
            debug!("range {} memoized as {}", key, hit);
            return Ok(hit.clone());
        }

        let mut best: Option<Version> = self
            .cache
            .recipe_versions(reference)?
            .into_iter()
            .filter(|v| range.satisfies(v))
            .max();

        if best.is_none() || update {
            for source in self.sources {
                let remote_best = source
                    .versions(reference)?
                    .into_iter()
                    .filter(|v| range.satisfies(v))
                    .max();
                if let Some(candidate) = remote_best {
                    if best.as_ref().map_or(true, |b| candidate > *b) {
                        debug!(
                            "remote '{}' offers {} for range {}",
                            source.name(),
                            candidate,
                            range
                        );
                        best = Some(candidate);
                    }
                }
            }
        }

        let version = best.ok_or_else(|| {
            Error::NotFound(format!(
                "no version of '{}' satisfies the range '{}'",
                reference.name, range
            ))
        })?;

        let resolved = RecipeReference {
            version,
            revision: None,
            ..reference.clone()
        };
        info!("version range {} resolved to {}", key, resolved);
        self.memo.insert(key, resolved.clone());
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemoteSource;

    fn cache_with(versions: &[&str]) -> (tempfile::TempDir, DataCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DataCache::new(dir.path().join("cache")).unwrap();
        for version in versions {
            let src = tempfile::tempdir().unwrap();
            std::fs::write(src.path().join("recipe.json"), format!("{{\"v\": \"{version}\"}}"))
                .unwrap();
            let base = RecipeReference::parse(&format!("lib/{}", version)).unwrap();
            cache.export_recipe(src.path(), &base).unwrap();
        }
        (dir, cache)
    }

    fn reference(text: &str) -> RecipeReference {
        RecipeReference::parse(text).unwrap()
    }

    #[test]
    fn test_concrete_passes_through() {
        let (_dir, cache) = cache_with(&[]);
        let sources: Vec<Arc<dyn RemoteSource>> = Vec::new();
        let mut resolver = VersionResolver::new(&cache, &sources);

        let concrete = reference("lib/1.0");
        assert_eq!(resolver.resolve(&concrete, false).unwrap(), concrete);
    }

    #[test]
    fn test_cache_satisfies_without_network() {
        let (_dir, cache) = cache_with(&["1.0", "1.1", "2.0"]);
        let remote = Arc::new(MemoryRemoteSource::new("origin"));
        let sources: Vec<Arc<dyn RemoteSource>> = vec![remote.clone()];
        let mut resolver = VersionResolver::new(&cache, &sources);

        let resolved = resolver
            .resolve(&reference("lib/[>=1.0 <2.0]"), false)
            .unwrap();
        assert_eq!(resolved.version.to_string(), "1.1");
        // The cache satisfied the range: the remote was never consulted
        assert_eq!(remote.request_count(), 0);
    }

    #[test]
    fn test_remote_consulted_on_cache_miss() {
        let (_dir, cache) = cache_with(&[]);
        let remote = Arc::new(MemoryRemoteSource::new("origin"));
        remote.add_recipe_json("lib/1.4", "{}").unwrap();
        remote.add_recipe_json("lib/3.0", "{}").unwrap();
        let sources: Vec<Arc<dyn RemoteSource>> = vec![remote];
        let mut resolver = VersionResolver::new(&cache, &sources);

        let resolved = resolver
            .resolve(&reference("lib/[>=1.0 <2.0]"), false)
            .unwrap();
        assert_eq!(resolved.version.to_string(), "1.4");
        assert!(resolved.revision.is_none());
    }

    #[test]
    fn test_update_lets_remote_win() {
        let (_dir, cache) = cache_with(&["1.0"]);
        let remote = Arc::new(MemoryRemoteSource::new("origin"));
        remote.add_recipe_json("lib/1.9", "{}").unwrap();
        let sources: Vec<Arc<dyn RemoteSource>> = vec![remote];

        // Without update the cache answer stands
        let mut resolver = VersionResolver::new(&cache, &sources);
        let resolved = resolver
            .resolve(&reference("lib/[>=1.0 <2.0]"), false)
            .unwrap();
        assert_eq!(resolved.version.to_string(), "1.0");

        // With update the newer remote version wins
        let mut resolver = VersionResolver::new(&cache, &sources);
        let resolved = resolver
            .resolve(&reference("lib/[>=1.0 <2.0]"), true)
            .unwrap();
        assert_eq!(resolved.version.to_string(), "1.9");
    }

    #[test]
    fn test_memoized_within_one_build() {
        let (_dir, cache) = cache_with(&[]);
        let remote = Arc::new(MemoryRemoteSource::new("origin"));
        remote.add_recipe_json("lib/1.5", "{}").unwrap();
        let sources: Vec<Arc<dyn RemoteSource>> = vec![remote.clone()];
        let mut resolver = VersionResolver::new(&cache, &sources);

        let range = reference("lib/[>=1.0 <2.0]");
        resolver.resolve(&range, false).unwrap();
        let listing_requests = remote.request_count();

        // The diamond's second branch resolves from the memo
        resolver.resolve(&range, false).unwrap();
        assert_eq!(remote.request_count(), listing_requests);
    }

    #[test]
    fn test_unsatisfiable_range() {
        let (_dir, cache) = cache_with(&["1.0"]);
        let sources: Vec<Arc<dyn RemoteSource>> = Vec::new();
        let mut resolver = VersionResolver::new(&cache, &sources);

        let err = resolver
            .resolve(&reference("lib/[>=5.0]"), false)
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
