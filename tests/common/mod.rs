// tests/common/mod.rs

//! Shared fixtures for the integration suites

#![allow(dead_code)]

use quarry::remote::memory::MemoryRemoteSource;
use quarry::remote::RemoteSource;
use quarry::{Context, DataCache, RecipeReference};
use std::path::Path;
use std::sync::Arc;

/// A minimal declarative recipe as JSON
pub fn recipe(name: &str, version: &str, requires: &[&str]) -> String {
    let requires = requires
        .iter()
        .map(|r| format!("\"{}\"", r))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "{{\"name\": \"{}\", \"version\": \"{}\", \"requires\": [{}]}}",
        name, version, requires
    )
}

/// Export a recipe JSON into the cache as `reference`, returning the
/// pinned reference.
pub fn export(cache: &DataCache, reference: &str, json: &str) -> RecipeReference {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("recipe.json"), json).unwrap();
    let base = RecipeReference::parse(reference).unwrap();
    cache.export_recipe(src.path(), &base).unwrap()
}

/// A context over a fresh cache with one in-memory remote attached
pub fn context_with_remote(root: &Path) -> (Context, Arc<MemoryRemoteSource>) {
    let remote = Arc::new(MemoryRemoteSource::new("origin"));
    let ctx = Context::new(root)
        .unwrap()
        .with_sources(vec![remote.clone() as Arc<dyn RemoteSource>]);
    (ctx, remote)
}

/// A context over a fresh cache with no remotes at all
pub fn offline_context(root: &Path) -> Context {
    Context::new(root).unwrap().with_sources(Vec::new())
}
