// src/lib.rs

//! Quarry Package Manager
//!
//! The core of a C/C++ package manager: given a root project declaring
//! dependencies on named recipes with version constraints, it resolves
//! a complete, consistent dependency graph, then fetches, caches and
//! serves the resulting artifacts to downstream builds.
//!
//! # Architecture
//!
//! - Content-addressed cache: recipe and package revisions indexed by a
//!   SQLite table, folders owned exclusively by the cache root
//! - Advisory locking: per-resource shared/exclusive locks, both
//!   cross-process (lock files) and cross-thread (in-process registry)
//! - Download pipeline: retrying, resumable, checksum-verified fetches
//!   with a fingerprint-keyed cross-process cache for immutable URLs
//! - Graph resolver: breadth-first expansion with diamond merging,
//!   conflict detection, overrides and host/build context propagation
//! - No global state: every entry point receives a `Context`

pub mod cache;
pub mod context;
pub mod download;
mod error;
pub mod graph;
pub mod hash;
pub mod lock;
pub mod manifest;
pub mod profile;
pub mod progress;
pub mod recipe;
pub mod reference;
pub mod remote;
pub mod version;

pub use cache::DataCache;
pub use context::Context;
pub use download::cached::CachingDownloader;
pub use download::{Auth, DownloadJob, DownloadOptions, FileDownloader};
pub use error::{Error, Result};
pub use graph::builder::{GraphBuilder, GraphOptions, RootSpec};
pub use graph::{DepsGraph, Node, NodeContext, RecipeStatus, Requirement};
pub use lock::{LockGuard, LockMode, ResourceLocks};
pub use manifest::FileTreeManifest;
pub use profile::Profile;
pub use progress::{BarProgress, LogProgress, ProgressTracker, SilentProgress};
pub use recipe::{CppInfo, DeclaredRecipe, JsonRecipeLoader, Recipe, RecipeLoader};
pub use reference::{CacheReference, PackageReference, RecipeReference};
pub use remote::{Remote, RemoteRegistry, RemoteSource};
pub use version::{Version, VersionRange};
