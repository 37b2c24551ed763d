// src/cache/layout.rs

//! On-disk layout of the cache and the dirty-bit protocol
//!
//! Everything lives under the cache root:
//!
//! ```text
//! <cache_root>/
//!   data/<name>/<version>/<user>/<channel>/<recipe_rev>/
//!       export/          recipe files (content-addressed)
//!       export_sources/
//!       source/          expanded sources (non-content-addressed)
//!       dl/export/       downloaded archives
//!       package/<package_id>/<package_rev>/
//!       build/<package_id>/
//!   p/<short_hash>       alternative short-path mapping (when enabled)
//!   .conan.db
//!   remotes.json
//!   locks/
//! ```
//!
//! Absent user/channel components are written as `_`. The dirty bit is a
//! `<path>.dirty` sentinel: set before any write to a folder, cleared
//! only after the write (or promotion) fully succeeded. A reader that
//! observes it must treat the entry as absent.

use crate::error::{Error, Result};
use crate::reference::{PackageReference, RecipeReference};
use std::fs;
use std::path::{Path, PathBuf};

/// Folder under the cache root holding all reference data
pub const DATA_FOLDER: &str = "data";
/// Recipe export tree
pub const EXPORT_FOLDER: &str = "export";
/// Exported sources shipped with the recipe
pub const EXPORT_SOURCES_FOLDER: &str = "export_sources";
/// Expanded sources (not content-addressed)
pub const SOURCE_FOLDER: &str = "source";
/// Downloaded recipe archives
pub const DOWNLOAD_EXPORT_FOLDER: &str = "dl/export";
/// Built package trees, by package id and revision
pub const PACKAGES_FOLDER: &str = "package";
/// Build workspaces, by package id
pub const BUILD_FOLDER: &str = "build";
/// The declarative recipe file inside `export/`
pub const RECIPE_FILE: &str = "recipe.json";

fn component(part: Option<&str>) -> &str {
    part.unwrap_or("_")
}

/// Base folder of a pinned recipe reference, relative to the cache root
pub fn recipe_folder(reference: &RecipeReference) -> Result<PathBuf> {
    let rrev = reference.revision.as_deref().ok_or_else(|| {
        Error::ParseError(format!(
            "cannot lay out '{}' without a recipe revision",
            reference.base_str()
        ))
    })?;
    Ok(PathBuf::from(DATA_FOLDER)
        .join(&reference.name)
        .join(reference.version.as_str())
        .join(component(reference.user.as_deref()))
        .join(component(reference.channel.as_deref()))
        .join(rrev))
}

/// Package tree folder of a pinned package reference, relative to the
/// cache root
pub fn package_folder(reference: &PackageReference) -> Result<PathBuf> {
    let prev = reference.revision.as_deref().ok_or_else(|| {
        Error::ParseError(format!(
            "cannot lay out '{}' without a package revision",
            reference.full_str()
        ))
    })?;
    Ok(recipe_folder(&reference.recipe)?
        .join(PACKAGES_FOLDER)
        .join(&reference.package_id)
        .join(prev))
}

/// Short-path mapping for a content hash: `p/<first 8 hex chars>`
pub fn short_path(hash: &str) -> PathBuf {
    PathBuf::from("p").join(&hash[..hash.len().min(8)])
}

/// Paths of a recipe revision's folders
#[derive(Debug, Clone)]
pub struct RecipeLayout {
    base: PathBuf,
}

impl RecipeLayout {
    /// Wrap an absolute base folder (`.../<rrev>/`)
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn base_folder(&self) -> &Path {
        &self.base
    }

    pub fn export(&self) -> PathBuf {
        self.base.join(EXPORT_FOLDER)
    }

    pub fn export_sources(&self) -> PathBuf {
        self.base.join(EXPORT_SOURCES_FOLDER)
    }

    pub fn source(&self) -> PathBuf {
        self.base.join(SOURCE_FOLDER)
    }

    pub fn download_export(&self) -> PathBuf {
        self.base.join(DOWNLOAD_EXPORT_FOLDER)
    }

    /// The declarative recipe file inside the export tree
    pub fn recipe_file(&self) -> PathBuf {
        self.export().join(RECIPE_FILE)
    }

    /// Create the folders a fresh recipe revision needs
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.export(), self.export_sources(), self.download_export()] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::IoError(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Delete this revision's folder tree entirely
    pub fn remove(&self) -> Result<()> {
        remove_tree(&self.base)
    }
}

/// Paths of one package build/binary location
#[derive(Debug, Clone)]
pub struct PackageLayout {
    /// The recipe revision's base folder
    recipe_base: PathBuf,
    package_id: String,
    /// The package revision (placeholder until promotion)
    revision: String,
}

impl PackageLayout {
    pub fn new(recipe_base: PathBuf, package_id: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            recipe_base,
            package_id: package_id.into(),
            revision: revision.into(),
        }
    }

    /// The built artifact tree
    pub fn package(&self) -> PathBuf {
        self.recipe_base
            .join(PACKAGES_FOLDER)
            .join(&self.package_id)
            .join(&self.revision)
    }

    /// The build workspace (shared across revisions of one package id)
    pub fn build(&self) -> PathBuf {
        self.recipe_base.join(BUILD_FOLDER).join(&self.package_id)
    }

    /// Create the package and build folders
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.package(), self.build()] {
            fs::create_dir_all(&dir).map_err(|e| {
                Error::IoError(format!("Failed to create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Delete the built artifact tree (the build workspace stays)
    pub fn remove_package(&self) -> Result<()> {
        clean_dirty(&self.package());
        remove_tree(&self.package())
    }
}

/// Remove a folder tree, surfacing the path on failure
pub fn remove_tree(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    fs::remove_dir_all(path).map_err(|e| {
        Error::IoError(format!(
            "{}\n\nFolder: {}\nCouldn't remove folder, might be busy or open",
            e,
            path.display()
        ))
    })
}

fn dirty_marker(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".dirty");
    PathBuf::from(name)
}

/// Mark a path as being written; must precede any write
pub fn set_dirty(path: &Path) -> Result<()> {
    let marker = dirty_marker(path);
    if let Some(parent) = marker.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", parent.display())))?;
    }
    fs::write(&marker, b"")
        .map_err(|e| Error::IoError(format!("Failed to set dirty bit {}: {e}", marker.display())))
}

/// Clear the dirty marker; must be the last step of a successful write
pub fn clean_dirty(path: &Path) {
    let _ = fs::remove_file(dirty_marker(path));
}

/// Whether a path carries the dirty marker
pub fn is_dirty(path: &Path) -> bool {
    dirty_marker(path).exists()
}
