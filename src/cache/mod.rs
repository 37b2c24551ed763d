// src/cache/mod.rs

//! The content-addressed cache: folders on disk plus the database that
//! indexes them
//!
//! `DataCache` owns the cache root exclusively: the `data/` tree, the
//! references database and the lock directory. It maintains the
//! bijection between references and folders, serializes structural
//! changes per reference through exclusive locks, and implements the
//! provisional-to-final promotion of freshly built packages.
//!
//! # Package build lifecycle
//!
//! A package row is born provisional: `create_package` inserts a row
//! whose revision is a random placeholder, marks the folder dirty and
//! hands back the exclusive lock. After the build fills the folder,
//! `promote_package` computes the final content-addressed revision from
//! the file tree, renames the folder, rewrites the row in one database
//! transaction, clears the dirty bit last, and exchanges the lock onto
//! the final resource. Readers that see a dirty bit treat the row as
//! absent and evict it.

pub mod db;
pub mod layout;

use crate::error::{Error, Result};
use crate::lock::{LockGuard, ResourceLocks};
use crate::manifest::FileTreeManifest;
use crate::reference::{CacheReference, PackageReference, RecipeReference};
use crate::version::Version;
use self::layout::{PackageLayout, RecipeLayout};
use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Subdirectory of the cache root holding lock files
const LOCKS_FOLDER: &str = "locks";

/// The cache store rooted at a single directory
pub struct DataCache {
    root: PathBuf,
    conn: Mutex<Connection>,
    locks: Arc<ResourceLocks>,
}

impl DataCache {
    /// Open (or create) a cache rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", root.display())))?;

        let conn = db::init(&root.join(db::DB_FILE))?;
        let locks = Arc::new(ResourceLocks::new(root.join(LOCKS_FOLDER))?);
        info!("cache opened at {}", root.display());

        Ok(Self {
            root,
            conn: Mutex::new(conn),
            locks,
        })
    }

    /// The cache root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-resource lock registry shared by everything that touches
    /// this cache
    pub fn locks(&self) -> Arc<ResourceLocks> {
        self.locks.clone()
    }

    /// Direct database access for listings and tests
    pub fn db(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    fn rel_str(path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    fn absolute(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    // ------------------------------------------------------------------
    // Recipes
    // ------------------------------------------------------------------

    /// Insert a row for a pinned recipe reference and create its folders.
    /// Inserts are serialized per reference through the exclusive lock
    /// on the reference's resource string.
    pub fn create_recipe_layout(
        &self,
        reference: &RecipeReference,
        remote: Option<&str>,
    ) -> Result<RecipeLayout> {
        let _guard = self.locks.exclusive(&reference.full_str(), None)?;
        let key = CacheReference::from_recipe(reference)?;
        let rel = layout::recipe_folder(reference)?;
        db::insert(&self.db(), &key, &Self::rel_str(&rel), remote)?;

        let recipe_layout = RecipeLayout::new(self.root.join(&rel));
        recipe_layout.ensure_dirs()?;
        debug!("created recipe layout for {}", reference);
        Ok(recipe_layout)
    }

    /// The layout of a pinned recipe reference already in the cache
    pub fn recipe_layout(&self, reference: &RecipeReference) -> Result<RecipeLayout> {
        let row = self.recipe_row(reference)?;
        Ok(RecipeLayout::new(self.absolute(&row.path)))
    }

    /// The database row of a pinned recipe reference
    pub fn recipe_row(&self, reference: &RecipeReference) -> Result<db::Row> {
        let key = CacheReference::from_recipe(reference)?;
        db::get(&self.db(), &key)
    }

    /// The latest recipe revision of a base reference, if any
    pub fn latest_recipe_revision(
        &self,
        reference: &RecipeReference,
    ) -> Result<Option<RecipeReference>> {
        let row = db::latest_recipe_revision(&self.db(), &reference.base_str())?;
        row.map(|r| r.cache_reference().to_recipe_ref()).transpose()
    }

    /// Register a local recipe tree: compute its manifest, derive the
    /// revision from the combined hash, copy the tree into `export/`.
    ///
    /// Re-exporting identical content hits the same revision; the
    /// existing row just gets a fresh timestamp.
    pub fn export_recipe(
        &self,
        source: &Path,
        reference: &RecipeReference,
    ) -> Result<RecipeReference> {
        let manifest = FileTreeManifest::create(source)?;
        let pinned = reference.with_revision(manifest.combined_hash());
        let key = CacheReference::from_recipe(&pinned)?;

        if db::get(&self.db(), &key).is_ok() {
            db::update(&self.db(), &key, None, None, None)?;
            debug!("recipe {} already exported, refreshed timestamp", pinned);
            return Ok(pinned);
        }

        let recipe_layout = self.create_recipe_layout(&pinned, None)?;
        copy_tree(source, &recipe_layout.export())?;
        manifest.save(&recipe_layout.export())?;
        info!("exported {} to {}", pinned, recipe_layout.base_folder().display());
        Ok(pinned)
    }

    /// Verify a cached recipe's export tree against its stored manifest
    pub fn verify_recipe(&self, reference: &RecipeReference) -> Result<()> {
        let recipe_layout = self.recipe_layout(reference)?;
        let stored = FileTreeManifest::load(&recipe_layout.export()).map_err(|_| {
            Error::CacheCorruption(format!(
                "{} has no manifest in its export tree",
                reference
            ))
        })?;
        let actual = FileTreeManifest::create(&recipe_layout.export())?;
        if stored != actual {
            return Err(Error::CacheCorruption(format!(
                "cached tree for {} does not match its manifest (expected {}, found {})",
                reference,
                stored.combined_hash(),
                actual.combined_hash()
            )));
        }
        Ok(())
    }

    /// Remove a recipe revision: its folder tree (packages included) and
    /// every row under that revision.
    pub fn remove_recipe(&self, reference: &RecipeReference) -> Result<()> {
        let row = self.recipe_row(reference)?;
        let resource = reference.full_str();
        let _guard = self.locks.exclusive(&resource, None)?;

        let removed = {
            let mut conn = self.db();
            db::transaction(&mut conn, |tx| {
                db::remove_revision_rows(tx, &row.reference, &row.rrev)
            })?
        };
        layout::remove_tree(&self.absolute(&row.path))?;
        info!("evicted {} ({} rows)", reference, removed);
        Ok(())
    }

    /// The versions of `name` present in the cache for one user/channel
    /// identity, used by the range resolver.
    pub fn recipe_versions(&self, sample: &RecipeReference) -> Result<Vec<Version>> {
        let references = db::recipe_references(&self.db(), &sample.name)?;
        let mut versions = Vec::new();
        for text in references {
            let candidate = RecipeReference::parse(&text)?;
            if candidate.same_identity(sample) {
                versions.push(candidate.version);
            }
        }
        Ok(versions)
    }

    /// All recipe revisions of a base reference, newest first
    pub fn list_recipe_revisions(
        &self,
        reference: &RecipeReference,
    ) -> Result<Vec<RecipeReference>> {
        let rows = db::recipe_revisions(&self.db(), &reference.base_str())?;
        rows.iter()
            .map(|r| r.cache_reference().to_recipe_ref())
            .collect()
    }

    // ------------------------------------------------------------------
    // Packages
    // ------------------------------------------------------------------

    /// The latest package revision for a package id, with dirty-bit
    /// remediation: a row whose folder is marked dirty is evicted and
    /// reported absent.
    pub fn latest_package_revision(
        &self,
        reference: &PackageReference,
    ) -> Result<Option<PackageReference>> {
        let key = CacheReference::from_package(reference)?;
        let row = db::latest_package_revision(
            &self.db(),
            &key.reference,
            &key.rrev,
            &key.pkgid.expect("package reference always has a pkgid"),
        )?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        if layout::is_dirty(&self.absolute(&row.path)) {
            self.remediate_dirty(&row)?;
            return Ok(None);
        }

        let prev = row.prev.clone().expect("package rows always carry a prev");
        Ok(Some(reference.with_revision(prev)))
    }

    /// The built artifact folder of a pinned package reference
    pub fn package_folder(&self, reference: &PackageReference) -> Result<PathBuf> {
        let key = CacheReference::from_package(reference)?;
        let row = db::get(&self.db(), &key)?;
        let folder = self.absolute(&row.path);
        if layout::is_dirty(&folder) {
            self.remediate_dirty(&row)?;
            return Err(Error::DoesNotExist(key.full_reference()));
        }
        Ok(folder)
    }

    /// Start a package build: insert a provisional row under a random
    /// placeholder revision, mark it dirty, and hand back the exclusive
    /// lock the build (and later the promotion) runs under.
    pub fn create_package(
        &self,
        reference: &PackageReference,
    ) -> Result<(PackageReference, PackageLayout, LockGuard)> {
        let provisional = reference.with_revision(Uuid::new_v4().simple().to_string());
        let guard = self.locks.exclusive(&provisional.full_str(), None)?;

        let key = CacheReference::from_package(&provisional)?;
        let rel = layout::package_folder(&provisional)?;

        // Dirty bit goes down before the row exists: a concurrent
        // reader either sees no row, or a dirty row it treats as absent
        let recipe_base = self.recipe_layout(&provisional.recipe)?.base_folder().to_path_buf();
        let pkg_layout = PackageLayout::new(
            recipe_base,
            &provisional.package_id,
            provisional.revision.clone().unwrap(),
        );
        pkg_layout.ensure_dirs()?;
        layout::set_dirty(&pkg_layout.package())?;

        db::insert(&self.db(), &key, &Self::rel_str(&rel), None)?;

        debug!("created provisional package {}", provisional);
        Ok((provisional, pkg_layout, guard))
    }

    /// Promote a provisional package revision to its final
    /// content-addressed location.
    ///
    /// The caller passes the exclusive guard obtained from
    /// `create_package`; it is exchanged for a lock on the final
    /// resource. Promoting content that already exists under its final
    /// revision discards the provisional copy and returns the existing
    /// reference, so promotion is idempotent.
    pub fn promote_package(
        &self,
        guard: LockGuard,
        provisional: &PackageReference,
    ) -> Result<(PackageReference, LockGuard)> {
        let key = CacheReference::from_package(provisional)?;
        // Bind the lookup before matching so the database guard is not
        // held while the no-op branch re-queries
        let lookup = {
            let conn = self.db();
            db::get(&conn, &key)
        };
        let row = match lookup {
            Ok(row) => row,
            Err(Error::DoesNotExist(_)) => {
                // The provisional row is gone: an earlier promotion of
                // this same reference already went through. Re-promoting
                // is a no-op that hands back the promoted reference.
                let promoted = self
                    .latest_package_revision(&PackageReference {
                        revision: None,
                        ..provisional.clone()
                    })?
                    .ok_or_else(|| Error::DoesNotExist(key.full_reference()))?;
                let guard = self.locks.exchange(guard, &promoted.full_str(), None)?;
                debug!("{} already promoted to {}", provisional, promoted);
                return Ok((promoted, guard));
            }
            Err(e) => return Err(e),
        };
        let provisional_folder = self.absolute(&row.path);

        let manifest = FileTreeManifest::create(&provisional_folder)?;
        manifest.save(&provisional_folder)?;
        let final_ref = provisional.with_revision(manifest.combined_hash());
        let final_key = CacheReference::from_package(&final_ref)?;

        if db::get(&self.db(), &final_key).is_ok() {
            // Already promoted by an earlier build of identical content
            {
                let mut conn = self.db();
                db::transaction(&mut conn, |tx| db::remove(tx, &key))?;
            }
            layout::remove_tree(&provisional_folder)?;
            layout::clean_dirty(&provisional_folder);
            let guard = self
                .locks
                .exchange(guard, &final_ref.full_str(), None)?;
            debug!("promotion of {} found existing {}", provisional, final_ref);
            return Ok((final_ref, guard));
        }

        let final_rel = layout::package_folder(&final_ref)?;
        let final_folder = self.root.join(&final_rel);
        if let Some(parent) = final_folder.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::IoError(format!("Failed to create {}: {e}", parent.display()))
            })?;
        }
        fs::rename(&provisional_folder, &final_folder).map_err(|e| {
            Error::IoError(format!(
                "Failed to move {} to {}: {e}",
                provisional_folder.display(),
                final_folder.display()
            ))
        })?;

        {
            let mut conn = self.db();
            db::transaction(&mut conn, |tx| {
                db::update(tx, &key, Some(&final_key), Some(&Self::rel_str(&final_rel)), None)
            })?;
        }

        // Dirty marker sits next to the provisional path; clearing it is
        // the last step so a crash anywhere above leaves the row evictable
        layout::clean_dirty(&provisional_folder);

        let guard = self.locks.exchange(guard, &final_ref.full_str(), None)?;
        info!("promoted {} -> {}", provisional, final_ref);
        Ok((final_ref, guard))
    }

    /// Remove one pinned package revision: its row and folder
    pub fn remove_package(&self, reference: &PackageReference) -> Result<()> {
        let key = CacheReference::from_package(reference)?;
        let _guard = self.locks.exclusive(&reference.full_str(), None)?;

        let row = db::get(&self.db(), &key)?;
        {
            let mut conn = self.db();
            db::transaction(&mut conn, |tx| db::remove(tx, &key))?;
        }
        let folder = self.absolute(&row.path);
        layout::clean_dirty(&folder);
        layout::remove_tree(&folder)?;
        info!("evicted {}", reference);
        Ok(())
    }

    /// The package ids built for a recipe revision
    pub fn list_package_ids(&self, reference: &RecipeReference) -> Result<Vec<PackageReference>> {
        let key = CacheReference::from_recipe(reference)?;
        let rows = db::package_ids(&self.db(), &key.reference, &key.rrev)?;
        rows.into_iter()
            .map(|row| {
                let mut pref = PackageReference::new(
                    reference.clone(),
                    row.pkgid.expect("package id listing always has pkgid"),
                )?;
                pref.revision = row.prev;
                Ok(pref)
            })
            .collect()
    }

    /// All revisions of one package id, newest first
    pub fn list_package_revisions(
        &self,
        reference: &PackageReference,
    ) -> Result<Vec<PackageReference>> {
        let key = CacheReference::from_package(reference)?;
        let rows = db::package_revisions(
            &self.db(),
            &key.reference,
            &key.rrev,
            &key.pkgid.expect("package reference always has a pkgid"),
        )?;
        Ok(rows
            .into_iter()
            .map(|row| reference.with_revision(row.prev.expect("package rows always carry a prev")))
            .collect())
    }

    /// Recipe rows for `cache list`, oldest first
    pub fn list_all(&self, only_latest_rrev: bool) -> Result<Vec<db::Row>> {
        db::all(&self.db(), only_latest_rrev)
    }

    /// Forget an origin remote on every row referencing it (used when a
    /// remote is removed from the registry)
    pub fn clear_remote(&self, remote: &str) -> Result<usize> {
        db::clear_remote(&self.db(), remote)
    }

    /// A dirty row is either an in-progress build (its resource lock is
    /// held, leave it alone) or a crashed one (lock free, evict it).
    /// Either way the caller treats the row as absent.
    fn remediate_dirty(&self, row: &db::Row) -> Result<()> {
        let resource = row.cache_reference().full_reference();
        match self.locks.exclusive(&resource, Some(Duration::ZERO)) {
            Ok(_guard) => {
                warn!("package folder {} is dirty, evicting row {}", row.path, resource);
                self.evict_row(row)
            }
            Err(Error::LockTimeout(_)) => {
                debug!("dirty folder {} belongs to an in-progress build", row.path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn evict_row(&self, row: &db::Row) -> Result<()> {
        {
            let mut conn = self.db();
            db::transaction(&mut conn, |tx| db::remove(tx, &row.cache_reference()))?;
        }
        let folder = self.absolute(&row.path);
        layout::remove_tree(&folder)?;
        layout::clean_dirty(&folder);
        Ok(())
    }
}

/// Copy a file tree, creating destination directories as needed
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest)
        .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", dest.display())))?;

    for entry in walkdir::WalkDir::new(source).min_depth(1) {
        let entry =
            entry.map_err(|e| Error::IoError(format!("Failed to walk {}: {e}", source.display())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::IoError(format!("Bad copy path: {e}")))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| Error::IoError(format!("Failed to create {}: {e}", target.display())))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    Error::IoError(format!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            fs::copy(entry.path(), &target).map_err(|e| {
                Error::IoError(format!(
                    "Failed to copy {} to {}: {e}",
                    entry.path().display(),
                    target.display()
                ))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (tempfile::TempDir, DataCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = DataCache::new(dir.path().join("cache")).unwrap();
        (dir, cache)
    }

    fn seed_recipe(cache: &DataCache, reference: &str) -> RecipeReference {
        let source = tempfile::tempdir().unwrap();
        std::fs::write(
            source.path().join("recipe.json"),
            format!("{{\"name\": \"{}\"}}", reference),
        )
        .unwrap();
        let base = RecipeReference::parse(reference).unwrap();
        cache.export_recipe(source.path(), &base).unwrap()
    }

    #[test]
    fn test_export_pins_revision_to_content() {
        let (_dir, cache) = cache();
        let pinned = seed_recipe(&cache, "zlib/1.0");
        assert!(pinned.revision.is_some());

        let recipe_layout = cache.recipe_layout(&pinned).unwrap();
        assert!(recipe_layout.recipe_file().exists());

        // Identical content resolves to the identical revision
        let again = seed_recipe(&cache, "zlib/1.0");
        assert_eq!(pinned, again);
        assert_eq!(cache.list_recipe_revisions(&pinned).unwrap().len(), 1);
    }

    #[test]
    fn test_latest_recipe_revision() {
        let (_dir, cache) = cache();
        assert!(cache
            .latest_recipe_revision(&RecipeReference::parse("zlib/1.0").unwrap())
            .unwrap()
            .is_none());

        let pinned = seed_recipe(&cache, "zlib/1.0");
        let latest = cache
            .latest_recipe_revision(&pinned.without_revision())
            .unwrap()
            .unwrap();
        assert_eq!(latest, pinned);
    }

    #[test]
    fn test_package_build_and_promotion() {
        let (_dir, cache) = cache();
        let recipe = seed_recipe(&cache, "zlib/1.0");
        let pref = PackageReference::new(recipe, "pkgid1").unwrap();

        let (provisional, pkg_layout, guard) = cache.create_package(&pref).unwrap();
        assert!(layout::is_dirty(&pkg_layout.package()));
        // A dirty provisional row is invisible to readers
        assert!(cache.latest_package_revision(&pref).unwrap().is_none());

        std::fs::write(pkg_layout.package().join("lib.a"), b"binary bits").unwrap();
        let (final_ref, _guard) = cache.promote_package(guard, &provisional).unwrap();

        assert_ne!(final_ref.revision, provisional.revision);
        let folder = cache.package_folder(&final_ref).unwrap();
        assert!(folder.join("lib.a").exists());
        assert!(!layout::is_dirty(&folder));

        let latest = cache.latest_package_revision(&pref).unwrap().unwrap();
        assert_eq!(latest, final_ref);
    }

    #[test]
    fn test_promotion_is_idempotent() {
        let (_dir, cache) = cache();
        let recipe = seed_recipe(&cache, "zlib/1.0");
        let pref = PackageReference::new(recipe, "pkgid1").unwrap();

        let (prov_a, layout_a, guard_a) = cache.create_package(&pref).unwrap();
        std::fs::write(layout_a.package().join("lib.a"), b"same bits").unwrap();
        let (final_a, guard_a) = cache.promote_package(guard_a, &prov_a).unwrap();
        drop(guard_a);

        // A second build of identical content promotes to the same
        // revision and leaves a single row behind
        let (prov_b, layout_b, guard_b) = cache.create_package(&pref).unwrap();
        std::fs::write(layout_b.package().join("lib.a"), b"same bits").unwrap();
        let (final_b, _guard_b) = cache.promote_package(guard_b, &prov_b).unwrap();

        assert_eq!(final_a, final_b);
        assert_eq!(cache.list_package_revisions(&pref).unwrap().len(), 1);
        assert!(!layout_b.package().exists());
    }

    #[test]
    fn test_dirty_row_recovery() {
        let (_dir, cache) = cache();
        let recipe = seed_recipe(&cache, "pkg/1.0");
        let pref = PackageReference::new(recipe, "abc").unwrap();

        let (provisional, pkg_layout, guard) = cache.create_package(&pref).unwrap();
        std::fs::write(pkg_layout.package().join("lib.a"), b"bits").unwrap();
        let (final_ref, guard) = cache.promote_package(guard, &provisional).unwrap();
        drop(guard);

        // Simulate a crash mid-write: dirty bit set on the final folder
        let folder = cache.package_folder(&final_ref).unwrap();
        layout::set_dirty(&folder).unwrap();

        // The reader reports absence and remediation removes the row
        assert!(cache.latest_package_revision(&pref).unwrap().is_none());
        assert!(cache.list_package_revisions(&pref).unwrap().is_empty());
        assert!(!folder.exists());
    }

    #[test]
    fn test_remove_recipe_takes_packages_with_it() {
        let (_dir, cache) = cache();
        let recipe = seed_recipe(&cache, "zlib/1.0");
        let pref = PackageReference::new(recipe.clone(), "pkgid1").unwrap();

        let (provisional, pkg_layout, guard) = cache.create_package(&pref).unwrap();
        std::fs::write(pkg_layout.package().join("lib.a"), b"bits").unwrap();
        let (_final_ref, guard) = cache.promote_package(guard, &provisional).unwrap();
        drop(guard);

        cache.remove_recipe(&recipe).unwrap();
        assert!(cache.recipe_row(&recipe).is_err());
        assert!(cache.latest_package_revision(&pref).unwrap().is_none());
        assert!(cache.list_all(false).unwrap().is_empty());
    }

    #[test]
    fn test_verify_recipe_detects_tampering() {
        let (_dir, cache) = cache();
        let pinned = seed_recipe(&cache, "zlib/1.0");
        cache.verify_recipe(&pinned).unwrap();

        // Tamper with the cached export tree behind the database's back
        let recipe_layout = cache.recipe_layout(&pinned).unwrap();
        std::fs::write(recipe_layout.recipe_file(), b"{\"tampered\": true}").unwrap();

        let err = cache.verify_recipe(&pinned).unwrap_err();
        assert!(matches!(err, Error::CacheCorruption(_)));
    }

    #[test]
    fn test_recipe_versions_filters_identity() {
        let (_dir, cache) = cache();
        seed_recipe(&cache, "lib/1.0");
        seed_recipe(&cache, "lib/1.1");
        seed_recipe(&cache, "lib/2.0@corp/stable");
        seed_recipe(&cache, "other/3.0");

        let sample = RecipeReference::parse("lib/1.0").unwrap();
        let mut versions = cache.recipe_versions(&sample).unwrap();
        versions.sort();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].to_string(), "1.0");
        assert_eq!(versions[1].to_string(), "1.1");
    }
}
