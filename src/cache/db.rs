// src/cache/db.rs

//! The cache database: one table indexing references to on-disk folders
//!
//! Schema (`conan_references`): `(reference, rrev, pkgid, prev, path,
//! timestamp, remote)`, unique on the reference 4-tuple with SQL NULL
//! distinctness, and globally unique `path`. Recipe rows have NULL
//! `pkgid`/`prev`; package rows carry both (a provisional package row
//! carries a placeholder `prev` until promotion).
//!
//! All mutations run inside a transaction; reads may be direct. Lookups
//! are NULL-aware (`IS` comparison) so a recipe row never answers a
//! package query and vice versa.

use crate::error::{Error, Result};
use crate::reference::CacheReference;
use chrono::Utc;
use rusqlite::{params, Connection, Transaction};
use std::path::Path;
use tracing::debug;

/// Database file name inside the cache root
pub const DB_FILE: &str = ".conan.db";

const CREATE_TABLE: &str = "
    CREATE TABLE IF NOT EXISTS conan_references (
        reference TEXT NOT NULL,
        rrev TEXT NOT NULL,
        pkgid TEXT,
        prev TEXT,
        path TEXT NOT NULL UNIQUE,
        timestamp REAL NOT NULL,
        remote TEXT,
        UNIQUE(reference, rrev, pkgid, prev)
    );
";

/// One row of the references table
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub reference: String,
    pub rrev: String,
    pub pkgid: Option<String>,
    pub prev: Option<String>,
    pub path: String,
    pub timestamp: f64,
    pub remote: Option<String>,
}

impl Row {
    /// The row's reference key
    pub fn cache_reference(&self) -> CacheReference {
        CacheReference {
            reference: self.reference.clone(),
            rrev: self.rrev.clone(),
            pkgid: self.pkgid.clone(),
            prev: self.prev.clone(),
        }
    }
}

fn row_from_sql(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok(Row {
        reference: row.get(0)?,
        rrev: row.get(1)?,
        pkgid: row.get(2)?,
        prev: row.get(3)?,
        path: row.get(4)?,
        timestamp: row.get(5)?,
        remote: row.get(6)?,
    })
}

/// Wall-clock timestamp for insert/update, seconds with sub-second precision
fn now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(())
}

/// Initialize the database, creating parent directories and the schema
pub fn init(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            Error::IoError(format!(
                "Failed to create directory {}: {e}",
                parent.display()
            ))
        })?;
    }

    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    conn.execute_batch(CREATE_TABLE)?;
    debug!("initialized cache database at {}", path.display());
    Ok(conn)
}

/// Open an existing database
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    apply_pragmas(&conn)?;
    Ok(conn)
}

/// Run a closure inside a transaction, committing on success and rolling
/// back on error.
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let tx = conn.transaction()?;
    let result = f(&tx)?;
    tx.commit()?;
    Ok(result)
}

/// Insert a row; fails with `AlreadyExists` on a unique-key violation
pub fn insert(
    conn: &Connection,
    key: &CacheReference,
    path: &str,
    remote: Option<&str>,
) -> Result<i64> {
    let result = conn.execute(
        "INSERT INTO conan_references (reference, rrev, pkgid, prev, path, timestamp, remote)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![key.reference, key.rrev, key.pkgid, key.prev, path, now(), remote],
    );

    match result {
        Ok(_) => Ok(conn.last_insert_rowid()),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Err(Error::AlreadyExists(key.full_reference()))
        }
        Err(e) => Err(e.into()),
    }
}

/// Exact-match lookup (NULLs matter); fails with `DoesNotExist`
pub fn get(conn: &Connection, key: &CacheReference) -> Result<Row> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE reference = ?1 AND rrev = ?2 AND pkgid IS ?3 AND prev IS ?4",
    )?;
    let mut rows = stmt.query_map(params![key.reference, key.rrev, key.pkgid, key.prev], row_from_sql)?;

    match rows.next() {
        Some(row) => Ok(row?),
        None => Err(Error::DoesNotExist(key.full_reference())),
    }
}

/// The recipe row with the greatest timestamp for a base reference
/// (equal timestamps break toward the lexicographically greatest rrev)
pub fn latest_recipe_revision(conn: &Connection, reference: &str) -> Result<Option<Row>> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE reference = ?1 AND pkgid IS NULL AND prev IS NULL
         ORDER BY timestamp DESC, rrev DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![reference], row_from_sql)?;
    rows.next().transpose().map_err(Into::into)
}

/// The package row with the greatest timestamp for a rrev + pkgid
/// (equal timestamps break toward the lexicographically greatest prev)
pub fn latest_package_revision(
    conn: &Connection,
    reference: &str,
    rrev: &str,
    pkgid: &str,
) -> Result<Option<Row>> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE reference = ?1 AND rrev = ?2 AND pkgid = ?3 AND prev IS NOT NULL
         ORDER BY timestamp DESC, prev DESC
         LIMIT 1",
    )?;
    let mut rows = stmt.query_map(params![reference, rrev, pkgid], row_from_sql)?;
    rows.next().transpose().map_err(Into::into)
}

/// All recipe revisions of a base reference, newest first
pub fn recipe_revisions(conn: &Connection, reference: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE reference = ?1 AND pkgid IS NULL AND prev IS NULL
         ORDER BY timestamp DESC, rrev DESC",
    )?;
    let rows = stmt.query_map(params![reference], row_from_sql)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// The package ids built for a recipe revision (latest revision per id)
pub fn package_ids(conn: &Connection, reference: &str, rrev: &str) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, MAX(timestamp), remote
         FROM conan_references
         WHERE reference = ?1 AND rrev = ?2 AND pkgid IS NOT NULL AND prev IS NOT NULL
         GROUP BY pkgid
         ORDER BY pkgid",
    )?;
    let rows = stmt.query_map(params![reference, rrev], row_from_sql)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// All revisions of one package id, newest first
pub fn package_revisions(
    conn: &Connection,
    reference: &str,
    rrev: &str,
    pkgid: &str,
) -> Result<Vec<Row>> {
    let mut stmt = conn.prepare(
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE reference = ?1 AND rrev = ?2 AND pkgid = ?3 AND prev IS NOT NULL
         ORDER BY timestamp DESC, prev DESC",
    )?;
    let rows = stmt.query_map(params![reference, rrev, pkgid], row_from_sql)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}

/// Distinct base references of recipe rows whose name matches
pub fn recipe_references(conn: &Connection, name: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT reference FROM conan_references
         WHERE pkgid IS NULL AND prev IS NULL
         ORDER BY reference",
    )?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let prefix = format!("{}/", name);
    let mut out = Vec::new();
    for reference in rows {
        let reference = reference?;
        if reference.starts_with(&prefix) {
            out.push(reference);
        }
    }
    Ok(out)
}

/// Rewrite a row's key, path and/or remote atomically, refreshing its
/// timestamp. Fails with `DoesNotExist` when the old key matches nothing.
pub fn update(
    conn: &Connection,
    old: &CacheReference,
    new: Option<&CacheReference>,
    new_path: Option<&str>,
    new_remote: Option<&str>,
) -> Result<()> {
    let new = new.unwrap_or(old);
    let changed = conn.execute(
        "UPDATE conan_references
         SET reference = ?1, rrev = ?2, pkgid = ?3, prev = ?4,
             path = COALESCE(?5, path), timestamp = ?6, remote = COALESCE(?7, remote)
         WHERE reference = ?8 AND rrev = ?9 AND pkgid IS ?10 AND prev IS ?11",
        params![
            new.reference,
            new.rrev,
            new.pkgid,
            new.prev,
            new_path,
            now(),
            new_remote,
            old.reference,
            old.rrev,
            old.pkgid,
            old.prev
        ],
    )?;

    if changed == 0 {
        return Err(Error::DoesNotExist(old.full_reference()));
    }
    Ok(())
}

/// Delete the row owning a path; returns the number of rows removed
pub fn delete_by_path(conn: &Connection, path: &str) -> Result<usize> {
    conn.execute("DELETE FROM conan_references WHERE path = ?1", params![path])
        .map_err(Into::into)
}

/// Delete a row by exact key; returns the number of rows removed
pub fn remove(conn: &Connection, key: &CacheReference) -> Result<usize> {
    conn.execute(
        "DELETE FROM conan_references
         WHERE reference = ?1 AND rrev = ?2 AND pkgid IS ?3 AND prev IS ?4",
        params![key.reference, key.rrev, key.pkgid, key.prev],
    )
    .map_err(Into::into)
}

/// Delete the recipe row and every package row of one recipe revision
pub fn remove_revision_rows(conn: &Connection, reference: &str, rrev: &str) -> Result<usize> {
    conn.execute(
        "DELETE FROM conan_references WHERE reference = ?1 AND rrev = ?2",
        params![reference, rrev],
    )
    .map_err(Into::into)
}

/// Forget an origin remote on every row that references it
pub fn clear_remote(conn: &Connection, remote: &str) -> Result<usize> {
    conn.execute(
        "UPDATE conan_references SET remote = NULL WHERE remote = ?1",
        params![remote],
    )
    .map_err(Into::into)
}

/// All recipe rows, optionally collapsed to the latest revision per
/// reference, oldest first (listing order)
pub fn all(conn: &Connection, only_latest_rrev: bool) -> Result<Vec<Row>> {
    let sql = if only_latest_rrev {
        "SELECT reference, rrev, pkgid, prev, path, MAX(timestamp), remote
         FROM conan_references
         WHERE pkgid IS NULL AND prev IS NULL
         GROUP BY reference
         ORDER BY MAX(timestamp) ASC"
    } else {
        "SELECT reference, rrev, pkgid, prev, path, timestamp, remote
         FROM conan_references
         WHERE pkgid IS NULL AND prev IS NULL
         ORDER BY timestamp ASC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], row_from_sql)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
}
