//! Repositories
//!
//! A repository owns a numbered sequence of versions and a monotonically
//! increasing counter (`last_version`) from which new version numbers are
//! handed out. Version 0 is created together with the repository.

use crate::counts;
use crate::error::{Result, VersionError};
use crate::id::{ContentId, RepositoryId};
use crate::ledger;
use crate::lifecycle::{self, OpenVersion};
use crate::plugin::RepositoryPlugin;
use crate::selection::ContentSelection;
use crate::squash;
use crate::store::Store;
use crate::version::{self, RepositoryVersion};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Stored state of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryRecord {
    pub id: RepositoryId,
    pub name: String,
    pub description: Option<String>,
    pub repo_type: String,
    /// Highest version number handed out so far.
    pub last_version: u64,
    pub created_at: i64,
}

const SELECT_REPOSITORY: &str =
    "SELECT id, name, description, repo_type, last_version, created_at FROM repository";

fn row_to_repository(row: &Row<'_>) -> rusqlite::Result<RepositoryRecord> {
    Ok(RepositoryRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        repo_type: row.get(3)?,
        last_version: row.get::<_, i64>(4)? as u64,
        created_at: row.get(5)?,
    })
}

fn load_by_id(conn: &Connection, id: &RepositoryId) -> Result<RepositoryRecord> {
    conn.query_row(&format!("{SELECT_REPOSITORY} WHERE id = ?1"), [id], row_to_repository)
        .optional()?
        .ok_or_else(|| VersionError::NotFound(format!("repository {}", id)))
}

pub(crate) fn load_by_name(conn: &Connection, name: &str) -> Result<RepositoryRecord> {
    conn.query_row(&format!("{SELECT_REPOSITORY} WHERE name = ?1"), [name], row_to_repository)
        .optional()?
        .ok_or_else(|| VersionError::NotFound(format!("repository '{}'", name)))
}

pub(crate) fn list(conn: &Connection) -> Result<Vec<RepositoryRecord>> {
    let mut stmt = conn.prepare_cached(&format!("{SELECT_REPOSITORY} ORDER BY name"))?;
    let records = stmt
        .query_map([], row_to_repository)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(records)
}

/// Insert a repository and its complete version 0, seeded by the plugin.
pub(crate) fn insert_repository(
    conn: &Connection,
    name: &str,
    description: Option<&str>,
    plugin: &dyn RepositoryPlugin,
    batch_size: usize,
) -> Result<RepositoryRecord> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM repository WHERE name = ?1", [name], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Err(VersionError::InvalidInput(format!("Repository '{}' already exists", name)));
    }

    let id = RepositoryId::new();
    conn.execute(
        "INSERT INTO repository (id, name, description, repo_type, last_version, created_at) \
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        rusqlite::params![id, name, description, plugin.repository_type(), crate::store::now()],
    )?;
    let record = load_by_id(conn, &id)?;

    let initial = version::insert_version(conn, &id, 0, None)?;
    let seed = plugin
        .initial_content(&record)
        .map_err(|source| VersionError::FinalizeRejected {
            version: initial.to_string(),
            source,
        })?;
    if !seed.is_empty() {
        let added = ledger::add_content(conn, &initial, &seed, batch_size)?;
        tracing::debug!("{}: seeded with {} unit(s)", initial, added);
    }
    let initial = version::mark_complete(conn, &initial)?;
    counts::recompute(conn, &initial)?;
    Ok(record)
}

/// Handle to a stored repository.
#[derive(Clone)]
pub struct Repository {
    store: Arc<Store>,
    record: RepositoryRecord,
}

impl Repository {
    pub(crate) fn new(store: Arc<Store>, record: RepositoryRecord) -> Self {
        Self { store, record }
    }

    pub fn id(&self) -> &RepositoryId {
        &self.record.id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn description(&self) -> Option<&str> {
        self.record.description.as_deref()
    }

    pub fn repo_type(&self) -> &str {
        &self.record.repo_type
    }

    /// Record as loaded; `last_version` may be stale, see [`Self::last_version_number`].
    pub fn record(&self) -> &RepositoryRecord {
        &self.record
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.record.created_at, 0)
            .single()
            .unwrap_or_default()
    }

    /// Current value of the version counter.
    pub async fn last_version_number(&self) -> Result<u64> {
        let record = self.store.read(|conn| load_by_id(conn, &self.record.id))?;
        Ok(record.last_version)
    }

    /// Open a new version, optionally starting from the content of `base`
    /// (which may belong to another repository).
    ///
    /// Without a base the new version starts with the content of the latest
    /// complete version.
    pub async fn begin_version(&self, base: Option<&RepositoryVersion>) -> Result<OpenVersion> {
        lifecycle::begin(&self.store, &self.record, base)
    }

    /// The highest numbered complete version.
    pub async fn latest_version(&self) -> Result<Option<RepositoryVersion>> {
        let latest = self
            .store
            .read(|conn| version::latest_complete(conn, &self.record.id))?;
        Ok(latest.map(|record| RepositoryVersion::new(Arc::clone(&self.store), record)))
    }

    /// The complete version with the given number.
    pub async fn version(&self, number: u64) -> Result<RepositoryVersion> {
        let record = self
            .store
            .read(|conn| version::complete_by_number(conn, &self.record.id, number))?
            .ok_or_else(|| {
                VersionError::NotFound(format!("version {} of repository '{}'", number, self.record.name))
            })?;
        Ok(RepositoryVersion::new(Arc::clone(&self.store), record))
    }

    /// All complete versions, oldest first.
    pub async fn versions(&self) -> Result<Vec<RepositoryVersion>> {
        let records = self
            .store
            .read(|conn| version::complete_versions(conn, &self.record.id))?;
        Ok(records
            .into_iter()
            .map(|record| RepositoryVersion::new(Arc::clone(&self.store), record))
            .collect())
    }

    /// Delete a version without changing the content of any other version.
    ///
    /// Fails with `VersionInProgress` while a version of this repository is open.
    pub async fn delete_version(&self, version: &RepositoryVersion) -> Result<()> {
        if version.repository_id() != self.id() {
            return Err(VersionError::InvalidInput(format!(
                "{} does not belong to repository '{}'",
                version, self.record.name
            )));
        }
        let _guard = self
            .store
            .repository_lock(&self.record.id)
            .try_lock_owned()
            .map_err(|_| VersionError::VersionInProgress(self.record.name.clone()))?;
        self.store
            .write(|tx| squash::delete_version(tx, version.record()))
    }

    /// Create a version from `base` (or the latest version) with `remove`
    /// taken out and `add` put in.
    ///
    /// Returns `None` if that changes nothing.
    pub async fn modify(
        &self,
        base: Option<&RepositoryVersion>,
        add: &[ContentId],
        remove: &ContentSelection,
    ) -> Result<Option<RepositoryVersion>> {
        let mut open = self.begin_version(base).await?;
        let removed = remove.resolve(&open).await?;
        open.remove_content(&removed).await?;
        open.add_content(add).await?;
        open.finalize().await
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Repository: {}>", self.record.name)
    }
}

impl fmt::Debug for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("record", &self.record)
            .finish()
    }
}
