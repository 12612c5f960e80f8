//! Repository versions
//!
//! A version is identified by `(repository, number)`. Only complete versions
//! are visible through [`Repository`](crate::Repository) lookups; the open
//! version under construction is reachable through its
//! [`OpenVersion`](crate::OpenVersion) handle.

use crate::counts::{self, ContentSummary, CountKind};
use crate::error::{Result, VersionError};
use crate::id::{ContentId, RepositoryId, VersionId};
use crate::ledger;
use crate::store::Store;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Stored state of one repository version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRecord {
    pub id: VersionId,
    pub repository_id: RepositoryId,
    pub repository_name: String,
    pub number: u64,
    pub complete: bool,
    pub base_version_id: Option<VersionId>,
    pub created_at: i64,
}

impl fmt::Display for VersionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Repository: {}; Version: {}>", self.repository_name, self.number)
    }
}

const SELECT_VERSION: &str = "SELECT v.id, v.repository_id, r.name, v.number, v.complete, \
     v.base_version_id, v.created_at \
     FROM repository_version v JOIN repository r ON r.id = v.repository_id";

fn row_to_version(row: &Row<'_>) -> rusqlite::Result<VersionRecord> {
    Ok(VersionRecord {
        id: row.get(0)?,
        repository_id: row.get(1)?,
        repository_name: row.get(2)?,
        number: row.get::<_, i64>(3)? as u64,
        complete: row.get(4)?,
        base_version_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

pub(crate) fn load_version(conn: &Connection, id: &VersionId) -> Result<VersionRecord> {
    conn.query_row(&format!("{SELECT_VERSION} WHERE v.id = ?1"), [id], row_to_version)
        .optional()?
        .ok_or_else(|| VersionError::NotFound(format!("repository version {}", id)))
}

pub(crate) fn complete_by_number(
    conn: &Connection,
    repository_id: &RepositoryId,
    number: u64,
) -> Result<Option<VersionRecord>> {
    Ok(conn
        .query_row(
            &format!("{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.number = ?2 AND v.complete = 1"),
            rusqlite::params![repository_id, number as i64],
            row_to_version,
        )
        .optional()?)
}

/// The nearest complete version with a higher number.
pub(crate) fn next_complete(conn: &Connection, version: &VersionRecord) -> Result<Option<VersionRecord>> {
    Ok(conn
        .query_row(
            &format!(
                "{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.complete = 1 AND v.number > ?2 \
                 ORDER BY v.number ASC LIMIT 1"
            ),
            rusqlite::params![version.repository_id, version.number as i64],
            row_to_version,
        )
        .optional()?)
}

/// The nearest complete version with a lower number.
pub(crate) fn previous_complete(conn: &Connection, version: &VersionRecord) -> Result<Option<VersionRecord>> {
    Ok(conn
        .query_row(
            &format!(
                "{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.complete = 1 AND v.number < ?2 \
                 ORDER BY v.number DESC LIMIT 1"
            ),
            rusqlite::params![version.repository_id, version.number as i64],
            row_to_version,
        )
        .optional()?)
}

pub(crate) fn latest_complete(conn: &Connection, repository_id: &RepositoryId) -> Result<Option<VersionRecord>> {
    Ok(conn
        .query_row(
            &format!(
                "{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.complete = 1 \
                 ORDER BY v.number DESC LIMIT 1"
            ),
            [repository_id],
            row_to_version,
        )
        .optional()?)
}

pub(crate) fn complete_versions(conn: &Connection, repository_id: &RepositoryId) -> Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.complete = 1 ORDER BY v.number ASC"
    ))?;
    let versions = stmt
        .query_map([repository_id], row_to_version)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Incomplete versions across all repositories, newest first per repository.
pub(crate) fn incomplete_versions(conn: &Connection) -> Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{SELECT_VERSION} WHERE v.complete = 0 ORDER BY v.repository_id, v.number DESC"
    ))?;
    let versions = stmt
        .query_map([], row_to_version)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

/// Incomplete versions of one repository, newest first.
pub(crate) fn incomplete_versions_of(
    conn: &Connection,
    repository_id: &RepositoryId,
) -> Result<Vec<VersionRecord>> {
    let mut stmt = conn.prepare_cached(&format!(
        "{SELECT_VERSION} WHERE v.repository_id = ?1 AND v.complete = 0 ORDER BY v.number DESC"
    ))?;
    let versions = stmt
        .query_map([repository_id], row_to_version)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(versions)
}

pub(crate) fn insert_version(
    conn: &Connection,
    repository_id: &RepositoryId,
    number: u64,
    base_version_id: Option<&VersionId>,
) -> Result<VersionRecord> {
    let id = VersionId::new();
    conn.execute(
        "INSERT INTO repository_version (id, repository_id, number, complete, base_version_id, created_at) \
         VALUES (?1, ?2, ?3, 0, ?4, ?5)",
        rusqlite::params![id, repository_id, number as i64, base_version_id, crate::store::now()],
    )?;
    load_version(conn, &id)
}

pub(crate) fn mark_complete(conn: &Connection, version: &VersionRecord) -> Result<VersionRecord> {
    conn.execute(
        "UPDATE repository_version SET complete = 1 WHERE id = ?1",
        [&version.id],
    )?;
    load_version(conn, &version.id)
}

/// Handle to a stored repository version.
///
/// Queries always read the current ledger, so results reflect later squashes
/// into this version.
#[derive(Clone)]
pub struct RepositoryVersion {
    pub(crate) store: Arc<Store>,
    pub(crate) record: VersionRecord,
}

impl RepositoryVersion {
    pub(crate) fn new(store: Arc<Store>, record: VersionRecord) -> Self {
        Self { store, record }
    }

    pub fn record(&self) -> &VersionRecord {
        &self.record
    }

    pub fn id(&self) -> &VersionId {
        &self.record.id
    }

    pub fn number(&self) -> u64 {
        self.record.number
    }

    pub fn repository_id(&self) -> &RepositoryId {
        &self.record.repository_id
    }

    pub fn base_version_id(&self) -> Option<&VersionId> {
        self.record.base_version_id.as_ref()
    }

    /// Completion flag as of when this handle was loaded.
    pub fn is_complete(&self) -> bool {
        self.record.complete
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.record.created_at, 0)
            .single()
            .unwrap_or_default()
    }

    /// Content present in this version.
    pub async fn content(&self) -> Result<BTreeSet<ContentId>> {
        self.store.read(|conn| ledger::content_at(conn, &self.record))
    }

    /// Content this version added relative to its predecessor.
    pub async fn added(&self) -> Result<BTreeSet<ContentId>> {
        self.store.read(|conn| ledger::added_at(conn, &self.record))
    }

    /// Content this version removed relative to its predecessor.
    pub async fn removed(&self) -> Result<BTreeSet<ContentId>> {
        self.store.read(|conn| ledger::removed_at(conn, &self.record))
    }

    pub async fn contains(&self, content: &ContentId) -> Result<bool> {
        self.store.read(|conn| ledger::contains(conn, &self.record, content))
    }

    /// The next complete version of the same repository.
    pub async fn next(&self) -> Result<RepositoryVersion> {
        let next = self.store.read(|conn| next_complete(conn, &self.record))?;
        next.map(|record| RepositoryVersion::new(Arc::clone(&self.store), record))
            .ok_or_else(|| VersionError::NotFound(format!("complete version after {}", self.record)))
    }

    /// The previous complete version of the same repository.
    pub async fn previous(&self) -> Result<RepositoryVersion> {
        let previous = self.store.read(|conn| previous_complete(conn, &self.record))?;
        previous
            .map(|record| RepositoryVersion::new(Arc::clone(&self.store), record))
            .ok_or_else(|| VersionError::NotFound(format!("complete version before {}", self.record)))
    }

    /// Content counts of one kind, keyed by content type.
    pub async fn counts(&self, kind: CountKind) -> Result<BTreeMap<String, u64>> {
        self.store.read(|conn| counts::load(conn, &self.record.id, kind))
    }

    pub async fn count_summary(&self) -> Result<ContentSummary> {
        self.store.read(|conn| counts::load_summary(conn, &self.record.id))
    }

    /// Add content to this version. Fails with `ImmutableVersion` once complete.
    pub async fn add_content(&self, content: &[ContentId]) -> Result<usize> {
        let batch = self.store.batch_size();
        self.store
            .write(|tx| ledger::add_content(tx, &self.record, content, batch))
    }

    /// Remove content from this version. Fails with `ImmutableVersion` once complete.
    pub async fn remove_content(&self, content: &[ContentId]) -> Result<usize> {
        let batch = self.store.batch_size();
        self.store
            .write(|tx| ledger::remove_content(tx, &self.record, content, batch))
    }

    /// Reload the stored row, e.g. to observe completion.
    pub async fn refresh(&self) -> Result<RepositoryVersion> {
        let record = self.store.read(|conn| load_version(conn, &self.record.id))?;
        Ok(RepositoryVersion::new(Arc::clone(&self.store), record))
    }
}

impl fmt::Display for RepositoryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

impl fmt::Debug for RepositoryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RepositoryVersion")
            .field("record", &self.record)
            .finish()
    }
}
