//! SQLite-backed store for repositories, versions and the membership ledger
//!
//! A single connection sits behind a mutex. Every write goes through
//! [`Store::write`], which runs the closure inside a `BEGIN IMMEDIATE`
//! transaction so partial ledger updates are never visible. Version creation
//! and deletion are additionally serialized per repository with an async lock
//! (see [`Repository::begin_version`]).

use crate::config::StoreConfig;
use crate::error::{Result, VersionError};
use crate::id::{ContentId, RepositoryId, VersionId};
use crate::plugin::{PluginRegistry, RepositoryPlugin};
use crate::remote::{self, Remote};
use crate::repository::{self, Repository};
use crate::squash;
use crate::version;
use fs2::FileExt;
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const DB_FILE: &str = "versions.sqlite";
const LOCK_FILE: &str = "store.lock";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS repository (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    repo_type TEXT NOT NULL,
    last_version INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS repository_version (
    id TEXT PRIMARY KEY,
    repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
    number INTEGER NOT NULL,
    complete INTEGER NOT NULL DEFAULT 0,
    base_version_id TEXT REFERENCES repository_version(id) ON DELETE SET NULL,
    created_at INTEGER NOT NULL,
    UNIQUE (repository_id, number)
);
CREATE INDEX IF NOT EXISTS repository_version_complete ON repository_version(complete);
CREATE TABLE IF NOT EXISTS content (
    id TEXT PRIMARY KEY,
    content_type TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS membership (
    id INTEGER PRIMARY KEY,
    repository_id TEXT NOT NULL REFERENCES repository(id) ON DELETE CASCADE,
    content_id TEXT NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    version_added_id TEXT NOT NULL REFERENCES repository_version(id) ON DELETE CASCADE,
    version_removed_id TEXT REFERENCES repository_version(id) ON DELETE CASCADE,
    UNIQUE (repository_id, content_id, version_added_id),
    UNIQUE (repository_id, content_id, version_removed_id)
);
CREATE INDEX IF NOT EXISTS membership_added ON membership(version_added_id);
CREATE INDEX IF NOT EXISTS membership_removed ON membership(version_removed_id);
CREATE INDEX IF NOT EXISTS membership_active ON membership(repository_id, content_id)
    WHERE version_removed_id IS NULL;
CREATE TABLE IF NOT EXISTS content_count (
    version_id TEXT NOT NULL REFERENCES repository_version(id) ON DELETE CASCADE,
    content_type TEXT NOT NULL,
    kind TEXT NOT NULL,
    count INTEGER NOT NULL,
    PRIMARY KEY (version_id, content_type, kind)
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS created_resource (
    object_id TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
) WITHOUT ROWID;
CREATE TABLE IF NOT EXISTS remote (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    remote_type TEXT NOT NULL,
    url TEXT NOT NULL,
    tls_validation INTEGER NOT NULL DEFAULT 1,
    proxy_url TEXT,
    username TEXT,
    password TEXT,
    download_concurrency INTEGER NOT NULL DEFAULT 20,
    policy TEXT NOT NULL
);
";

pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn configure(conn: &Connection, config: &StoreConfig, on_disk: bool) -> Result<()> {
    if on_disk {
        let mode: String = conn.pragma_update_and_check(
            None,
            "journal_mode",
            config.journal_mode.as_str(),
            |row| row.get(0),
        )?;
        tracing::debug!("SQLite journal_mode={}", mode);
    }
    conn.pragma_update(None, "synchronous", config.synchronous.as_str())?;
    conn.pragma_update(None, "cache_size", format!("-{}", config.cache_size_kib))?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

/// Take the exclusive lock of a store root without waiting.
fn lock_root(root: &Path) -> Result<File> {
    let lock_path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)?;
    if file.try_lock_exclusive().is_err() {
        tracing::warn!("Store root {:?} is locked by another store", root);
        return Err(VersionError::StoreLocked(root.to_path_buf()));
    }
    Ok(file)
}

/// Relational store holding every repository, version and ledger record.
pub struct Store {
    root: Option<PathBuf>,
    /// Exclusive lock on `<root>/store.lock`, released when the store drops
    /// or the process dies.
    _root_lock: Option<File>,
    config: StoreConfig,
    conn: Mutex<Connection>,
    locks: Mutex<HashMap<RepositoryId, Arc<tokio::sync::Mutex<()>>>>,
    plugins: PluginRegistry,
}

impl Store {
    /// Open (or create) a store rooted at `path`.
    ///
    /// Loads `store-config.json` if present and discards any version that a
    /// previous process left open. Only one `Store` may have a root open at a
    /// time; a second open fails with `StoreLocked`.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        fs::create_dir_all(path)?;
        let root_lock = lock_root(path)?;
        let config = StoreConfig::load(path)?;
        let db_path = path.join(DB_FILE);
        let conn = Connection::open(&db_path)?;
        configure(&conn, &config, true)?;
        tracing::info!("Opened version store at {:?}", db_path);
        Self::from_connection(Some(path.to_path_buf()), Some(root_lock), config, conn)
    }

    /// Open a private in-memory store with default configuration.
    pub fn open_in_memory() -> Result<Arc<Self>> {
        Self::open_in_memory_with(StoreConfig::default())
    }

    pub fn open_in_memory_with(config: StoreConfig) -> Result<Arc<Self>> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, &config, false)?;
        Self::from_connection(None, None, config, conn)
    }

    fn from_connection(
        root: Option<PathBuf>,
        root_lock: Option<File>,
        config: StoreConfig,
        conn: Connection,
    ) -> Result<Arc<Self>> {
        let store = Self {
            root,
            _root_lock: root_lock,
            config,
            conn: Mutex::new(conn),
            locks: Mutex::new(HashMap::new()),
            plugins: PluginRegistry::new(),
        };
        let recovered = store.recover_incomplete_versions()?;
        if recovered > 0 {
            tracing::warn!("Discarded {} incomplete version(s) left by a previous run", recovered);
        }
        Ok(Arc::new(store))
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub(crate) fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run read-only queries against the connection.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction; commit on `Ok`, roll back on `Err`.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// The lock serializing version creation and deletion for one repository.
    pub(crate) fn repository_lock(&self, id: &RepositoryId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(*id).or_default().clone()
    }

    // ==================== Plugins ====================

    /// Register the implementation for a repository type, replacing any
    /// previous registration for the same type.
    pub fn register_plugin(&self, plugin: Arc<dyn RepositoryPlugin>) {
        self.plugins.register(plugin);
    }

    pub(crate) fn plugin(&self, repo_type: &str) -> Result<Arc<dyn RepositoryPlugin>> {
        self.plugins.get(repo_type)
    }

    // ==================== Content registry ====================

    /// Register a single content unit of the given type.
    pub async fn register_content(&self, content_type: &str) -> Result<ContentId> {
        let mut ids = self.register_contents(content_type, 1).await?;
        ids.pop()
            .ok_or_else(|| VersionError::InvalidInput("no content registered".into()))
    }

    /// Register `count` content units of the given type in one transaction.
    pub async fn register_contents(&self, content_type: &str, count: usize) -> Result<Vec<ContentId>> {
        if content_type.trim().is_empty() {
            return Err(VersionError::InvalidInput("content type cannot be empty".into()));
        }
        let ids: Vec<ContentId> = (0..count).map(|_| ContentId::new()).collect();
        self.write(|tx| {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO content (id, content_type, created_at) VALUES (?1, ?2, ?3)",
            )?;
            let created_at = now();
            for id in &ids {
                stmt.execute(rusqlite::params![id, content_type, created_at])?;
            }
            Ok(())
        })?;
        Ok(ids)
    }

    pub async fn content_type(&self, id: &ContentId) -> Result<String> {
        self.read(|conn| {
            conn.query_row(
                "SELECT content_type FROM content WHERE id = ?1",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or(VersionError::UnknownContent(*id))
        })
    }

    // ==================== Repositories ====================

    /// Create a repository of `repo_type` together with its initial version 0.
    pub async fn create_repository(
        self: &Arc<Self>,
        name: &str,
        repo_type: &str,
        description: Option<&str>,
    ) -> Result<Repository> {
        let name = name.trim();
        if name.is_empty() {
            return Err(VersionError::InvalidInput("Repository name cannot be empty".into()));
        }
        let plugin = self.plugin(repo_type)?;
        let batch = self.batch_size();
        let record = self.write(|tx| {
            repository::insert_repository(tx, name, description, plugin.as_ref(), batch)
        })?;
        tracing::info!("Created repository '{}' ({})", record.name, record.repo_type);
        Ok(Repository::new(Arc::clone(self), record))
    }

    pub async fn repository(self: &Arc<Self>, name: &str) -> Result<Repository> {
        let record = self.read(|conn| repository::load_by_name(conn, name))?;
        Ok(Repository::new(Arc::clone(self), record))
    }

    /// All repositories ordered by name.
    pub async fn repositories(self: &Arc<Self>) -> Result<Vec<Repository>> {
        let records = self.read(repository::list)?;
        Ok(records
            .into_iter()
            .map(|record| Repository::new(Arc::clone(self), record))
            .collect())
    }

    // ==================== Remotes ====================

    pub async fn create_remote(&self, remote: &Remote) -> Result<()> {
        self.plugin(&remote.remote_type)?;
        self.write(|tx| remote::insert_remote(tx, remote))
    }

    pub async fn remote(&self, name: &str) -> Result<Remote> {
        self.read(|conn| remote::load_remote(conn, name))
    }

    /// Ask the plugin owning `remote`'s type which content type lives at `relative_path`.
    pub fn remote_artifact_content_type(&self, remote: &Remote, relative_path: &str) -> Result<String> {
        let plugin = self.plugin(&remote.remote_type)?;
        plugin
            .remote_artifact_content_type(remote, relative_path)
            .ok_or_else(|| {
                VersionError::Unsupported(format!(
                    "remote type '{}' cannot resolve a content type for '{}'",
                    remote.remote_type, relative_path
                ))
            })
    }

    // ==================== Maintenance ====================

    /// Object ids that still carry a created-resource marker.
    pub async fn created_resources(&self) -> Result<Vec<VersionId>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT object_id FROM created_resource ORDER BY created_at")?;
            let ids = stmt
                .query_map([], |r| r.get(0))?
                .collect::<rusqlite::Result<Vec<VersionId>>>()?;
            Ok(ids)
        })
    }

    /// Discard every version still marked incomplete. Run at open time while
    /// holding the root lock, before any handle can exist, so every such row
    /// belongs to a dead process.
    fn recover_incomplete_versions(&self) -> Result<usize> {
        let stale = self.read(version::incomplete_versions)?;
        for record in &stale {
            tracing::warn!("Discarding stale incomplete {}", record);
            self.write(|tx| squash::delete_incomplete(tx, record))?;
        }
        Ok(stale.len())
    }
}
