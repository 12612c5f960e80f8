//! Open versions
//!
//! [`OpenVersion`] is the only way to mutate a repository's history. It holds
//! the repository's version lock for as long as it lives. It must end in
//! [`OpenVersion::finalize`] or [`OpenVersion::abort`]; a handle dropped any
//! other way aborts the version.

use crate::counts;
use crate::error::{Result, VersionError};
use crate::id::ContentId;
use crate::ledger;
use crate::plugin::RepositoryPlugin;
use crate::repository::RepositoryRecord;
use crate::squash;
use crate::store::Store;
use crate::version::{self, RepositoryVersion, VersionRecord};
use rusqlite::{Connection, OptionalExtension};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

/// A version under construction.
///
/// Derefs to [`RepositoryVersion`] for queries.
pub struct OpenVersion {
    version: RepositoryVersion,
    plugin: Arc<dyn RepositoryPlugin>,
    finished: bool,
    _guard: OwnedMutexGuard<()>,
}

/// Hand out the next version number of a repository.
fn next_number(conn: &Connection, repository: &RepositoryRecord) -> Result<u64> {
    let number: Option<i64> = conn
        .query_row(
            "UPDATE repository SET last_version = last_version + 1 WHERE id = ?1 RETURNING last_version",
            [&repository.id],
            |r| r.get(0),
        )
        .optional()?;
    number
        .map(|n| n as u64)
        .ok_or_else(|| VersionError::NotFound(format!("repository '{}'", repository.name)))
}

/// Make `version` hold exactly the content of `base`.
fn clone_base(conn: &Connection, version: &VersionRecord, base: &VersionRecord, batch_size: usize) -> Result<()> {
    let current = ledger::content_at(conn, version)?;
    let wanted = ledger::content_at(conn, base)?;
    let stale: Vec<ContentId> = current.difference(&wanted).copied().collect();
    let missing: Vec<ContentId> = wanted.difference(&current).copied().collect();
    ledger::remove_content(conn, version, &stale, batch_size)?;
    ledger::add_content(conn, version, &missing, batch_size)?;
    tracing::debug!(
        "{}: cloned from {} ({} removed, {} added)",
        version,
        base,
        stale.len(),
        missing.len()
    );
    Ok(())
}

/// Open a new version of `repository`. Fails with `VersionInProgress` if
/// another version of the repository is open or being deleted.
pub(crate) fn begin(
    store: &Arc<Store>,
    repository: &RepositoryRecord,
    base: Option<&RepositoryVersion>,
) -> Result<OpenVersion> {
    let plugin = store.plugin(&repository.repo_type)?;
    let guard = store
        .repository_lock(&repository.id)
        .try_lock_owned()
        .map_err(|_| VersionError::VersionInProgress(repository.name.clone()))?;

    let base_id = base.map(|b| b.record().id);
    let batch = store.batch_size();
    let record = store.write(|tx| {
        let base = match base_id {
            Some(id) => {
                let base = version::load_version(tx, &id)?;
                if !base.complete {
                    return Err(VersionError::InvalidInput(format!(
                        "base version {} is not complete",
                        base
                    )));
                }
                Some(base)
            }
            None => None,
        };

        // The lock is ours, so any open row of this repository is left over
        // from a handle whose discard failed.
        for stale in version::incomplete_versions_of(tx, &repository.id)? {
            tracing::warn!("Discarding leftover {}", stale);
            squash::delete_incomplete(tx, &stale)?;
        }

        let number = next_number(tx, repository)?;
        let record = version::insert_version(tx, &repository.id, number, base_id.as_ref())?;
        tx.execute(
            "INSERT INTO created_resource (object_id, created_at) VALUES (?1, ?2)",
            rusqlite::params![record.id, crate::store::now()],
        )?;
        if let Some(base) = &base {
            clone_base(tx, &record, base, batch)?;
        }
        Ok(record)
    })?;
    tracing::info!("Opened {}", record);

    Ok(OpenVersion {
        version: RepositoryVersion::new(Arc::clone(store), record),
        plugin,
        finished: false,
        _guard: guard,
    })
}

impl OpenVersion {
    /// Add content. Content already present is skipped.
    pub async fn add_content(&mut self, content: &[ContentId]) -> Result<usize> {
        self.version.add_content(content).await
    }

    /// Remove content. Content not present is skipped.
    pub async fn remove_content(&mut self, content: &[ContentId]) -> Result<usize> {
        self.version.remove_content(content).await
    }

    /// Run the plugin's finalize hook and complete the version.
    ///
    /// Returns `None` when the version ended up identical to its predecessor;
    /// it is discarded and its number handed back. Fails with `NotFound` if
    /// the version row is gone.
    pub async fn finalize(mut self) -> Result<Option<RepositoryVersion>> {
        let plugin = Arc::clone(&self.plugin);
        if let Err(source) = plugin.finalize_new_version(&mut self).await {
            tracing::warn!("Finalize hook rejected {}: {:#}", self.version, source);
            let version = self.version.to_string();
            self.discard_logged();
            return Err(VersionError::FinalizeRejected { version, source });
        }

        let record = self.version.record.clone();
        let outcome = self.version.store.write(|tx| {
            ledger::ensure_mutable(tx, &record)?;
            if !ledger::has_changes(tx, &record)? {
                squash::delete_incomplete(tx, &record)?;
                return Ok(None);
            }
            let complete = version::mark_complete(tx, &record)?;
            counts::recompute(tx, &complete)?;
            tx.execute("DELETE FROM created_resource WHERE object_id = ?1", [&complete.id])?;
            Ok(Some(complete))
        });

        match outcome {
            Ok(Some(complete)) => {
                self.finished = true;
                tracing::info!("Completed {}", complete);
                Ok(Some(RepositoryVersion::new(Arc::clone(&self.version.store), complete)))
            }
            Ok(None) => {
                self.finished = true;
                tracing::debug!("{} has no changes, discarded", record);
                Ok(None)
            }
            Err(err) if err.is_not_found() => {
                // nothing left to discard
                self.finished = true;
                tracing::error!("{} vanished before it could be completed", record);
                Err(err)
            }
            Err(err) => {
                tracing::warn!("Completing {} failed: {}", record, err);
                self.discard_logged();
                Err(err)
            }
        }
    }

    /// Discard the version and everything it recorded.
    pub async fn abort(mut self) -> Result<()> {
        tracing::info!("Aborting {}", self.version);
        self.discard()
    }

    fn discard(&mut self) -> Result<()> {
        // A failed discard leaves the row; the next begin on this repository
        // or the next open removes it.
        self.finished = true;
        let record = &self.version.record;
        self.version.store.write(|tx| squash::delete_incomplete(tx, record))
    }

    fn discard_logged(&mut self) {
        if let Err(err) = self.discard() {
            tracing::error!("Failed to discard {}: {}", self.version, err);
        }
    }
}

impl Deref for OpenVersion {
    type Target = RepositoryVersion;

    fn deref(&self) -> &RepositoryVersion {
        &self.version
    }
}

impl Drop for OpenVersion {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::warn!("{} dropped while open, aborting", self.version);
        self.discard_logged();
    }
}

impl fmt::Debug for OpenVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenVersion")
            .field("record", &self.version.record)
            .field("finished", &self.finished)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::CORE_REPOSITORY_TYPE;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_second_open_version_is_rejected() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("busy", CORE_REPOSITORY_TYPE, None).await.unwrap();

        let open = repo.begin_version(None).await.unwrap();
        let err = repo.begin_version(None).await.unwrap_err();
        assert!(matches!(err, VersionError::VersionInProgress(ref name) if name == "busy"));
        open.abort().await.unwrap();

        let again = repo.begin_version(None).await.unwrap();
        assert_eq!(again.number(), 1);
        again.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_created_resource_marker() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("marked", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let unit = store.register_content("file.file").await.unwrap();

        let mut open = repo.begin_version(None).await.unwrap();
        assert_eq!(store.created_resources().await.unwrap(), vec![*open.id()]);
        open.add_content(&[unit]).await.unwrap();
        open.finalize().await.unwrap().unwrap();
        assert!(store.created_resources().await.unwrap().is_empty());

        let open = repo.begin_version(None).await.unwrap();
        open.abort().await.unwrap();
        assert!(store.created_resources().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_noop_finalize_reclaims_number() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("noop", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let unit = store.register_content("file.file").await.unwrap();

        let mut open = repo.begin_version(None).await.unwrap();
        open.add_content(&[unit]).await.unwrap();
        open.remove_content(&[unit]).await.unwrap();
        assert!(open.finalize().await.unwrap().is_none());
        assert_eq!(repo.last_version_number().await.unwrap(), 0);
        assert_eq!(repo.latest_version().await.unwrap().unwrap().number(), 0);
    }

    #[tokio::test]
    async fn test_drop_aborts() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("dropped", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let unit = store.register_content("file.file").await.unwrap();

        {
            let mut open = repo.begin_version(None).await.unwrap();
            open.add_content(&[unit]).await.unwrap();
        }

        assert_eq!(repo.last_version_number().await.unwrap(), 0);
        let mut open = repo.begin_version(None).await.unwrap();
        assert_eq!(open.number(), 1);
        assert_eq!(open.content().await.unwrap(), BTreeSet::new());
        open.add_content(&[unit]).await.unwrap();
        assert_eq!(open.finalize().await.unwrap().unwrap().number(), 1);
    }

    #[tokio::test]
    async fn test_finalize_fails_when_row_is_gone() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("vanished", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let unit = store.register_content("file.file").await.unwrap();

        let mut open = repo.begin_version(None).await.unwrap();
        open.add_content(&[unit]).await.unwrap();
        let record = open.record().clone();
        store.write(|tx| squash::delete_incomplete(tx, &record)).unwrap();

        let err = open.finalize().await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(repo.versions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_next_begin_clears_leftover_version() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("leftover", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let units = store.register_contents("file.file", 2).await.unwrap();
        let mut v1 = repo.begin_version(None).await.unwrap();
        v1.add_content(&units[..1]).await.unwrap();
        v1.finalize().await.unwrap().unwrap();

        // as if the discard had failed: the lock is released, the row stays
        let mut open = repo.begin_version(None).await.unwrap();
        open.remove_content(&units[..1]).await.unwrap();
        open.add_content(&units[1..]).await.unwrap();
        open.finished = true;
        drop(open);

        let next = repo.begin_version(None).await.unwrap();
        assert_eq!(next.number(), 2);
        assert_eq!(next.content().await.unwrap(), BTreeSet::from([units[0]]));
        assert_eq!(store.created_resources().await.unwrap(), vec![*next.id()]);
        next.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_discards_version_of_dead_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let unit;
        {
            let store = Store::open(tmp.path()).unwrap();
            let repo = store.create_repository("durable", CORE_REPOSITORY_TYPE, None).await.unwrap();
            unit = store.register_content("file.file").await.unwrap();
            let mut v1 = repo.begin_version(None).await.unwrap();
            v1.add_content(&[unit]).await.unwrap();
            v1.finalize().await.unwrap().unwrap();

            // crash: the handle goes away without aborting
            let mut open = repo.begin_version(None).await.unwrap();
            open.remove_content(&[unit]).await.unwrap();
            open.finished = true;
        }

        let store = Store::open(tmp.path()).unwrap();
        assert!(store.created_resources().await.unwrap().is_empty());
        let repo = store.repository("durable").await.unwrap();
        assert_eq!(repo.last_version_number().await.unwrap(), 1);
        let latest = repo.latest_version().await.unwrap().unwrap();
        assert_eq!(latest.number(), 1);
        assert_eq!(latest.content().await.unwrap(), BTreeSet::from([unit]));
    }

    #[tokio::test]
    async fn test_refresh_observes_completion() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("refreshed", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let unit = store.register_content("file.file").await.unwrap();

        let mut open = repo.begin_version(None).await.unwrap();
        open.add_content(&[unit]).await.unwrap();
        let snapshot = RepositoryVersion::clone(&open);
        assert!(!snapshot.is_complete());
        open.finalize().await.unwrap().unwrap();

        assert!(!snapshot.is_complete());
        let reloaded = snapshot.refresh().await.unwrap();
        assert!(reloaded.is_complete());
        assert_eq!(reloaded.number(), 1);
    }

    #[tokio::test]
    async fn test_base_must_be_complete() {
        let store = Store::open_in_memory().unwrap();
        let a = store.create_repository("a", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let b = store.create_repository("b", CORE_REPOSITORY_TYPE, None).await.unwrap();

        let open_a = a.begin_version(None).await.unwrap();
        let err = b.begin_version(Some(&*open_a)).await.unwrap_err();
        assert!(matches!(err, VersionError::InvalidInput(_)));
        // the failed begin handed nothing out
        assert_eq!(b.last_version_number().await.unwrap(), 0);
        open_a.abort().await.unwrap();
    }
}
