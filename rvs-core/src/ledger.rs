//! Membership ledger
//!
//! Each row of the `membership` table records an interval in a repository's
//! history during which a content unit was present: it names the version that
//! added the unit and, once the unit is gone, the version that removed it.
//! A unit is present at version N iff some row has `added.number <= N` and
//! either no removal or `removed.number > N`. Versions never store full
//! content sets.
//!
//! The functions here take a plain connection and expect the caller to have
//! opened a transaction (see `Store::write`).

use crate::error::{Result, VersionError};
use crate::id::ContentId;
use crate::version::VersionRecord;
use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};
use std::collections::{BTreeSet, HashSet};

/// Joins resolving the boundary numbers of `membership m`.
pub(crate) const PRESENT_JOINS: &str = "JOIN repository_version va ON va.id = m.version_added_id \
     LEFT JOIN repository_version vr ON vr.id = m.version_removed_id";

/// Rows present at version number `?2` in repository `?1`; needs [`PRESENT_JOINS`].
pub(crate) const PRESENT_WHERE: &str =
    "m.repository_id = ?1 AND va.number <= ?2 AND (vr.id IS NULL OR vr.number > ?2)";

/// `?{start}, ?{start+1}, ...` for `count` parameters.
fn numbered_placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// First-seen order, duplicates dropped.
fn dedup(content: &[ContentId]) -> Vec<ContentId> {
    let mut seen = HashSet::with_capacity(content.len());
    content.iter().copied().filter(|id| seen.insert(*id)).collect()
}

fn collect_ids(conn: &Connection, sql: &str, params: &[&dyn ToSql]) -> Result<BTreeSet<ContentId>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt
        .query_map(params, |r| r.get(0))?
        .collect::<rusqlite::Result<BTreeSet<ContentId>>>()?;
    Ok(ids)
}

pub(crate) fn content_at(conn: &Connection, version: &VersionRecord) -> Result<BTreeSet<ContentId>> {
    let number = version.number as i64;
    collect_ids(
        conn,
        &format!("SELECT m.content_id FROM membership m {PRESENT_JOINS} WHERE {PRESENT_WHERE}"),
        &[&version.repository_id, &number],
    )
}

pub(crate) fn added_at(conn: &Connection, version: &VersionRecord) -> Result<BTreeSet<ContentId>> {
    collect_ids(
        conn,
        "SELECT content_id FROM membership WHERE version_added_id = ?1",
        &[&version.id],
    )
}

pub(crate) fn removed_at(conn: &Connection, version: &VersionRecord) -> Result<BTreeSet<ContentId>> {
    collect_ids(
        conn,
        "SELECT content_id FROM membership WHERE version_removed_id = ?1",
        &[&version.id],
    )
}

pub(crate) fn contains(conn: &Connection, version: &VersionRecord, content: &ContentId) -> Result<bool> {
    let number = version.number as i64;
    let found: bool = conn.query_row(
        &format!(
            "SELECT EXISTS (SELECT 1 FROM membership m {PRESENT_JOINS} \
             WHERE {PRESENT_WHERE} AND m.content_id = ?3)"
        ),
        rusqlite::params![version.repository_id, number, content],
        |r| r.get(0),
    )?;
    Ok(found)
}

/// Whether the version added or removed anything relative to its predecessor.
pub(crate) fn has_changes(conn: &Connection, version: &VersionRecord) -> Result<bool> {
    let changed: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM membership WHERE version_added_id = ?1) \
             OR EXISTS (SELECT 1 FROM membership WHERE version_removed_id = ?1)",
        [&version.id],
        |r| r.get(0),
    )?;
    Ok(changed)
}

/// Reject writes against versions that are gone or complete, using the stored flag.
pub(crate) fn ensure_mutable(conn: &Connection, version: &VersionRecord) -> Result<()> {
    let complete: Option<bool> = conn
        .query_row(
            "SELECT complete FROM repository_version WHERE id = ?1",
            [&version.id],
            |r| r.get(0),
        )
        .optional()?;
    match complete {
        None => Err(VersionError::NotFound(format!("{}", version))),
        Some(true) => Err(VersionError::ImmutableVersion(version.to_string())),
        Some(false) => Ok(()),
    }
}

fn ensure_registered(conn: &Connection, chunk: &[ContentId]) -> Result<()> {
    let sql = format!(
        "SELECT id FROM content WHERE id IN ({})",
        numbered_placeholders(1, chunk.len())
    );
    let params: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
    let known = collect_ids(conn, &sql, &params)?;
    match chunk.iter().find(|id| !known.contains(id)) {
        Some(missing) => Err(VersionError::UnknownContent(*missing)),
        None => Ok(()),
    }
}

/// Parameters `?1` = repository, `?2` = version, `?3..` = the chunk.
fn chunk_params<'a>(version: &'a VersionRecord, chunk: &'a [ContentId]) -> Vec<&'a dyn ToSql> {
    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 2);
    params.push(&version.repository_id);
    params.push(&version.id);
    params.extend(chunk.iter().map(|id| id as &dyn ToSql));
    params
}

/// Add content to an open version.
///
/// Units already active are skipped. A unit removed earlier by this same
/// version gets its removal undone rather than a second record, so
/// `added_at`/`removed_at` stay the net difference to the predecessor.
/// Returns the number of units that became present.
pub(crate) fn add_content(
    conn: &Connection,
    version: &VersionRecord,
    content: &[ContentId],
    batch_size: usize,
) -> Result<usize> {
    ensure_mutable(conn, version)?;
    let content = dedup(content);
    let mut changed = 0;
    for chunk in content.chunks(batch_size.max(1)) {
        ensure_registered(conn, chunk)?;
        let marks = numbered_placeholders(3, chunk.len());
        let params = chunk_params(version, chunk);

        changed += conn.execute(
            &format!(
                "UPDATE membership SET version_removed_id = NULL \
                 WHERE repository_id = ?1 AND version_removed_id = ?2 AND content_id IN ({marks})"
            ),
            params.as_slice(),
        )?;
        changed += conn.execute(
            &format!(
                "INSERT INTO membership (repository_id, content_id, version_added_id) \
                 SELECT ?1, c.id, ?2 FROM content c \
                 WHERE c.id IN ({marks}) AND NOT EXISTS ( \
                     SELECT 1 FROM membership a \
                     WHERE a.repository_id = ?1 AND a.content_id = c.id \
                       AND a.version_removed_id IS NULL)"
            ),
            params.as_slice(),
        )?;
    }
    tracing::debug!("{}: added {} of {} unit(s)", version, changed, content.len());
    Ok(changed)
}

/// Remove content from an open version.
///
/// Units not currently active are skipped. A unit added by this same version
/// has its addition record deleted. Returns the number of units that stopped
/// being present.
pub(crate) fn remove_content(
    conn: &Connection,
    version: &VersionRecord,
    content: &[ContentId],
    batch_size: usize,
) -> Result<usize> {
    ensure_mutable(conn, version)?;
    let content = dedup(content);
    let mut changed = 0;
    for chunk in content.chunks(batch_size.max(1)) {
        let marks = numbered_placeholders(3, chunk.len());
        let params = chunk_params(version, chunk);

        changed += conn.execute(
            &format!(
                "DELETE FROM membership \
                 WHERE repository_id = ?1 AND version_added_id = ?2 \
                   AND version_removed_id IS NULL AND content_id IN ({marks})"
            ),
            params.as_slice(),
        )?;
        changed += conn.execute(
            &format!(
                "UPDATE membership SET version_removed_id = ?2 \
                 WHERE repository_id = ?1 AND version_removed_id IS NULL AND content_id IN ({marks})"
            ),
            params.as_slice(),
        )?;
    }
    tracing::debug!("{}: removed {} of {} unit(s)", version, changed, content.len());
    Ok(changed)
}

/// Drop every boundary a version holds: records it added go away, records it
/// removed become active again.
pub(crate) fn drop_boundaries(conn: &Connection, version: &VersionRecord) -> Result<()> {
    conn.execute(
        "DELETE FROM membership WHERE version_added_id = ?1",
        [&version.id],
    )?;
    conn.execute(
        "UPDATE membership SET version_removed_id = NULL WHERE version_removed_id = ?1",
        [&version.id],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::CORE_REPOSITORY_TYPE;
    use crate::store::Store;
    use std::sync::Arc;

    fn set(ids: &[ContentId]) -> BTreeSet<ContentId> {
        ids.iter().copied().collect()
    }

    fn record_count(store: &Arc<Store>) -> i64 {
        store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM membership", [], |r| r.get(0))?))
            .unwrap()
    }

    #[test]
    fn test_numbered_placeholders() {
        assert_eq!(numbered_placeholders(3, 3), "?3, ?4, ?5");
        assert_eq!(numbered_placeholders(1, 0), "");
    }

    #[test]
    fn test_dedup_keeps_order() {
        let a = ContentId::new();
        let b = ContentId::new();
        assert_eq!(dedup(&[a, b, a, b]), vec![a, b]);
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("idem", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let ids = store.register_contents("file.file", 3).await.unwrap();

        let mut v1 = repo.begin_version(None).await.unwrap();
        assert_eq!(v1.add_content(&ids).await.unwrap(), 3);
        let before = record_count(&store);
        assert_eq!(v1.add_content(&ids).await.unwrap(), 0);
        assert_eq!(record_count(&store), before);
        assert_eq!(v1.content().await.unwrap(), set(&ids));
        let v1 = v1.finalize().await.unwrap().unwrap();

        let mut v2 = repo.begin_version(None).await.unwrap();
        assert_eq!(v2.add_content(&ids).await.unwrap(), 0);
        assert!(v2.finalize().await.unwrap().is_none());
        assert_eq!(record_count(&store), before);
        assert_eq!(v1.content().await.unwrap(), set(&ids));
    }

    #[tokio::test]
    async fn test_remove_skips_inactive() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("skip", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let ids = store.register_contents("file.file", 2).await.unwrap();

        let mut v1 = repo.begin_version(None).await.unwrap();
        v1.add_content(&ids[..1]).await.unwrap();
        v1.finalize().await.unwrap().unwrap();

        let mut v2 = repo.begin_version(None).await.unwrap();
        assert_eq!(v2.remove_content(&ids).await.unwrap(), 1);
        assert_eq!(v2.removed().await.unwrap(), set(&ids[..1]));
        assert_eq!(v2.remove_content(&ids).await.unwrap(), 0);
        v2.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_then_readd_in_same_version() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("readd", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let ids = store.register_contents("file.file", 1).await.unwrap();

        let mut v1 = repo.begin_version(None).await.unwrap();
        v1.add_content(&ids).await.unwrap();
        v1.finalize().await.unwrap().unwrap();

        let mut v2 = repo.begin_version(None).await.unwrap();
        v2.remove_content(&ids).await.unwrap();
        v2.add_content(&ids).await.unwrap();
        assert!(v2.added().await.unwrap().is_empty());
        assert!(v2.removed().await.unwrap().is_empty());
        assert!(v2.contains(&ids[0]).await.unwrap());
        assert!(v2.finalize().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_then_remove_in_same_version() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("undo", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let ids = store.register_contents("file.file", 2).await.unwrap();

        let mut v1 = repo.begin_version(None).await.unwrap();
        v1.add_content(&ids).await.unwrap();
        v1.remove_content(&ids[..1]).await.unwrap();
        assert_eq!(v1.added().await.unwrap(), set(&ids[1..]));
        assert!(v1.removed().await.unwrap().is_empty());
        assert_eq!(record_count(&store), 1);
        v1.finalize().await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_unknown_content_rejected() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.create_repository("unknown", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let known = store.register_content("file.file").await.unwrap();
        let stranger = ContentId::new();

        let mut v1 = repo.begin_version(None).await.unwrap();
        let err = v1.add_content(&[known, stranger]).await.unwrap_err();
        assert!(matches!(err, VersionError::UnknownContent(id) if id == stranger));
        // the failed call wrote nothing
        assert!(v1.added().await.unwrap().is_empty());
        v1.abort().await.unwrap();
    }

    #[tokio::test]
    async fn test_batches_smaller_than_input() {
        let config = crate::StoreConfig {
            batch_size: 4,
            ..Default::default()
        };
        let store = Store::open_in_memory_with(config).unwrap();
        let repo = store.create_repository("batched", CORE_REPOSITORY_TYPE, None).await.unwrap();
        let ids = store.register_contents("file.file", 11).await.unwrap();

        let mut v1 = repo.begin_version(None).await.unwrap();
        assert_eq!(v1.add_content(&ids).await.unwrap(), 11);
        let v1 = v1.finalize().await.unwrap().unwrap();
        assert_eq!(v1.content().await.unwrap().len(), 11);

        let mut v2 = repo.begin_version(None).await.unwrap();
        assert_eq!(v2.remove_content(&ids[..9]).await.unwrap(), 9);
        let v2 = v2.finalize().await.unwrap().unwrap();
        assert_eq!(v2.content().await.unwrap(), set(&ids[9..]));
    }
}
