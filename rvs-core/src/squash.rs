//! Version deletion
//!
//! Deleting a complete version V must not change what any surviving version
//! contains. If a later complete version N exists, V's boundaries are moved
//! forward onto N ("squashed"); otherwise they are simply dropped. Deleting an
//! incomplete version is an abort: its boundaries are dropped and the
//! repository's version counter is rolled back if V was the last number
//! handed out.
//!
//! Callers run these inside one immediate transaction while holding the
//! repository lock.

use crate::counts;
use crate::error::Result;
use crate::id::VersionId;
use crate::ledger;
use crate::version::{self, VersionRecord};
use rusqlite::Connection;

/// Delete a version, squashing it into its successor when it is complete.
pub(crate) fn delete_version(conn: &Connection, version: &VersionRecord) -> Result<()> {
    let current = version::load_version(conn, &version.id)?;
    if !current.complete {
        return delete_incomplete(conn, &current);
    }

    match version::next_complete(conn, &current)? {
        Some(next) => {
            squash_into(conn, &current, &next)?;
            delete_row(conn, &current)?;
            counts::recompute(conn, &next)?;
            tracing::info!("Deleted {} (squashed into version {})", current, next.number);
        }
        None => {
            ledger::drop_boundaries(conn, &current)?;
            delete_row(conn, &current)?;
            tracing::info!("Deleted {} (latest version)", current);
        }
    }
    Ok(())
}

/// Move every boundary of `version` onto `next`, its complete successor.
fn squash_into(conn: &Connection, version: &VersionRecord, next: &VersionRecord) -> Result<()> {
    // Present only in [version, next): nothing left once version disappears.
    let vanished = conn.execute(
        "DELETE FROM membership WHERE version_added_id = ?1 AND version_removed_id = ?2",
        rusqlite::params![version.id, next.id],
    )?;

    // Removed by version and re-added by next: the unit never left. The older
    // record takes over the re-added record's fate.
    let readded: Vec<(i64, i64, Option<VersionId>)> = {
        let mut stmt = conn.prepare_cached(
            "SELECT old.id, new.id, new.version_removed_id \
             FROM membership old JOIN membership new \
               ON new.repository_id = old.repository_id AND new.content_id = old.content_id \
             WHERE old.version_removed_id = ?1 AND new.version_added_id = ?2",
        )?;
        let rows = stmt
            .query_map(rusqlite::params![version.id, next.id], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    {
        let mut delete = conn.prepare_cached("DELETE FROM membership WHERE id = ?1")?;
        let mut extend =
            conn.prepare_cached("UPDATE membership SET version_removed_id = ?1 WHERE id = ?2")?;
        for (old, new, removed) in &readded {
            delete.execute([new])?;
            extend.execute(rusqlite::params![removed, old])?;
        }
    }

    let moved_added = conn.execute(
        "UPDATE membership SET version_added_id = ?2 WHERE version_added_id = ?1",
        rusqlite::params![version.id, next.id],
    )?;
    let moved_removed = conn.execute(
        "UPDATE membership SET version_removed_id = ?2 WHERE version_removed_id = ?1",
        rusqlite::params![version.id, next.id],
    )?;

    tracing::debug!(
        "Squashed {} into version {}: {} vanished, {} re-added, {} additions and {} removals moved",
        version,
        next.number,
        vanished,
        readded.len(),
        moved_added,
        moved_removed
    );
    Ok(())
}

/// Discard a version that never completed.
pub(crate) fn delete_incomplete(conn: &Connection, version: &VersionRecord) -> Result<()> {
    ledger::drop_boundaries(conn, version)?;
    conn.execute(
        "DELETE FROM created_resource WHERE object_id = ?1",
        [&version.id],
    )?;
    // Only the most recently handed out number can be reclaimed.
    let reclaimed = conn.execute(
        "UPDATE repository SET last_version = ?1 WHERE id = ?2 AND last_version = ?3",
        rusqlite::params![
            version.number.saturating_sub(1) as i64,
            version.repository_id,
            version.number as i64
        ],
    )?;
    delete_row(conn, version)?;
    tracing::info!(
        "Discarded {}{}",
        version,
        if reclaimed > 0 { " (number reclaimed)" } else { "" }
    );
    Ok(())
}

fn delete_row(conn: &Connection, version: &VersionRecord) -> Result<()> {
    conn.execute("DELETE FROM repository_version WHERE id = ?1", [&version.id])?;
    Ok(())
}
