//! Per content type counts for finalized versions
//!
//! `content_count` is a cache derived purely from the ledger; it is wiped and
//! rebuilt whenever a version is completed or another version is squashed
//! into it.

use crate::error::Result;
use crate::id::VersionId;
use crate::ledger::{PRESENT_JOINS, PRESENT_WHERE};
use crate::version::VersionRecord;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which membership set a count describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountKind {
    Added,
    Present,
    Removed,
}

impl CountKind {
    pub const ALL: [CountKind; 3] = [CountKind::Added, CountKind::Present, CountKind::Removed];

    /// Single-letter code stored in the `kind` column.
    pub fn code(&self) -> &'static str {
        match self {
            CountKind::Added => "A",
            CountKind::Present => "P",
            CountKind::Removed => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.code() == code)
    }
}

/// All three count maps of one version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContentSummary {
    pub added: BTreeMap<String, u64>,
    pub present: BTreeMap<String, u64>,
    pub removed: BTreeMap<String, u64>,
}

impl ContentSummary {
    pub fn get(&self, kind: CountKind) -> &BTreeMap<String, u64> {
        match kind {
            CountKind::Added => &self.added,
            CountKind::Present => &self.present,
            CountKind::Removed => &self.removed,
        }
    }

    fn get_mut(&mut self, kind: CountKind) -> &mut BTreeMap<String, u64> {
        match kind {
            CountKind::Added => &mut self.added,
            CountKind::Present => &mut self.present,
            CountKind::Removed => &mut self.removed,
        }
    }
}

/// Rebuild the count rows of `version` from the ledger. Returns the number of rows written.
pub(crate) fn recompute(conn: &Connection, version: &VersionRecord) -> Result<usize> {
    conn.execute("DELETE FROM content_count WHERE version_id = ?1", [&version.id])?;

    let number = version.number as i64;
    let mut written = conn.execute(
        &format!(
            "INSERT INTO content_count (version_id, content_type, kind, count) \
             SELECT ?3, c.content_type, '{}', COUNT(DISTINCT m.content_id) \
             FROM membership m JOIN content c ON c.id = m.content_id {PRESENT_JOINS} \
             WHERE {PRESENT_WHERE} GROUP BY c.content_type",
            CountKind::Present.code()
        ),
        rusqlite::params![version.repository_id, number, version.id],
    )?;
    for (kind, column) in [
        (CountKind::Added, "version_added_id"),
        (CountKind::Removed, "version_removed_id"),
    ] {
        written += conn.execute(
            &format!(
                "INSERT INTO content_count (version_id, content_type, kind, count) \
                 SELECT ?1, c.content_type, '{}', COUNT(*) \
                 FROM membership m JOIN content c ON c.id = m.content_id \
                 WHERE m.{column} = ?1 GROUP BY c.content_type",
                kind.code()
            ),
            [&version.id],
        )?;
    }
    tracing::debug!("{}: wrote {} count row(s)", version, written);
    Ok(written)
}

pub(crate) fn load(conn: &Connection, version_id: &VersionId, kind: CountKind) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT content_type, count FROM content_count WHERE version_id = ?1 AND kind = ?2",
    )?;
    let counts = stmt
        .query_map(rusqlite::params![version_id, kind.code()], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u64))
        })?
        .collect::<rusqlite::Result<BTreeMap<_, _>>>()?;
    Ok(counts)
}

pub(crate) fn load_summary(conn: &Connection, version_id: &VersionId) -> Result<ContentSummary> {
    let mut stmt = conn.prepare_cached(
        "SELECT kind, content_type, count FROM content_count WHERE version_id = ?1",
    )?;
    let mut rows = stmt.query([version_id])?;
    let mut summary = ContentSummary::default();
    while let Some(row) = rows.next()? {
        let code: String = row.get(0)?;
        let Some(kind) = CountKind::from_code(&code) else {
            tracing::warn!("Ignoring count row with unknown kind '{}'", code);
            continue;
        };
        summary
            .get_mut(kind)
            .insert(row.get(1)?, row.get::<_, i64>(2)? as u64);
    }
    Ok(summary)
}
