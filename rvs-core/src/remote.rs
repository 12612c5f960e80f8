//! Remotes: upstream sources that content can be synced from

use crate::error::{Result, VersionError};
use crate::id::RemoteId;
use crate::plugin::CORE_REPOSITORY_TYPE;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::fmt;

/// When artifacts of synced content are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPolicy {
    /// Download everything during sync.
    #[default]
    Immediate,
    /// Download on first request, then keep.
    OnDemand,
    /// Stream on request without keeping.
    Streamed,
}

impl DownloadPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadPolicy::Immediate => "immediate",
            DownloadPolicy::OnDemand => "on_demand",
            DownloadPolicy::Streamed => "streamed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(DownloadPolicy::Immediate),
            "on_demand" => Ok(DownloadPolicy::OnDemand),
            "streamed" => Ok(DownloadPolicy::Streamed),
            other => Err(VersionError::InvalidInput(format!("unknown download policy '{}'", other))),
        }
    }
}

impl fmt::Display for DownloadPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_download_concurrency() -> u32 {
    20
}

fn default_tls_validation() -> bool {
    true
}

/// An upstream source of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Remote {
    pub id: RemoteId,
    pub name: String,
    /// Plugin type resolving artifacts of this remote.
    pub remote_type: String,
    pub url: String,
    #[serde(default = "default_tls_validation")]
    pub tls_validation: bool,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: u32,
    #[serde(default)]
    pub policy: DownloadPolicy,
}

impl Remote {
    /// A core-typed remote with default settings.
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: RemoteId::new(),
            name: name.into(),
            remote_type: CORE_REPOSITORY_TYPE.to_string(),
            url: url.into(),
            tls_validation: default_tls_validation(),
            proxy_url: None,
            username: None,
            password: None,
            download_concurrency: default_download_concurrency(),
            policy: DownloadPolicy::default(),
        }
    }

    pub fn with_type(mut self, remote_type: impl Into<String>) -> Self {
        self.remote_type = remote_type.into();
        self
    }

    pub fn with_policy(mut self, policy: DownloadPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// URL of the artifact at `relative_path` below this remote's URL.
    pub fn artifact_url(&self, relative_path: &str) -> Result<String> {
        if relative_path.starts_with('/') {
            return Err(VersionError::InvalidInput(format!(
                "artifact path '{}' must be relative",
                relative_path
            )));
        }
        Ok(format!("{}/{}", self.url.trim_end_matches('/'), relative_path))
    }
}

pub(crate) fn insert_remote(conn: &Connection, remote: &Remote) -> Result<()> {
    let exists: Option<i64> = conn
        .query_row("SELECT 1 FROM remote WHERE name = ?1", [&remote.name], |r| r.get(0))
        .optional()?;
    if exists.is_some() {
        return Err(VersionError::InvalidInput(format!("Remote '{}' already exists", remote.name)));
    }
    conn.execute(
        "INSERT INTO remote (id, name, remote_type, url, tls_validation, proxy_url, username, \
         password, download_concurrency, policy) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            remote.id,
            remote.name,
            remote.remote_type,
            remote.url,
            remote.tls_validation,
            remote.proxy_url,
            remote.username,
            remote.password,
            remote.download_concurrency,
            remote.policy.as_str(),
        ],
    )?;
    tracing::info!("Created remote '{}' ({})", remote.name, remote.url);
    Ok(())
}

fn row_to_remote(row: &Row<'_>) -> rusqlite::Result<(Remote, String)> {
    Ok((
        Remote {
            id: row.get(0)?,
            name: row.get(1)?,
            remote_type: row.get(2)?,
            url: row.get(3)?,
            tls_validation: row.get(4)?,
            proxy_url: row.get(5)?,
            username: row.get(6)?,
            password: row.get(7)?,
            download_concurrency: row.get(8)?,
            policy: DownloadPolicy::default(),
        },
        row.get(9)?,
    ))
}

pub(crate) fn load_remote(conn: &Connection, name: &str) -> Result<Remote> {
    let (mut remote, policy) = conn
        .query_row(
            "SELECT id, name, remote_type, url, tls_validation, proxy_url, username, password, \
             download_concurrency, policy FROM remote WHERE name = ?1",
            [name],
            row_to_remote,
        )
        .optional()?
        .ok_or_else(|| VersionError::NotFound(format!("remote '{}'", name)))?;
    remote.policy = DownloadPolicy::parse(&policy)?;
    Ok(remote)
}
