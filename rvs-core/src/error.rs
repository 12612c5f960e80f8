//! Error types for repository versioning

use crate::id::ContentId;

/// Result type for versioning operations
pub type Result<T> = std::result::Result<T, VersionError>;

/// Errors that can occur while building, querying or deleting versions
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// The target version is complete; its membership can no longer change.
    #[error("{0} is complete and cannot be modified")]
    ImmutableVersion(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Another caller holds the repository's version lock.
    #[error("Repository '{0}' already has a version in progress")]
    VersionInProgress(String),

    /// Another `Store` already has this root open.
    #[error("Store at {0:?} is already open")]
    StoreLocked(std::path::PathBuf),

    #[error("Unknown content: {0}")]
    UnknownContent(ContentId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The finalize hook failed. The version was discarded before this error was returned.
    #[error("Finalizing {version} failed: {source}")]
    FinalizeRejected {
        version: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl VersionError {
    /// True for the "no such row" family, which callers usually treat as a
    /// normal negative answer rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, VersionError::NotFound(_))
    }
}
