//! RVS Core Library
//!
//! Versioned membership of content units in repositories:
//! - Interval ledger recording when each unit entered and left a repository
//! - Open version handles with guaranteed abort
//! - Deletion of versions by squashing into the next complete version
//! - Per content type counts of finalized versions
//! - Repository type plugins and remotes
//! - SQLite storage (WAL mode) via rusqlite

pub mod config;
pub mod counts;
pub mod error;
pub mod id;
mod ledger;
pub mod lifecycle;
pub mod plugin;
pub mod remote;
pub mod repository;
pub mod selection;
mod squash;
pub mod store;
pub mod version;

pub use config::StoreConfig;
pub use counts::{ContentSummary, CountKind};
pub use error::{Result, VersionError};
pub use id::{ContentId, RemoteId, RepositoryId, VersionId};
pub use lifecycle::OpenVersion;
pub use plugin::{CorePlugin, PluginRegistry, RepositoryPlugin, CORE_REPOSITORY_TYPE};
pub use remote::{DownloadPolicy, Remote};
pub use repository::{Repository, RepositoryRecord};
pub use selection::ContentSelection;
pub use store::Store;
pub use version::{RepositoryVersion, VersionRecord};
