//! Repository type plugins
//!
//! Each repository and remote stores a type discriminator. The registry maps
//! that discriminator to the plugin implementing the type's hooks. The core
//! type is always available.

use crate::error::{Result, VersionError};
use crate::id::ContentId;
use crate::lifecycle::OpenVersion;
use crate::remote::Remote;
use crate::repository::RepositoryRecord;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Discriminator of the built-in repository type.
pub const CORE_REPOSITORY_TYPE: &str = "core.repository";

/// Type specific behavior of a repository.
#[async_trait]
pub trait RepositoryPlugin: Send + Sync {
    /// The discriminator stored with repositories of this type.
    fn repository_type(&self) -> &str;

    /// Content placed in version 0 when a repository is created.
    fn initial_content(&self, _repository: &RepositoryRecord) -> anyhow::Result<Vec<ContentId>> {
        Ok(Vec::new())
    }

    /// Called by [`OpenVersion::finalize`] before the version is checked for
    /// changes and completed. The hook may add or remove content; returning
    /// an error discards the version.
    async fn finalize_new_version(&self, _version: &mut OpenVersion) -> anyhow::Result<()> {
        Ok(())
    }

    /// Content type of the artifact at `relative_path` on `remote`, if this
    /// plugin knows how to tell.
    fn remote_artifact_content_type(&self, _remote: &Remote, _relative_path: &str) -> Option<String> {
        None
    }
}

/// Plugin for plain repositories: no seed content, no finalize checks.
#[derive(Debug, Default)]
pub struct CorePlugin;

impl RepositoryPlugin for CorePlugin {
    fn repository_type(&self) -> &str {
        CORE_REPOSITORY_TYPE
    }
}

/// Registry of plugins keyed by repository type.
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn RepositoryPlugin>>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    /// A registry holding only [`CorePlugin`].
    pub fn new() -> Self {
        let registry = Self {
            plugins: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(CorePlugin));
        registry
    }

    /// Register a plugin, replacing any earlier plugin of the same type.
    pub fn register(&self, plugin: Arc<dyn RepositoryPlugin>) {
        let repo_type = plugin.repository_type().to_string();
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        if plugins.insert(repo_type.clone(), plugin).is_some() {
            tracing::warn!("Replaced plugin for repository type '{}'", repo_type);
        } else {
            tracing::debug!("Registered plugin for repository type '{}'", repo_type);
        }
    }

    pub fn get(&self, repo_type: &str) -> Result<Arc<dyn RepositoryPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(repo_type)
            .cloned()
            .ok_or_else(|| VersionError::Unsupported(format!("unknown repository type '{}'", repo_type)))
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let plugins = self.plugins.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = plugins.keys().cloned().collect();
        types.sort();
        types
    }
}
