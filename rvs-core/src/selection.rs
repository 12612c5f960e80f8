//! Content selections given by callers
//!
//! A selection is either the wildcard `*`, meaning all content of a version,
//! or an explicit list of content ids. Mixing both is rejected.

use crate::error::{Result, VersionError};
use crate::id::ContentId;
use crate::version::RepositoryVersion;
use std::str::FromStr;

const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSelection {
    /// Every unit present in the version the selection is resolved against.
    All,
    Units(Vec<ContentId>),
}

impl ContentSelection {
    pub fn parse<S: AsRef<str>>(items: &[S]) -> Result<Self> {
        let wildcards = items.iter().filter(|s| s.as_ref().trim() == WILDCARD).count();
        if wildcards > 0 {
            if wildcards != items.len() || wildcards > 1 {
                return Err(VersionError::InvalidInput(
                    "'*' cannot be combined with other content".into(),
                ));
            }
            return Ok(ContentSelection::All);
        }

        let units = items
            .iter()
            .map(|s| {
                let s = s.as_ref().trim();
                ContentId::from_str(s)
                    .map_err(|_| VersionError::InvalidInput(format!("invalid content id '{}'", s)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ContentSelection::Units(units))
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ContentSelection::All)
    }

    /// The concrete ids selected in `version`.
    pub async fn resolve(&self, version: &RepositoryVersion) -> Result<Vec<ContentId>> {
        match self {
            ContentSelection::All => Ok(version.content().await?.into_iter().collect()),
            ContentSelection::Units(units) => Ok(units.clone()),
        }
    }
}
