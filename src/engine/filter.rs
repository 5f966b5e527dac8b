//! Path gating for synchronization targets.

use regex::Regex;
use thiserror::Error;

use crate::config::Settings;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("invalid filter pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Include/exclude predicates compiled from the settings.
#[derive(Debug, Default)]
pub struct FileFilter {
    only: Option<Regex>,
    ignore: Option<Regex>,
}

impl FileFilter {
    pub fn from_settings(settings: &Settings) -> Result<Self, FilterError> {
        Ok(Self {
            only: compile(&settings.sync_only_regex)?,
            ignore: compile(&settings.sync_ignore_regex)?,
        })
    }

    /// Ids carrying a `:` live in special namespaces and always pass.
    pub fn is_target(&self, path: &str) -> bool {
        if path.contains(':') {
            return true;
        }
        if let Some(only) = &self.only
            && !only.is_match(path)
        {
            return false;
        }
        if let Some(ignore) = &self.ignore
            && ignore.is_match(path)
        {
            return false;
        }
        true
    }
}

fn compile(pattern: &str) -> Result<Option<Regex>, FilterError> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|source| FilterError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}
