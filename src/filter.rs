//! Glob-based selection of repository files.

use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Configuration for file filtering with glob patterns.
///
/// Patterns are matched against paths relative to the repository root.
#[derive(Debug, Clone, Default)]
pub struct FileFilterConfig {
    exclude_files: Vec<String>,
    exclude_all_files_except: Vec<String>,
    exclude_directories: Vec<String>,
}

impl FileFilterConfig {
    /// Creates an empty configuration that accepts every file.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Skips files matching any of the patterns.
    #[must_use]
    pub fn exclude_files(mut self, patterns: Vec<String>) -> Self {
        self.exclude_files = patterns;
        self
    }

    /// Skips everything below directories matching any of the patterns.
    #[must_use]
    pub fn exclude_directories(mut self, patterns: Vec<String>) -> Self {
        self.exclude_directories = patterns;
        self
    }

    /// Keeps only files matching one of the patterns.
    #[must_use]
    pub fn allow_only(mut self, patterns: Vec<String>) -> Self {
        self.exclude_all_files_except = patterns;
        self
    }

    /// Returns true if no pattern is configured.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.exclude_files.is_empty()
            && self.exclude_all_files_except.is_empty()
            && self.exclude_directories.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FileFilter {
    exclude_files: GlobSet,
    include_files: Option<GlobSet>,
    exclude_directories: GlobSet,
}

impl FileFilter {
    /// Compiles the configured patterns.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a pattern is not a valid glob.
    pub(crate) fn new(config: &FileFilterConfig) -> Result<Self> {
        let include_files = if config.exclude_all_files_except.is_empty() {
            None
        } else {
            Some(Self::build_globset(&config.exclude_all_files_except)?)
        };

        Ok(Self {
            exclude_files: Self::build_globset(&config.exclude_files)?,
            include_files,
            exclude_directories: Self::build_globset(&config.exclude_directories)?,
        })
    }

    fn build_globset(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob = Glob::new(pattern)
                .map_err(|e| Error::config(format!("Invalid glob pattern '{pattern}': {e}")))?;
            builder.add(glob);
        }

        builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build glob set: {e}")))
    }

    /// Decides whether a root-relative path is ingested.
    pub(crate) fn should_process(&self, path: &Path) -> bool {
        if let Some(ref include) = self.include_files {
            if !include.is_match(path) {
                return false;
            }
        }

        if path
            .ancestors()
            .skip(1)
            .any(|ancestor| self.exclude_directories.is_match(ancestor))
        {
            return false;
        }

        !self.exclude_files.is_match(path)
    }
}
