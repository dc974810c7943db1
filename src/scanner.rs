use crate::{
    config::Config,
    dump::RepositoryDump,
    error::{Error, Result},
    file::{ReadOutcome, SourceFile, read_source},
    filter::FileFilter,
};
use ignore::{DirEntry, WalkBuilder, WalkState};
use parking_lot::Mutex;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Statistics collected during scanning.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanStats {
    /// Files seen by the walker after ignore rules
    pub total_files: usize,

    /// Text files ingested
    pub text_files: usize,

    /// Binary files skipped
    pub binary_files: usize,

    /// Files rejected by the glob filter
    pub filtered_files: usize,

    /// Unreadable or non-UTF-8 files
    pub errors: usize,
}

/// Walks a checked-out repository and reads its text files.
pub(crate) struct Scanner {
    root_dir: PathBuf,
    file_filter: FileFilter,
}

impl Scanner {
    /// Creates a new scanner from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a filter pattern is invalid.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            root_dir: config.root_dir.clone(),
            file_filter: FileFilter::new(&config.file_filter_config)?,
        })
    }

    /// Scans the root directory and returns all text files, sorted by path.
    ///
    /// `.gitignore` rules apply and the `.git` directory is never entered.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoFiles`] if nothing was ingested.
    pub(crate) fn scan(&self) -> Result<(Vec<SourceFile>, ScanStats)> {
        let files = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(Mutex::new(ScanStats::default()));

        debug!("Starting parallel scan of {}", self.root_dir.display());

        let walker = WalkBuilder::new(&self.root_dir)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .hidden(false)
            .follow_links(false)
            .filter_entry(|entry| entry.file_name() != ".git")
            .threads(num_cpus::get())
            .build_parallel();

        walker.run(|| {
            let files = Arc::clone(&files);
            let stats = Arc::clone(&stats);
            let root = self.root_dir.clone();
            let file_filter = self.file_filter.clone();

            Box::new(move |result| {
                match result {
                    Ok(entry) if entry.file_type().is_some_and(|ft| ft.is_file()) => {
                        let processed = Self::process_entry(&entry, &root, &file_filter);
                        let mut stats = stats.lock();
                        stats.total_files += 1;
                        match processed {
                            Ok(EntryOutcome::Text(file)) => {
                                stats.text_files += 1;
                                files.lock().push(file);
                            }
                            Ok(EntryOutcome::Binary) => stats.binary_files += 1,
                            Ok(EntryOutcome::Filtered) => stats.filtered_files += 1,
                            Err(e) => {
                                warn!("Skipping {}: {}", entry.path().display(), e);
                                stats.errors += 1;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Walk error: {}", e);
                        stats.lock().errors += 1;
                    }
                }
                WalkState::Continue
            })
        });

        let mut files = std::mem::take(&mut *files.lock());
        let stats = stats.lock().clone();

        debug!(
            "Scan complete: {} total, {} text, {} binary, {} filtered, {} errors",
            stats.total_files,
            stats.text_files,
            stats.binary_files,
            stats.filtered_files,
            stats.errors
        );

        if files.is_empty() {
            return Err(Error::no_files(&self.root_dir));
        }

        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok((files, stats))
    }

    /// Scans the root directory into a [`RepositoryDump`].
    ///
    /// # Errors
    ///
    /// Returns an error if scanning fails or a path cannot be placed in the tree.
    pub(crate) fn scan_dump(&self) -> Result<(RepositoryDump, ScanStats)> {
        let (files, stats) = self.scan()?;
        let dump = RepositoryDump::from_file_contents(
            files.into_iter().map(|file| (file.relative_path, file.content)),
        )?;
        Ok((dump, stats))
    }

    fn process_entry(
        entry: &DirEntry,
        root: &Path,
        file_filter: &FileFilter,
    ) -> Result<EntryOutcome> {
        let path = entry.path();
        let relative = pathdiff::diff_paths(path, root).unwrap_or_else(|| path.to_path_buf());

        if !file_filter.should_process(&relative) {
            trace!("Filtered out: {}", relative.display());
            return Ok(EntryOutcome::Filtered);
        }

        match read_source(path)? {
            ReadOutcome::Binary => {
                debug!("Skipping binary file: {}", relative.display());
                Ok(EntryOutcome::Binary)
            }
            ReadOutcome::Text(content) => Ok(EntryOutcome::Text(SourceFile {
                absolute_path: path.to_path_buf(),
                relative_path: to_repo_path(&relative),
                content,
            })),
        }
    }
}

enum EntryOutcome {
    Text(SourceFile),
    Binary,
    Filtered,
}

/// Joins the normal components of a relative path with `/`.
fn to_repo_path(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FileFilterConfig;
    use assert_fs::prelude::*;

    fn create_test_config(root: &Path) -> Config {
        Config::builder()
            .root_dir(root)
            .output_dir(root.join("out"))
            .build()
            .unwrap()
    }

    fn paths(files: &[SourceFile]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_scanner_finds_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("file1.rs").write_str("fn main() {}").unwrap();
        temp.child("file2.rs").write_str("pub fn test() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let (files, stats) = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["file1.rs", "file2.rs"]);
        assert_eq!(stats.text_files, 2);
    }

    #[test]
    fn test_scanner_skips_binary() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("text.rs").write_str("fn main() {}").unwrap();
        temp.child("blob.dat").write_binary(&[0u8; 100]).unwrap();
        temp.child("icon.png").write_str("pretend image").unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let (files, stats) = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["text.rs"]);
        assert_eq!(stats.binary_files, 2);
    }

    #[test]
    fn test_scanner_respects_gitignore() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".gitignore").write_str("ignored.rs\n").unwrap();
        temp.child("included.rs").write_str("fn main() {}").unwrap();
        temp.child("ignored.rs").write_str("fn test() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let (files, _) = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec![".gitignore", "included.rs"]);
    }

    #[test]
    fn test_scanner_skips_git_directory() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".git/HEAD").write_str("ref: refs/heads/main").unwrap();
        temp.child("src/lib.rs").write_str("pub fn lib() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let (files, _) = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["src/lib.rs"]);
    }

    #[test]
    fn test_scanner_applies_glob_filter() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("Cargo.lock").write_str("# lock").unwrap();
        temp.child("src/main.rs").write_str("fn main() {}").unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .file_filter_config(FileFilterConfig::new().exclude_files(vec!["*.lock".to_string()]))
            .build()
            .unwrap();
        let scanner = Scanner::new(&config).unwrap();
        let (files, stats) = scanner.scan().unwrap();

        assert_eq!(paths(&files), vec!["src/main.rs"]);
        assert_eq!(stats.filtered_files, 1);
    }

    #[test]
    fn test_scanner_empty_directory() {
        let temp = assert_fs::TempDir::new().unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let result = scanner.scan();

        assert!(matches!(result, Err(Error::NoFiles { .. })));
    }

    #[test]
    fn test_scan_dump_nests_directories() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("src/main.rs").write_str("fn main() {}").unwrap();
        temp.child("src/util/mod.rs").write_str("pub mod x;").unwrap();
        temp.child("tests/it.rs").write_str("#[test]\nfn it() {}").unwrap();

        let scanner = Scanner::new(&create_test_config(temp.path())).unwrap();
        let (dump, _) = scanner.scan_dump().unwrap();

        assert_eq!(dump.count_files(), 3);
        assert!(dump.tree().get("src").is_some());
        assert!(dump.tree().get("tests").is_some());
        let paths: Vec<&str> = dump.files().iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"src/util/mod.rs"));
    }
}
