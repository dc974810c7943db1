//! In-memory snapshot of a repository's text files.

use crate::error::{Error, Result};
use crate::tree::{FileTree, Node};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Metadata of a directory node in a [`RepositoryDump`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryInfo {
    /// Repository-relative path of the directory
    pub path: String,
}

/// Metadata of a file leaf in a [`RepositoryDump`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Repository-relative path of the file
    pub path: String,
    /// Decoded text content
    pub content: String,
}

/// Tree of a repository's decoded text files.
pub type DumpTree = FileTree<DirectoryInfo, FileInfo>;

/// Immutable dump of a repository, the ingestion boundary of the pipeline.
///
/// Binary files are excluded before a dump is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryDump {
    tree: DumpTree,
}

impl RepositoryDump {
    /// Wraps an existing tree.
    #[must_use]
    pub const fn new(tree: DumpTree) -> Self {
        Self { tree }
    }

    /// Builds a dump from `path -> content` pairs.
    ///
    /// Each path is split on `/`; intermediate segments become directory
    /// nodes whose path is the joined prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if a path has empty segments or if a path is
    /// used both as a file and as a directory.
    pub fn from_file_contents<I, P, C>(files: I) -> Result<Self>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut tree = DumpTree::new();

        for (path, content) in files {
            let single = single_file_tree(path.into(), content.into())?;
            tree = tree.merge(single)?;
        }

        debug!("Built repository dump with {} files", tree.file_count());
        Ok(Self { tree })
    }

    /// Returns the underlying tree.
    #[must_use]
    pub const fn tree(&self) -> &DumpTree {
        &self.tree
    }

    /// Number of files in the dump.
    #[must_use]
    pub fn count_files(&self) -> usize {
        self.tree.file_count()
    }

    /// All files of the dump.
    #[must_use]
    pub fn files(&self) -> Vec<&FileInfo> {
        self.tree.flatten()
    }

    /// Renders the whole dump as `<file>` fragments joined by newlines.
    #[must_use]
    pub fn to_xml_string(&self) -> String {
        let rendered: FileTree<(), String> = self.tree.map(
            |_, children: FileTree<(), String>| {
                let joined = children
                    .values()
                    .filter_map(Node::as_file)
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join("\n");
                Node::File(joined)
            },
            |info| Node::File(file_xml(&info.path, &info.content)),
        );

        rendered
            .values()
            .filter_map(Node::as_file)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Wraps file content in a `<file>` fragment.
#[must_use]
pub fn file_xml(path: &str, content: &str) -> String {
    format!("<file path=\"{path}\">{content}</file>")
}

/// Builds the chain of directory nodes leading to a single leaf.
fn single_file_tree(path: String, content: String) -> Result<DumpTree> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(Error::invalid_path(&path, "path contains an empty segment"));
    }

    let (leaf_segment, parents) = segments
        .split_last()
        .ok_or_else(|| Error::invalid_path(&path, "path is empty"))?;

    let mut subtree = DumpTree::new();
    subtree.insert(
        *leaf_segment,
        Node::File(FileInfo {
            path: path.clone(),
            content,
        }),
    );

    for depth in (0..parents.len()).rev() {
        let mut parent = DumpTree::new();
        parent.insert(
            parents[depth],
            Node::Directory(
                DirectoryInfo {
                    path: parents[..=depth].join("/"),
                },
                subtree,
            ),
        );
        subtree = parent;
    }

    Ok(subtree)
}
