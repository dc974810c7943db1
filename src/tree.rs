//! Generic recursive file tree.
//!
//! A [`FileTree`] maps path segments to either a directory node carrying
//! directory metadata and a child tree, or a leaf carrying file metadata.
//! Keys are kept sorted so iteration order is deterministic, although no
//! caller may depend on a particular sibling order.

use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt, try_join_all};
use std::collections::BTreeMap;
use std::future::Future;
use tracing::trace;

/// A single entry of a [`FileTree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<D, F> {
    /// Directory metadata and its children
    Directory(D, FileTree<D, F>),
    /// Leaf file metadata
    File(F),
}

impl<D, F> Node<D, F> {
    /// Returns true if this node is a leaf.
    #[must_use]
    pub const fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    /// Returns the leaf metadata, if this node is a leaf.
    #[must_use]
    pub const fn as_file(&self) -> Option<&F> {
        match self {
            Self::File(info) => Some(info),
            Self::Directory(..) => None,
        }
    }

    /// Returns the children, if this node is a directory.
    #[must_use]
    pub const fn children(&self) -> Option<&FileTree<D, F>> {
        match self {
            Self::Directory(_, children) => Some(children),
            Self::File(_) => None,
        }
    }
}

/// Immutable tree of path segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTree<D, F> {
    entries: BTreeMap<String, Node<D, F>>,
}

impl<D, F> Default for FileTree<D, F> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<D, F> FromIterator<(String, Node<D, F>)> for FileTree<D, F> {
    fn from_iter<I: IntoIterator<Item = (String, Node<D, F>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl<D, F> FileTree<D, F> {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node under `segment`, returning the node it replaced.
    ///
    /// Segments are not validated here; ingestion rejects malformed paths
    /// before a tree is built.
    pub fn insert(&mut self, segment: impl Into<String>, node: Node<D, F>) -> Option<Node<D, F>> {
        self.entries.insert(segment.into(), node)
    }

    /// Number of entries at this level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if this level has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up an entry at this level.
    #[must_use]
    pub fn get(&self, segment: &str) -> Option<&Node<D, F>> {
        self.entries.get(segment)
    }

    /// Iterates over the entries at this level.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Node<D, F>)> {
        self.entries.iter().map(|(segment, node)| (segment.as_str(), node))
    }

    /// Iterates over the nodes at this level.
    pub fn values(&self) -> impl Iterator<Item = &Node<D, F>> {
        self.entries.values()
    }

    /// Consumes the tree, yielding the nodes at this level.
    pub fn into_values(self) -> impl Iterator<Item = Node<D, F>> {
        self.entries.into_values()
    }

    /// Collects all leaf metadata, depth-first in key order.
    #[must_use]
    pub fn flatten(&self) -> Vec<&F> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves<'a>(&'a self, leaves: &mut Vec<&'a F>) {
        for node in self.entries.values() {
            match node {
                Node::File(info) => leaves.push(info),
                Node::Directory(_, children) => children.collect_leaves(leaves),
            }
        }
    }

    /// Counts all leaves in the tree.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|node| match node {
                Node::File(_) => 1,
                Node::Directory(_, children) => children.file_count(),
            })
            .sum()
    }

    /// Merges two trees describing paths under the same root.
    ///
    /// Colliding directories merge recursively and keep the left metadata.
    /// Colliding leaves resolve to the right-hand leaf.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PathConflict`] if one side has a file where the
    /// other has a directory.
    pub fn merge(self, other: Self) -> Result<Self> {
        self.merge_at(other, "")
    }

    fn merge_at(mut self, other: Self, prefix: &str) -> Result<Self> {
        for (segment, rhs) in other.entries {
            let path = if prefix.is_empty() {
                segment.clone()
            } else {
                format!("{prefix}/{segment}")
            };

            let merged = match self.entries.remove(&segment) {
                None => rhs,
                Some(lhs) => match (lhs, rhs) {
                    (Node::Directory(info, left), Node::Directory(_, right)) => {
                        Node::Directory(info, left.merge_at(right, &path)?)
                    }
                    (Node::File(_), Node::File(right)) => {
                        trace!("Duplicate leaf '{}', keeping the later one", path);
                        Node::File(right)
                    }
                    _ => return Err(Error::PathConflict { path }),
                },
            };

            self.entries.insert(segment, merged);
        }

        Ok(self)
    }

    /// Transforms the tree bottom-up.
    ///
    /// `dir_mapper` runs after all children of a directory are mapped and
    /// receives the mapped children. Either mapper may return a directory or
    /// a leaf, so a directory can collapse into a single leaf.
    pub fn map<D2, F2, DM, FM>(&self, dir_mapper: DM, file_mapper: FM) -> FileTree<D2, F2>
    where
        DM: Fn(&D, FileTree<D2, F2>) -> Node<D2, F2>,
        FM: Fn(&F) -> Node<D2, F2>,
    {
        self.map_with(&dir_mapper, &file_mapper)
    }

    fn map_with<D2, F2, DM, FM>(&self, dir_mapper: &DM, file_mapper: &FM) -> FileTree<D2, F2>
    where
        DM: Fn(&D, FileTree<D2, F2>) -> Node<D2, F2>,
        FM: Fn(&F) -> Node<D2, F2>,
    {
        self.entries
            .iter()
            .map(|(segment, node)| {
                let mapped = match node {
                    Node::File(info) => file_mapper(info),
                    Node::Directory(info, children) => {
                        dir_mapper(info, children.map_with(dir_mapper, file_mapper))
                    }
                };
                (segment.clone(), mapped)
            })
            .collect()
    }

    /// Asynchronous, fallible variant of [`FileTree::map`].
    ///
    /// Siblings are mapped concurrently. A directory's mapper is only polled
    /// once every child has produced its result. The first error aborts the
    /// whole pass.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by either mapper.
    pub async fn map_async<D2, F2, E, DM, FM, DFut, FFut>(
        &self,
        dir_mapper: DM,
        file_mapper: FM,
    ) -> std::result::Result<FileTree<D2, F2>, E>
    where
        D: Sync,
        F: Sync,
        D2: Send,
        F2: Send,
        E: Send,
        DM: Fn(&D, FileTree<D2, F2>) -> DFut + Sync,
        FM: Fn(&F) -> FFut + Sync,
        DFut: Future<Output = std::result::Result<Node<D2, F2>, E>> + Send,
        FFut: Future<Output = std::result::Result<Node<D2, F2>, E>> + Send,
    {
        map_level_async(self, &dir_mapper, &file_mapper).await
    }
}

fn map_level_async<'a, D, F, D2, F2, E, DM, FM, DFut, FFut>(
    tree: &'a FileTree<D, F>,
    dir_mapper: &'a DM,
    file_mapper: &'a FM,
) -> BoxFuture<'a, std::result::Result<FileTree<D2, F2>, E>>
where
    D: Sync,
    F: Sync,
    D2: Send + 'a,
    F2: Send + 'a,
    E: Send + 'a,
    DM: Fn(&D, FileTree<D2, F2>) -> DFut + Sync,
    FM: Fn(&F) -> FFut + Sync,
    DFut: Future<Output = std::result::Result<Node<D2, F2>, E>> + Send + 'a,
    FFut: Future<Output = std::result::Result<Node<D2, F2>, E>> + Send + 'a,
{
    async move {
        let pending = tree.entries.iter().map(|(segment, node)| async move {
            let mapped = match node {
                Node::File(info) => file_mapper(info).await?,
                Node::Directory(info, children) => {
                    let children = map_level_async(children, dir_mapper, file_mapper).await?;
                    dir_mapper(info, children).await?
                }
            };
            Ok::<_, E>((segment.clone(), mapped))
        });

        let entries = try_join_all(pending).await?;
        Ok(entries.into_iter().collect())
    }
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::sync::Mutex;

    type TestTree = FileTree<String, u32>;

    fn dir(name: &str, children: TestTree) -> Node<String, u32> {
        Node::Directory(name.to_string(), children)
    }

    fn sample_tree() -> TestTree {
        let mut src = TestTree::new();
        src.insert("lib.rs", Node::File(10));
        src.insert("main.rs", Node::File(20));

        let mut nested = TestTree::new();
        nested.insert("mod.rs", Node::File(5));
        src.insert("nested", dir("src/nested", nested));

        let mut root = TestTree::new();
        root.insert("src", dir("src", src));
        root.insert("README.md", Node::File(1));
        root
    }

    #[test]
    fn test_flatten_returns_all_leaves() {
        let tree = sample_tree();
        let mut leaves: Vec<u32> = tree.flatten().into_iter().copied().collect();
        leaves.sort_unstable();
        assert_eq!(leaves, vec![1, 5, 10, 20]);
        assert_eq!(tree.file_count(), 4);
    }

    #[test]
    fn test_flatten_is_stable() {
        let tree = sample_tree();
        assert_eq!(tree.flatten(), tree.flatten());
    }

    #[test]
    fn test_map_is_post_order() {
        let tree = sample_tree();
        let visited = RefCell::new(Vec::new());

        tree.map(
            |name: &String, children: FileTree<String, u32>| {
                visited.borrow_mut().push(name.clone());
                Node::Directory(name.clone(), children)
            },
            |value| Node::File(*value),
        );

        assert_eq!(*visited.borrow(), vec!["src/nested", "src"]);
    }

    #[test]
    fn test_map_receives_transformed_children() {
        let tree = sample_tree();

        // Collapse every directory into the sum of its (already summed) children.
        let summed: FileTree<(), u32> = tree.map(
            |_, children: FileTree<(), u32>| {
                Node::File(children.values().filter_map(Node::as_file).sum())
            },
            |value| Node::File(*value),
        );

        assert_eq!(summed.get("src"), Some(&Node::File(35)));
        assert_eq!(summed.get("README.md"), Some(&Node::File(1)));
    }

    #[tokio::test]
    async fn test_map_async_collapses_directories() {
        let tree = sample_tree();

        let summed: FileTree<(), u32> = tree
            .map_async(
                |_, children: FileTree<(), u32>| async move {
                    Ok::<_, Error>(Node::File(
                        children.values().filter_map(Node::as_file).sum(),
                    ))
                },
                |value| {
                    let value = *value;
                    async move { Ok(Node::File(value * 2)) }
                },
            )
            .await
            .unwrap();

        assert_eq!(summed.get("src"), Some(&Node::File(70)));
        assert_eq!(summed.get("README.md"), Some(&Node::File(2)));
    }

    #[tokio::test]
    async fn test_map_async_children_before_parent() {
        let tree = sample_tree();
        let events = Mutex::new(Vec::new());

        let _: FileTree<(), ()> = tree
            .map_async(
                |name: &String, _children| {
                    events.lock().unwrap().push(format!("dir:{name}"));
                    async { Ok::<_, Error>(Node::File(())) }
                },
                |value| {
                    events.lock().unwrap().push(format!("file:{value}"));
                    async { Ok(Node::File(())) }
                },
            )
            .await
            .unwrap();

        let events = events.into_inner().unwrap();
        let position = |label: &str| events.iter().position(|e| e == label).unwrap();

        assert!(position("file:5") < position("dir:src/nested"));
        assert!(position("dir:src/nested") < position("dir:src"));
        assert!(position("file:10") < position("dir:src"));
        assert!(position("file:20") < position("dir:src"));
    }

    #[tokio::test]
    async fn test_map_async_propagates_errors() {
        let tree = sample_tree();

        let result: std::result::Result<FileTree<(), ()>, Error> = tree
            .map_async(
                |name: &String, _children| {
                    let name = name.clone();
                    async move {
                        if name == "src/nested" {
                            Err(Error::parse("boom"))
                        } else {
                            Ok(Node::File(()))
                        }
                    }
                },
                |_| async { Ok(Node::File(())) },
            )
            .await;

        assert!(result.unwrap_err().is_parse());
    }

    #[test]
    fn test_merge_with_itself_is_identity() {
        let tree = sample_tree();
        let merged = tree.clone().merge(tree.clone()).unwrap();
        assert_eq!(merged, tree);
    }

    #[test]
    fn test_merge_combines_branches() {
        let mut left_src = TestTree::new();
        left_src.insert("a.rs", Node::File(1));
        let mut left = TestTree::new();
        left.insert("src", dir("src", left_src));

        let mut right_src = TestTree::new();
        right_src.insert("b.rs", Node::File(2));
        let mut right = TestTree::new();
        right.insert("src", dir("src", right_src));
        right.insert("Cargo.toml", Node::File(3));

        let merged = left.merge(right).unwrap();
        let src = merged.get("src").and_then(Node::children).unwrap();
        assert_eq!(src.len(), 2);
        assert_eq!(merged.file_count(), 3);
    }

    #[test]
    fn test_merge_duplicate_leaf_keeps_later() {
        let mut left = TestTree::new();
        left.insert("a.rs", Node::File(1));
        let mut right = TestTree::new();
        right.insert("a.rs", Node::File(2));

        let merged = left.merge(right).unwrap();
        assert_eq!(merged.get("a.rs"), Some(&Node::File(2)));
    }

    #[test]
    fn test_merge_file_directory_conflict() {
        let mut left = TestTree::new();
        left.insert("src", Node::File(1));
        let mut right = TestTree::new();
        right.insert("src", dir("src", TestTree::new()));

        let err = left.merge(right).unwrap_err();
        assert!(matches!(err, Error::PathConflict { ref path } if path == "src"));
    }
}
