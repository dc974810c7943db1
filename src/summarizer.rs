//! Hierarchical, token-bounded summarization of a repository dump.
//!
//! Every directory is reduced bottom-up: its children (files rendered as
//! `<file>` fragments, or already reduced subdirectories) are packed
//! first-fit into groups that stay below the token budget. A directory that
//! fits into one group is passed through untouched; otherwise every group is
//! summarized by the chat model and wrapped in a `<summary>` fragment.

use crate::{
    dump::{DirectoryInfo, FileInfo, RepositoryDump, file_xml},
    error::{Error, Result},
    llm::{ChatMessage, ChatModel},
    token::TokenEstimator,
    tree::{FileTree, Node},
};
use futures::future::{ready, try_join_all};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, info, trace};

const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// System prompt for summarizing one group of fragments.
pub const SUMMARIZE_PROMPT: &str = r#"
You will be provided with an XML file describing parts of a Git repository.
Your job is to summarize the content you are given in a way that it can later be given to you again with other summaries to get an understanding of the entire repository.
Therefore, analyze the following information in the upcoming XML:
- Dependencies on other important files or packages.
- Key functionalities of the file.
- Exported structure, such as public classes or functions, that can be used by other parts of the repository.
- Relation to other components of the repository as a whole.

The XML will contain two types of tags:
- The "file" tag will have an attribute for that file's path and contain the file's contents.
- The "summary" tag will have an attribute for a file's or directory's path and contain the summary for that part created previously by you.

Provide your output in a formal and factual tone in form of a document to be read.
"#;

/// A file or directory reduced to an XML fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummarizedNode {
    /// Repository-relative path of the file or directory
    pub path: String,
    /// `<file>` fragments, or `<summary>` fragments once reduced
    pub xml: String,
    /// Estimated token count of `xml`
    pub tokens: usize,
}

/// Result of summarizing a dump: every top-level entry collapsed to a leaf.
pub type SummaryTree = FileTree<(), SummarizedNode>;

/// Packs children into groups using first-fit.
///
/// A child joins the first group (in creation order) whose running total plus
/// the child's tokens stays strictly below `budget`; if there is none, it
/// opens a new group. A child at or above the budget always ends up alone.
#[must_use]
pub fn first_fit_groups(children: &[SummarizedNode], budget: usize) -> Vec<Vec<&SummarizedNode>> {
    let mut groups: Vec<(usize, Vec<&SummarizedNode>)> = Vec::new();

    for child in children {
        let slot = groups
            .iter_mut()
            .find(|(sum, _)| sum.saturating_add(child.tokens) < budget);

        match slot {
            Some((sum, members)) => {
                *sum += child.tokens;
                members.push(child);
            }
            None => groups.push((child.tokens, vec![child])),
        }
    }

    groups.into_iter().map(|(_, members)| members).collect()
}

/// Reduces a repository dump under a token budget.
pub struct Summarizer {
    model: Arc<dyn ChatModel>,
    estimator: Arc<dyn TokenEstimator>,
    budget: usize,
    permits: Semaphore,
    calls: AtomicUsize,
}

impl Summarizer {
    /// Creates a summarizer for the given budget.
    #[must_use]
    pub fn new(
        model: Arc<dyn ChatModel>,
        estimator: Arc<dyn TokenEstimator>,
        budget: usize,
    ) -> Self {
        Self {
            model,
            estimator,
            budget,
            permits: Semaphore::new(DEFAULT_MAX_CONCURRENCY),
            calls: AtomicUsize::new(0),
        }
    }

    /// Limits how many summarize calls may be in flight at once.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.permits = Semaphore::new(max_concurrency.max(1));
        self
    }

    /// Token budget every group must stay below.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Number of summarize calls issued so far.
    #[must_use]
    pub fn summarize_calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    /// Renders a file as a `<file>` fragment.
    #[must_use]
    pub fn file_node(&self, info: &FileInfo) -> SummarizedNode {
        let xml = file_xml(&info.path, &info.content);
        SummarizedNode {
            path: info.path.clone(),
            tokens: self.estimator.estimate(&xml),
            xml,
        }
    }

    /// Packs children into groups under this summarizer's budget.
    #[must_use]
    pub fn group_children<'a>(
        &self,
        children: &'a [SummarizedNode],
    ) -> Vec<Vec<&'a SummarizedNode>> {
        first_fit_groups(children, self.budget)
    }

    /// Reduces the children of one directory to a single node.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Summarization`] if any group fails to summarize.
    pub async fn reduce_directory(
        &self,
        path: &str,
        children: Vec<SummarizedNode>,
    ) -> Result<SummarizedNode> {
        let groups = self.group_children(&children);
        let merged: Vec<String> = groups
            .iter()
            .map(|group| group.iter().map(|child| child.xml.as_str()).collect())
            .collect();

        if merged.len() <= 1 {
            trace!("'{}' fits into a single group", path);
            let xml = merged.into_iter().next().unwrap_or_default();
            return Ok(SummarizedNode {
                path: path.to_string(),
                tokens: self.estimator.estimate(&xml),
                xml,
            });
        }

        debug!(
            "'{}' needs {} groups for {} children (budget {})",
            path,
            merged.len(),
            children.len(),
            self.budget
        );

        let pending = merged
            .iter()
            .map(|group_xml| self.summarize_part(path, group_xml));
        let xml: String = try_join_all(pending).await?.concat();

        Ok(SummarizedNode {
            path: path.to_string(),
            tokens: self.estimator.estimate(&xml),
            xml,
        })
    }

    /// Summarizes one group and wraps the result in a `<summary>` fragment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Summarization`] if the chat model fails.
    pub async fn summarize_part(&self, path: &str, xml: &str) -> Result<String> {
        let wrap_error = |message: String| Error::Summarization {
            path: path.to_string(),
            message,
        };

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| wrap_error(e.to_string()))?;

        self.calls.fetch_add(1, Ordering::Relaxed);
        let summary = self
            .model
            .chat(SUMMARIZE_PROMPT, &[ChatMessage::user(xml)])
            .await
            .map_err(|e| wrap_error(e.to_string()))?;

        Ok(format!("<summary path=\"{path}\">{summary}</summary>"))
    }

    /// Reduces the whole dump. Every top-level entry becomes a leaf.
    ///
    /// # Errors
    ///
    /// Fails as soon as any summarize call fails; no partial tree is returned.
    pub async fn summarize(&self, dump: &RepositoryDump) -> Result<SummaryTree> {
        let tree = dump
            .tree()
            .map_async(
                |info: &DirectoryInfo, children: SummaryTree| {
                    let path = info.path.clone();
                    async move {
                        let nodes = children.into_values().filter_map(|node| match node {
                            Node::File(summary) => Some(summary),
                            Node::Directory(..) => None,
                        });
                        self.reduce_directory(&path, nodes.collect())
                            .await
                            .map(Node::File)
                    }
                },
                |info: &FileInfo| ready(Ok(Node::File(self.file_node(info)))),
            )
            .await?;

        info!(
            "Reduced {} files to {} top-level fragments with {} summarize calls",
            dump.count_files(),
            tree.len(),
            self.summarize_calls()
        );

        Ok(tree)
    }

    /// Joins the top-level fragments into the final digest.
    #[must_use]
    pub fn digest(tree: &SummaryTree) -> String {
        tree.values()
            .filter_map(Node::as_file)
            .map(|node| node.xml.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CharEstimator, ScriptedModel};

    fn node(path: &str, tokens: usize) -> SummarizedNode {
        SummarizedNode {
            path: path.to_string(),
            xml: format!("<file path=\"{path}\">{}</file>", "x".repeat(tokens)),
            tokens,
        }
    }

    fn summarizer(model: &Arc<ScriptedModel>, budget: usize) -> Summarizer {
        Summarizer::new(model.clone(), Arc::new(CharEstimator), budget)
    }

    #[test]
    fn test_first_fit_places_in_first_group() {
        let children = vec![node("a", 100), node("b", 150), node("c", 200)];
        let groups = first_fit_groups(&children, 400);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[0][0].path, "a");
        assert_eq!(groups[0][1].path, "b");
        assert_eq!(groups[1][0].path, "c");
    }

    #[test]
    fn test_first_fit_backfills_earlier_groups() {
        // 300 opens group 1, 250 opens group 2, 50 goes back into group 1.
        let children = vec![node("a", 300), node("b", 250), node("c", 50)];
        let groups = first_fit_groups(&children, 400);

        assert_eq!(groups.len(), 2);
        let first: Vec<&str> = groups[0].iter().map(|n| n.path.as_str()).collect();
        assert_eq!(first, vec!["a", "c"]);
    }

    #[test]
    fn test_first_fit_sum_stays_below_budget() {
        let sizes = [90, 10, 45, 60, 5, 99, 30, 30, 1, 70, 20, 64];
        let children: Vec<SummarizedNode> = sizes
            .iter()
            .enumerate()
            .map(|(i, &tokens)| node(&format!("f{i}"), tokens))
            .collect();
        let budget = 100;

        let groups = first_fit_groups(&children, budget);

        let placed: usize = groups.iter().map(Vec::len).sum();
        assert_eq!(placed, children.len());
        for group in &groups {
            let sum: usize = group.iter().map(|n| n.tokens).sum();
            assert!(sum < budget, "group sum {sum} reached the budget");
        }
    }

    #[test]
    fn test_first_fit_strict_inequality() {
        let children = vec![node("a", 200), node("b", 200)];
        assert_eq!(first_fit_groups(&children, 400).len(), 2);
        assert_eq!(first_fit_groups(&children, 401).len(), 1);
    }

    #[test]
    fn test_first_fit_oversized_child_alone() {
        let children = vec![node("small", 10), node("huge", 1_000), node("tiny", 5)];
        let groups = first_fit_groups(&children, 100);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[1][0].path, "huge");
    }

    #[tokio::test]
    async fn test_scenario_two_groups_two_calls() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 400);

        let children = vec![node("src/a", 100), node("src/b", 150), node("src/c", 200)];
        let reduced = summarizer.reduce_directory("src", children).await.unwrap();

        assert_eq!(model.call_count(), 2);
        assert_eq!(summarizer.summarize_calls(), 2);
        assert_eq!(reduced.xml.matches("<summary path=\"src\">").count(), 2);
        assert_eq!(reduced.xml.matches("</summary>").count(), 2);
        assert_eq!(reduced.tokens, reduced.xml.chars().count());

        let calls = model.calls();
        assert!(calls[0].user.contains("src/a") && calls[0].user.contains("src/b"));
        assert!(calls[1].user.contains("src/c"));
    }

    #[derive(Default)]
    struct InFlightModel {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChatModel for InFlightModel {
        fn name(&self) -> &str {
            "in-flight"
        }

        fn context_window(&self) -> usize {
            10_000
        }

        async fn chat(&self, _system: &str, _messages: &[ChatMessage]) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("done".to_string())
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_bounded_by_limit() {
        let model = Arc::new(InFlightModel::default());
        let summarizer = Summarizer::new(model.clone(), Arc::new(CharEstimator), 50)
            .with_max_concurrency(2);
        let children: Vec<SummarizedNode> =
            (0..6).map(|i| node(&format!("wide/f{i}"), 40)).collect();

        let reduced = summarizer.reduce_directory("wide", children).await.unwrap();

        assert_eq!(summarizer.summarize_calls(), 6);
        assert_eq!(reduced.xml.matches("<summary path=\"wide\">done</summary>").count(), 6);
        let peak = model.peak.load(Ordering::SeqCst);
        assert!(peak <= 2, "{peak} calls were in flight at once");
        assert!(peak > 1, "sibling groups never overlapped");
        assert_eq!(model.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_single_group_is_verbatim() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 1_000);
        let children = vec![node("lib/a", 10), node("lib/b", 20)];
        let expected: String = children.iter().map(|c| c.xml.as_str()).collect();

        let reduced = summarizer.reduce_directory("lib", children).await.unwrap();

        assert_eq!(model.call_count(), 0);
        assert_eq!(reduced.xml, expected);
        assert_eq!(reduced.path, "lib");
    }

    #[tokio::test]
    async fn test_empty_directory_is_single_empty_group() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 10);

        let reduced = summarizer.reduce_directory("empty", Vec::new()).await.unwrap();

        assert_eq!(model.call_count(), 0);
        assert!(reduced.xml.is_empty());
        assert_eq!(reduced.tokens, 0);
    }

    #[tokio::test]
    async fn test_multi_group_wraps_every_group() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 50);
        let children: Vec<SummarizedNode> =
            (0..5).map(|i| node(&format!("pkg/f{i}"), 40)).collect();

        let reduced = summarizer.reduce_directory("pkg", children).await.unwrap();

        assert_eq!(model.call_count(), 5);
        assert_eq!(reduced.xml.matches("<summary path=\"pkg\">").count(), 5);
        for n in 1..=5 {
            assert!(reduced.xml.contains(&format!("summary {n}")));
        }
    }

    #[tokio::test]
    async fn test_summarize_passes_small_repository_through() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 10_000);
        let dump = RepositoryDump::from_file_contents([
            ("src/lib.rs", "pub mod a;"),
            ("src/a.rs", "pub fn a() {}"),
            ("README.md", "# readme"),
        ])
        .unwrap();

        let tree = summarizer.summarize(&dump).await.unwrap();
        let digest = Summarizer::digest(&tree);

        assert_eq!(model.call_count(), 0);
        assert_eq!(tree.len(), 2);
        assert_eq!(
            digest,
            "<file path=\"README.md\"># readme</file>\n\
             <file path=\"src/a.rs\">pub fn a() {}</file><file path=\"src/lib.rs\">pub mod a;</file>"
        );
    }

    #[tokio::test]
    async fn test_summarize_reduces_nested_directories() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        // Each <file> fragment is ~40 characters; two never fit under 60.
        let summarizer = summarizer(&model, 60);
        let dump = RepositoryDump::from_file_contents([
            ("app/core/one.rs", "1111111111"),
            ("app/core/two.rs", "2222222222"),
            ("app/main.rs", "fn main(){}"),
        ])
        .unwrap();

        let tree = summarizer.summarize(&dump).await.unwrap();
        let app = tree.get("app").and_then(Node::as_file).unwrap();

        assert_eq!(app.path, "app");
        // app/core needs 2 calls; app then holds two large children again.
        assert!(model.call_count() >= 2);
        assert!(app.xml.contains("<summary path=\"app"));
        assert_eq!(tree.file_count(), 1);
    }

    #[tokio::test]
    async fn test_summarize_failure_is_fatal() {
        let model = Arc::new(ScriptedModel::failing(10_000));
        let summarizer = summarizer(&model, 30);
        let dump = RepositoryDump::from_file_contents([
            ("src/a.rs", "aaaaaaaaaaaaaaaaaaaa"),
            ("src/b.rs", "bbbbbbbbbbbbbbbbbbbb"),
        ])
        .unwrap();

        let err = summarizer.summarize(&dump).await.unwrap_err();
        match err {
            Error::Summarization { path, message } => {
                assert_eq!(path, "src");
                assert!(message.contains("rate limited"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_oversized_file_is_not_split() {
        let model = Arc::new(ScriptedModel::numbered(10_000));
        let summarizer = summarizer(&model, 10);
        let dump = RepositoryDump::from_file_contents([("big.txt", "x".repeat(500))]).unwrap();

        let tree = summarizer.summarize(&dump).await.unwrap();
        let big = tree.get("big.txt").and_then(Node::as_file).unwrap();

        assert_eq!(model.call_count(), 0);
        assert!(big.tokens > summarizer.budget());
    }
}
