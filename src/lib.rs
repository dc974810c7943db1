//! # repo-digest
//!
//! Hierarchical, token-bounded repository summarization and LLM analysis.
//!
//! ## Features
//!
//! - Parallel file scanning with `.gitignore` support
//! - Bottom-up summarization that keeps every model call under a token budget
//! - Structured repository analysis with a Mermaid component graph
//! - In-memory retrieval index for follow-up questions
//! - Anthropic, Gemini, Groq and Ollama chat backends
//! - Atomic output writes with automatic backups
//!
//! ## Quick Start
//!
//! ```no_run
//! use repo_digest::{Config, HttpChatModel, Pipeline, ProviderConfig};
//! use std::sync::Arc;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let provider = ProviderConfig::from_parts("groq", Some("gsk-...".into()), None)?;
//! let model = Arc::new(HttpChatModel::new(provider)?);
//!
//! let config = Config::builder()
//!     .root_dir("./my-project")
//!     .output_dir("./analysis")
//!     .build()?;
//!
//! let mut pipeline = Pipeline::new(config, model)?;
//! let outcome = pipeline.run().await?;
//! println!("{}", outcome.analysis.summary.purpose);
//!
//! let answer = pipeline.ask("Where is the entry point?").await?;
//! println!("{answer}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! The library follows a pipeline architecture:
//! 1. **Scanner**: Reads text files into a [`RepositoryDump`]
//! 2. **Summarizer**: Packs siblings first-fit under the budget and
//!    summarizes every group that does not fit a single call
//! 3. **Analyzer**: Indexes retrieval chunks and requests the final analysis
//! 4. **Writer**: Persists the analysis, the digest and a Markdown report

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod analysis;
mod config;
mod documents;
mod dump;
mod error;
mod file;
mod filter;
mod llm;
mod pipeline;
mod provider;
mod retrieval;
mod scanner;
mod summarizer;
mod template;
mod token;
mod tree;
mod writer;

#[cfg(test)]
mod test_support;

pub use analysis::{
    ANALYSIS_PROMPT, ComponentEdge, ComponentGraph, IMPORTANCE_RANGE, KeyFile, MAX_DEPENDENCIES,
    MAX_FURTHER_QUESTIONS, MAX_GRAPH_NODES, RepoAnalysis, RepoSummary, analysis_schema,
};
pub use config::{AnalysisMode, Config, ConfigBuilder};
pub use documents::{
    ChunkMetadata, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DocumentChunk, DocumentExtractor,
};
pub use dump::{DirectoryInfo, DumpTree, FileInfo, RepositoryDump, file_xml};
pub use error::{Error, Result};
pub use file::{SourceFile, is_binary_content};
pub use filter::FileFilterConfig;
pub use llm::{ChatMessage, ChatModel, Role, parse_json_response, strip_code_fence};
pub use pipeline::{ASK_PROMPT, AnalysisOutcome, AnalysisStats, Analyzer, Pipeline, RunState};
pub use provider::{
    ANTHROPIC_MODELS, GEMINI_MODELS, GROQ_MODELS, HttpChatModel, ModelInfo, ProviderConfig,
};
pub use retrieval::{MemoryIndex, RetrievalIndex};
pub use scanner::ScanStats;
pub use summarizer::{SUMMARIZE_PROMPT, SummarizedNode, Summarizer, SummaryTree, first_fit_groups};
pub use token::{TokenEstimator, TokenizerKind};
pub use tree::{FileTree, Node};
pub use writer::{ANALYSIS_FILE, DIGEST_FILE, REPORT_FILE};

/// Runs the complete pipeline with the given configuration and model.
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - No processable files are found
/// - A model call fails or its reply does not match the analysis schema
/// - Output files cannot be written
pub async fn run(
    config: Config,
    model: std::sync::Arc<dyn ChatModel>,
) -> Result<AnalysisOutcome> {
    Pipeline::new(config, model)?.run().await
}
