use crate::documents::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DocumentExtractor};
use crate::error::{Error, Result};
use crate::filter::FileFilterConfig;
use crate::token::TokenizerKind;
use std::path::PathBuf;

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_RETRIEVAL_K: usize = 4;

/// How the final analysis is requested from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AnalysisMode {
    /// Ask the provider for schema-constrained JSON
    Structured,
    /// Ask for free text and parse the JSON out of it
    #[default]
    FreeText,
}

impl AnalysisMode {
    /// Short name used in logs and reports.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::FreeText => "free-text",
        }
    }
}

/// Configuration for a repo-digest run.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Root directory of the checked-out repository
    pub root_dir: PathBuf,

    /// Output directory for the analysis, digest and report
    pub output_dir: PathBuf,

    /// Token estimator used for budgets
    pub tokenizer: TokenizerKind,

    /// Retrieval chunk length in characters
    pub chunk_size: usize,

    /// Overlap between retrieval chunks in characters
    pub chunk_overlap: usize,

    /// Attach each file's full content to its chunks
    pub include_full_content: bool,

    /// Maximum summarize calls in flight
    pub max_concurrency: usize,

    /// Structured or free-text final call
    pub analysis_mode: AnalysisMode,

    /// Overrides the provider's context window
    pub context_window: Option<usize>,

    /// Number of chunks used as context for follow-up questions
    pub retrieval_k: usize,

    /// Include/exclude glob patterns for ingestion
    pub file_filter_config: FileFilterConfig,

    /// Create backups of existing output files
    pub backup_existing: bool,

    /// Dry run mode (no file writes)
    pub dry_run: bool,

    /// Path to an external report template
    pub template_path: Option<PathBuf>,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```
    /// use repo_digest::Config;
    ///
    /// let config = Config::builder()
    ///     .root_dir("./src")
    ///     .chunk_size(800)
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Root directory doesn't exist
    /// - Chunk sizes are invalid
    /// - Concurrency or context window is zero
    /// - The report template is missing or invalid
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.exists() {
            return Err(Error::config(format!(
                "Root directory does not exist: {}",
                self.root_dir.display()
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(Error::config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }

        if self.chunk_size == 0 {
            return Err(Error::config("chunk_size must be greater than 0"));
        }

        if self.chunk_overlap >= self.chunk_size {
            return Err(Error::config(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }

        if self.max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be greater than 0"));
        }

        if self.retrieval_k == 0 {
            return Err(Error::config("retrieval_k must be greater than 0"));
        }

        if self.context_window == Some(0) {
            return Err(Error::config("context_window must be greater than 0"));
        }

        if let Some(ref template_path) = self.template_path {
            if !template_path.is_file() {
                return Err(Error::config(format!(
                    "Template file does not exist: {}",
                    template_path.display()
                )));
            }

            crate::template::ReportRenderer::validate_template(template_path)?;
        }

        Ok(())
    }

    /// Builds the document extractor described by this configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk sizes are invalid.
    pub fn extractor(&self) -> Result<DocumentExtractor> {
        DocumentExtractor::new(self.chunk_size, self.chunk_overlap, self.include_full_content)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            output_dir: PathBuf::from("out"),
            tokenizer: TokenizerKind::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            include_full_content: true,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            analysis_mode: AnalysisMode::default(),
            context_window: None,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            file_filter_config: FileFilterConfig::default(),
            backup_existing: true,
            dry_run: false,
            template_path: None,
        }
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    root_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    tokenizer: Option<TokenizerKind>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
    include_full_content: Option<bool>,
    max_concurrency: Option<usize>,
    analysis_mode: Option<AnalysisMode>,
    context_window: Option<usize>,
    retrieval_k: Option<usize>,
    file_filter_config: Option<FileFilterConfig>,
    backup_existing: Option<bool>,
    dry_run: bool,
    template_path: Option<PathBuf>,
}

impl ConfigBuilder {
    /// Sets the repository root.
    #[must_use]
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(path.into());
        self
    }

    /// Sets the output directory.
    #[must_use]
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(path.into());
        self
    }

    /// Sets the tokenizer implementation.
    #[must_use]
    pub fn tokenizer(mut self, kind: TokenizerKind) -> Self {
        self.tokenizer = Some(kind);
        self
    }

    /// Sets the retrieval chunk size in characters.
    #[must_use]
    pub fn chunk_size(mut self, chars: usize) -> Self {
        self.chunk_size = Some(chars);
        self
    }

    /// Sets the retrieval chunk overlap in characters.
    #[must_use]
    pub fn chunk_overlap(mut self, chars: usize) -> Self {
        self.chunk_overlap = Some(chars);
        self
    }

    /// Attaches or omits full file content on chunks.
    #[must_use]
    pub fn include_full_content(mut self, enabled: bool) -> Self {
        self.include_full_content = Some(enabled);
        self
    }

    /// Sets the maximum number of concurrent summarize calls.
    #[must_use]
    pub fn max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = Some(limit);
        self
    }

    /// Sets the analysis mode.
    #[must_use]
    pub fn analysis_mode(mut self, mode: AnalysisMode) -> Self {
        self.analysis_mode = Some(mode);
        self
    }

    /// Overrides the provider's context window.
    #[must_use]
    pub fn context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Sets how many chunks back a follow-up answer.
    #[must_use]
    pub fn retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = Some(k);
        self
    }

    /// Sets the ingestion glob filter.
    #[must_use]
    pub fn file_filter_config(mut self, config: FileFilterConfig) -> Self {
        self.file_filter_config = Some(config);
        self
    }

    /// Enables or disables backup creation.
    #[must_use]
    pub fn backup_existing(mut self, enabled: bool) -> Self {
        self.backup_existing = Some(enabled);
        self
    }

    /// Enables dry run mode (no file writes).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Sets the path to an external report template.
    ///
    /// The file must exist and contain valid Tera syntax.
    #[must_use]
    pub fn template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let defaults = Config::default();
        let config = Config {
            root_dir: self.root_dir.unwrap_or(defaults.root_dir),
            output_dir: self.output_dir.unwrap_or(defaults.output_dir),
            tokenizer: self.tokenizer.unwrap_or(defaults.tokenizer),
            chunk_size: self.chunk_size.unwrap_or(defaults.chunk_size),
            chunk_overlap: self.chunk_overlap.unwrap_or(defaults.chunk_overlap),
            include_full_content: self
                .include_full_content
                .unwrap_or(defaults.include_full_content),
            max_concurrency: self.max_concurrency.unwrap_or(defaults.max_concurrency),
            analysis_mode: self.analysis_mode.unwrap_or(defaults.analysis_mode),
            context_window: self.context_window,
            retrieval_k: self.retrieval_k.unwrap_or(defaults.retrieval_k),
            file_filter_config: self.file_filter_config.unwrap_or_default(),
            backup_existing: self.backup_existing.unwrap_or(defaults.backup_existing),
            dry_run: self.dry_run,
            template_path: self.template_path,
        };

        config.validate()?;
        Ok(config)
    }
}
