use crate::{
    analysis::{ANALYSIS_PROMPT, RepoAnalysis, analysis_schema},
    config::{AnalysisMode, Config},
    documents::{DocumentChunk, DocumentExtractor},
    dump::RepositoryDump,
    error::{Error, Result},
    llm::{ChatMessage, ChatModel, parse_json_response},
    retrieval::{MemoryIndex, RetrievalIndex},
    scanner::Scanner,
    summarizer::{SUMMARIZE_PROMPT, Summarizer},
    token::{TokenEstimator, TokenizerKind},
    writer::Writer,
};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

const DEFAULT_MAX_CONCURRENCY: usize = 4;
const DEFAULT_RETRIEVAL_K: usize = 4;

/// System prompt for follow-up questions answered from retrieved chunks.
pub const ASK_PROMPT: &str = r#"
You answer questions about a software repository.
The user message contains excerpts of the repository inside <chunk> tags, followed by a question.
Answer using only these excerpts. If they do not contain the answer, say so plainly.
Refer to files by their path.
"#;

/// Phase of an [`Analyzer`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum RunState {
    /// Nothing has run yet
    #[default]
    Idle,
    /// Reducing the dump to a digest
    Summarizing,
    /// Extracting and indexing retrieval chunks
    Indexing,
    /// Waiting on the final analysis call or a follow-up answer
    Querying,
    /// The last operation succeeded
    Done,
    /// The last operation failed
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Summarizing => "summarizing",
            Self::Indexing => "indexing",
            Self::Querying => "querying",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Statistics collected while analyzing a repository.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalysisStats {
    /// Files seen by the scanner
    pub scanned_files: usize,

    /// Binary files skipped by the scanner
    pub binary_files: usize,

    /// Text files in the dump
    pub files: usize,

    /// Fragments left at the top level after reduction
    pub top_level_fragments: usize,

    /// Estimated tokens of the final digest
    pub digest_tokens: usize,

    /// Token budget every summarize group stayed below
    pub budget: usize,

    /// Summarize calls issued during reduction
    pub summarize_calls: usize,

    /// Retrieval chunks added to the index
    pub chunks_indexed: usize,

    /// Total execution time
    pub duration: Duration,

    /// Time spent scanning
    pub scan_duration: Duration,

    /// Time spent summarizing
    pub summarize_duration: Duration,

    /// Time spent indexing and waiting on the final call
    pub analysis_duration: Duration,

    /// Time spent writing
    pub write_duration: Duration,

    /// Output directory path
    pub output_directory: String,

    /// Number of files written
    pub files_written: usize,
}

impl AnalysisStats {
    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║            Repository Digest Summary                  ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Files Scanned:        {:>8}                        ║",
            self.scanned_files
        );
        println!(
            "║   - Text files:       {:>8}                        ║",
            self.files
        );
        println!(
            "║   - Binary files:     {:>8}                        ║",
            self.binary_files
        );
        println!("║                                                       ║");
        println!(
            "║ Token Budget:         {:>8} tokens                 ║",
            self.budget
        );
        println!(
            "║ Summarize Calls:      {:>8}                        ║",
            self.summarize_calls
        );
        println!(
            "║ Top-level Fragments:  {:>8}                        ║",
            self.top_level_fragments
        );
        println!(
            "║ Digest Size:          {:>8} tokens                 ║",
            self.digest_tokens
        );
        println!(
            "║ Chunks Indexed:       {:>8}                        ║",
            self.chunks_indexed
        );
        println!("║                                                       ║");
        println!(
            "║ Files Written:        {:>8}                        ║",
            self.files_written
        );
        println!("║ Output Directory:                                     ║");
        println!(
            "║   {}                                              ║",
            self.output_directory
        );
        println!("║                                                       ║");
        println!("║ Timing Breakdown:                                     ║");
        println!(
            "║   - Scanning:         {:>8.2}s                     ║",
            self.scan_duration.as_secs_f64()
        );
        println!(
            "║   - Summarizing:      {:>8.2}s                     ║",
            self.summarize_duration.as_secs_f64()
        );
        println!(
            "║   - Analyzing:        {:>8.2}s                     ║",
            self.analysis_duration.as_secs_f64()
        );
        println!(
            "║   - Writing:          {:>8.2}s                     ║",
            self.write_duration.as_secs_f64()
        );
        println!(
            "║   - Total:            {:>8.2}s                     ║",
            self.duration.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }

    /// Ratio of digest tokens to the budget; above 1.0 the digest alone
    /// overflows a single context window.
    #[must_use]
    pub fn budget_usage(&self) -> f64 {
        if self.budget == 0 {
            return 0.0;
        }
        self.digest_tokens as f64 / self.budget as f64
    }
}

/// Result of a successful [`Analyzer::analyze`].
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    /// Validated structured analysis
    pub analysis: RepoAnalysis,

    /// Top-level fragments joined by newlines
    pub digest: String,

    /// Run statistics
    pub stats: AnalysisStats,
}

/// Drives summarization, indexing and the final analysis call for one
/// repository.
///
/// The retrieval index is populated by [`Analyzer::analyze`] and can then
/// be queried with [`Analyzer::ask`]. Both take `&mut self`, so one analyzer
/// never runs two operations at once.
pub struct Analyzer {
    model: Arc<dyn ChatModel>,
    estimator: Arc<dyn TokenEstimator>,
    index: Arc<dyn RetrievalIndex>,
    extractor: DocumentExtractor,
    mode: AnalysisMode,
    max_concurrency: usize,
    context_window: Option<usize>,
    retrieval_k: usize,
    state: watch::Sender<RunState>,
}

impl Analyzer {
    /// Creates an analyzer with an in-memory index and default settings.
    #[must_use]
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            estimator: TokenizerKind::default().create(),
            index: Arc::new(MemoryIndex::new()),
            extractor: DocumentExtractor::default(),
            mode: AnalysisMode::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            context_window: None,
            retrieval_k: DEFAULT_RETRIEVAL_K,
            state: watch::Sender::new(RunState::Idle),
        }
    }

    /// Creates an analyzer from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk settings are invalid.
    pub fn from_config(model: Arc<dyn ChatModel>, config: &Config) -> Result<Self> {
        let mut analyzer = Self::new(model)
            .with_estimator(config.tokenizer.create())
            .with_extractor(config.extractor()?)
            .with_mode(config.analysis_mode)
            .with_max_concurrency(config.max_concurrency)
            .with_retrieval_k(config.retrieval_k);
        analyzer.context_window = config.context_window;
        Ok(analyzer)
    }

    /// Uses a different token estimator for budgets.
    #[must_use]
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replaces the in-memory index.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn RetrievalIndex>) -> Self {
        self.index = index;
        self
    }

    /// Uses different chunk settings for indexing.
    #[must_use]
    pub fn with_extractor(mut self, extractor: DocumentExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// Selects structured or free-text analysis.
    #[must_use]
    pub fn with_mode(mut self, mode: AnalysisMode) -> Self {
        self.mode = mode;
        self
    }

    /// Bounds the number of summarize calls in flight.
    #[must_use]
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit.max(1);
        self
    }

    /// Uses `tokens` instead of the model's advertised context window.
    #[must_use]
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = Some(tokens);
        self
    }

    /// Number of chunks handed to the model by [`Analyzer::ask`].
    #[must_use]
    pub fn with_retrieval_k(mut self, k: usize) -> Self {
        self.retrieval_k = k.max(1);
        self
    }

    /// Current run state.
    #[must_use]
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Receiver observing every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Name reported by the chat model.
    #[must_use]
    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Context window minus the summarize prompt overhead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the prompt alone fills the window.
    pub fn budget(&self) -> Result<usize> {
        let window = self
            .context_window
            .unwrap_or_else(|| self.model.context_window());
        let overhead = self.estimator.estimate(SUMMARIZE_PROMPT);

        match window.checked_sub(overhead) {
            Some(budget) if budget > 0 => Ok(budget),
            _ => Err(Error::config(format!(
                "Context window of {window} tokens leaves no room after the {overhead}-token summarize prompt"
            ))),
        }
    }

    fn transition(&self, next: RunState) {
        let previous = self.state.send_replace(next);
        debug!("Analyzer state: {} -> {}", previous, next);
    }

    /// Summarizes the dump, indexes its chunks and requests the analysis.
    ///
    /// # Process
    ///
    /// 1. **Summarize**: Reduces the dump bottom-up under the token budget
    /// 2. **Index**: Splits every file into retrieval chunks
    /// 3. **Analyze**: Sends the digest with the analysis prompt
    ///
    /// Indexing and the analysis call run concurrently; both must succeed.
    ///
    /// # Errors
    ///
    /// Returns an error if the budget is empty, any summarize call fails,
    /// the index was already populated, or the reply does not parse into a
    /// valid [`RepoAnalysis`].
    #[instrument(skip_all, fields(model = %self.model.name(), files = dump.count_files()))]
    pub async fn analyze(&mut self, dump: &RepositoryDump) -> Result<AnalysisOutcome> {
        let result = self.run_analysis(dump).await;
        self.finish(&result);
        result
    }

    async fn run_analysis(&self, dump: &RepositoryDump) -> Result<AnalysisOutcome> {
        if self.index.is_initialized() {
            return Err(Error::IndexAlreadyInitialized);
        }

        let budget = self.budget()?;
        let mut stats = AnalysisStats {
            files: dump.count_files(),
            budget,
            ..AnalysisStats::default()
        };

        self.transition(RunState::Summarizing);
        let summarize_start = Instant::now();
        let summarizer =
            Summarizer::new(Arc::clone(&self.model), Arc::clone(&self.estimator), budget)
                .with_max_concurrency(self.max_concurrency);
        let tree = summarizer.summarize(dump).await?;
        let digest = Summarizer::digest(&tree);
        stats.summarize_duration = summarize_start.elapsed();
        stats.summarize_calls = summarizer.summarize_calls();
        stats.top_level_fragments = tree.len();
        stats.digest_tokens = self.estimator.estimate(&digest);

        info!(
            "✓ Reduced {} files to {} tokens with {} summarize calls in {:.2}s",
            stats.files,
            stats.digest_tokens,
            stats.summarize_calls,
            stats.summarize_duration.as_secs_f64()
        );

        if stats.digest_tokens >= budget {
            warn!(
                "Digest ({} tokens) exceeds the budget of {} tokens; the model may truncate it",
                stats.digest_tokens, budget
            );
        }

        self.transition(RunState::Indexing);
        let analysis_start = Instant::now();
        let indexing = async {
            let documents = self.extractor.extract(dump);
            let indexed = self.index.index_documents(documents).await?;
            self.transition(RunState::Querying);
            Ok::<_, Error>(indexed)
        };
        let querying = self.request_analysis(&digest);
        let (chunks_indexed, value) = tokio::try_join!(indexing, querying)?;
        let analysis = RepoAnalysis::from_value(value)?;
        stats.chunks_indexed = chunks_indexed;
        stats.analysis_duration = analysis_start.elapsed();

        info!(
            "✓ Indexed {} chunks and received analysis in {:.2}s",
            chunks_indexed,
            stats.analysis_duration.as_secs_f64()
        );

        Ok(AnalysisOutcome {
            analysis,
            digest,
            stats,
        })
    }

    async fn request_analysis(&self, digest: &str) -> Result<Value> {
        let messages = [ChatMessage::user(digest)];
        debug!("Requesting {} analysis", self.mode.as_str());

        match self.mode {
            AnalysisMode::Structured => {
                self.model
                    .chat_structured(ANALYSIS_PROMPT.as_str(), &messages, &analysis_schema())
                    .await
            }
            AnalysisMode::FreeText => {
                let reply = self.model.chat(ANALYSIS_PROMPT.as_str(), &messages).await?;
                parse_json_response(&reply)
            }
        }
    }

    /// Answers a follow-up question from the indexed chunks.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IndexNotInitialized`] before [`Analyzer::analyze`],
    /// or the chat model's error.
    #[instrument(skip(self))]
    pub async fn ask(&mut self, question: &str) -> Result<String> {
        self.transition(RunState::Querying);
        let result = self.answer(question).await;
        self.finish(&result);
        result
    }

    async fn answer(&self, question: &str) -> Result<String> {
        let chunks = self.index.query(question, self.retrieval_k).await?;
        debug!("Answering with {} retrieved chunks", chunks.len());

        let prompt = question_prompt(&chunks, question);
        self.model.chat(ASK_PROMPT, &[ChatMessage::user(prompt)]).await
    }

    fn finish<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => self.transition(RunState::Done),
            Err(e) => {
                warn!("Analyzer failed: {}", e);
                self.transition(RunState::Failed);
            }
        }
    }
}

fn question_prompt(chunks: &[DocumentChunk], question: &str) -> String {
    let excerpts: String = chunks
        .iter()
        .map(|chunk| {
            format!(
                "<chunk path=\"{}\">\n{}\n</chunk>\n",
                chunk.metadata.path, chunk.page_content
            )
        })
        .collect();

    format!("{excerpts}\nQuestion: {question}")
}

/// Main pipeline orchestrator: scan, analyze, write.
pub struct Pipeline {
    config: Config,
    scanner: Scanner,
    analyzer: Analyzer,
    writer: Writer,
}

impl Pipeline {
    /// Creates a new pipeline with the given configuration and chat model.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - A filter pattern is invalid
    /// - Writer initialization fails
    pub fn new(config: Config, model: Arc<dyn ChatModel>) -> Result<Self> {
        config.validate()?;

        let scanner = Scanner::new(&config)?;
        let analyzer = Analyzer::from_config(model, &config)?;
        let writer = Writer::new(&config)?;

        Ok(Self {
            config,
            scanner,
            analyzer,
            writer,
        })
    }

    /// Current state of the underlying analyzer.
    #[must_use]
    pub fn state(&self) -> RunState {
        self.analyzer.state()
    }

    /// Executes the complete pipeline and returns the outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if any stage fails.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use repo_digest::{Config, HttpChatModel, Pipeline, ProviderConfig};
    /// use std::sync::Arc;
    ///
    /// # async fn demo() -> anyhow::Result<()> {
    /// let provider = ProviderConfig::from_parts("ollama", None, None)?;
    /// let model = Arc::new(HttpChatModel::new(provider)?);
    /// let config = Config::builder().root_dir(".").build()?;
    ///
    /// let outcome = Pipeline::new(config, model)?.run().await?;
    /// outcome.stats.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(root_dir = %self.config.root_dir.display()))]
    pub async fn run(&mut self) -> Result<AnalysisOutcome> {
        let start_time = Instant::now();

        info!("Stage 1/3: Scanning repository...");
        let scan_start = Instant::now();
        let (dump, scan_stats) = self.scanner.scan_dump()?;
        let scan_duration = scan_start.elapsed();

        info!(
            "✓ Scanned {} files ({} text, {} binary) in {:.2}s",
            scan_stats.total_files,
            scan_stats.text_files,
            scan_stats.binary_files,
            scan_duration.as_secs_f64()
        );

        info!("Stage 2/3: Analyzing repository...");
        let mut outcome = self.analyzer.analyze(&dump).await?;

        let write_start = Instant::now();
        let files_written = if self.config.dry_run {
            warn!("Dry run mode enabled - skipping file writes");
            0
        } else {
            info!("Stage 3/3: Writing output files...");
            self.writer.write(&outcome, self.analyzer.model_name())?
        };
        let write_duration = write_start.elapsed();

        let stats = &mut outcome.stats;
        stats.scanned_files = scan_stats.total_files;
        stats.binary_files = scan_stats.binary_files;
        stats.scan_duration = scan_duration;
        stats.write_duration = write_duration;
        stats.files_written = files_written;
        stats.output_directory = self.config.output_dir.display().to_string();
        stats.duration = start_time.elapsed();

        info!(
            "✓ Pipeline completed successfully in {:.2}s",
            stats.duration.as_secs_f64()
        );

        Ok(outcome)
    }

    /// Answers a follow-up question after [`Pipeline::run`].
    ///
    /// # Errors
    ///
    /// Returns an error if the index is empty or the model call fails.
    pub async fn ask(&mut self, question: &str) -> Result<String> {
        self.analyzer.ask(question).await
    }
}
