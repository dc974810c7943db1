use anyhow::Context;
use clap::Parser;
use repo_digest::{
    AnalysisMode, Config, FileFilterConfig, HttpChatModel, Pipeline, ProviderConfig, TokenizerKind,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "repo-digest",
    version,
    author,
    about = "Summarize a repository under a token budget and analyze it with an LLM",
    long_about = "Summarize a repository under a token budget and analyze it with an LLM.\n\n\
    The repository is reduced bottom-up: sibling files and directories are packed into \
    groups that fit the model's context window, and only groups that do not fit a single \
    call are summarized. The resulting digest is sent once for a structured analysis.\n\n\
    USAGE EXAMPLES:\n  \
      # Analyze the current directory with a local Ollama model\n  \
      repo-digest --provider ollama\n\n  \
      # Analyze a project with Groq and ask a follow-up question\n  \
      repo-digest --dir ./my-project --provider groq --ask \"Where is the entry point?\"\n\n  \
      # Reuse a saved provider configuration\n  \
      repo-digest --provider-config ./provider.json --out ./analysis"
)]
struct Cli {
    /// Root directory of the repository to analyze
    #[arg(short, long, default_value = ".", value_name = "PATH")]
    dir: PathBuf,

    /// Output directory for analysis.json, digest.xml and report.md
    #[arg(short, long, default_value = "out", value_name = "PATH")]
    out: PathBuf,

    /// Chat provider
    #[arg(short, long, value_enum, default_value = "ollama")]
    provider: CliProvider,

    /// Model name (defaults to the provider's first catalog model)
    #[arg(short, long)]
    model: Option<String>,

    /// API key for hosted providers
    #[arg(long, env = "REPO_DIGEST_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Load provider settings from a JSON file instead of the flags above
    #[arg(long, value_name = "FILE")]
    provider_config: Option<PathBuf>,

    /// Save the resolved provider settings to a JSON file
    #[arg(long, value_name = "FILE")]
    save_provider_config: Option<PathBuf>,

    /// Tokenizer used for budgets
    #[arg(long, value_enum, default_value = "approximate")]
    tokenizer: CliTokenizer,

    /// Retrieval chunk size in characters
    #[arg(long, default_value_t = 1_000)]
    chunk_size: usize,

    /// Overlap between retrieval chunks in characters
    #[arg(long, default_value_t = 200)]
    chunk_overlap: usize,

    /// Maximum summarize calls in flight
    #[arg(long, default_value_t = 4)]
    concurrency: usize,

    /// Override the model's context window (tokens)
    #[arg(long)]
    context_window: Option<usize>,

    /// Request schema-constrained JSON from the provider
    #[arg(long, conflicts_with = "free_text")]
    structured: bool,

    /// Ask for free text and parse the JSON out of it (default)
    #[arg(long)]
    free_text: bool,

    /// Glob of files to skip (can be used multiple times)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Glob of directories to skip (can be used multiple times)
    #[arg(long, value_name = "GLOB")]
    exclude_dir: Vec<String>,

    /// Only ingest files matching this glob (can be used multiple times)
    #[arg(long, value_name = "GLOB")]
    only: Vec<String>,

    /// Path to a custom Tera template for report.md
    #[arg(long, value_name = "FILE")]
    template: Option<PathBuf>,

    /// Overwrite existing outputs without backups
    #[arg(long)]
    no_backup: bool,

    /// Follow-up question answered from the index (can be used multiple times)
    #[arg(long, value_name = "QUESTION")]
    ask: Vec<String>,

    /// Dry run (don't write files)
    #[arg(long)]
    dry_run: bool,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliProvider {
    Anthropic,
    Gemini,
    Groq,
    Ollama,
}

impl CliProvider {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Groq => "groq",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliTokenizer {
    Simple,
    Enhanced,
    Approximate,
}

impl From<CliTokenizer> for TokenizerKind {
    fn from(t: CliTokenizer) -> Self {
        match t {
            CliTokenizer::Simple => Self::Simple,
            CliTokenizer::Enhanced => Self::Enhanced,
            CliTokenizer::Approximate => Self::Approximate,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let provider = resolve_provider(&cli)?;
    if let Some(ref path) = cli.save_provider_config {
        provider
            .save(path)
            .with_context(|| format!("Failed to save provider config to {}", path.display()))?;
        info!("Saved provider config to {}", path.display());
    }

    let model = Arc::new(HttpChatModel::new(provider).context("Failed to create chat model")?);

    let mut exclude_directories = vec!["**/target".to_string(), "**/node_modules".to_string()];
    if let Some(pattern) = output_dir_pattern(&cli.dir, &cli.out) {
        exclude_directories.push(pattern);
    }
    exclude_directories.extend(cli.exclude_dir);

    let mode = if cli.structured && !cli.free_text {
        AnalysisMode::Structured
    } else {
        AnalysisMode::FreeText
    };

    let mut builder = Config::builder()
        .root_dir(cli.dir)
        .output_dir(cli.out)
        .tokenizer(cli.tokenizer.into())
        .chunk_size(cli.chunk_size)
        .chunk_overlap(cli.chunk_overlap)
        .max_concurrency(cli.concurrency)
        .analysis_mode(mode)
        .backup_existing(!cli.no_backup)
        .dry_run(cli.dry_run)
        .file_filter_config(
            FileFilterConfig::new()
                .exclude_files(cli.exclude)
                .exclude_directories(exclude_directories)
                .allow_only(cli.only),
        );

    if let Some(tokens) = cli.context_window {
        builder = builder.context_window(tokens);
    }

    if let Some(template_path) = cli.template {
        builder = builder.template_path(template_path);
    }

    let config = builder.build().context("Failed to build configuration")?;

    let mut pipeline = Pipeline::new(config, model).context("Failed to create pipeline")?;
    let outcome = pipeline.run().await.context("Pipeline execution failed")?;

    outcome.stats.print_summary();
    println!("{}\n", outcome.analysis.summary.purpose);

    for question in &cli.ask {
        let answer = pipeline
            .ask(question)
            .await
            .with_context(|| format!("Failed to answer '{question}'"))?;
        println!("Q: {question}\nA: {answer}\n");
    }

    Ok(())
}

fn resolve_provider(cli: &Cli) -> anyhow::Result<ProviderConfig> {
    let provider = match cli.provider_config {
        Some(ref path) => ProviderConfig::load(path)
            .with_context(|| format!("Failed to load provider config from {}", path.display()))?,
        None => ProviderConfig::from_parts(cli.provider.as_str(), None, cli.model.clone())?,
    };

    Ok(match cli.api_key {
        Some(ref key) => provider.with_api_key(key),
        None => provider,
    })
}

/// Glob excluding the output directory when it lies inside the root.
fn output_dir_pattern(root: &Path, out: &Path) -> Option<String> {
    let root = root.canonicalize().ok()?;
    let out = if out.is_absolute() {
        out.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(out)
    };
    let relative = pathdiff::diff_paths(&out, &root)?;

    let pattern = relative.to_string_lossy().replace('\\', "/");
    if pattern.is_empty() || pattern.starts_with("..") {
        return None;
    }
    Some(pattern)
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("repo_digest=info"),
        1 => EnvFilter::new("repo_digest=debug"),
        _ => EnvFilter::new("repo_digest=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();

    Ok(())
}
