use crate::{
    config::{AnalysisMode, Config},
    error::{Error, Result},
    pipeline::AnalysisOutcome,
    template::ReportRenderer,
};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::SystemTime,
};
use tracing::{debug, info};

/// Structured analysis as pretty JSON.
pub const ANALYSIS_FILE: &str = "analysis.json";

/// Top-level digest fragments.
pub const DIGEST_FILE: &str = "digest.xml";

/// Rendered Markdown report.
pub const REPORT_FILE: &str = "report.md";

/// Persists the results of a run with atomic file operations.
pub(crate) struct Writer {
    output_dir: PathBuf,
    backup_existing: bool,
    mode: AnalysisMode,
    renderer: ReportRenderer,
}

impl Writer {
    /// Creates a new writer from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the report template cannot be loaded.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            output_dir: config.output_dir.clone(),
            backup_existing: config.backup_existing,
            mode: config.analysis_mode,
            renderer: ReportRenderer::new(config.template_path.as_deref())?,
        })
    }

    /// Writes the analysis, the digest and the report.
    ///
    /// Returns the number of files written.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Output directory cannot be created
    /// - Serialization or template rendering fails
    /// - File write operations fail
    pub(crate) fn write(&self, outcome: &AnalysisOutcome, model: &str) -> Result<usize> {
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| Error::io(&self.output_dir, e))?;

        info!("Writing results to {}", self.output_dir.display());

        let analysis = serde_json::to_string_pretty(&outcome.analysis)?;
        let report = self.renderer.render(outcome, model, self.mode.as_str())?;

        let outputs = [
            (ANALYSIS_FILE, analysis.as_str()),
            (DIGEST_FILE, outcome.digest.as_str()),
            (REPORT_FILE, report.as_str()),
        ];

        for (name, content) in outputs {
            let path = self.output_dir.join(name);
            self.write_file_atomic(&path, content)?;
            debug!("Wrote {} ({} bytes)", path.display(), content.len());
        }

        info!("Successfully wrote {} files", outputs.len());
        Ok(outputs.len())
    }

    /// Writes a file atomically with optional backup.
    ///
    /// # Process
    ///
    /// 1. Creates backup if file exists and backup is enabled
    /// 2. Writes content to temporary file
    /// 3. Syncs temporary file to disk
    /// 4. Renames temporary file to target path
    fn write_file_atomic(&self, path: &Path, content: &str) -> Result<()> {
        if path.exists() && self.backup_existing {
            self.backup_file(path)?;
        }

        let temp_path = path.with_extension("tmp");
        let mut temp_file = fs::File::create(&temp_path)
            .map_err(|e| Error::io(&temp_path, e))?;

        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| Error::io(&temp_path, e))?;

        temp_file
            .sync_all()
            .map_err(|e| Error::io(&temp_path, e))?;

        drop(temp_file);

        fs::rename(&temp_path, path)
            .map_err(|e| Error::io(path, e))?;

        Ok(())
    }

    /// Creates a timestamped backup of an existing file.
    fn backup_file(&self, path: &Path) -> Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)?
            .as_nanos();

        let filename = path
            .file_name()
            .ok_or_else(|| Error::config("Invalid file path"))?
            .to_string_lossy();

        let backup_path = self
            .output_dir
            .join(format!("{filename}.backup.{timestamp}"));

        fs::copy(path, &backup_path)
            .map_err(|e| Error::io(&backup_path, e))?;

        debug!("Created backup: {}", backup_path.display());
        Ok(())
    }
}
