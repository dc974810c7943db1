use crate::{
    analysis::RepoAnalysis,
    error::{Error, Result},
    pipeline::{AnalysisOutcome, AnalysisStats},
};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tera::{Context, Tera, Value};
use tracing::debug;

const BUILTIN_TEMPLATE: &str = "report.md";

/// Maximum external template size (1MB)
const MAX_TEMPLATE_SIZE: u64 = 1024 * 1024;

/// Variables an external report template has to reference.
const REQUIRED_VARIABLES: &[&str] = &["analysis"];

/// Variables that are available but optional.
const OPTIONAL_VARIABLES: &[&str] = &["mermaid", "stats", "metadata"];

#[derive(Serialize)]
struct ReportContext<'a> {
    analysis: &'a RepoAnalysis,
    mermaid: String,
    stats: &'a AnalysisStats,
    metadata: ReportMetadata<'a>,
}

#[derive(Serialize)]
struct ReportMetadata<'a> {
    generated_at: String,
    model: &'a str,
    mode: &'a str,
}

/// Renders the Markdown report of an analysis.
pub(crate) struct ReportRenderer {
    tera: Tera,
    template_name: String,
}

impl ReportRenderer {
    /// Creates a renderer using the built-in template, or `template_path`
    /// when given.
    ///
    /// # Errors
    ///
    /// Returns an error if the template does not compile.
    pub(crate) fn new(template_path: Option<&Path>) -> Result<Self> {
        let mut tera = Tera::default();
        Self::register_filters(&mut tera);

        let template_name = match template_path {
            Some(path) => {
                let name = path.to_string_lossy().to_string();
                tera.add_template_file(path, Some(&name))
                    .map_err(|e| Error::template(&name, e))?;
                debug!("Using external report template {}", path.display());
                name
            }
            None => {
                tera.add_raw_template(
                    BUILTIN_TEMPLATE,
                    include_str!("../templates/report.md.tera"),
                )
                .map_err(|e| Error::template(BUILTIN_TEMPLATE, e))?;
                BUILTIN_TEMPLATE.to_string()
            }
        };

        Ok(Self {
            tera,
            template_name,
        })
    }

    fn register_filters(tera: &mut Tera) {
        tera.register_filter("importance_bar", Self::importance_bar_filter);
        tera.register_filter("table_cell", Self::table_cell_filter);
    }

    /// Renders an importance score as a ten-cell bar.
    fn importance_bar_filter(
        value: &Value,
        _args: &HashMap<String, Value>,
    ) -> tera::Result<Value> {
        let score = value
            .as_u64()
            .ok_or_else(|| tera::Error::msg("importance_bar expects an integer"))?
            .min(10) as usize;

        Ok(Value::String(format!("{}{}", "█".repeat(score), "░".repeat(10 - score))))
    }

    /// Keeps free text inside a single Markdown table cell.
    fn table_cell_filter(
        value: &Value,
        _args: &HashMap<String, Value>,
    ) -> tera::Result<Value> {
        match value.as_str() {
            Some(s) => Ok(Value::String(
                s.replace('|', "\\|").replace("\r\n", " ").replace('\n', " "),
            )),
            None => Ok(value.clone()),
        }
    }

    /// Renders the report for a finished analysis.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub(crate) fn render(
        &self,
        outcome: &AnalysisOutcome,
        model: &str,
        mode: &str,
    ) -> Result<String> {
        let context = ReportContext {
            analysis: &outcome.analysis,
            mermaid: outcome.analysis.component_flow_graph.to_mermaid(),
            stats: &outcome.stats,
            metadata: ReportMetadata {
                generated_at: chrono::Local::now()
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string(),
                model,
                mode,
            },
        };

        let mut tera_context = Context::new();
        tera_context.insert("ctx", &context);

        self.tera
            .render(&self.template_name, &tera_context)
            .map_err(|e| Error::template(&self.template_name, e))
    }

    /// Validates an external report template.
    ///
    /// Performs the following checks:
    /// 1. File exists and is within the size limit
    /// 2. Template is not empty
    /// 3. Template syntax is valid
    /// 4. Template references the analysis
    ///
    /// # Errors
    ///
    /// Returns an error describing the first failed check.
    pub(crate) fn validate_template(path: &Path) -> Result<()> {
        let name = path.to_string_lossy().to_string();

        let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if !metadata.is_file() {
            return Err(Error::template_validation(&name, "Path is not a file"));
        }

        if metadata.len() > MAX_TEMPLATE_SIZE {
            return Err(Error::template_validation(
                &name,
                format!(
                    "Template file too large: {} bytes (max: {} bytes)",
                    metadata.len(),
                    MAX_TEMPLATE_SIZE
                ),
            ));
        }

        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        if content.trim().is_empty() {
            return Err(Error::template_validation(&name, "Template file is empty"));
        }

        let mut tera = Tera::default();
        Self::register_filters(&mut tera);
        tera.add_raw_template("validation", &content)
            .map_err(|e| Error::template_validation(&name, format!("Template syntax error: {e}")))?;

        let missing: Vec<&str> = REQUIRED_VARIABLES
            .iter()
            .filter(|var| !content.contains(&format!("ctx.{var}")))
            .copied()
            .collect();

        if !missing.is_empty() {
            return Err(Error::template_validation(
                &name,
                format!(
                    "Template does not reference: {}. Access fields through `ctx`, e.g. {{{{ ctx.analysis.summary.purpose }}}}",
                    missing.join(", ")
                ),
            ));
        }

        for var in OPTIONAL_VARIABLES {
            if !content.contains(&format!("ctx.{var}")) {
                debug!("Template does not use optional variable: {}", var);
            }
        }

        Ok(())
    }
}
