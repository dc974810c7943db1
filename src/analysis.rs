//! Structured repository analysis produced by the final model call.

use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::fmt::Write as _;

/// Maximum number of nodes in the component flow graph.
pub const MAX_GRAPH_NODES: usize = 20;
/// Maximum number of listed dependencies.
pub const MAX_DEPENDENCIES: usize = 10;
/// Maximum number of suggested follow-up questions.
pub const MAX_FURTHER_QUESTIONS: usize = 3;
/// Valid range of [`KeyFile::importance`].
pub const IMPORTANCE_RANGE: std::ops::RangeInclusive<u8> = 1..=10;

/// System prompt of the final analysis call, with the output schema embedded.
pub static ANALYSIS_PROMPT: Lazy<String> = Lazy::new(|| {
    format!(
        r#"
Analyze the following Git repository XML data and generate a structured analysis in JSON format.

The XML will contain two types of tags:
- The "file" tag will have an attribute for that file's path and contain the file's contents.
- The "summary" tag will have an attribute for a file's or directory's path and contain the summary for that part created previously by you.

The output must adhere to the following schema:

{}

Ground rules:
1. Keep all text fields concise and information-dense
2. Include only information that can be confidently inferred from the repository
3. In keyFiles, prioritize files that are essential for understanding the system architecture
"#,
        analysis_schema()
    )
});

/// High-level description of the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    /// The project's core purpose and design
    pub purpose: String,
    /// Primary data and control flow through the system
    pub main_flow: String,
}

/// A directed connection between two components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentEdge {
    /// Component with the outgoing connection
    pub from: String,
    /// Component with the incoming connection
    pub to: String,
    /// Optional description of the connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Flow graph relating the components of the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentGraph {
    /// Component names
    pub nodes: Vec<String>,
    /// Connections between components
    #[serde(default)]
    pub edges: Vec<ComponentEdge>,
}

impl ComponentGraph {
    /// Renders the graph as Mermaid flowchart source.
    ///
    /// Spaces in node ids become underscores and double quotes in labels
    /// become single quotes.
    #[must_use]
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD;");

        for node in &self.nodes {
            let _ = write!(out, "\n    {}[{}]", mermaid_id(node), mermaid_label(node));
        }

        for edge in &self.edges {
            let _ = match &edge.label {
                Some(label) => write!(
                    out,
                    "\n    {} --> |{}| {}",
                    mermaid_id(&edge.from),
                    mermaid_label(label),
                    mermaid_id(&edge.to)
                ),
                None => write!(
                    out,
                    "\n    {} --> {}",
                    mermaid_id(&edge.from),
                    mermaid_id(&edge.to)
                ),
            };
        }

        out
    }
}

fn mermaid_id(id: &str) -> String {
    id.replace(' ', "_")
}

fn mermaid_label(label: &str) -> String {
    format!("\"{}\"", label.replace('"', "'"))
}

/// A file that matters for understanding the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFile {
    /// Repository-relative path
    pub path: String,
    /// Role of the file
    pub purpose: String,
    /// How crucial the file is, from 1 to 10
    #[serde(deserialize_with = "whole_number")]
    pub importance: u8,
    /// Related files
    #[serde(default)]
    pub connections: Vec<String>,
}

/// Accepts integral JSON numbers, including floats such as `8.0`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn whole_number<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let n = f64::deserialize(deserializer)?;
    if n.fract() != 0.0 || !(0.0..=f64::from(u8::MAX)).contains(&n) {
        return Err(serde::de::Error::custom(format!(
            "expected a whole number between 1 and 10, got {n}"
        )));
    }
    Ok(n as u8)
}

/// The analysis returned by [`crate::pipeline::Analyzer::analyze`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoAnalysis {
    /// Purpose and main flow
    pub summary: RepoSummary,
    /// Component relations
    pub component_flow_graph: ComponentGraph,
    /// Important files
    #[serde(default)]
    pub key_files: Vec<KeyFile>,
    /// Most important dependencies
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Questions worth asking next
    #[serde(default)]
    pub further_questions: Vec<String>,
}

impl RepoAnalysis {
    /// Deserializes and validates a model reply.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] if the value has the wrong shape or
    /// violates a bound.
    pub fn from_value(value: Value) -> Result<Self> {
        let analysis: Self =
            serde_json::from_value(value).map_err(|e| Error::schema(e.to_string()))?;
        analysis.validate()?;
        Ok(analysis)
    }

    /// Checks the list bounds and the importance range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaMismatch`] naming the first violated bound.
    pub fn validate(&self) -> Result<()> {
        let graph = &self.component_flow_graph;
        if graph.nodes.len() > MAX_GRAPH_NODES {
            return Err(Error::schema(format!(
                "componentFlowGraph.nodes has {} entries (max {MAX_GRAPH_NODES})",
                graph.nodes.len()
            )));
        }
        if self.dependencies.len() > MAX_DEPENDENCIES {
            return Err(Error::schema(format!(
                "dependencies has {} entries (max {MAX_DEPENDENCIES})",
                self.dependencies.len()
            )));
        }
        if self.further_questions.len() > MAX_FURTHER_QUESTIONS {
            return Err(Error::schema(format!(
                "furtherQuestions has {} entries (max {MAX_FURTHER_QUESTIONS})",
                self.further_questions.len()
            )));
        }
        if let Some(file) = self
            .key_files
            .iter()
            .find(|file| !IMPORTANCE_RANGE.contains(&file.importance))
        {
            return Err(Error::schema(format!(
                "keyFiles '{}' has importance {} (expected 1-10)",
                file.path, file.importance
            )));
        }

        Ok(())
    }
}

/// JSON schema of [`RepoAnalysis`], passed to structured-output calls.
#[must_use]
pub fn analysis_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "summary": {
                "type": "object",
                "properties": {
                    "purpose": {
                        "type": "string",
                        "description": "The project's core purpose and design"
                    },
                    "mainFlow": {
                        "type": "string",
                        "description": "Description of primary data/control flow through system"
                    }
                },
                "required": ["purpose", "mainFlow"],
                "additionalProperties": false
            },
            "componentFlowGraph": {
                "type": "object",
                "description": "A \"component analysis\", which relates the different components used in this project in a flow graph, displaying their relation and functionality together.",
                "properties": {
                    "nodes": {
                        "type": "array",
                        "items": {
                            "type": "string",
                            "description": "Name of a single component. A component could be a class, a function, an abstract concept, or something else."
                        },
                        "maxItems": MAX_GRAPH_NODES
                    },
                    "edges": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "from": {
                                    "type": "string",
                                    "description": "Component name with the outgoing connection"
                                },
                                "to": {
                                    "type": "string",
                                    "description": "Component name with the incoming connection"
                                },
                                "label": { "type": "string" }
                            },
                            "required": ["from", "to"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["nodes", "edges"],
                "additionalProperties": false
            },
            "keyFiles": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string", "description": "File path" },
                        "purpose": {
                            "type": "string",
                            "description": "Brief description of file's role and why it is important to the repositories purpose"
                        },
                        "importance": {
                            "type": "integer",
                            "minimum": IMPORTANCE_RANGE.start(),
                            "maximum": IMPORTANCE_RANGE.end(),
                            "description": "From 1 to 10, how crucial this file is for understanding the repository purpose"
                        },
                        "connections": {
                            "type": "array",
                            "items": { "type": "string" },
                            "description": "Other files in the repository related to this one"
                        }
                    },
                    "required": ["path", "purpose", "importance", "connections"],
                    "additionalProperties": false
                }
            },
            "dependencies": {
                "type": "array",
                "items": { "type": "string" },
                "maxItems": MAX_DEPENDENCIES,
                "description": "List of the most important dependencies frameworks / libraries"
            },
            "furtherQuestions": {
                "type": "array",
                "items": {
                    "type": "string",
                    "description": "A question that you would suggest me to ask you, to gain more detailed insight about the repository."
                },
                "maxItems": MAX_FURTHER_QUESTIONS
            }
        },
        "required": [
            "summary",
            "componentFlowGraph",
            "keyFiles",
            "dependencies",
            "furtherQuestions"
        ],
        "additionalProperties": false
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_value() -> Value {
        json!({
            "summary": {
                "purpose": "Summarizes repositories",
                "mainFlow": "scan -> summarize -> analyze"
            },
            "componentFlowGraph": {
                "nodes": ["Scanner", "Summarizer", "Chat Model"],
                "edges": [
                    { "from": "Scanner", "to": "Summarizer" },
                    { "from": "Summarizer", "to": "Chat Model", "label": "sends \"groups\"" }
                ]
            },
            "keyFiles": [
                {
                    "path": "src/summarizer.rs",
                    "purpose": "Bottom-up reduction",
                    "importance": 9,
                    "connections": ["src/tree.rs"]
                }
            ],
            "dependencies": ["tokio", "serde"],
            "furtherQuestions": ["How are groups packed?"]
        })
    }

    #[test]
    fn test_from_value_accepts_valid_analysis() {
        let analysis = RepoAnalysis::from_value(sample_value()).unwrap();

        assert_eq!(analysis.summary.main_flow, "scan -> summarize -> analyze");
        assert_eq!(analysis.key_files[0].importance, 9);
        assert_eq!(analysis.component_flow_graph.edges.len(), 2);
    }

    #[test]
    fn test_serializes_camel_case() {
        let analysis = RepoAnalysis::from_value(sample_value()).unwrap();
        let json = serde_json::to_value(&analysis).unwrap();

        assert!(json.get("componentFlowGraph").is_some());
        assert!(json.get("furtherQuestions").is_some());
        assert!(json["summary"].get("mainFlow").is_some());
        assert!(json["componentFlowGraph"]["edges"][0].get("label").is_none());
    }

    #[test]
    fn test_rejects_wrong_shape() {
        let err = RepoAnalysis::from_value(json!({ "summary": "nope" })).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
    }

    #[test]
    fn test_rejects_out_of_range_importance() {
        let mut value = sample_value();
        value["keyFiles"][0]["importance"] = json!(11);

        let err = RepoAnalysis::from_value(value).unwrap_err();
        assert!(err.to_string().contains("importance 11"));
    }

    #[test]
    fn test_importance_accepts_integral_float() {
        let mut value = sample_value();
        value["keyFiles"][0]["importance"] = json!(8.0);

        let analysis = RepoAnalysis::from_value(value).unwrap();
        assert_eq!(analysis.key_files[0].importance, 8);
    }

    #[test]
    fn test_importance_rejects_fraction() {
        let mut value = sample_value();
        value["keyFiles"][0]["importance"] = json!(7.5);

        let err = RepoAnalysis::from_value(value).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        assert!(err.to_string().contains("7.5"));
    }

    #[test]
    fn test_schema_declares_integer_importance() {
        let schema = analysis_schema();
        let importance = &schema["properties"]["keyFiles"]["items"]["properties"]["importance"];

        assert_eq!(importance["type"], "integer");
        assert_eq!(importance["minimum"], 1);
        assert_eq!(importance["maximum"], 10);
    }

    #[test]
    fn test_rejects_too_many_entries() {
        let mut value = sample_value();
        value["furtherQuestions"] = json!(["a", "b", "c", "d"]);
        assert!(RepoAnalysis::from_value(value).unwrap_err().is_parse());

        let mut value = sample_value();
        value["componentFlowGraph"]["nodes"] =
            json!((0..21).map(|i| format!("n{i}")).collect::<Vec<_>>());
        assert!(RepoAnalysis::from_value(value).is_err());

        let mut value = sample_value();
        value["dependencies"] = json!((0..11).map(|i| format!("d{i}")).collect::<Vec<_>>());
        assert!(RepoAnalysis::from_value(value).is_err());
    }

    #[test]
    fn test_mermaid_output() {
        let analysis = RepoAnalysis::from_value(sample_value()).unwrap();
        let mermaid = analysis.component_flow_graph.to_mermaid();

        assert_eq!(
            mermaid,
            "graph TD;\n    Scanner[\"Scanner\"]\n    Summarizer[\"Summarizer\"]\n    \
             Chat_Model[\"Chat Model\"]\n    Scanner --> Summarizer\n    \
             Summarizer --> |\"sends 'groups'\"| Chat_Model"
        );
    }

    #[test]
    fn test_prompt_embeds_schema() {
        assert!(ANALYSIS_PROMPT.contains("\"furtherQuestions\""));
        assert_eq!(analysis_schema()["properties"]["dependencies"]["maxItems"], 10);
    }
}
