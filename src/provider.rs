//! Chat providers reachable over HTTP.
//!
//! [`ProviderConfig`] is the serializable selection of a provider and model;
//! [`HttpChatModel`] turns it into a [`ChatModel`].

use crate::{
    error::{Error, Result},
    llm::{ChatMessage, ChatModel, Role, parse_json_response},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::Path;
use tracing::{debug, trace};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const GEMINI_API_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const DEFAULT_OLLAMA_MODEL: &str = "gemma2:2b";
const DEFAULT_OLLAMA_CONTEXT: usize = 1000;
const OLLAMA_MAX_CONTEXT: usize = 8192;
const MAX_OUTPUT_TOKENS: u32 = 4096;

/// A model offered by a hosted provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Model identifier sent to the API
    pub name: &'static str,
    /// Context window in tokens
    pub context_window: usize,
}

const fn model(name: &'static str, context_window: usize) -> ModelInfo {
    ModelInfo {
        name,
        context_window,
    }
}

/// Anthropic models.
pub const ANTHROPIC_MODELS: &[ModelInfo] = &[
    model("claude-3-7-sonnet-20250219", 200_000),
    model("claude-3-5-haiku-20241022", 200_000),
    model("claude-3-opus-20240229", 200_000),
    model("claude-3-haiku-20240307", 200_000),
];

/// Gemini models.
pub const GEMINI_MODELS: &[ModelInfo] = &[
    model("gemini-1.5-flash", 1_000_000),
    model("gemini-1.5-pro", 2_000_000),
    model("gemini-1.5-flash-8b", 1_000_000),
    model("gemini-2.0-flash", 1_000_000),
];

/// Groq models.
pub const GROQ_MODELS: &[ModelInfo] = &[
    model("gemma2-9b-it", 8_000),
    model("llama-3.3-70b-versatile", 128_000),
    model("llama-3.1-8b-instant", 128_000),
    model("llama-guard-3-8b", 8_000),
    model("llama3-70b-8192", 8_000),
    model("llama3-8b-8192", 8_000),
    model("mixtral-8x7b-32768", 32_000),
];

fn default_ollama_url() -> String {
    DEFAULT_OLLAMA_URL.to_string()
}

fn default_ollama_model() -> String {
    DEFAULT_OLLAMA_MODEL.to_string()
}

const fn default_ollama_context() -> usize {
    DEFAULT_OLLAMA_CONTEXT
}

/// Provider selection and credentials.
///
/// Serialized as `{"provider": "groq", "apiKey": "...", "model": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// Anthropic messages API
    #[serde(rename_all = "camelCase")]
    Anthropic {
        /// API key
        api_key: String,
        /// One of [`ANTHROPIC_MODELS`]
        model: String,
    },
    /// Google Gemini API
    #[serde(rename_all = "camelCase")]
    Gemini {
        /// API key
        api_key: String,
        /// One of [`GEMINI_MODELS`]
        model: String,
    },
    /// Groq OpenAI-compatible API
    #[serde(rename_all = "camelCase")]
    Groq {
        /// API key
        api_key: String,
        /// One of [`GROQ_MODELS`]
        model: String,
    },
    /// Local Ollama server
    #[serde(rename_all = "camelCase")]
    Ollama {
        /// Server URL
        #[serde(default = "default_ollama_url")]
        base_url: String,
        /// Any locally available model
        #[serde(default = "default_ollama_model")]
        model: String,
        /// Context window to plan for
        #[serde(default = "default_ollama_context")]
        context_window: usize,
    },
}

impl ProviderConfig {
    /// Builds a config from a provider name, using the first catalog model
    /// when `model` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unknown provider name.
    pub fn from_parts(
        provider: &str,
        api_key: Option<String>,
        model: Option<String>,
    ) -> Result<Self> {
        let key = api_key.unwrap_or_default();
        let pick = |catalog: &[ModelInfo]| {
            model
                .clone()
                .unwrap_or_else(|| catalog[0].name.to_string())
        };

        match provider.to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic {
                api_key: key,
                model: pick(ANTHROPIC_MODELS),
            }),
            "gemini" => Ok(Self::Gemini {
                api_key: key,
                model: pick(GEMINI_MODELS),
            }),
            "groq" => Ok(Self::Groq {
                api_key: key,
                model: pick(GROQ_MODELS),
            }),
            "ollama" => Ok(Self::Ollama {
                base_url: default_ollama_url(),
                model: model.unwrap_or_else(default_ollama_model),
                context_window: DEFAULT_OLLAMA_CONTEXT,
            }),
            other => Err(Error::config(format!(
                "Unknown provider '{other}' (expected anthropic, gemini, groq or ollama)"
            ))),
        }
    }

    /// Reads a config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_str(&text).map_err(|e| Error::config(format!("{}: {e}", path.display())))
    }

    /// Writes the config as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text).map_err(|e| Error::io(path, e))
    }

    /// Provider display name.
    #[must_use]
    pub const fn provider_name(&self) -> &'static str {
        match self {
            Self::Anthropic { .. } => "Anthropic",
            Self::Gemini { .. } => "Gemini",
            Self::Groq { .. } => "Groq",
            Self::Ollama { .. } => "Ollama",
        }
    }

    /// Selected model.
    #[must_use]
    pub fn model(&self) -> &str {
        match self {
            Self::Anthropic { model, .. }
            | Self::Gemini { model, .. }
            | Self::Groq { model, .. }
            | Self::Ollama { model, .. } => model,
        }
    }

    /// Overrides the API key of a hosted provider.
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        match &mut self {
            Self::Anthropic { api_key, .. }
            | Self::Gemini { api_key, .. }
            | Self::Groq { api_key, .. } => *api_key = key.into(),
            Self::Ollama { .. } => {}
        }
        self
    }

    /// Context window of the selected model.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a hosted model is not in the catalog.
    pub fn context_window(&self) -> Result<usize> {
        let catalog = match self {
            Self::Anthropic { .. } => ANTHROPIC_MODELS,
            Self::Gemini { .. } => GEMINI_MODELS,
            Self::Groq { .. } => GROQ_MODELS,
            Self::Ollama { context_window, .. } => return Ok(*context_window),
        };

        catalog
            .iter()
            .find(|info| info.name == self.model())
            .map(|info| info.context_window)
            .ok_or_else(|| {
                Error::config(format!(
                    "Invalid {} model: {}",
                    self.provider_name(),
                    self.model()
                ))
            })
    }

    /// Checks that the model is known and that hosted providers have a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the problem.
    pub fn validate(&self) -> Result<()> {
        self.context_window()?;
        match self {
            Self::Anthropic { api_key, .. }
            | Self::Gemini { api_key, .. }
            | Self::Groq { api_key, .. }
                if api_key.trim().is_empty() =>
            {
                Err(Error::config(format!(
                    "{} requires an API key",
                    self.provider_name()
                )))
            }
            Self::Ollama { context_window: 0, .. } => {
                Err(Error::config("Ollama context window must be greater than 0"))
            }
            _ => Ok(()),
        }
    }
}

/// An HTTP request ready to be sent.
#[derive(Debug, Clone, PartialEq)]
struct PreparedRequest {
    url: String,
    headers: Vec<(&'static str, String)>,
    body: Value,
}

/// [`ChatModel`] talking to one of the supported HTTP APIs.
pub struct HttpChatModel {
    config: ProviderConfig,
    context_window: usize,
    client: Client,
}

impl HttpChatModel {
    /// Creates a client for the given provider.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the config does not validate.
    pub fn new(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let context_window = config.context_window()?;
        debug!(
            "Using {} model '{}' ({} token context)",
            config.provider_name(),
            config.model(),
            context_window
        );

        Ok(Self {
            config,
            context_window,
            client: Client::new(),
        })
    }

    fn prepare(
        &self,
        system: &str,
        messages: &[ChatMessage],
        schema: Option<&Value>,
    ) -> PreparedRequest {
        match &self.config {
            ProviderConfig::Anthropic { api_key, model } => PreparedRequest {
                url: ANTHROPIC_API_URL.to_string(),
                headers: vec![
                    ("x-api-key", api_key.clone()),
                    ("anthropic-version", ANTHROPIC_VERSION.to_string()),
                ],
                body: json!({
                    "model": model,
                    "max_tokens": MAX_OUTPUT_TOKENS,
                    "system": system,
                    "messages": messages
                        .iter()
                        .map(|m| json!({ "role": openai_role(m.role), "content": m.text }))
                        .collect::<Vec<_>>(),
                }),
            },
            ProviderConfig::Gemini { api_key, model } => {
                let mut generation = json!({ "maxOutputTokens": MAX_OUTPUT_TOKENS });
                if schema.is_some() {
                    generation["responseMimeType"] = json!("application/json");
                }
                PreparedRequest {
                    url: format!("{GEMINI_API_BASE_URL}/{model}:generateContent?key={api_key}"),
                    headers: Vec::new(),
                    body: json!({
                        "systemInstruction": { "parts": [{ "text": system }] },
                        "contents": messages
                            .iter()
                            .map(|m| json!({
                                "role": if m.role == Role::User { "user" } else { "model" },
                                "parts": [{ "text": m.text }],
                            }))
                            .collect::<Vec<_>>(),
                        "generationConfig": generation,
                    }),
                }
            }
            ProviderConfig::Groq { api_key, model } => {
                let mut body = json!({
                    "model": model,
                    "messages": openai_messages(system, messages),
                });
                if schema.is_some() {
                    body["response_format"] = json!({ "type": "json_object" });
                }
                PreparedRequest {
                    url: GROQ_API_URL.to_string(),
                    headers: vec![("authorization", format!("Bearer {api_key}"))],
                    body,
                }
            }
            ProviderConfig::Ollama {
                base_url,
                model,
                context_window,
            } => {
                // No system role here: the prompt leads the first user message.
                let mut turns: Vec<Value> = messages
                    .iter()
                    .map(|m| json!({ "role": openai_role(m.role), "content": m.text }))
                    .collect();
                match messages.first() {
                    Some(first) if first.role == Role::User => {
                        turns[0]["content"] = json!(format!("{system}\n\n{}", first.text));
                    }
                    _ => turns.insert(0, json!({ "role": "user", "content": system })),
                }

                let mut body = json!({
                    "model": model,
                    "messages": turns,
                    "stream": false,
                    // Ollama silently truncates beyond num_ctx, so leave headroom.
                    "options": { "num_ctx": (context_window * 2).min(OLLAMA_MAX_CONTEXT) },
                });
                if let Some(schema) = schema {
                    body["format"] = schema.clone();
                }
                PreparedRequest {
                    url: format!("{}/api/chat", base_url.trim_end_matches('/')),
                    headers: Vec::new(),
                    body,
                }
            }
        }
    }

    fn extract_text(&self, response: Value) -> Result<String> {
        let text = match &self.config {
            ProviderConfig::Anthropic { .. } => {
                serde_json::from_value::<AnthropicResponse>(response)
                    .map(|r| r.content.into_iter().filter_map(|b| b.text).collect::<String>())
            }
            ProviderConfig::Gemini { .. } => {
                serde_json::from_value::<GeminiResponse>(response).map(|r| {
                    r.candidates
                        .into_iter()
                        .next()
                        .map(|c| c.content.parts.into_iter().map(|p| p.text).collect::<String>())
                        .unwrap_or_default()
                })
            }
            ProviderConfig::Groq { .. } => {
                serde_json::from_value::<OpenAiResponse>(response).map(|r| {
                    r.choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default()
                })
            }
            ProviderConfig::Ollama { .. } => {
                serde_json::from_value::<OllamaResponse>(response).map(|r| r.message.content)
            }
        }
        .map_err(|e| self.error(format!("Unexpected response shape: {e}")))?;

        if text.trim().is_empty() {
            return Err(self.error("Empty response"));
        }
        Ok(text)
    }

    async fn send(&self, request: PreparedRequest) -> Result<Value> {
        trace!("POST {}", redact_key(&request.url));

        let mut builder = self.client.post(&request.url).json(&request.body);
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| self.error(format!("Request failed: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| self.error(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(self.error(format!(
                "API error ({}): {}",
                status.as_u16(),
                error_message(&text)
            )));
        }

        serde_json::from_str(&text).map_err(|e| self.error(format!("Invalid JSON response: {e}")))
    }

    fn error(&self, message: impl Into<String>) -> Error {
        Error::llm(self.config.provider_name(), message)
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn name(&self) -> &str {
        self.config.provider_name()
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        let response = self.send(self.prepare(system, messages, None)).await?;
        self.extract_text(response)
    }

    async fn chat_structured(
        &self,
        system: &str,
        messages: &[ChatMessage],
        schema: &Value,
    ) -> Result<Value> {
        let response = self.send(self.prepare(system, messages, Some(schema))).await?;
        parse_json_response(&self.extract_text(response)?)
    }
}

const fn openai_role(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

fn openai_messages(system: &str, messages: &[ChatMessage]) -> Vec<Value> {
    std::iter::once(json!({ "role": "system", "content": system }))
        .chain(
            messages
                .iter()
                .map(|m| json!({ "role": openai_role(m.role), "content": m.text })),
        )
        .collect()
}

/// Pulls `error.message` out of an error body when there is one.
fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

fn redact_key(url: &str) -> String {
    match url.find("key=") {
        Some(i) => format!("{}key=***", &url[..i]),
        None => url.to_string(),
    }
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

#[derive(Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessage,
}

#[derive(Deserialize)]
struct OllamaMessage {
    content: String,
}
