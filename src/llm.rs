//! Chat model capability used by the summarizer and the orchestrator.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Message written by the user
    User,
    /// Message written by the model
    Assistant,
}

/// A single turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message
    pub role: Role,
    /// Message text
    pub text: String,
}

impl ChatMessage {
    /// Creates a user message.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    /// Creates an assistant message.
    #[must_use]
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
        }
    }
}

/// A chat-completion backend.
///
/// One implementation exists per provider; the rest of the crate only sees
/// this trait. Retries and timeouts, if any, belong to implementations.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Human-readable provider name.
    fn name(&self) -> &str;

    /// Context window of the selected model, in tokens.
    fn context_window(&self) -> usize;

    /// Sends a single-turn or multi-turn conversation and returns the reply text.
    async fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<String>;

    /// Requests a reply conforming to `schema`.
    ///
    /// The default implementation asks for free text and parses it as JSON.
    async fn chat_structured(
        &self,
        system: &str,
        messages: &[ChatMessage],
        schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let _ = schema;
        let reply = self.chat(system, messages).await?;
        parse_json_response(&reply)
    }
}

/// Parses a model reply as JSON, stripping a Markdown code fence if present.
///
/// The trimmed reply is parsed as-is first, so bare JSON whose strings
/// contain backticks is accepted unchanged.
///
/// # Errors
///
/// Returns [`Error::Parse`] if neither the reply nor its fenced body is valid JSON.
pub fn parse_json_response(reply: &str) -> Result<serde_json::Value> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let body = strip_code_fence(trimmed);
    serde_json::from_str(body).map_err(|e| Error::parse(format!("{e} in reply: {}", preview(body))))
}

/// Returns the inside of the first fenced block, or the trimmed input.
#[must_use]
pub fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };

    let body = skip_info_string(&trimmed[start + 3..]);

    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Drops a `json` tag, or any other tag that fills the rest of the fence line.
fn skip_info_string(after_fence: &str) -> &str {
    let tag_len = after_fence
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(after_fence.len());
    if after_fence[..tag_len].eq_ignore_ascii_case("json") {
        return &after_fence[tag_len..];
    }

    match after_fence.find('\n') {
        Some(end) if !after_fence[..end].contains(['{', '[', '"']) => &after_fence[end + 1..],
        _ => after_fence,
    }
}

fn preview(text: &str) -> String {
    const PREVIEW_CHARS: usize = 120;
    let mut shown: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        shown.push_str("...");
    }
    shown
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fenced_json_equals_bare_json() {
        let inner = r#"{"summary": {"purpose": "demo"}, "dependencies": ["serde"]}"#;
        let fenced = format!("```json\n{inner}\n```");

        assert_eq!(
            parse_json_response(&fenced).unwrap(),
            parse_json_response(inner).unwrap()
        );
    }

    #[test]
    fn test_fence_without_language() {
        let fenced = "```\n[1, 2, 3]\n```";
        assert_eq!(parse_json_response(fenced).unwrap(), json!([1, 2, 3]));
    }

    #[test]
    fn test_fence_with_surrounding_prose() {
        let reply = "Here is the analysis:\n```json\n{\"a\": 1}\n```\nLet me know!";
        assert_eq!(parse_json_response(reply).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_unterminated_fence() {
        let reply = "```json\n{\"a\": true}";
        assert_eq!(parse_json_response(reply).unwrap(), json!({"a": true}));
    }

    #[test]
    fn test_single_line_fence_with_tag() {
        let reply = "```json{\"a\": 1}```";
        assert_eq!(parse_json_response(reply).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_single_line_fence_without_tag() {
        let reply = "```{\"a\": 1}```";
        assert_eq!(parse_json_response(reply).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_other_language_tag_is_skipped() {
        let reply = "```jsonc\n{\"a\": 1}\n```";
        assert_eq!(parse_json_response(reply).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_bare_json_with_backticks_in_strings() {
        let reply = r#"{"purpose": "renders ```rust blocks", "flow": "```json\n{}```"}"#;
        let value = parse_json_response(reply).unwrap();

        assert_eq!(value["purpose"], "renders ```rust blocks");
        assert_eq!(value["flow"], "```json\n{}```");
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        let err = parse_json_response("```json\nnot json\n```").unwrap_err();
        assert!(err.is_parse());
        assert!(err.to_string().contains("not json"));
    }

    #[test]
    fn test_chat_message_constructors() {
        assert_eq!(ChatMessage::user("hi").role, Role::User);
        assert_eq!(ChatMessage::assistant("hello").role, Role::Assistant);
    }
}
