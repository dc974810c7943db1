//! Shared fixtures for unit tests.

use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ChatModel};
use crate::token::TokenEstimator;
use async_trait::async_trait;
use std::sync::Mutex;

/// One recorded `chat` invocation.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub system: String,
    pub user: String,
}

type Responder = Box<dyn Fn(usize, &str, &str) -> Result<String> + Send + Sync>;

/// Chat model answering from a closure and recording every call.
pub(crate) struct ScriptedModel {
    context_window: usize,
    responder: Responder,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedModel {
    /// Replies `"summary <n>"` to the n-th call (1-based).
    pub(crate) fn numbered(context_window: usize) -> Self {
        Self::with_responder(context_window, |n, _, _| Ok(format!("summary {n}")))
    }

    /// Fails every call.
    pub(crate) fn failing(context_window: usize) -> Self {
        Self::with_responder(context_window, |_, _, _| {
            Err(Error::llm("scripted", "rate limited"))
        })
    }

    pub(crate) fn with_responder(
        context_window: usize,
        responder: impl Fn(usize, &str, &str) -> Result<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            context_window,
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn chat(&self, system: &str, messages: &[ChatMessage]) -> Result<String> {
        let user = messages
            .iter()
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(RecordedCall {
                system: system.to_string(),
                user: user.clone(),
            });
            calls.len()
        };

        (self.responder)(n, system, &user)
    }
}

/// Counts one token per character, which keeps budgets easy to reason about.
pub(crate) struct CharEstimator;

impl TokenEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count()
    }
}
