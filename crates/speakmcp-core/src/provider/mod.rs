//! Language model collaborator
//!
//! The runtime never talks to a model API directly. Frontends supply an
//! [`LlmClient`] that turns the transcript plus the active tool catalog into
//! either text, tool calls, or both.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::types::ConversationEntry;
use crate::tools::{ToolCall, ToolDescriptor};

/// One model turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// The model's own signal that the task is (not) finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_more_work: Option<bool>,
}

impl LlmResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Default::default()
        }
    }

    pub fn tools(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Default::default()
        }
    }

    pub fn with_needs_more_work(mut self, needs_more_work: bool) -> Self {
        self.needs_more_work = Some(needs_more_work);
        self
    }

    /// Trimmed text, if there is any
    pub fn text_content(&self) -> Option<&str> {
        self.content
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.text_content().is_none() && self.tool_calls.is_empty()
    }
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Produce the next turn. `tools` is the active catalog for this iteration.
    async fn call(
        &self,
        messages: &[ConversationEntry],
        tools: &[ToolDescriptor],
    ) -> Result<LlmResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_detection() {
        assert!(LlmResponse::default().is_empty());
        assert!(LlmResponse::text("   \n").is_empty());
        assert!(!LlmResponse::text("done").is_empty());
        assert!(!LlmResponse::tools(vec![ToolCall::new("1", "a:b", json!({}))]).is_empty());
    }
}
