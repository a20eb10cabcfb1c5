//! Session types shared by the agent loop and its frontends
//!
//! Conversation entries are the persisted transcript; progress steps and
//! updates are the live view streamed to whoever is watching a run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::{ToolCall, ToolResult};

/// Unique identifier for a session
pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

/// One transcript entry. Entries are never mutated once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_results: Option<Vec<ToolResult>>,
}

impl ConversationEntry {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: None,
            tool_results: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Assistant turn that requested tools
    pub fn assistant_with_tools(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut entry = Self::new(Role::Assistant, content);
        entry.tool_calls = Some(calls);
        entry
    }

    /// Tool results for one batch, in request order
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        let content = results
            .iter()
            .map(ToolResult::joined)
            .collect::<Vec<_>>()
            .join("\n\n");
        let mut entry = Self::new(Role::Tool, content);
        entry.tool_results = Some(results);
        entry
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    AwaitingApproval,
}

/// What a progress step describes. Each variant carries only its own fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    ToolCall {
        tool_name: String,
        input: Value,
    },
    ToolResult {
        tool_name: String,
        output: String,
        is_error: bool,
    },
    Retry {
        tool_name: String,
        attempt: u32,
        max_attempts: u32,
        reason: String,
        delay_ms: u64,
    },
    Approval {
        tool_name: String,
        approval_id: String,
    },
    Completion {
        content: String,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressStep {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: StepStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: StepKind,
}

impl ProgressStep {
    pub fn new(title: impl Into<String>, status: StepStatus, kind: StepKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.into(),
            description: None,
            status,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamingContent {
    pub text: String,
    pub is_streaming: bool,
}

/// Snapshot of a run, emitted after every step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub session_id: SessionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub current_iteration: usize,
    pub max_iterations: usize,
    pub steps: Vec<ProgressStep>,
    pub is_complete: bool,
    pub is_snoozed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_content: Option<StreamingContent>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_kind_is_flattened_with_type_tag() {
        let step = ProgressStep::new(
            "Retrying github:search",
            StepStatus::InProgress,
            StepKind::Retry {
                tool_name: "github:search".into(),
                attempt: 2,
                max_attempts: 3,
                reason: "timeout".into(),
                delay_ms: 2000,
            },
        );

        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["type"], "retry");
        assert_eq!(value["attempt"], 2);
        assert_eq!(value["status"], "in_progress");
        assert!(value.get("toolName").is_none());
        assert_eq!(value["tool_name"], "github:search");

        let back: ProgressStep = serde_json::from_value(value).unwrap();
        assert_eq!(back.kind, step.kind);
    }

    #[test]
    fn test_tool_results_entry_keeps_order() {
        let entry = ConversationEntry::tool_results(vec![
            ToolResult::text("first"),
            ToolResult::error("second"),
        ]);
        assert_eq!(entry.role, Role::Tool);
        assert_eq!(entry.content, "first\n\nsecond");
        let results = entry.tool_results.unwrap();
        assert!(!results[0].is_error);
        assert!(results[1].is_error);
    }

    #[test]
    fn test_entry_serialization_omits_empty_tool_fields() {
        let entry = ConversationEntry::user("hi");
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["role"], "user");
        assert!(value.get("toolCalls").is_none());

        let with_tools = ConversationEntry::assistant_with_tools(
            "",
            vec![ToolCall::new("c1", "fs:read", json!({"path": "/tmp"}))],
        );
        let value = serde_json::to_value(&with_tools).unwrap();
        assert_eq!(value["toolCalls"][0]["name"], "fs:read");
    }
}
