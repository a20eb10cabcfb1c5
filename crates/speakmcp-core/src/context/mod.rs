//! Context budgeting for model calls
//!
//! Before every model call the loop hands the transcript to a
//! [`ContextBudget`], which may shrink it to fit and reports which
//! strategies it applied. The persisted history is never touched; only the
//! copy sent to the model is reduced.

pub mod tokens;

use async_trait::async_trait;

use crate::session::types::{ConversationEntry, Role};
use crate::tools::ToolDescriptor;

pub use tokens::TokenCounter;

/// Result of a shrink pass
#[derive(Debug, Clone)]
pub struct ShrinkOutcome {
    pub messages: Vec<ConversationEntry>,
    /// Names of the strategies applied, in order (empty when nothing changed)
    pub applied: Vec<String>,
}

impl ShrinkOutcome {
    pub fn unchanged(messages: Vec<ConversationEntry>) -> Self {
        Self {
            messages,
            applied: Vec::new(),
        }
    }
}

#[async_trait]
pub trait ContextBudget: Send + Sync {
    async fn shrink(
        &self,
        messages: Vec<ConversationEntry>,
        tools: &[ToolDescriptor],
    ) -> ShrinkOutcome;
}

/// Leaves the transcript alone
pub struct UnlimitedBudget;

#[async_trait]
impl ContextBudget for UnlimitedBudget {
    async fn shrink(&self, messages: Vec<ConversationEntry>, _tools: &[ToolDescriptor]) -> ShrinkOutcome {
        ShrinkOutcome::unchanged(messages)
    }
}

pub const STRATEGY_TRUNCATE_TOOL_OUTPUT: &str = "truncate_tool_output";
pub const STRATEGY_DROP_MIDDLE: &str = "drop_middle";

/// Token-estimate budget.
///
/// When over `max_tokens` it first truncates long tool outputs, then drops
/// the oldest entries between the first one and the most recent
/// `keep_recent`, leaving a note where they were.
pub struct TokenBudget {
    counter: TokenCounter,
    max_tokens: usize,
    tool_output_max_chars: usize,
    keep_recent: usize,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self::new(100_000)
    }
}

impl TokenBudget {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            counter: TokenCounter::new(),
            max_tokens,
            tool_output_max_chars: 4_000,
            keep_recent: 4,
        }
    }

    pub fn with_tool_output_max_chars(mut self, chars: usize) -> Self {
        self.tool_output_max_chars = chars;
        self
    }

    pub fn with_keep_recent(mut self, keep: usize) -> Self {
        self.keep_recent = keep;
        self
    }

    fn estimate(&self, messages: &[ConversationEntry], tool_tokens: usize) -> usize {
        self.counter.count_entries(messages) + tool_tokens
    }

    fn truncate_tool_outputs(&self, messages: &mut [ConversationEntry]) -> bool {
        let mut changed = false;
        for entry in messages.iter_mut().filter(|e| e.role == Role::Tool) {
            let total = entry.content.chars().count();
            if total > self.tool_output_max_chars {
                let kept: String = entry.content.chars().take(self.tool_output_max_chars).collect();
                entry.content = format!(
                    "{}\n... [truncated {} chars]",
                    kept,
                    total - self.tool_output_max_chars
                );
                changed = true;
            }
        }
        changed
    }

    fn drop_middle(&self, messages: Vec<ConversationEntry>, tool_tokens: usize) -> (Vec<ConversationEntry>, bool) {
        if messages.len() <= self.keep_recent + 1 {
            return (messages, false);
        }

        let mut head = messages;
        let tail = head.split_off(head.len() - self.keep_recent);
        let first = head.remove(0);
        let mut middle = head;

        let mut dropped = 0;
        loop {
            let mut candidate = Vec::with_capacity(middle.len() + tail.len() + 2);
            candidate.push(first.clone());
            if dropped > 0 {
                candidate.push(ConversationEntry::system(format!(
                    "[{} earlier messages omitted to fit the context window]",
                    dropped
                )));
            }
            candidate.extend(middle.iter().cloned());
            candidate.extend(tail.iter().cloned());

            if middle.is_empty() || self.estimate(&candidate, tool_tokens) <= self.max_tokens {
                return (candidate, dropped > 0);
            }
            middle.remove(0);
            dropped += 1;
        }
    }
}

#[async_trait]
impl ContextBudget for TokenBudget {
    async fn shrink(&self, mut messages: Vec<ConversationEntry>, tools: &[ToolDescriptor]) -> ShrinkOutcome {
        let tool_tokens = self.counter.count_tools(tools);
        if self.estimate(&messages, tool_tokens) <= self.max_tokens {
            return ShrinkOutcome::unchanged(messages);
        }

        let mut applied = Vec::new();
        if self.truncate_tool_outputs(&mut messages) {
            applied.push(STRATEGY_TRUNCATE_TOOL_OUTPUT.to_string());
        }

        if self.estimate(&messages, tool_tokens) > self.max_tokens {
            let (reduced, dropped) = self.drop_middle(messages, tool_tokens);
            messages = reduced;
            if dropped {
                applied.push(STRATEGY_DROP_MIDDLE.to_string());
            }
        }

        ShrinkOutcome { messages, applied }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;

    fn transcript(n: usize) -> Vec<ConversationEntry> {
        let mut entries = vec![ConversationEntry::user("original task")];
        for i in 0..n {
            entries.push(ConversationEntry::assistant(format!("step {} {}", i, "x".repeat(200))));
        }
        entries
    }

    #[tokio::test]
    async fn test_under_budget_is_unchanged() {
        let budget = TokenBudget::new(10_000);
        let outcome = budget.shrink(transcript(3), &[]).await;
        assert_eq!(outcome.messages.len(), 4);
        assert!(outcome.applied.is_empty());
    }

    #[tokio::test]
    async fn test_truncates_tool_output_first() {
        let budget = TokenBudget::new(500).with_tool_output_max_chars(100);
        let messages = vec![
            ConversationEntry::user("go"),
            ConversationEntry::tool_results(vec![ToolResult::text("y".repeat(4_000))]),
        ];

        let outcome = budget.shrink(messages, &[]).await;
        assert_eq!(outcome.applied, vec![STRATEGY_TRUNCATE_TOOL_OUTPUT]);
        assert!(outcome.messages[1].content.contains("[truncated 3900 chars]"));
    }

    #[tokio::test]
    async fn test_drops_middle_keeping_first_and_recent() {
        let budget = TokenBudget::new(300).with_keep_recent(2);
        let messages = transcript(10);
        let last = messages.last().unwrap().content.clone();

        let outcome = budget.shrink(messages, &[]).await;
        assert_eq!(outcome.applied, vec![STRATEGY_DROP_MIDDLE]);
        assert_eq!(outcome.messages[0].content, "original task");
        assert_eq!(outcome.messages[1].role, Role::System);
        assert!(outcome.messages[1].content.contains("earlier messages omitted"));
        assert_eq!(outcome.messages.last().unwrap().content, last);
    }
}
