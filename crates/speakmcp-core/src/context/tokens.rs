//! Token estimation for context budgeting
//!
//! Uses tiktoken when the `tiktoken` feature is enabled, falls back to
//! character heuristics otherwise.

#[cfg(feature = "tiktoken")]
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::session::types::ConversationEntry;
use crate::tools::ToolDescriptor;

/// Fixed per-message overhead (role, separators)
const MESSAGE_OVERHEAD: usize = 3;

/// Token counter for estimating context usage
pub struct TokenCounter {
    #[cfg(feature = "tiktoken")]
    encoder: Option<CoreBPE>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter {
    pub fn new() -> Self {
        #[cfg(feature = "tiktoken")]
        {
            Self {
                encoder: cl100k_base().ok(),
            }
        }

        #[cfg(not(feature = "tiktoken"))]
        {
            Self {}
        }
    }

    /// Count tokens for a string
    ///
    /// Heuristic fallback:
    /// - For English text: ~4 characters per token
    /// - For code: ~3 characters per token (more symbols)
    pub fn count(&self, text: &str) -> usize {
        #[cfg(feature = "tiktoken")]
        {
            if let Some(ref encoder) = self.encoder {
                return encoder.encode_with_special_tokens(text).len();
            }
        }

        count_heuristic(text)
    }

    /// Count tokens in a transcript, tool calls included
    pub fn count_entries(&self, entries: &[ConversationEntry]) -> usize {
        entries
            .iter()
            .map(|entry| {
                let calls = entry
                    .tool_calls
                    .as_ref()
                    .map(|calls| {
                        calls
                            .iter()
                            .map(|c| self.count(&c.name) + self.count(&c.arguments.to_string()))
                            .sum::<usize>()
                    })
                    .unwrap_or(0);
                MESSAGE_OVERHEAD + self.count(&entry.content) + calls
            })
            .sum()
    }

    /// Count tokens spent on tool definitions
    pub fn count_tools(&self, tools: &[ToolDescriptor]) -> usize {
        tools
            .iter()
            .map(|t| {
                self.count(&t.name) + self.count(&t.description) + self.count(&t.input_schema.to_string())
            })
            .sum()
    }
}

fn count_heuristic(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        return 0;
    }

    let code_chars = text
        .chars()
        .filter(|c| {
            matches!(
                c,
                '{' | '}' | '[' | ']' | '(' | ')' | ';' | ':' | ',' | '=' | '+' | '-' | '*' | '/'
            )
        })
        .count();

    // More than 5% code characters: use the code ratio
    let ratio = if code_chars as f64 / chars as f64 > 0.05 {
        3.0
    } else {
        4.0
    };

    (chars as f64 / ratio).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_text() {
        let counter = TokenCounter::new();
        let tokens = counter.count("Hello, this is a simple test message.");
        assert!(tokens > 5 && tokens < 15);
    }

    #[test]
    fn test_count_code() {
        let counter = TokenCounter::new();
        let tokens = counter.count("fn main() { let x = 1 + 2; println!(\"{}\", x); }");
        assert!(tokens > 10 && tokens < 30);
    }

    #[test]
    fn test_count_empty() {
        assert_eq!(TokenCounter::new().count(""), 0);
    }

    #[test]
    fn test_entries_include_overhead() {
        let counter = TokenCounter::new();
        let entries = vec![ConversationEntry::user(""), ConversationEntry::assistant("")];
        assert_eq!(counter.count_entries(&entries), 2 * MESSAGE_OVERHEAD);
    }
}
