//! System prompt assembly
//!
//! Rebuilt every iteration so the tool list always matches the active
//! catalog the model is offered.

use crate::profile::ProfileSnapshot;
use crate::tools::ToolDescriptor;

/// Default base prompt when the profile does not supply one
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are SpeakMCP, an assistant that completes tasks by calling tools.

Work step by step. Call tools when you need information or need to act; tool names have the form `server:tool`.
When the task is finished, reply with a short summary of what you did and do not call any more tools.
If a tool keeps failing, try a different approach or explain what is blocking you."#;

#[derive(Debug, Clone)]
pub struct SystemPrompt {
    base: String,
    guidelines: Option<String>,
    tools: Vec<(String, String)>,
}

impl Default for SystemPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemPrompt {
    pub fn new() -> Self {
        Self {
            base: DEFAULT_SYSTEM_PROMPT.to_string(),
            guidelines: None,
            tools: Vec::new(),
        }
    }

    /// Take the base prompt and guidelines from a profile snapshot
    pub fn with_profile(mut self, profile: Option<&ProfileSnapshot>) -> Self {
        if let Some(profile) = profile {
            if let Some(base) = profile.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
                self.base = base.to_string();
            }
            if !profile.guidelines.trim().is_empty() {
                self.guidelines = Some(profile.guidelines.clone());
            }
        }
        self
    }

    pub fn with_tools(mut self, tools: &[ToolDescriptor]) -> Self {
        self.tools = tools
            .iter()
            .map(|t| (t.name.clone(), t.description.clone()))
            .collect();
        self
    }

    pub fn build(&self) -> String {
        let mut prompt = self.base.clone();

        if let Some(guidelines) = &self.guidelines {
            prompt.push_str("\n\n## Guidelines\n");
            prompt.push_str(guidelines.trim());
        }

        prompt.push_str("\n\n## Available Tools\n");
        if self.tools.is_empty() {
            prompt.push_str("No tools are available. Answer directly.");
        } else {
            for (name, description) in &self.tools {
                if description.is_empty() {
                    prompt.push_str(&format!("- {}\n", name));
                } else {
                    prompt.push_str(&format!("- {}: {}\n", name, description));
                }
            }
        }
        prompt
    }
}
