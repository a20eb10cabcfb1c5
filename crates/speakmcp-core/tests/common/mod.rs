//! Shared test doubles for the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use speakmcp_core::provider::{LlmClient, LlmResponse};
use speakmcp_core::session::ConversationEntry;
use speakmcp_core::tools::{ToolCall, ToolContext, ToolDescriptor, ToolExecutor, ToolResult};
use speakmcp_core::{Error, Result};

/// Model that replays a fixed script and records what it was shown
#[derive(Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Result<LlmResponse>>>,
    seen_tools: Mutex<Vec<Vec<String>>>,
    seen_messages: Mutex<Vec<usize>>,
    fallback: Option<LlmResponse>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<LlmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(Ok).collect()),
            ..Default::default()
        }
    }

    /// Replays `responses`, then answers every further call with `fallback`
    pub fn with_fallback(mut self, fallback: LlmResponse) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn failing(message: &str) -> Self {
        let llm = Self::default();
        llm.responses
            .lock()
            .unwrap()
            .push_back(Err(Error::Provider(message.to_string())));
        llm
    }

    pub fn calls(&self) -> usize {
        self.seen_tools.lock().unwrap().len()
    }

    /// Tool names offered on each call, in call order
    pub fn seen_tools(&self) -> Vec<Vec<String>> {
        self.seen_tools.lock().unwrap().clone()
    }

    /// Message counts on each call, in call order
    pub fn seen_message_counts(&self) -> Vec<usize> {
        self.seen_messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn call(&self, messages: &[ConversationEntry], tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        self.seen_tools
            .lock()
            .unwrap()
            .push(tools.iter().map(|t| t.name.clone()).collect());
        self.seen_messages.lock().unwrap().push(messages.len());

        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(response) => response,
            None => Ok(self
                .fallback
                .clone()
                .unwrap_or_else(|| LlmResponse::text("All done."))),
        }
    }
}

/// Model that never answers
pub struct HangingLlm;

#[async_trait]
impl LlmClient for HangingLlm {
    async fn call(&self, _messages: &[ConversationEntry], _tools: &[ToolDescriptor]) -> Result<LlmResponse> {
        std::future::pending::<()>().await;
        Ok(LlmResponse::default())
    }
}

/// How a scripted tool behaves
#[derive(Clone)]
pub enum Behavior {
    Ok(String),
    Fail(String),
    /// Fail with the first message `times` times, then succeed
    FailThenOk { error: String, times: usize, output: String },
    Delay(Duration, String),
    Hang,
}

/// Executor with per-tool scripted behavior and call counting
#[derive(Default)]
pub struct ScriptedExecutor {
    behaviors: HashMap<String, Behavior>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, tool: &str, behavior: Behavior) -> Self {
        self.behaviors.insert(tool.to_string(), behavior);
        self
    }

    pub fn calls_to(&self, tool: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == tool).count()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    async fn execute(&self, call: &ToolCall, _ctx: &ToolContext) -> ToolResult {
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|c| **c == call.name).count();
            calls.push(call.name.clone());
            previous
        };

        match self.behaviors.get(&call.name) {
            Some(Behavior::Ok(output)) => ToolResult::text(output.clone()),
            Some(Behavior::Fail(error)) => ToolResult::error(error.clone()),
            Some(Behavior::FailThenOk { error, times, output }) => {
                if previous < *times {
                    ToolResult::error(error.clone())
                } else {
                    ToolResult::text(output.clone())
                }
            }
            Some(Behavior::Delay(delay, output)) => {
                tokio::time::sleep(*delay).await;
                ToolResult::text(output.clone())
            }
            Some(Behavior::Hang) => {
                std::future::pending::<()>().await;
                ToolResult::text("unreachable")
            }
            None => ToolResult::error(format!("Unknown tool '{}'", call.name)),
        }
    }
}

pub fn descriptor(name: &str) -> ToolDescriptor {
    let server = name.split(':').next().unwrap_or_default().to_string();
    ToolDescriptor {
        name: name.to_string(),
        description: format!("Test tool {}", name),
        input_schema: json!({"type": "object"}),
        server,
    }
}

pub fn call(id: &str, name: &str) -> ToolCall {
    ToolCall::new(id, name, Value::Object(Default::default()))
}

pub fn call_with(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}
