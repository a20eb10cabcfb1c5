//! Agent runtime - the composition root frontends talk to
//!
//! Owns the shared managers, builds the tool catalog (built-ins plus MCP
//! servers), and runs prompts against stored conversations, either directly
//! or by draining a conversation's message queue.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::context::ContextBudget;
use crate::error::Result;
use crate::mcp_manager::McpServerManager;
use crate::profile::ProfileStore;
use crate::progress::ProgressSink;
use crate::provider::LlmClient;
use crate::session::queue::normalize_conversation_id;
use crate::session::{
    AgentLoop, AgentOutcome, AgentRequest, ConversationStore, MessageQueueManager,
    SessionStateManager, StopReport, ToolApprovalManager,
};
use crate::tools::builtin::{builtin_registry, BuiltinContext};
use crate::tools::{ToolCatalog, ToolExecutor};

/// What a queue drain did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueReport {
    pub completed: usize,
    pub failed: usize,
    /// Draining ended because a run was stopped; the queue is paused
    pub stopped: bool,
}

pub struct AgentRuntime {
    config: Config,
    mcp: Arc<McpServerManager>,
    profiles: Arc<ProfileStore>,
    state: Arc<SessionStateManager>,
    approvals: Arc<ToolApprovalManager>,
    queue: Arc<MessageQueueManager>,
    store: Arc<dyn ConversationStore>,
    catalog: Arc<ToolCatalog>,
    agent: AgentLoop,
}

impl AgentRuntime {
    pub fn new(config: Config, llm: Arc<dyn LlmClient>, store: Arc<dyn ConversationStore>) -> Self {
        Self::with_mcp_manager(config, llm, store, Arc::new(McpServerManager::new()))
    }

    pub fn with_mcp_manager(
        config: Config,
        llm: Arc<dyn LlmClient>,
        store: Arc<dyn ConversationStore>,
        mcp: Arc<McpServerManager>,
    ) -> Self {
        let profiles = Arc::new(ProfileStore::from_config(&config));
        let state = Arc::new(SessionStateManager::new(config.agent.kill_grace()));
        let approvals = Arc::new(ToolApprovalManager::new());

        let builtins = builtin_registry(BuiltinContext {
            mcp: mcp.clone(),
            profiles: profiles.clone(),
            state: state.clone(),
            approvals: approvals.clone(),
            agent: config.agent.clone(),
        });
        let catalog = Arc::new(ToolCatalog::new(Arc::new(builtins), mcp.clone()));
        let agent = AgentLoop::new(config.agent.clone(), llm, state.clone(), approvals.clone());

        Self {
            config,
            mcp,
            profiles,
            state,
            approvals,
            queue: Arc::new(MessageQueueManager::new()),
            store,
            catalog,
            agent,
        }
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.agent = self.agent.with_progress_sink(sink);
        self
    }

    pub fn with_budget(mut self, budget: Arc<dyn ContextBudget>) -> Self {
        self.agent = self.agent.with_budget(budget);
        self
    }

    /// Connect the configured MCP servers
    pub async fn start(&self) -> Vec<(String, Result<usize>)> {
        self.mcp.initialize(&self.config.mcp_servers).await
    }

    /// Stop every run and disconnect every server
    pub async fn shutdown(&self) {
        self.emergency_stop();
        self.mcp.shutdown().await;
    }

    /// Run one prompt against a stored conversation and persist what the run appended
    pub async fn process_message(
        &self,
        conversation_id: Option<&str>,
        prompt: &str,
    ) -> Result<AgentOutcome> {
        let conversation_id = normalize_conversation_id(conversation_id);
        let history = self.store.load(&conversation_id).await?.unwrap_or_default();
        let prior = history.len();

        let session_id = uuid::Uuid::new_v4().to_string();
        let executor: Arc<dyn ToolExecutor> = self.catalog.clone();

        info!(session_id = %session_id, conversation_id = %conversation_id, "Processing message");
        let outcome = self
            .agent
            .run(AgentRequest {
                session_id,
                conversation_id: Some(conversation_id.clone()),
                prompt: prompt.to_string(),
                history,
                tools: self.catalog.tools().await,
                executor,
                profile: self.profiles.snapshot(),
            })
            .await;

        self.store
            .append(&conversation_id, &outcome.history[prior..])
            .await?;
        Ok(outcome)
    }

    /// Drain a conversation's queue in order until it is empty, paused, or a run is stopped
    pub async fn process_queue(&self, conversation_id: Option<&str>) -> QueueReport {
        let mut report = QueueReport::default();

        while let Some(message) = self.queue.dequeue(conversation_id) {
            let result = self
                .process_message(Some(&message.conversation_id), &message.content)
                .await;

            let error = match result {
                // Hitting the iteration cap ends the run with a note but no error
                Ok(outcome) if outcome.success || (!outcome.aborted && outcome.error.is_none()) => {
                    if let Err(e) = self.queue.mark_completed(&message.id) {
                        warn!(message_id = %message.id, "Could not mark message completed: {}", e);
                    }
                    report.completed += 1;
                    continue;
                }
                Ok(outcome) if outcome.aborted => {
                    if let Err(e) = self.queue.mark_failed(&message.id, "stopped") {
                        warn!(message_id = %message.id, "Could not mark message stopped: {}", e);
                    }
                    self.queue.pause(Some(&message.conversation_id));
                    report.failed += 1;
                    report.stopped = true;
                    info!(conversation_id = %message.conversation_id, "Queue paused after stop");
                    break;
                }
                Ok(outcome) => outcome
                    .error
                    .unwrap_or_else(|| "agent run did not succeed".to_string()),
                Err(e) => e.to_string(),
            };

            warn!(message_id = %message.id, "Queued message failed: {}", error);
            if let Err(e) = self.queue.mark_failed(&message.id, error) {
                warn!(message_id = %message.id, "Could not mark message failed: {}", e);
            }
            report.failed += 1;
        }

        report
    }

    /// Stop one run and deny its pending approvals
    pub fn stop_session(&self, session_id: &str) -> StopReport {
        self.approvals.cancel_for_session(session_id);
        self.state.stop_session(session_id)
    }

    /// Stop every run and deny every pending approval
    pub fn emergency_stop(&self) -> StopReport {
        self.approvals.cancel_all();
        self.state.stop_all_sessions()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mcp(&self) -> &Arc<McpServerManager> {
        &self.mcp
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn state(&self) -> &Arc<SessionStateManager> {
        &self.state
    }

    pub fn approvals(&self) -> &Arc<ToolApprovalManager> {
        &self.approvals
    }

    pub fn queue(&self) -> &Arc<MessageQueueManager> {
        &self.queue
    }

    pub fn catalog(&self) -> &Arc<ToolCatalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }
}
