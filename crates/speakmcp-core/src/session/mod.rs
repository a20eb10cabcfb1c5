//! Session module - agent runs and the state around them
//!
//! - `AgentLoop`: drives one run from prompt to final answer
//! - `SessionStateManager`: per-session stop flags, cancellation handles and owned processes
//! - `ToolApprovalManager`: pending tool approvals, resolved exactly once
//! - `MessageQueueManager`: per-conversation queue of prompts waiting for a run
//! - `ConversationStore`: where transcripts are kept between runs
//!
//! # Example Usage
//!
//! ```ignore
//! let agent = AgentLoop::new(config.agent.clone(), llm, state.clone(), approvals.clone());
//! let outcome = agent
//!     .run(AgentRequest {
//!         session_id: "s1".into(),
//!         conversation_id: None,
//!         prompt: "List my open pull requests".into(),
//!         history: Vec::new(),
//!         tools: catalog.tools().await,
//!         executor: catalog.clone(),
//!         profile: None,
//!     })
//!     .await;
//! ```

pub mod agent_loop;
pub mod approval;
pub mod persistence;
pub mod queue;
pub mod state;
pub mod types;

pub use agent_loop::{AgentLoop, AgentOutcome, AgentRequest};
pub use approval::{ApprovalDecision, ApprovalHandle, PendingApproval, ToolApprovalManager};
pub use persistence::{
    ConversationStore, ConversationSummary, JsonFileStore, MemoryStore, SavedConversation,
};
pub use queue::{MessageQueueManager, QueueStatus, QueuedMessage, DEFAULT_CONVERSATION};
pub use state::{HandleId, SessionStateManager, SessionSummary, StopReport};
pub use types::{
    ConversationEntry, ProgressStep, ProgressUpdate, Role, SessionId, StepKind, StepStatus,
    StreamingContent,
};
