//! Agent Loop - iterative model/tool execution for one session
//!
//! Each iteration asks the model for the next turn given the transcript and
//! the active tool catalog, runs any requested tools, and appends the
//! results, until the model's answer is judged complete or a limit is hit.
//!
//! Every suspension point (context shrink, model call, tool batch, approval
//! wait, retry backoff) races the run's cancellation token, which is
//! registered with the [`SessionStateManager`] so `stop_session` and
//! `stop_all_sessions` interrupt the run promptly.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::approval::ToolApprovalManager;
use super::state::SessionStateManager;
use super::types::{
    ConversationEntry, ProgressStep, ProgressUpdate, SessionId, StepKind, StepStatus,
};
use crate::classify::{
    CompletionDetector, ErrorClassifier, HeuristicCompletionDetector, KeywordErrorClassifier,
};
use crate::config::AgentConfig;
use crate::context::{ContextBudget, TokenBudget};
use crate::profile::ProfileSnapshot;
use crate::progress::{NullProgressSink, ProgressEvent, ProgressSink};
use crate::provider::{LlmClient, LlmResponse};
use crate::system_prompt::SystemPrompt;
use crate::tools::{ToolCall, ToolContext, ToolDescriptor, ToolExecutor, ToolResult};

/// Appended when the model returns nothing at all
const EMPTY_RESPONSE_NUDGE: &str =
    "Your last response was empty. Continue working on the task, or reply with a final answer.";

/// Appended when the model says it is not finished yet
const CONTINUE_NUDGE: &str = "Continue with the task. Use the available tools for the next step.";

/// Appended after repeated short replies that neither call tools nor finish
const NO_PROGRESS_NUDGE: &str = "You have not made progress in your last replies. Either call a tool \
    for the next step, or give the final answer with a summary of what was done.";

const STOPPED_NOTE: &str = "Agent stopped by user before the task was finished.";
const MAX_ITERATIONS_NOTE: &str = "Max iterations reached";

const CANCELLED_RESULT: &str = "Tool call cancelled: the session was stopped.";

/// Input to one agent run
pub struct AgentRequest {
    pub session_id: SessionId,
    pub conversation_id: Option<String>,
    pub prompt: String,
    /// Prior transcript; the prompt is appended as a new user entry
    pub history: Vec<ConversationEntry>,
    /// Global catalog at the start of the run
    pub tools: Vec<ToolDescriptor>,
    pub executor: Arc<dyn ToolExecutor>,
    pub profile: Option<ProfileSnapshot>,
}

/// Result of one agent run
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub success: bool,
    /// Ended by a stop request
    pub aborted: bool,
    pub final_content: String,
    /// Full transcript including the prompt and everything the run appended
    pub history: Vec<ConversationEntry>,
    pub iterations: usize,
    pub error: Option<String>,
}

enum Ending {
    Complete(String),
    Aborted,
    MaxIterations,
    Failed(String),
}

/// Mutable per-run counters; none of this outlives the run
struct RunState {
    history: Vec<ConversationEntry>,
    tools_used: bool,
    empty_responses: usize,
    short_responses: usize,
    failures: HashMap<String, usize>,
    iterations: usize,
}

/// Builds and emits progress for one run
struct RunProgress {
    session_id: SessionId,
    conversation_id: Option<String>,
    max_iterations: usize,
    iteration: AtomicUsize,
    steps: Mutex<Vec<ProgressStep>>,
    sink: Arc<dyn ProgressSink>,
    state: Arc<SessionStateManager>,
}

impl RunProgress {
    fn step(&self, title: impl Into<String>, status: StepStatus, kind: StepKind) {
        let step = ProgressStep::new(title, status, kind);
        self.steps.lock().push(step.clone());
        self.sink.emit(ProgressEvent::Step {
            session_id: self.session_id.clone(),
            step,
        });
        self.update(false, None);
    }

    fn update(&self, is_complete: bool, final_content: Option<String>) {
        self.sink.emit(ProgressEvent::Update(ProgressUpdate {
            session_id: self.session_id.clone(),
            conversation_id: self.conversation_id.clone(),
            current_iteration: self.iteration.load(Ordering::SeqCst),
            max_iterations: self.max_iterations,
            steps: self.steps.lock().clone(),
            is_complete,
            is_snoozed: self.state.is_snoozed(&self.session_id),
            final_content,
            streaming_content: None,
        }));
    }
}

/// Everything a single tool call needs, borrowed from the run
#[derive(Clone, Copy)]
struct CallScope<'a> {
    session_id: &'a str,
    token: &'a CancellationToken,
    executor: &'a dyn ToolExecutor,
    hidden: &'a HashSet<String>,
    progress: &'a RunProgress,
}

struct CallOutcome {
    result: ToolResult,
    /// Counts toward the per-tool failure tally
    failed: bool,
}

/// The agent loop. Cheap to share; one instance can drive many sessions.
pub struct AgentLoop {
    config: AgentConfig,
    llm: Arc<dyn LlmClient>,
    state: Arc<SessionStateManager>,
    approvals: Arc<ToolApprovalManager>,
    budget: Arc<dyn ContextBudget>,
    sink: Arc<dyn ProgressSink>,
    classifier: Arc<dyn ErrorClassifier>,
    detector: Arc<dyn CompletionDetector>,
}

impl AgentLoop {
    pub fn new(
        config: AgentConfig,
        llm: Arc<dyn LlmClient>,
        state: Arc<SessionStateManager>,
        approvals: Arc<ToolApprovalManager>,
    ) -> Self {
        Self {
            config,
            llm,
            state,
            approvals,
            budget: Arc::new(TokenBudget::default()),
            sink: Arc::new(NullProgressSink),
            classifier: Arc::new(KeywordErrorClassifier::default()),
            detector: Arc::new(HeuristicCompletionDetector::default()),
        }
    }

    pub fn with_budget(mut self, budget: Arc<dyn ContextBudget>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_error_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_completion_detector(mut self, detector: Arc<dyn CompletionDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Run one request to completion, stop, or failure
    pub async fn run(&self, request: AgentRequest) -> AgentOutcome {
        let AgentRequest {
            session_id,
            conversation_id,
            prompt,
            history,
            tools,
            executor,
            profile,
        } = request;

        self.state.create_session(&session_id, profile.clone());
        let token = CancellationToken::new();
        let handle = self.state.register_cancellation_handle(&session_id, token.clone());

        let progress = RunProgress {
            session_id: session_id.clone(),
            conversation_id,
            max_iterations: self.config.max_iterations,
            iteration: AtomicUsize::new(0),
            steps: Mutex::new(Vec::new()),
            sink: self.sink.clone(),
            state: self.state.clone(),
        };

        let mut run = RunState {
            history,
            tools_used: false,
            empty_responses: 0,
            short_responses: 0,
            failures: HashMap::new(),
            iterations: 0,
        };
        run.history.push(ConversationEntry::user(prompt));

        info!(session_id = %session_id, tools = tools.len(), "Agent run starting");
        let ending = self
            .drive(&mut run, &session_id, &token, &tools, executor.as_ref(), profile.as_ref(), &progress)
            .await;

        let outcome = self.finish(run, ending, &progress);

        if let Some(handle) = handle {
            self.state.unregister_cancellation_handle(&session_id, handle);
        }
        let denied = self.approvals.cancel_for_session(&session_id);
        if denied > 0 {
            debug!(session_id = %session_id, denied, "Cancelled leftover approvals");
        }
        self.state.cleanup_session(&session_id);

        info!(
            session_id = %session_id,
            success = outcome.success,
            aborted = outcome.aborted,
            iterations = outcome.iterations,
            "Agent run finished"
        );
        outcome
    }

    fn stopped(&self, session_id: &str, token: &CancellationToken) -> bool {
        token.is_cancelled() || self.state.should_stop(session_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        run: &mut RunState,
        session_id: &str,
        token: &CancellationToken,
        tools: &[ToolDescriptor],
        executor: &dyn ToolExecutor,
        profile: Option<&ProfileSnapshot>,
        progress: &RunProgress,
    ) -> Ending {
        for iteration in 1..=self.config.max_iterations {
            if self.stopped(session_id, token) {
                return Ending::Aborted;
            }

            run.iterations = iteration;
            progress.iteration.store(iteration, Ordering::SeqCst);
            self.state.increment_iteration(session_id);

            let active = self.active_tools(tools, &run.failures);
            let messages = self.build_messages(&run.history, &active, profile);

            progress.step("Thinking", StepStatus::InProgress, StepKind::Thinking);
            debug!(session_id, iteration, tools = active.len(), "Calling model");

            let shrunk = tokio::select! {
                outcome = self.budget.shrink(messages, &active) => outcome,
                _ = token.cancelled() => return Ending::Aborted,
            };
            if !shrunk.applied.is_empty() {
                info!(session_id, strategies = ?shrunk.applied, "Context shrunk to fit budget");
            }

            let response = tokio::select! {
                response = self.llm.call(&shrunk.messages, &active) => response,
                _ = token.cancelled() => return Ending::Aborted,
            };
            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!(session_id, iteration, "Model call failed: {}", e);
                    return Ending::Failed(e.to_string());
                }
            };

            if self.stopped(session_id, token) {
                return Ending::Aborted;
            }

            if response.is_empty() {
                run.empty_responses += 1;
                warn!(session_id, count = run.empty_responses, "Empty model response");
                if run.empty_responses >= self.config.max_empty_responses {
                    return Ending::Failed(format!(
                        "model returned {} empty responses in a row",
                        run.empty_responses
                    ));
                }
                run.history.push(ConversationEntry::user(EMPTY_RESPONSE_NUDGE));
                continue;
            }
            run.empty_responses = 0;

            if response.tool_calls.is_empty() {
                if let Some(done) = self.judge_text(run, &response) {
                    return Ending::Complete(done);
                }
                continue;
            }

            run.tools_used = true;
            run.short_responses = 0;
            let calls = response.tool_calls.clone();
            run.history.push(ConversationEntry::assistant_with_tools(
                response.content.clone().unwrap_or_default(),
                calls.clone(),
            ));

            let hidden = self.hidden_tools(&run.failures);
            let scope = CallScope {
                session_id,
                token,
                executor,
                hidden: &hidden,
                progress,
            };

            let Some(outcomes) = self.execute_batch(scope, &calls).await else {
                return Ending::Aborted;
            };
            if self.stopped(session_id, token) {
                return Ending::Aborted;
            }

            for (call, outcome) in calls.iter().zip(&outcomes) {
                if outcome.failed {
                    let count = run.failures.entry(call.name.clone()).or_insert(0);
                    *count += 1;
                    if *count == self.config.tool_failure_threshold {
                        warn!(session_id, tool = %call.name, "Tool hidden after repeated failures");
                    }
                }
            }

            run.history.push(ConversationEntry::tool_results(
                outcomes.into_iter().map(|o| o.result).collect(),
            ));
        }

        Ending::MaxIterations
    }

    /// Decide what a text-only response means. `Some(text)` completes the run.
    fn judge_text(&self, run: &mut RunState, response: &LlmResponse) -> Option<String> {
        let text = response.text_content().unwrap_or_default().to_string();

        if response.needs_more_work == Some(false) || self.detector.looks_complete(&text) {
            return Some(text);
        }
        if response.needs_more_work == Some(true) {
            run.history.push(ConversationEntry::assistant(text));
            run.history.push(ConversationEntry::user(CONTINUE_NUDGE));
            return None;
        }
        // A plain answer as the very first reply is a simple question answered
        if run.iterations == 1 && !run.tools_used {
            return Some(text);
        }
        if run.tools_used && text.chars().count() < self.config.short_response_chars {
            run.short_responses += 1;
            run.history.push(ConversationEntry::assistant(text));
            if run.short_responses >= self.config.no_progress_nudge_after {
                run.history.push(ConversationEntry::user(NO_PROGRESS_NUDGE));
                run.short_responses = 0;
            }
            return None;
        }
        Some(text)
    }

    fn hidden_tools(&self, failures: &HashMap<String, usize>) -> HashSet<String> {
        failures
            .iter()
            .filter(|(_, count)| **count >= self.config.tool_failure_threshold)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The catalog minus tools that failed too often in this run
    fn active_tools(&self, tools: &[ToolDescriptor], failures: &HashMap<String, usize>) -> Vec<ToolDescriptor> {
        let hidden = self.hidden_tools(failures);
        tools
            .iter()
            .filter(|t| !hidden.contains(&t.name))
            .cloned()
            .collect()
    }

    fn build_messages(
        &self,
        history: &[ConversationEntry],
        tools: &[ToolDescriptor],
        profile: Option<&ProfileSnapshot>,
    ) -> Vec<ConversationEntry> {
        let system = SystemPrompt::new()
            .with_profile(profile)
            .with_tools(tools)
            .build();
        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(ConversationEntry::system(system));
        messages.extend(history.iter().cloned());
        messages
    }

    /// Run a batch. `None` means the run was stopped and the batch discarded.
    async fn execute_batch(&self, scope: CallScope<'_>, calls: &[ToolCall]) -> Option<Vec<CallOutcome>> {
        if calls.len() > 1 && self.config.parallel_tool_execution {
            debug!(session_id = scope.session_id, calls = calls.len(), "Executing tools in parallel");
            let batch = futures::future::join_all(calls.iter().map(|call| self.execute_call(scope, call)));
            return tokio::select! {
                outcomes = batch => Some(outcomes),
                _ = scope.token.cancelled() => {
                    info!(session_id = scope.session_id, "Tool batch cancelled");
                    None
                }
            };
        }

        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            if self.stopped(scope.session_id, scope.token) {
                return None;
            }
            tokio::select! {
                outcome = self.execute_call(scope, call) => outcomes.push(outcome),
                _ = scope.token.cancelled() => return None,
            }
        }
        Some(outcomes)
    }

    /// One call: hidden check, approval gate, then retries
    async fn execute_call(&self, scope: CallScope<'_>, call: &ToolCall) -> CallOutcome {
        let progress = scope.progress;

        if scope.hidden.contains(&call.name) {
            return CallOutcome {
                result: ToolResult::error(format!(
                    "Tool '{}' is unavailable: it failed too many times in this session",
                    call.name
                )),
                failed: false,
            };
        }

        progress.step(
            format!("Calling {}", call.name),
            StepStatus::InProgress,
            StepKind::ToolCall {
                tool_name: call.name.clone(),
                input: call.arguments.clone(),
            },
        );

        if self.config.needs_approval(&call.name) {
            let handle = self.approvals.request_approval(
                scope.session_id,
                &call.name,
                call.arguments.clone(),
            );
            progress.step(
                format!("Waiting for approval of {}", call.name),
                StepStatus::AwaitingApproval,
                StepKind::Approval {
                    tool_name: call.name.clone(),
                    approval_id: handle.approval_id.clone(),
                },
            );

            let approved = tokio::select! {
                decision = handle.wait() => decision.is_approved(),
                _ = scope.token.cancelled() => false,
            };
            if !approved {
                info!(session_id = scope.session_id, tool = %call.name, "Tool call denied");
                let result = ToolResult::error(format!("Tool call '{}' was denied by the user", call.name));
                self.report_result(progress, call, &result);
                return CallOutcome { result, failed: false };
            }
        }

        let result = self.execute_with_retry(scope, call).await;
        self.report_result(progress, call, &result);
        CallOutcome {
            failed: result.is_error,
            result,
        }
    }

    async fn execute_with_retry(&self, scope: CallScope<'_>, call: &ToolCall) -> ToolResult {
        let retry = &self.config.retry;
        let max_attempts = retry.max_attempts.max(1);
        let ctx = ToolContext::new(scope.session_id);

        let mut attempt = 1;
        loop {
            if self.stopped(scope.session_id, scope.token) {
                return ToolResult::error(CANCELLED_RESULT);
            }

            let result = scope.executor.execute(call, &ctx).await;
            if !result.is_error {
                return result;
            }

            let reason = result.joined();
            if attempt >= max_attempts || !self.classifier.is_retryable(&reason) {
                return result;
            }

            let delay = retry.delay_for(attempt);
            warn!(
                session_id = scope.session_id,
                tool = %call.name,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying tool call: {}",
                reason
            );
            scope.progress.step(
                format!("Retrying {}", call.name),
                StepStatus::InProgress,
                StepKind::Retry {
                    tool_name: call.name.clone(),
                    attempt: attempt + 1,
                    max_attempts,
                    reason,
                    delay_ms: delay.as_millis() as u64,
                },
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = scope.token.cancelled() => return ToolResult::error(CANCELLED_RESULT),
            }
            attempt += 1;
        }
    }

    fn report_result(&self, progress: &RunProgress, call: &ToolCall, result: &ToolResult) {
        let status = if result.is_error {
            StepStatus::Failed
        } else {
            StepStatus::Completed
        };
        progress.step(
            format!("{} finished", call.name),
            status,
            StepKind::ToolResult {
                tool_name: call.name.clone(),
                output: result.joined(),
                is_error: result.is_error,
            },
        );
    }

    /// Turn the ending into an outcome, appending the closing assistant entry
    fn finish(&self, mut run: RunState, ending: Ending, progress: &RunProgress) -> AgentOutcome {
        let (success, aborted, final_content, error) = match ending {
            Ending::Complete(text) => {
                progress.step(
                    "Task complete",
                    StepStatus::Completed,
                    StepKind::Completion { content: text.clone() },
                );
                (true, false, text, None)
            }
            Ending::Aborted => {
                progress.step(
                    "Stopped",
                    StepStatus::Failed,
                    StepKind::Error {
                        message: STOPPED_NOTE.to_string(),
                    },
                );
                (false, true, STOPPED_NOTE.to_string(), None)
            }
            Ending::MaxIterations => {
                let note = format!(
                    "{} ({}). The task may be incomplete.",
                    MAX_ITERATIONS_NOTE, self.config.max_iterations
                );
                progress.step(
                    "Iteration limit",
                    StepStatus::Completed,
                    StepKind::Error { message: note.clone() },
                );
                (false, false, note, None)
            }
            Ending::Failed(message) => {
                progress.step(
                    "Agent failed",
                    StepStatus::Failed,
                    StepKind::Error {
                        message: message.clone(),
                    },
                );
                let note = format!("I could not finish the task: {}.", message);
                (false, false, note, Some(message))
            }
        };

        run.history.push(ConversationEntry::assistant(final_content.clone()));
        progress.update(true, Some(final_content.clone()));

        AgentOutcome {
            success,
            aborted,
            final_content,
            history: run.history,
            iterations: run.iterations,
            error,
        }
    }
}
