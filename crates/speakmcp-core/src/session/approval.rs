//! Tool approval coordination
//!
//! Each approval request gets an id and a oneshot channel. A decision
//! resolves the channel exactly once and removes the record; cancelling
//! resolves outstanding requests as denied so no waiter blocks forever.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

impl ApprovalDecision {
    pub fn is_approved(self) -> bool {
        matches!(self, ApprovalDecision::Approved)
    }
}

/// A request waiting for a human decision
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub approval_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub created_at: DateTime<Utc>,
}

struct PendingEntry {
    info: PendingApproval,
    responder: oneshot::Sender<ApprovalDecision>,
}

/// Caller side of one approval request
#[derive(Debug)]
pub struct ApprovalHandle {
    pub approval_id: String,
    receiver: oneshot::Receiver<ApprovalDecision>,
}

impl ApprovalHandle {
    /// Wait for the decision. A responder that vanished counts as denied.
    pub async fn wait(self) -> ApprovalDecision {
        self.receiver.await.unwrap_or(ApprovalDecision::Denied)
    }
}

#[derive(Default)]
pub struct ToolApprovalManager {
    pending: Mutex<HashMap<String, PendingEntry>>,
}

impl ToolApprovalManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_approval(
        &self,
        session_id: &str,
        tool_name: &str,
        arguments: Value,
    ) -> ApprovalHandle {
        let approval_id = uuid::Uuid::new_v4().to_string();
        let (responder, receiver) = oneshot::channel();

        let info = PendingApproval {
            approval_id: approval_id.clone(),
            session_id: session_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            created_at: Utc::now(),
        };
        self.pending
            .lock()
            .insert(approval_id.clone(), PendingEntry { info, responder });

        info!(session_id, tool_name, approval_id = %approval_id, "Approval requested");
        ApprovalHandle {
            approval_id,
            receiver,
        }
    }

    /// Deliver a decision. Returns `false` if the id is unknown or already resolved.
    pub fn respond(&self, approval_id: &str, approved: bool) -> bool {
        let Some(entry) = self.pending.lock().remove(approval_id) else {
            debug!(approval_id, "Approval response for unknown id");
            return false;
        };

        let decision = if approved {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Denied
        };
        // The waiter may have given up; the decision is still consumed
        let _ = entry.responder.send(decision);
        info!(approval_id, ?decision, tool = %entry.info.tool_name, "Approval resolved");
        true
    }

    /// Deny every pending request of one session
    pub fn cancel_for_session(&self, session_id: &str) -> usize {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.pending.lock();
            let ids: Vec<String> = pending
                .values()
                .filter(|e| e.info.session_id == session_id)
                .map(|e| e.info.approval_id.clone())
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        Self::deny_all(drained, session_id)
    }

    /// Deny every pending request
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().drain().map(|(_, e)| e).collect();
        Self::deny_all(drained, "*")
    }

    fn deny_all(entries: Vec<PendingEntry>, scope: &str) -> usize {
        let count = entries.len();
        for entry in entries {
            let _ = entry.responder.send(ApprovalDecision::Denied);
        }
        if count > 0 {
            info!(scope, count, "Pending approvals cancelled");
        }
        count
    }

    /// All pending requests, oldest first
    pub fn pending(&self) -> Vec<PendingApproval> {
        let mut list: Vec<PendingApproval> =
            self.pending.lock().values().map(|e| e.info.clone()).collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    pub fn pending_for_session(&self, session_id: &str) -> Vec<PendingApproval> {
        self.pending()
            .into_iter()
            .filter(|p| p.session_id == session_id)
            .collect()
    }
}
