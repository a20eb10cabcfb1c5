//! Per-conversation message queue
//!
//! Messages typed while an agent is busy wait here until the conversation
//! is free. Each conversation has its own FIFO; an absent or blank
//! conversation id maps to the shared `"default"` queue.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_CONVERSATION: &str = "default";

/// Map an optional conversation id onto a queue key
pub fn normalize_conversation_id(id: Option<&str>) -> String {
    match id.map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => DEFAULT_CONVERSATION.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    pub status: QueueStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<String, Vec<QueuedMessage>>,
    paused: HashSet<String>,
}

impl QueueState {
    fn find_mut(&mut self, id: &str) -> Option<&mut QueuedMessage> {
        self.queues
            .values_mut()
            .flat_map(|q| q.iter_mut())
            .find(|m| m.id == id)
    }
}

#[derive(Default)]
pub struct MessageQueueManager {
    state: Mutex<QueueState>,
}

impl MessageQueueManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, conversation_id: Option<&str>, content: impl Into<String>) -> QueuedMessage {
        let conversation_id = normalize_conversation_id(conversation_id);
        let message = QueuedMessage {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            content: content.into(),
            status: QueueStatus::Queued,
            retry_count: 0,
            error: None,
            created_at: Utc::now(),
        };

        self.state
            .lock()
            .queues
            .entry(conversation_id.clone())
            .or_default()
            .push(message.clone());
        debug!(conversation_id = %conversation_id, message_id = %message.id, "Message queued");
        message
    }

    /// Take the first queued message of a conversation and mark it processing.
    ///
    /// Paused conversations yield nothing.
    pub fn dequeue(&self, conversation_id: Option<&str>) -> Option<QueuedMessage> {
        let conversation_id = normalize_conversation_id(conversation_id);
        let mut state = self.state.lock();
        if state.paused.contains(&conversation_id) {
            return None;
        }

        let message = state
            .queues
            .get_mut(&conversation_id)?
            .iter_mut()
            .find(|m| m.status == QueueStatus::Queued)?;
        message.status = QueueStatus::Processing;
        Some(message.clone())
    }

    pub fn mark_completed(&self, id: &str) -> Result<()> {
        self.transition(id, QueueStatus::Processing, QueueStatus::Completed, None)
    }

    pub fn mark_failed(&self, id: &str, error: impl Into<String>) -> Result<()> {
        self.transition(id, QueueStatus::Processing, QueueStatus::Failed, Some(error.into()))
    }

    /// Put a failed message back in line
    pub fn retry(&self, id: &str) -> Result<()> {
        self.transition(id, QueueStatus::Failed, QueueStatus::Queued, None)?;
        let mut state = self.state.lock();
        if let Some(message) = state.find_mut(id) {
            message.retry_count += 1;
            message.error = None;
        }
        Ok(())
    }

    fn transition(
        &self,
        id: &str,
        from: QueueStatus,
        to: QueueStatus,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let message = state
            .find_mut(id)
            .ok_or_else(|| Error::Queue(format!("Message not found: {}", id)))?;

        if message.status != from {
            return Err(Error::Queue(format!(
                "Message {} is {:?}, expected {:?}",
                id, message.status, from
            )));
        }

        message.status = to;
        if error.is_some() {
            message.error = error;
        }
        Ok(())
    }

    pub fn pause(&self, conversation_id: Option<&str>) {
        self.state
            .lock()
            .paused
            .insert(normalize_conversation_id(conversation_id));
    }

    pub fn resume(&self, conversation_id: Option<&str>) {
        self.state
            .lock()
            .paused
            .remove(&normalize_conversation_id(conversation_id));
    }

    pub fn is_paused(&self, conversation_id: Option<&str>) -> bool {
        self.state
            .lock()
            .paused
            .contains(&normalize_conversation_id(conversation_id))
    }

    /// Move `ordered_ids` to the front in the given order, keeping the rest in
    /// their original relative order. Nothing changes if any id is foreign or repeated.
    pub fn reorder(&self, conversation_id: Option<&str>, ordered_ids: &[String]) -> Result<()> {
        let conversation_id = normalize_conversation_id(conversation_id);
        let mut state = self.state.lock();
        let queue = state
            .queues
            .get_mut(&conversation_id)
            .ok_or_else(|| Error::Queue(format!("No queue for conversation {}", conversation_id)))?;

        let mut seen = HashSet::new();
        for id in ordered_ids {
            if !seen.insert(id.as_str()) {
                return Err(Error::Queue(format!("Duplicate id in reorder: {}", id)));
            }
            if !queue.iter().any(|m| &m.id == id) {
                return Err(Error::Queue(format!(
                    "Message {} does not belong to conversation {}",
                    id, conversation_id
                )));
            }
        }

        let mut reordered = Vec::with_capacity(queue.len());
        for id in ordered_ids {
            if let Some(message) = queue.iter().find(|m| &m.id == id) {
                reordered.push(message.clone());
            }
        }
        reordered.extend(
            queue
                .iter()
                .filter(|m| !seen.contains(m.id.as_str()))
                .cloned(),
        );
        *queue = reordered;
        Ok(())
    }

    /// Edit a message that has not started processing
    pub fn update_content(&self, id: &str, content: impl Into<String>) -> Result<()> {
        let mut state = self.state.lock();
        let message = state
            .find_mut(id)
            .ok_or_else(|| Error::Queue(format!("Message not found: {}", id)))?;
        if message.status != QueueStatus::Queued {
            return Err(Error::Queue(format!(
                "Only queued messages can be edited ({} is {:?})",
                id, message.status
            )));
        }
        message.content = content.into();
        Ok(())
    }

    /// Remove a message that is not being processed
    pub fn remove(&self, id: &str) -> Result<QueuedMessage> {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            if let Some(pos) = queue.iter().position(|m| m.id == id) {
                if queue[pos].status == QueueStatus::Processing {
                    return Err(Error::Queue(format!("Message {} is being processed", id)));
                }
                return Ok(queue.remove(pos));
            }
        }
        Err(Error::Queue(format!("Message not found: {}", id)))
    }

    /// Drop everything except the message being processed. Returns the number removed.
    pub fn clear(&self, conversation_id: Option<&str>) -> usize {
        let conversation_id = normalize_conversation_id(conversation_id);
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(&conversation_id) else {
            return 0;
        };
        let before = queue.len();
        queue.retain(|m| m.status == QueueStatus::Processing);
        before - queue.len()
    }

    pub fn list(&self, conversation_id: Option<&str>) -> Vec<QueuedMessage> {
        let conversation_id = normalize_conversation_id(conversation_id);
        self.state
            .lock()
            .queues
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.state.lock().find_mut(id).map(|m| m.clone())
    }

    /// Remove completed messages from one conversation, or all when `None`
    pub fn prune_completed(&self, conversation_id: Option<&str>) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        let target = conversation_id.map(|c| normalize_conversation_id(Some(c)));
        for (key, queue) in state.queues.iter_mut() {
            if target.as_ref().is_some_and(|t| t != key) {
                continue;
            }
            let before = queue.len();
            queue.retain(|m| m.status != QueueStatus::Completed);
            removed += before - queue.len();
        }
        state.queues.retain(|_, q| !q.is_empty());
        removed
    }

    /// Conversations with at least one queued message
    pub fn conversations_with_pending(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.iter().any(|m| m.status == QueueStatus::Queued))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_conversation_id() {
        assert_eq!(normalize_conversation_id(None), "default");
        assert_eq!(normalize_conversation_id(Some("  ")), "default");
        assert_eq!(normalize_conversation_id(Some("c1")), "c1");
    }

    #[test]
    fn test_fifo_and_pause() {
        let queue = MessageQueueManager::new();
        let first = queue.enqueue(Some("c1"), "one");
        queue.enqueue(Some("c1"), "two");

        queue.pause(Some("c1"));
        assert!(queue.dequeue(Some("c1")).is_none());
        // Enqueue still works while paused
        queue.enqueue(Some("c1"), "three");
        queue.resume(Some("c1"));

        let got = queue.dequeue(Some("c1")).unwrap();
        assert_eq!(got.id, first.id);
        assert_eq!(got.status, QueueStatus::Processing);

        let next = queue.dequeue(Some("c1")).unwrap();
        assert_eq!(next.content, "two");
    }

    #[test]
    fn test_status_transitions() {
        let queue = MessageQueueManager::new();
        let m = queue.enqueue(None, "hello");

        assert!(queue.mark_completed(&m.id).is_err());
        queue.dequeue(None).unwrap();
        queue.mark_failed(&m.id, "boom").unwrap();
        assert_eq!(queue.get(&m.id).unwrap().error.as_deref(), Some("boom"));

        queue.retry(&m.id).unwrap();
        let retried = queue.get(&m.id).unwrap();
        assert_eq!(retried.status, QueueStatus::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.error.is_none());
        assert!(queue.retry(&m.id).is_err());
    }

    #[test]
    fn test_reorder_all_or_nothing() {
        let queue = MessageQueueManager::new();
        queue.enqueue(Some("c"), "a");
        let b = queue.enqueue(Some("c"), "b");
        let c = queue.enqueue(Some("c"), "c");
        let d = queue.enqueue(Some("c"), "d");
        let other = queue.enqueue(Some("x"), "x");

        let err = queue.reorder(Some("c"), &[c.id.clone(), other.id.clone()]);
        assert!(err.is_err());
        let unchanged: Vec<String> = queue.list(Some("c")).into_iter().map(|m| m.content).collect();
        assert_eq!(unchanged, vec!["a", "b", "c", "d"]);

        queue.reorder(Some("c"), &[d.id.clone(), b.id.clone()]).unwrap();
        let order: Vec<String> = queue.list(Some("c")).into_iter().map(|m| m.content).collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
    }

    #[test]
    fn test_update_and_remove_rules() {
        let queue = MessageQueueManager::new();
        let m = queue.enqueue(None, "draft");
        queue.update_content(&m.id, "final").unwrap();
        assert_eq!(queue.get(&m.id).unwrap().content, "final");

        queue.dequeue(None).unwrap();
        assert!(queue.update_content(&m.id, "late").is_err());
        assert!(queue.remove(&m.id).is_err());

        queue.mark_completed(&m.id).unwrap();
        assert_eq!(queue.prune_completed(None), 1);
        assert!(queue.list(None).is_empty());
    }

    #[test]
    fn test_clear_keeps_processing_message() {
        let queue = MessageQueueManager::new();
        queue.enqueue(None, "a");
        queue.enqueue(None, "b");
        queue.dequeue(None).unwrap();
        assert_eq!(queue.clear(None), 1);
        assert_eq!(queue.list(None).len(), 1);
        assert_eq!(queue.conversations_with_pending(), Vec::<String>::new());
    }
}
