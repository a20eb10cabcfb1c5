//! Conversation persistence - save and load transcripts
//!
//! The runtime only needs append and load; storage engines live behind
//! [`ConversationStore`]. [`JsonFileStore`] keeps one JSON file per
//! conversation, [`MemoryStore`] is for tests and ephemeral frontends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::types::ConversationEntry;
use crate::error::{Error, Result};

/// Saved conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedConversation {
    pub id: String,
    pub entries: Vec<ConversationEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SavedConversation {
    fn new(id: &str) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            entries: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            entry_count: self.entries.len(),
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub entry_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Entries of a conversation, `None` if it does not exist
    async fn load(&self, id: &str) -> Result<Option<Vec<ConversationEntry>>>;

    /// Append entries, creating the conversation if needed
    async fn append(&self, id: &str, entries: &[ConversationEntry]) -> Result<()>;

    /// Known conversations, most recently updated first
    async fn list(&self) -> Result<Vec<ConversationSummary>>;

    /// Returns `false` if there was nothing to delete
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// Ids become file names, so keep them to a safe alphabet
fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Storage(format!("invalid conversation id: {:?}", id)))
    }
}

/// One `<id>.json` file per conversation
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn read(&self, path: &Path) -> Result<Option<SavedConversation>> {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn load(&self, id: &str) -> Result<Option<Vec<ConversationEntry>>> {
        let path = self.path_for(id)?;
        Ok(self.read(&path).await?.map(|saved| saved.entries))
    }

    async fn append(&self, id: &str, entries: &[ConversationEntry]) -> Result<()> {
        let path = self.path_for(id)?;
        let mut saved = self
            .read(&path)
            .await?
            .unwrap_or_else(|| SavedConversation::new(id));
        saved.entries.extend_from_slice(entries);
        saved.updated_at = Utc::now();

        tokio::fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_string_pretty(&saved)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(conversation_id = id, appended = entries.len(), "Conversation saved");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut conversations = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match self.read(&path).await {
                Ok(Some(saved)) => conversations.push(saved.summary()),
                Ok(None) => {}
                Err(e) => warn!("Failed to read conversation {:?}: {}", path, e),
            }
        }

        conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(conversations)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let path = self.path_for(id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    conversations: RwLock<HashMap<String, SavedConversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Vec<ConversationEntry>>> {
        Ok(self.conversations.read().get(id).map(|c| c.entries.clone()))
    }

    async fn append(&self, id: &str, entries: &[ConversationEntry]) -> Result<()> {
        let mut conversations = self.conversations.write();
        let saved = conversations
            .entry(id.to_string())
            .or_insert_with(|| SavedConversation::new(id));
        saved.entries.extend_from_slice(entries);
        saved.updated_at = Utc::now();
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationSummary>> {
        let mut list: Vec<ConversationSummary> = self
            .conversations
            .read()
            .values()
            .map(SavedConversation::summary)
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.conversations.write().remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_json_store_appends_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("conversations"));

        assert!(store.load("c1").await.unwrap().is_none());
        assert!(store.list().await.unwrap().is_empty());

        store.append("c1", &[ConversationEntry::user("hi")]).await.unwrap();
        store
            .append("c1", &[ConversationEntry::assistant("hello")])
            .await
            .unwrap();

        let entries = store.load("c1").await.unwrap().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "hello");

        let list = store.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].entry_count, 2);

        assert!(store.delete("c1").await.unwrap());
        assert!(!store.delete("c1").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("../etc/passwd").await.is_err());
        assert!(store.append("..", &[]).await.is_err());
        assert!(store.load("").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.append("a", &[ConversationEntry::user("one")]).await.unwrap();
        assert_eq!(store.load("a").await.unwrap().unwrap().len(), 1);
        assert!(store.load("b").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap()[0].id, "a");
    }
}
