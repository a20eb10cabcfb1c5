//! Agent profiles
//!
//! A profile bundles the guidelines (and optional full system prompt) the
//! agent runs with. Sessions capture an immutable [`ProfileSnapshot`] at
//! creation so switching profiles mid-run never changes a running session.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, Result};

pub const DEFAULT_PROFILE_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub guidelines: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Profile {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            guidelines: String::new(),
            system_prompt: None,
        }
    }

    pub fn with_guidelines(mut self, guidelines: impl Into<String>) -> Self {
        self.guidelines = guidelines.into();
        self
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        ProfileSnapshot {
            profile_id: self.id.clone(),
            profile_name: self.name.clone(),
            guidelines: self.guidelines.clone(),
            system_prompt: self.system_prompt.clone(),
            captured_at: Utc::now(),
        }
    }
}

/// Copy of a profile taken when a session starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileSnapshot {
    pub profile_id: String,
    pub profile_name: String,
    pub guidelines: String,
    pub system_prompt: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Known profiles plus the currently selected one
pub struct ProfileStore {
    profiles: RwLock<Vec<Profile>>,
    current: RwLock<String>,
}

impl ProfileStore {
    /// Build from a list of profiles. An empty list yields a single default profile.
    pub fn new(profiles: Vec<Profile>, current: Option<String>) -> Self {
        let profiles = if profiles.is_empty() {
            vec![Profile::new(DEFAULT_PROFILE_ID, "Default")]
        } else {
            profiles
        };

        let current = current
            .filter(|id| profiles.iter().any(|p| &p.id == id))
            .unwrap_or_else(|| profiles[0].id.clone());

        Self {
            profiles: RwLock::new(profiles),
            current: RwLock::new(current),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.profiles.clone(), config.active_profile.clone())
    }

    pub fn list(&self) -> Vec<Profile> {
        self.profiles.read().clone()
    }

    pub fn current(&self) -> Option<Profile> {
        let current = self.current.read();
        self.profiles.read().iter().find(|p| p.id == *current).cloned()
    }

    pub fn current_id(&self) -> String {
        self.current.read().clone()
    }

    /// Switch by id or (case-insensitive) name
    pub fn switch(&self, id_or_name: &str) -> Result<Profile> {
        let profile = self
            .profiles
            .read()
            .iter()
            .find(|p| p.id == id_or_name || p.name.eq_ignore_ascii_case(id_or_name))
            .cloned()
            .ok_or_else(|| Error::ProfileNotFound(id_or_name.to_string()))?;

        *self.current.write() = profile.id.clone();
        tracing::info!(profile = %profile.id, "Switched profile");
        Ok(profile)
    }

    pub fn snapshot(&self) -> Option<ProfileSnapshot> {
        self.current().map(|p| p.snapshot())
    }

    pub fn upsert(&self, profile: Profile) {
        let mut profiles = self.profiles.write();
        match profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => profiles.push(profile),
        }
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new(Vec::new(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ProfileStore {
        ProfileStore::new(
            vec![
                Profile::new("default", "Default").with_guidelines("Be brief."),
                Profile::new("coder", "Coder").with_guidelines("Prefer shell tools."),
            ],
            Some("coder".to_string()),
        )
    }

    #[test]
    fn test_empty_store_has_default_profile() {
        let store = ProfileStore::default();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.current_id(), DEFAULT_PROFILE_ID);
    }

    #[test]
    fn test_switch_by_id_and_name() {
        let store = store();
        assert_eq!(store.current_id(), "coder");

        store.switch("default").unwrap();
        assert_eq!(store.current_id(), "default");

        store.switch("CODER").unwrap();
        assert_eq!(store.current_id(), "coder");

        assert!(matches!(store.switch("nope"), Err(Error::ProfileNotFound(_))));
        assert_eq!(store.current_id(), "coder");
    }

    #[test]
    fn test_unknown_current_falls_back_to_first() {
        let store = ProfileStore::new(vec![Profile::new("a", "A")], Some("zzz".to_string()));
        assert_eq!(store.current_id(), "a");
    }

    #[test]
    fn test_snapshot_is_detached() {
        let store = store();
        let snapshot = store.snapshot().unwrap();
        store.upsert(Profile::new("coder", "Coder").with_guidelines("changed"));

        assert_eq!(snapshot.guidelines, "Prefer shell tools.");
        assert_eq!(store.current().unwrap().guidelines, "changed");
    }
}
