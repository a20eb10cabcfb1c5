//! Per-session concurrency and cancellation state
//!
//! One authoritative map of live sessions plus a single process-wide
//! emergency flag. Each session owns the cancellation tokens and child
//! processes registered against it; stopping or cleaning up a session
//! cancels the tokens and terminates the processes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::types::SessionId;
use crate::profile::ProfileSnapshot;
use crate::tools::process_utils::terminate_process;

/// Stopped sessions remembered after removal, so late `should_stop` checks still read true
const MAX_STOP_TOMBSTONES: usize = 256;

/// Identifies one registered cancellation handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

#[derive(Debug)]
struct SessionEntry {
    should_stop: bool,
    is_snoozed: bool,
    iteration_count: usize,
    handles: HashMap<HandleId, CancellationToken>,
    processes: HashSet<u32>,
    profile_snapshot: Option<ProfileSnapshot>,
    created_at: DateTime<Utc>,
}

impl SessionEntry {
    fn new(profile_snapshot: Option<ProfileSnapshot>) -> Self {
        Self {
            should_stop: false,
            is_snoozed: false,
            iteration_count: 0,
            handles: HashMap::new(),
            processes: HashSet::new(),
            profile_snapshot,
            created_at: Utc::now(),
        }
    }

    /// Cancel every handle and hand back the owned pids
    fn drain(&mut self) -> (usize, Vec<u32>) {
        let handles = self.handles.len();
        for (_, token) in self.handles.drain() {
            token.cancel();
        }
        (handles, self.processes.drain().collect())
    }
}

/// What a stop or cleanup swept up
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    pub handles_cancelled: usize,
    pub processes_terminated: Vec<u32>,
}

/// Read-only view of one session
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub should_stop: bool,
    pub is_snoozed: bool,
    pub iteration_count: usize,
    pub handle_count: usize,
    pub process_count: usize,
    pub profile_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub struct SessionStateManager {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    emergency_stop: AtomicBool,
    tombstones: Mutex<VecDeque<SessionId>>,
    next_handle: AtomicU64,
    kill_grace: Duration,
}

impl Default for SessionStateManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl SessionStateManager {
    /// `kill_grace` is the delay between the graceful signal and the hard kill
    pub fn new(kill_grace: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            emergency_stop: AtomicBool::new(false),
            tombstones: Mutex::new(VecDeque::new()),
            next_handle: AtomicU64::new(1),
            kill_grace,
        }
    }

    /// Create a session. Returns `false` (and changes nothing) if it already exists.
    ///
    /// A new session clears the process-wide emergency flag so it is not born
    /// pre-cancelled by an earlier stop-all.
    pub fn create_session(&self, id: &str, profile_snapshot: Option<ProfileSnapshot>) -> bool {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(id) {
            return false;
        }
        sessions.insert(id.to_string(), SessionEntry::new(profile_snapshot));
        drop(sessions);

        self.emergency_stop.store(false, Ordering::SeqCst);
        self.tombstones.lock().retain(|t| t != id);
        debug!(session_id = %id, "Session created");
        true
    }

    /// Whether the run for `id` should wind down.
    ///
    /// Unknown sessions read as stopped if they were stopped before removal,
    /// otherwise they fall back to the process-wide flag.
    pub fn should_stop(&self, id: &str) -> bool {
        if let Some(entry) = self.sessions.read().get(id) {
            return entry.should_stop;
        }
        if self.tombstones.lock().iter().any(|t| t == id) {
            return true;
        }
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Stop one session. Safe to call repeatedly and on unknown ids.
    pub fn stop_session(&self, id: &str) -> StopReport {
        let drained = {
            let mut sessions = self.sessions.write();
            sessions.get_mut(id).map(|entry| {
                entry.should_stop = true;
                entry.drain()
            })
        };

        match drained {
            Some((handles, pids)) => {
                info!(session_id = %id, handles, processes = pids.len(), "Session stopped");
                self.spawn_termination(id, &pids);
                StopReport {
                    handles_cancelled: handles,
                    processes_terminated: pids,
                }
            }
            None => {
                self.remember_stopped(id);
                StopReport::default()
            }
        }
    }

    /// Stop every known session and raise the process-wide flag
    pub fn stop_all_sessions(&self) -> StopReport {
        self.emergency_stop.store(true, Ordering::SeqCst);

        let ids: Vec<SessionId> = self.sessions.read().keys().cloned().collect();
        let mut report = StopReport::default();
        for id in ids {
            let r = self.stop_session(&id);
            report.handles_cancelled += r.handles_cancelled;
            report.processes_terminated.extend(r.processes_terminated);
        }
        warn!(
            handles = report.handles_cancelled,
            processes = report.processes_terminated.len(),
            "Emergency stop: all sessions stopped"
        );
        report
    }

    /// Sweep stragglers and remove the session.
    ///
    /// Never clears the process-wide flag; only a later `create_session` does.
    pub fn cleanup_session(&self, id: &str) -> StopReport {
        let Some(mut entry) = self.sessions.write().remove(id) else {
            return StopReport::default();
        };

        let (handles, pids) = entry.drain();
        if entry.should_stop {
            self.remember_stopped(id);
        }
        self.spawn_termination(id, &pids);
        debug!(session_id = %id, handles, processes = pids.len(), "Session cleaned up");

        StopReport {
            handles_cancelled: handles,
            processes_terminated: pids,
        }
    }

    /// Attach a cancellation token to a session.
    ///
    /// Returns `None` when the token was not retained: the session is unknown,
    /// or it is already stopped, in which case the token is cancelled at once.
    pub fn register_cancellation_handle(
        &self,
        id: &str,
        token: CancellationToken,
    ) -> Option<HandleId> {
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(id) else {
            drop(sessions);
            if self.should_stop(id) {
                token.cancel();
            }
            return None;
        };

        if entry.should_stop {
            token.cancel();
            return None;
        }

        let handle = HandleId(self.next_handle.fetch_add(1, Ordering::SeqCst));
        entry.handles.insert(handle, token);
        Some(handle)
    }

    pub fn unregister_cancellation_handle(&self, id: &str, handle: HandleId) -> bool {
        self.sessions
            .write()
            .get_mut(id)
            .is_some_and(|entry| entry.handles.remove(&handle).is_some())
    }

    /// Attach a child process to a session. A stopped session terminates it immediately.
    pub fn register_process(&self, id: &str, pid: u32) -> bool {
        let mut sessions = self.sessions.write();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };

        if entry.should_stop {
            drop(sessions);
            self.spawn_termination(id, &[pid]);
            return false;
        }

        entry.processes.insert(pid);
        true
    }

    pub fn unregister_process(&self, id: &str, pid: u32) -> bool {
        self.sessions
            .write()
            .get_mut(id)
            .is_some_and(|entry| entry.processes.remove(&pid))
    }

    /// Bump and return the session's iteration count
    pub fn increment_iteration(&self, id: &str) -> Option<usize> {
        self.sessions.write().get_mut(id).map(|entry| {
            entry.iteration_count += 1;
            entry.iteration_count
        })
    }

    pub fn iteration_count(&self, id: &str) -> Option<usize> {
        self.sessions.read().get(id).map(|e| e.iteration_count)
    }

    /// Sum of iteration counts across live sessions
    pub fn total_iterations(&self) -> usize {
        self.sessions.read().values().map(|e| e.iteration_count).sum()
    }

    pub fn set_snoozed(&self, id: &str, snoozed: bool) -> bool {
        self.sessions
            .write()
            .get_mut(id)
            .map(|entry| entry.is_snoozed = snoozed)
            .is_some()
    }

    pub fn is_snoozed(&self, id: &str) -> bool {
        self.sessions.read().get(id).is_some_and(|e| e.is_snoozed)
    }

    pub fn profile_snapshot(&self, id: &str) -> Option<ProfileSnapshot> {
        self.sessions
            .read()
            .get(id)
            .and_then(|e| e.profile_snapshot.clone())
    }

    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Ids of sessions that have not been asked to stop, sorted
    pub fn active_session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .read()
            .iter()
            .filter(|(_, e)| !e.should_stop)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .iter()
            .map(|(id, e)| SessionSummary {
                session_id: id.clone(),
                should_stop: e.should_stop,
                is_snoozed: e.is_snoozed,
                iteration_count: e.iteration_count,
                handle_count: e.handles.len(),
                process_count: e.processes.len(),
                profile_id: e.profile_snapshot.as_ref().map(|p| p.profile_id.clone()),
                created_at: e.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    fn remember_stopped(&self, id: &str) {
        let mut tombstones = self.tombstones.lock();
        if tombstones.iter().any(|t| t == id) {
            return;
        }
        if tombstones.len() >= MAX_STOP_TOMBSTONES {
            tombstones.pop_front();
        }
        tombstones.push_back(id.to_string());
    }

    fn spawn_termination(&self, id: &str, pids: &[u32]) {
        if pids.is_empty() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(session_id = %id, ?pids, "No async runtime; cannot terminate processes");
            return;
        };
        for &pid in pids {
            let grace = self.kill_grace;
            let session_id = id.to_string();
            runtime.spawn(async move {
                let forced = terminate_process(pid, grace).await;
                debug!(session_id = %session_id, pid, forced, "Process terminated");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;

    #[test]
    fn test_create_is_idempotent() {
        let state = SessionStateManager::default();
        assert!(state.create_session("a", None));
        state.increment_iteration("a");
        assert!(!state.create_session("a", None));
        assert_eq!(state.iteration_count("a"), Some(1));
    }

    #[test]
    fn test_stop_is_idempotent_and_survives_cleanup() {
        let state = SessionStateManager::default();
        state.create_session("a", None);

        state.stop_session("a");
        state.stop_session("a");
        assert!(state.should_stop("a"));

        state.cleanup_session("a");
        assert!(!state.has_session("a"));
        assert!(state.should_stop("a"));

        state.stop_session("a");
        assert!(state.should_stop("a"));
    }

    #[test]
    fn test_unknown_session_falls_back_to_global_flag() {
        let state = SessionStateManager::default();
        assert!(!state.should_stop("ghost"));

        state.create_session("a", None);
        state.stop_all_sessions();
        assert!(state.is_emergency_stopped());
        assert!(state.should_stop("a"));
        assert!(state.should_stop("ghost"));
    }

    #[test]
    fn test_cleanup_keeps_global_flag_until_next_create() {
        let state = SessionStateManager::default();
        state.create_session("a", None);
        state.stop_all_sessions();
        state.cleanup_session("a");
        assert!(state.is_emergency_stopped());

        assert!(state.create_session("b", None));
        assert!(!state.is_emergency_stopped());
        assert!(!state.should_stop("b"));
        // "a" was stopped before it went away
        assert!(state.should_stop("a"));
    }

    #[test]
    fn test_recreate_clears_tombstone() {
        let state = SessionStateManager::default();
        state.create_session("a", None);
        state.stop_session("a");
        state.cleanup_session("a");

        state.create_session("a", None);
        assert!(!state.should_stop("a"));
    }

    #[test]
    fn test_stop_cancels_registered_handles() {
        let state = SessionStateManager::default();
        state.create_session("a", None);
        let token = CancellationToken::new();
        let other = CancellationToken::new();
        state.register_cancellation_handle("a", token.clone()).unwrap();
        let handle = state.register_cancellation_handle("a", other.clone()).unwrap();
        assert!(state.unregister_cancellation_handle("a", handle));

        let report = state.stop_session("a");
        assert_eq!(report.handles_cancelled, 1);
        assert!(token.is_cancelled());
        assert!(!other.is_cancelled());
    }

    #[test]
    fn test_register_on_stopped_session_cancels_immediately() {
        let state = SessionStateManager::default();
        state.create_session("a", None);
        state.stop_session("a");

        let token = CancellationToken::new();
        assert!(state.register_cancellation_handle("a", token.clone()).is_none());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_total_iterations_is_derived() {
        let state = SessionStateManager::default();
        state.create_session("a", None);
        state.create_session("b", None);
        state.increment_iteration("a");
        state.increment_iteration("a");
        state.increment_iteration("b");
        assert_eq!(state.total_iterations(), 3);

        state.cleanup_session("a");
        assert_eq!(state.total_iterations(), 1);
    }

    #[test]
    fn test_snapshot_and_snooze() {
        let state = SessionStateManager::default();
        let snapshot = Profile::new("p1", "One").snapshot();
        state.create_session("a", Some(snapshot.clone()));

        assert_eq!(state.profile_snapshot("a"), Some(snapshot));
        assert!(!state.is_snoozed("a"));
        assert!(state.set_snoozed("a", true));
        assert!(state.is_snoozed("a"));
        assert!(!state.set_snoozed("missing", true));
    }

    #[test]
    fn test_active_session_ids_excludes_stopped() {
        let state = SessionStateManager::default();
        state.create_session("b", None);
        state.create_session("a", None);
        state.create_session("c", None);
        state.stop_session("c");
        assert_eq!(state.active_session_ids(), vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_terminates_owned_process() {
        use crate::tools::process_utils::shell_command;

        let state = SessionStateManager::new(Duration::from_millis(500));
        state.create_session("a", None);

        let mut child = shell_command("sleep 30").spawn().unwrap();
        let pid = child.id().unwrap();
        assert!(state.register_process("a", pid));

        let report = state.stop_session("a");
        assert_eq!(report.processes_terminated, vec![pid]);

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("process should be terminated")
            .unwrap();
        assert!(!status.success());
    }
}
