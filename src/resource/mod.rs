//! Resource State Manager.
//!
//! Persistent record of browser-side resources that outlive any one
//! process: debugger sessions, per-tab operation locks, network captures,
//! and content-script injections.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Where a debugger session attachment originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebuggerSource {
    /// Attached by this broker.
    SelfAttached,
    /// Attached by some other extension or devtools instance.
    External,
    /// Found already attached at startup.
    Existing,
}

/// A browser debugger session on a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebuggerSession {
    /// Unix millis the session was attached.
    pub attached_at: u64,
    /// Where the attachment came from.
    pub source: DebuggerSource,
    /// Free-form reason this session exists (logging only).
    pub purpose: String,
    /// Whether the session can be cleanly detached.
    pub can_detach: bool,
    /// Whether `verify_debugger` has confirmed liveness.
    pub verified: bool,
    /// Unix millis of the last successful verification, if any.
    pub last_verified: Option<u64>,
}

/// An exclusive per-tab operation lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationLock {
    /// The operation this lock is held for.
    pub op: String,
    /// Peer id that holds the lock.
    pub holder_peer_id: String,
    /// Unix millis the lock was acquired.
    pub acquired_at: u64,
    /// Requested hold duration, in milliseconds.
    pub timeout_ms: u64,
    /// Unix millis at which the lock auto-releases regardless of holder.
    pub auto_release_at: u64,
}

/// An active network capture session on a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkCapture {
    /// Unix millis the capture started.
    pub started_at: u64,
    /// Id of the debugger session this capture piggybacks on, if any.
    pub linked_debugger: Option<String>,
}

/// A content script injected into a tab.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentScript {
    /// Script version/build identifier.
    pub version: String,
    /// Execution worlds the script was injected into.
    pub worlds: Vec<String>,
    /// Unix millis of injection.
    pub injected_at: u64,
}

/// Whether an attach-style call created a new record or found one already
/// there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachOutcome {
    /// No prior record existed; one was created.
    Created,
    /// A record already existed and was left untouched.
    AlreadyPresent,
}

/// The result of a sweep for orphaned resources.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Tab ids whose debugger session looked orphaned.
    pub orphaned_debugger_sessions: Vec<u64>,
    /// Tab ids whose operation lock had passed its `auto_release_at`.
    pub expired_locks: Vec<u64>,
}

/// Emitted after [`ResourceStateManager::on_extension_restart`] completes.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// The sweep performed as part of recovery.
    pub sweep: SweepReport,
    /// Unix millis the extension reported as its own startup time.
    pub extension_startup_time: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    debugger_sessions: HashMap<u64, DebuggerSession>,
    locks: HashMap<u64, OperationLock>,
    network_captures: HashMap<u64, NetworkCapture>,
    content_scripts: HashMap<u64, ContentScript>,
}

/// Tracks browser-side resources keyed by tab id.
pub struct ResourceStateManager {
    state: Mutex<PersistedState>,
    state_path: PathBuf,
    auto_release_timers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl ResourceStateManager {
    /// Loads existing state from `state_path` (quarantining it if
    /// corrupted).
    pub fn new(state_path: PathBuf) -> Self {
        let state = crate::statefile::load_or_default(&state_path);
        Self {
            state: Mutex::new(state),
            state_path,
            auto_release_timers: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent: attaching twice updates nothing but `attached_at` stays
    /// as of the first attach.
    pub async fn attach_debugger(
        &self,
        tab_id: u64,
        source: DebuggerSource,
        purpose: &str,
    ) -> AttachOutcome {
        let mut state = self.state.lock().await;
        let outcome = if state.debugger_sessions.contains_key(&tab_id) {
            AttachOutcome::AlreadyPresent
        } else {
            AttachOutcome::Created
        };
        state.debugger_sessions.entry(tab_id).or_insert_with(|| DebuggerSession {
            attached_at: now_millis(),
            source,
            purpose: purpose.to_string(),
            can_detach: true,
            verified: false,
            last_verified: None,
        });
        self.persist(&state);
        outcome
    }

    /// Removes the debugger session for `tab_id`.
    pub async fn detach_debugger(&self, tab_id: u64) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        state
            .debugger_sessions
            .remove(&tab_id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound {
                what: format!("debugger session for tab {tab_id}"),
            })
            .inspect(|()| self.persist(&state))
    }

    /// Marks a session as verified and returns its current age.
    pub async fn verify_debugger(&self, tab_id: u64) -> Result<(bool, u64), BridgeError> {
        let mut state = self.state.lock().await;
        let now = now_millis();
        let session = state
            .debugger_sessions
            .get_mut(&tab_id)
            .ok_or_else(|| BridgeError::NotFound {
                what: format!("debugger session for tab {tab_id}"),
            })?;
        session.verified = true;
        session.last_verified = Some(now);
        let can_detach = session.can_detach;
        let age_ms = now.saturating_sub(session.attached_at);
        self.persist(&state);
        Ok((can_detach, age_ms))
    }

    /// Acquires an exclusive operation lock on `tab_id`, scheduling an
    /// auto-release timer. Fails with `Busy` if already held.
    ///
    /// Takes `Arc<Self>` because the auto-release timer must be able to
    /// call back into the manager after the caller's own reference has
    /// gone out of scope.
    pub async fn acquire_lock(
        self: &std::sync::Arc<Self>,
        tab_id: u64,
        op: &str,
        holder_peer_id: &str,
        timeout_ms: u64,
    ) -> Result<(), BridgeError> {
        {
            let mut state = self.state.lock().await;
            if state.locks.contains_key(&tab_id) {
                return Err(BridgeError::Busy {
                    resource: format!("tab:{tab_id}"),
                });
            }
            let now = now_millis();
            state.locks.insert(
                tab_id,
                OperationLock {
                    op: op.to_string(),
                    holder_peer_id: holder_peer_id.to_string(),
                    acquired_at: now,
                    timeout_ms,
                    auto_release_at: now + timeout_ms,
                },
            );
            self.persist(&state);
        }
        self.schedule_auto_release(tab_id, timeout_ms).await;
        Ok(())
    }

    /// Releases the lock on `tab_id`, cancelling its auto-release timer.
    /// Idempotent: a second release returns `NotFound`, not an error trap.
    pub async fn release_lock(&self, tab_id: u64) -> Result<(), BridgeError> {
        let had_lock = {
            let mut state = self.state.lock().await;
            let existed = state.locks.remove(&tab_id).is_some();
            if existed {
                self.persist(&state);
            }
            existed
        };
        self.cancel_auto_release(tab_id).await;
        if had_lock {
            Ok(())
        } else {
            Err(BridgeError::NotFound {
                what: format!("lock on tab {tab_id}"),
            })
        }
    }

    async fn schedule_auto_release(self: &std::sync::Arc<Self>, tab_id: u64, timeout_ms: u64) {
        let manager = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            let mut state = manager.state.lock().await;
            if state.locks.remove(&tab_id).is_some() {
                manager.persist(&state);
                log::debug!("auto-released lock on tab {tab_id} after {timeout_ms}ms");
            }
        });
        self.auto_release_timers.lock().await.insert(tab_id, handle);
    }

    async fn cancel_auto_release(&self, tab_id: u64) {
        if let Some(handle) = self.auto_release_timers.lock().await.remove(&tab_id) {
            handle.abort();
        }
    }

    /// Registers a network capture on `tab_id`.
    pub async fn start_network_capture(
        &self,
        tab_id: u64,
        linked_debugger: Option<String>,
    ) -> AttachOutcome {
        let mut state = self.state.lock().await;
        let outcome = if state.network_captures.contains_key(&tab_id) {
            AttachOutcome::AlreadyPresent
        } else {
            AttachOutcome::Created
        };
        state.network_captures.entry(tab_id).or_insert_with(|| NetworkCapture {
            started_at: now_millis(),
            linked_debugger,
        });
        self.persist(&state);
        outcome
    }

    /// Removes the network capture on `tab_id`.
    pub async fn stop_network_capture(&self, tab_id: u64) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        state
            .network_captures
            .remove(&tab_id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound {
                what: format!("network capture on tab {tab_id}"),
            })
            .inspect(|()| self.persist(&state))
    }

    /// Records a content script injection on `tab_id`.
    pub async fn register_content_script(&self, tab_id: u64, version: &str, worlds: Vec<String>) {
        let mut state = self.state.lock().await;
        state.content_scripts.insert(
            tab_id,
            ContentScript {
                version: version.to_string(),
                worlds,
                injected_at: now_millis(),
            },
        );
        self.persist(&state);
    }

    /// Removes the content script record for `tab_id`.
    pub async fn unregister_content_script(&self, tab_id: u64) -> Result<(), BridgeError> {
        let mut state = self.state.lock().await;
        state
            .content_scripts
            .remove(&tab_id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::NotFound {
                what: format!("content script for tab {tab_id}"),
            })
            .inspect(|()| self.persist(&state))
    }

    /// Reports (and, if `release_expired` is set, releases) resources that
    /// look orphaned as of `now`.
    pub async fn sweep(&self, now: u64, release_expired: bool) -> SweepReport {
        let mut state = self.state.lock().await;
        let orphaned_debugger_sessions: Vec<u64> = state
            .debugger_sessions
            .iter()
            .filter(|(_, s)| !s.verified)
            .map(|(tab, _)| *tab)
            .collect();

        let expired_locks: Vec<u64> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.auto_release_at <= now)
            .map(|(tab, _)| *tab)
            .collect();

        if release_expired {
            for tab in &expired_locks {
                state.locks.remove(tab);
            }
            self.persist(&state);
        }

        SweepReport {
            orphaned_debugger_sessions,
            expired_locks,
        }
    }

    /// Runs a sweep, releases expired locks, and records the extension's
    /// reported startup time. Called when the browser extension itself
    /// restarts and resource state may be stale.
    pub async fn on_extension_restart(&self, extension_startup_time: u64) -> RecoveryReport {
        let sweep = self.sweep(now_millis(), true).await;
        RecoveryReport {
            sweep,
            extension_startup_time,
        }
    }

    fn persist(&self, state: &PersistedState) {
        crate::statefile::save_best_effort(&self.state_path, state);
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (std::sync::Arc<ResourceStateManager>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        (std::sync::Arc::new(ResourceStateManager::new(path)), dir)
    }

    #[tokio::test]
    async fn test_attach_debugger_is_idempotent() {
        let (mgr, _dir) = manager();
        let first = mgr.attach_debugger(1, DebuggerSource::SelfAttached, "navigate").await;
        let second = mgr.attach_debugger(1, DebuggerSource::SelfAttached, "navigate").await;
        assert_eq!(first, AttachOutcome::Created);
        assert_eq!(second, AttachOutcome::AlreadyPresent);
        mgr.detach_debugger(1).await.unwrap();
        assert!(matches!(
            mgr.detach_debugger(1).await,
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_verify_debugger_sets_verified_and_age() {
        let (mgr, _dir) = manager();
        mgr.attach_debugger(2, DebuggerSource::Existing, "capture").await;
        let (can_detach, age_ms) = mgr.verify_debugger(2).await.unwrap();
        assert!(can_detach);
        assert!(age_ms < 1_000);
    }

    #[tokio::test]
    async fn test_acquire_lock_rejects_second_holder() {
        let (mgr, _dir) = manager();
        mgr.acquire_lock(3, "navigate", "host-a", 10_000).await.unwrap();
        let result = mgr.acquire_lock(3, "navigate", "host-b", 10_000).await;
        assert!(matches!(result, Err(BridgeError::Busy { .. })));
    }

    #[tokio::test]
    async fn test_release_lock_then_reacquire() {
        let (mgr, _dir) = manager();
        mgr.acquire_lock(4, "navigate", "host-a", 10_000).await.unwrap();
        mgr.release_lock(4).await.unwrap();
        mgr.acquire_lock(4, "navigate", "host-b", 10_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_reports_expired_lock_and_optionally_releases() {
        let (mgr, _dir) = manager();
        mgr.acquire_lock(5, "navigate", "host-a", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = mgr.sweep(now_millis(), false).await;
        assert_eq!(report.expired_locks, vec![5]);

        let report = mgr.sweep(now_millis(), true).await;
        assert_eq!(report.expired_locks, vec![5]);

        // now released
        mgr.acquire_lock(5, "navigate", "host-b", 10_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_on_extension_restart_releases_expired_locks() {
        let (mgr, _dir) = manager();
        mgr.acquire_lock(6, "navigate", "host-a", 1).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = mgr.on_extension_restart(now_millis()).await;
        assert_eq!(report.sweep.expired_locks, vec![6]);
        mgr.acquire_lock(6, "navigate", "host-b", 10_000).await.unwrap();
    }

    #[tokio::test]
    async fn test_content_script_register_and_unregister() {
        let (mgr, _dir) = manager();
        mgr.register_content_script(7, "1.2.3", vec!["MAIN".into()]).await;
        mgr.unregister_content_script(7).await.unwrap();
        assert!(matches!(
            mgr.unregister_content_script(7).await,
            Err(BridgeError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resources.json");
        let mgr = ResourceStateManager::new(path.clone());
        mgr.attach_debugger(8, DebuggerSource::SelfAttached, "p").await;
        mgr.start_network_capture(8, None).await;

        let reloaded = ResourceStateManager::new(path);
        let report = reloaded.sweep(now_millis(), false).await;
        assert_eq!(report.orphaned_debugger_sessions, vec![8]);
    }
}
