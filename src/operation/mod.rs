//! Operation Manager.
//!
//! Gives each long-running request a durable id, a milestone log, and a
//! completion signal that waiters subscribe to rather than poll.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};

/// Lifecycle status of an [`Operation`]. Transitions only ever move
/// forward: `Pending` → `InProgress` → (`Completed` | `Failed`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Created but no milestone has arrived yet.
    Pending,
    /// At least one non-terminal milestone has arrived.
    InProgress,
    /// Terminal: succeeded.
    Completed,
    /// Terminal: failed.
    Failed,
}

impl OperationStatus {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single labeled, timestamped progress event attached to an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    /// Milestone label (`started`, `completed`, `error`, or caller-defined).
    pub label: String,
    /// Unix millis when the milestone was recorded.
    pub at: u64,
    /// Arbitrary milestone payload.
    pub data: Option<serde_json::Value>,
}

/// A durable, named unit of work with a milestone log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// `op_<kind>_<epoch_millis>`.
    pub operation_id: String,
    /// Caller-supplied kind, embedded in the id for readability.
    pub kind: String,
    /// Parameters the operation was created with.
    pub params: serde_json::Value,
    /// Current lifecycle status.
    pub status: OperationStatus,
    /// Ordered milestone log.
    pub milestones: Vec<Milestone>,
    /// Unix millis of creation.
    pub created_at: u64,
    /// Unix millis of the last mutation.
    pub updated_at: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    operations: HashMap<String, Operation>,
}

/// Per-operation single-shot broadcast: the terminal value is stored once
/// and replayed immediately to any subscriber that arrives after it fired.
struct Waiters {
    tx: broadcast::Sender<Operation>,
}

/// Manages durable operation records and publishes their terminal states.
pub struct OperationManager {
    state: Mutex<PersistedState>,
    waiters: Mutex<HashMap<String, Arc<Waiters>>>,
    state_path: PathBuf,
}

impl OperationManager {
    /// Loads existing state from `state_path` (quarantining it if
    /// corrupted) and returns a manager ready to serve requests.
    pub fn new(state_path: PathBuf) -> Self {
        let state = crate::statefile::load_or_default(&state_path);
        Self {
            state: Mutex::new(state),
            waiters: Mutex::new(HashMap::new()),
            state_path,
        }
    }

    /// Creates a new operation, returning its durable id.
    pub async fn create(&self, kind: &str, params: serde_json::Value) -> String {
        let now = now_millis();
        let operation_id = format!("op_{kind}_{now}");
        let operation = Operation {
            operation_id: operation_id.clone(),
            kind: kind.to_string(),
            params,
            status: OperationStatus::Pending,
            milestones: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut state = self.state.lock().await;
        state.operations.insert(operation_id.clone(), operation);
        self.persist(&state);
        operation_id
    }

    /// Appends a milestone and advances status per the milestone label.
    /// Returns `NotFound` if the operation id is unknown.
    pub async fn update(
        &self,
        operation_id: &str,
        label: &str,
        data: Option<serde_json::Value>,
    ) -> Result<(), BridgeError> {
        let terminal_snapshot = {
            let mut state = self.state.lock().await;
            let op = state
                .operations
                .get_mut(operation_id)
                .ok_or_else(|| BridgeError::NotFound {
                    what: format!("operation {operation_id}"),
                })?;

            let now = now_millis();
            op.milestones.push(Milestone {
                label: label.to_string(),
                at: now,
                data,
            });
            op.updated_at = now;

            if !op.status.is_terminal() {
                op.status = match label {
                    "started" => OperationStatus::InProgress,
                    "completed" | "response_completed" => OperationStatus::Completed,
                    "error" => OperationStatus::Failed,
                    _ => op.status,
                };
            }

            self.persist(&state);
            if op.status.is_terminal() {
                Some(op.clone())
            } else {
                None
            }
        };

        if let Some(op) = terminal_snapshot {
            self.publish_terminal(op).await;
        }

        Ok(())
    }

    /// Waits for the operation to reach a terminal state, or for
    /// `timeout_ms` to elapse.
    pub async fn wait(&self, operation_id: &str, timeout_ms: u64) -> Result<Operation, BridgeError> {
        let already_terminal = {
            let state = self.state.lock().await;
            state
                .operations
                .get(operation_id)
                .filter(|op| op.status.is_terminal())
                .cloned()
        };
        if let Some(op) = already_terminal {
            return Ok(op);
        }
        if !self.state.lock().await.operations.contains_key(operation_id) {
            return Err(BridgeError::NotFound {
                what: format!("operation {operation_id}"),
            });
        }

        let mut rx = {
            let mut waiters = self.waiters.lock().await;
            let entry = waiters
                .entry(operation_id.to_string())
                .or_insert_with(|| {
                    let (tx, _rx) = broadcast::channel(1);
                    Arc::new(Waiters { tx })
                })
                .clone();
            entry.tx.subscribe()
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx.recv()).await {
            Ok(Ok(op)) => Ok(op),
            Ok(Err(_)) => Err(BridgeError::Internal(anyhow::anyhow!(
                "operation waiter channel closed unexpectedly"
            ))),
            Err(_) => Err(BridgeError::Timeout {
                elapsed_ms: timeout_ms,
            }),
        }
    }

    /// Lists all non-terminal operations.
    pub async fn list_pending(&self) -> Vec<Operation> {
        self.state
            .lock()
            .await
            .operations
            .values()
            .filter(|op| !op.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Removes terminal operations older than `max_age`, returning the
    /// count removed.
    pub async fn gc(&self, max_age: Duration) -> usize {
        let cutoff = now_millis().saturating_sub(max_age.as_millis() as u64);
        let mut state = self.state.lock().await;
        let before = state.operations.len();
        state
            .operations
            .retain(|_, op| !op.status.is_terminal() || op.updated_at > cutoff);
        let removed = before - state.operations.len();
        if removed > 0 {
            self.persist(&state);
        }
        removed
    }

    async fn publish_terminal(&self, op: Operation) {
        let mut waiters = self.waiters.lock().await;
        if let Some(w) = waiters.remove(&op.operation_id) {
            let _ = w.tx.send(op);
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

    async fn manager() -> (OperationManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.json");
        (OperationManager::new(path), dir)
    }

    #[tokio::test]
    async fn test_create_then_wait_completes_immediately_if_already_terminal() {
        let (mgr, _dir) = manager().await;
        let id = mgr.create("tab_navigate", serde_json::json!({})).await;
        mgr.update(&id, "started", None).await.unwrap();
        mgr.update(&id, "completed", Some(serde_json::json!({"ok": true})))
            .await
            .unwrap();

        let op = mgr.wait(&id, 1_000).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        assert_eq!(op.milestones.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_unblocks_when_update_arrives_later() {
        let (mgr, _dir) = manager().await;
        let id = mgr.create("tab_navigate", serde_json::json!({})).await;

        let mgr = Arc::new(mgr);
        let mgr2 = mgr.clone();
        let id2 = id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            mgr2.update(&id2, "completed", None).await.unwrap();
        });

        let op = mgr.wait(&id, 5_000).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (mgr, _dir) = manager().await;
        let id = mgr.create("tab_navigate", serde_json::json!({})).await;
        let result = mgr.wait(&id, 10).await;
        assert!(matches!(result, Err(BridgeError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_update_unknown_operation_is_not_found() {
        let (mgr, _dir) = manager().await;
        let result = mgr.update("op_missing_0", "started", None).await;
        assert!(matches!(result, Err(BridgeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_status_never_regresses_after_terminal() {
        let (mgr, _dir) = manager().await;
        let id = mgr.create("x", serde_json::json!({})).await;
        mgr.update(&id, "completed", None).await.unwrap();
        mgr.update(&id, "started", None).await.unwrap();

        let op = mgr.wait(&id, 100).await.unwrap();
        assert_eq!(op.status, OperationStatus::Completed);
    }

    #[tokio::test]
    async fn test_gc_removes_old_terminal_operations_only() {
        let (mgr, _dir) = manager().await;
        let old_id = mgr.create("old", serde_json::json!({})).await;
        mgr.update(&old_id, "completed", None).await.unwrap();
        let pending_id = mgr.create("pending", serde_json::json!({})).await;

        let removed = mgr.gc(Duration::from_millis(0)).await;
        assert_eq!(removed, 1);

        let pending = mgr.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, pending_id);
    }

    #[tokio::test]
    async fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("operations.json");
        let mgr = OperationManager::new(path.clone());
        let id = mgr.create("persisted", serde_json::json!({"x": 1})).await;
        mgr.update(&id, "started", None).await.unwrap();

        let reloaded = OperationManager::new(path);
        let pending = reloaded.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation_id, id);
        assert_eq!(pending[0].status, OperationStatus::InProgress);
    }
}
