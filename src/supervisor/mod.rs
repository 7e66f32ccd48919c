//! Lifecycle Supervisor: owns the process-wide run loop, restart policy,
//! and signal handling for the hub client + daemon pair.
//!
//! Grounded on the CLI's own headless run loop: a `SHUTDOWN_FLAG` set from
//! `signal_hook`, polled from a tick loop, with staged shutdown on exit.
//! This module generalizes that pattern into an explicit state machine with
//! a bounded restart policy instead of a single unconditional inner loop.

use crate::config::Config;
use crate::daemon::Daemon;
use crate::hub_client::HubClient;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Coarse lifecycle state, surfaced to `ccm daemon status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    /// Constructed but not yet started.
    Uninitialized,
    /// Spawning the hub client and waiting for registration.
    Initializing,
    /// Connected and serving.
    Operational,
    /// Lost the hub connection; the client's own reconnect loop is working
    /// on it, or the restart policy has given up.
    Disconnected,
    /// Staged shutdown in progress.
    ShuttingDown,
}

/// Durable supervisor bookkeeping, reloaded across process restarts so a
/// crash loop's restart count doesn't reset to zero on every attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PreservedState {
    session_id: String,
    restart_count: u32,
    preserved_at_ms: u64,
}

/// Preserved state older than this is treated as stale and discarded
/// rather than resumed, so a supervisor restarted long after a crash
/// starts a fresh session instead of inheriting an ancient restart count.
const PRESERVED_STATE_MAX_AGE: Duration = Duration::from_secs(10 * 60);

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(30);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Drives the hub client + daemon through their lifecycle, applying the
/// restart policy and handling OS signals.
pub struct LifecycleSupervisor {
    config: Arc<Config>,
    state: RwLock<SupervisorState>,
    session_id: RwLock<String>,
    restart_count: AtomicU32,
    shutdown_flag: Arc<AtomicBool>,
    state_path: std::path::PathBuf,
}

impl LifecycleSupervisor {
    /// Builds a supervisor and restores any recent preserved state.
    pub fn new(config: Arc<Config>, state_path: std::path::PathBuf) -> Arc<Self> {
        let preserved: Option<PreservedState> = crate::statefile::load_or_default::<
            Option<PreservedState>,
        >(&state_path)
        .filter(|p| now_millis().saturating_sub(p.preserved_at_ms) < PRESERVED_STATE_MAX_AGE.as_millis() as u64);

        let (session_id, restart_count) = match preserved {
            Some(p) => (p.session_id, p.restart_count),
            None => (new_session_id(), 0),
        };

        Arc::new(Self {
            config,
            state: RwLock::new(SupervisorState::Uninitialized),
            session_id: RwLock::new(session_id),
            restart_count: AtomicU32::new(restart_count),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            state_path,
        })
    }

    /// Registers `SIGINT`/`SIGTERM`/`SIGHUP` handlers that flip the shared
    /// shutdown flag, mirroring the CLI's own headless-mode setup.
    pub fn install_signal_handlers(&self) -> anyhow::Result<()> {
        use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
        use signal_hook::flag;
        flag::register(SIGINT, Arc::clone(&self.shutdown_flag))?;
        flag::register(SIGTERM, Arc::clone(&self.shutdown_flag))?;
        flag::register(SIGHUP, Arc::clone(&self.shutdown_flag))?;
        Ok(())
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SupervisorState {
        *self.state.read().await
    }

    /// The session id for the current (or most recently preserved) run.
    pub async fn session_id(&self) -> String {
        self.session_id.read().await.clone()
    }

    /// Runs the supervised lifecycle until the shutdown flag is set,
    /// applying the restart policy whenever the hub client drops its
    /// connection to the hub.
    pub async fn run(self: &Arc<Self>, hub_client: Arc<HubClient>, daemon: Arc<Daemon>) -> anyhow::Result<()> {
        *self.state.write().await = SupervisorState::Initializing;

        let run_handle = tokio::spawn(Arc::clone(&hub_client).run());

        if tokio::time::timeout(INIT_TIMEOUT, wait_until_connected(&hub_client))
            .await
            .is_err()
        {
            log::warn!("supervisor: hub client did not connect within {INIT_TIMEOUT:?}");
        }
        *self.state.write().await = SupervisorState::Operational;
        self.preserve().await;

        loop {
            if self.shutdown_flag.load(Ordering::Relaxed) {
                break;
            }

            let connected = hub_client.is_connected().await;
            let state = self.state().await;
            match (connected, state) {
                (true, SupervisorState::Disconnected) => {
                    *self.state.write().await = SupervisorState::Operational;
                    log::info!("supervisor: hub client reconnected");
                }
                (false, SupervisorState::Operational) => {
                    *self.state.write().await = SupervisorState::Disconnected;
                    self.on_disconnect().await;
                }
                _ => {}
            }

            tokio::time::sleep(Duration::from_secs(
                crate::env::health_interval_secs().max(1),
            ))
            .await;
        }

        *self.state.write().await = SupervisorState::ShuttingDown;
        self.graceful_shutdown(run_handle, hub_client, daemon).await;
        Ok(())
    }

    /// Applies the restart policy on a lost hub connection. The hub
    /// client's own `run()` loop owns the actual reconnect attempts; this
    /// throttles how often the supervisor re-evaluates state and, once the
    /// restart budget is exhausted, escalates to a full supervised-process
    /// exit so an external process manager can restart the process outright.
    async fn on_disconnect(&self) {
        if !crate::env::restart_enabled() {
            return;
        }
        let count = self.restart_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count > crate::env::max_restarts() {
            log::error!(
                "supervisor: exceeded max restart count ({count}), requesting full process exit"
            );
            self.request_shutdown();
            return;
        }
        self.preserve().await;
        let delay = Duration::from_millis(crate::env::restart_delay_ms() * u64::from(count));
        log::warn!("supervisor: hub client disconnected (attempt {count}), backing off {delay:?}");
        tokio::time::sleep(delay).await;
    }

    async fn graceful_shutdown(
        &self,
        run_handle: tokio::task::JoinHandle<()>,
        hub_client: Arc<HubClient>,
        daemon: Arc<Daemon>,
    ) {
        log::info!("supervisor: starting graceful shutdown");
        daemon.shutdown_all().await;

        if let Some(hub) = hub_client.owned_hub().await {
            log::info!("supervisor: shutting down hub this process owns");
            hub.shutdown().await;
        }

        run_handle.abort();
        let _ = tokio::time::timeout(STDIN_CLOSE_GRACE.min(KILL_GRACE), async {
            let _ = run_handle.await;
        })
        .await;

        self.clear_preserved_state();
        log::info!("supervisor: shutdown complete");
    }

    async fn preserve(&self) {
        let state = PreservedState {
            session_id: self.session_id().await,
            restart_count: self.restart_count.load(Ordering::Relaxed),
            preserved_at_ms: now_millis(),
        };
        crate::statefile::save_best_effort(&self.state_path, &Some(state));
    }

    fn clear_preserved_state(&self) {
        crate::statefile::save_best_effort(&self.state_path, &Option::<PreservedState>::None);
    }

    /// Requests shutdown as if a signal had arrived; used by `ccm daemon stop`.
    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }
}

async fn wait_until_connected(hub_client: &Arc<HubClient>) {
    while !hub_client.is_connected().await {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn new_session_id() -> String {
    format!("sess_{}", uuid::Uuid::new_v4())
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationManager;

    fn test_config() -> Arc<Config> {
        Arc::new(Config::default())
    }

    #[tokio::test]
    async fn test_new_supervisor_starts_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LifecycleSupervisor::new(test_config(), dir.path().join("sup.json"));
        assert_eq!(sup.state().await, SupervisorState::Uninitialized);
    }

    #[tokio::test]
    async fn test_preserve_and_reload_keeps_restart_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sup.json");
        let sup = LifecycleSupervisor::new(test_config(), path.clone());
        sup.restart_count.store(3, Ordering::Relaxed);
        sup.preserve().await;

        let reloaded = LifecycleSupervisor::new(test_config(), path);
        assert_eq!(reloaded.restart_count.load(Ordering::Relaxed), 3);
        assert_eq!(reloaded.session_id().await, sup.session_id().await);
    }

    #[tokio::test]
    async fn test_request_shutdown_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let sup = LifecycleSupervisor::new(test_config(), dir.path().join("sup.json"));
        assert!(!sup.shutdown_flag.load(Ordering::Relaxed));
        sup.request_shutdown();
        assert!(sup.shutdown_flag.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_wait_until_connected_returns_once_registered() {
        let dir = tempfile::tempdir().unwrap();
        let operations = Arc::new(OperationManager::new(dir.path().join("ops.json")));
        let hub_client = HubClient::new(test_config(), operations);
        // Never connects in this unit test (no hub running); just confirms
        // the helper doesn't panic when polled and dropped promptly.
        let waited = tokio::time::timeout(
            Duration::from_millis(50),
            wait_until_connected(&hub_client),
        )
        .await;
        assert!(waited.is_err());
    }
}
