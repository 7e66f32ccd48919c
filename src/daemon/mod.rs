//! Daemon: Unix-socket front door that supervises MCP tool subprocesses.
//!
//! A single daemon process per machine owns zero or more tool subprocesses,
//! each speaking MCP JSON-RPC over stdio (`initialize` → `tools/list` →
//! `tools/call`, one line per message — see [`tool_server`]). CLI
//! invocations talk to the daemon over a Unix-domain socket using the same
//! newline-JSON framing as the hub bus.

mod paths;
mod tool_server;

pub use paths::{daemon_pid_file_path, daemon_socket_path, is_daemon_running};
pub use tool_server::{HealthCheckSpec, ToolDescriptor, ToolServer, ToolServerSpec};

use crate::config::Config;
use crate::error::BridgeError;
use crate::framing::JsonFrameDecoder;
use crate::resource::ResourceStateManager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

/// A tool name qualified by the server that exports it, used to resolve
/// collisions when two servers export tools with the same bare name.
#[derive(Debug, Clone)]
struct ToolRoute {
    server: String,
    tool: String,
    priority: i32,
}

struct ServerRecord {
    handle: Arc<ToolServer>,
    last_used: Mutex<Instant>,
}

/// Owns the tool-subprocess pool and serves the control socket.
pub struct Daemon {
    config: Arc<Config>,
    resources: Arc<ResourceStateManager>,
    servers: Mutex<HashMap<String, ServerRecord>>,
    /// Bare tool name -> routes, sorted by descending priority (ties keep
    /// registration order). The first entry is the canonical route a bare
    /// `tool_call` resolves to; later entries are only reachable via an
    /// explicit `server_id`.
    tool_index: Mutex<HashMap<String, Vec<ToolRoute>>>,
    shutdown: tokio::sync::Notify,
}

/// A request frame read from the control socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum DaemonRequest {
    DaemonStatus,
    ListServers,
    ListTools,
    ServerStatus { name: String },
    StartServer { name: String, spec: ToolServerSpec },
    StopServer { name: String },
    ToolCall {
        tool: String,
        params: Value,
        #[serde(default)]
        server_id: Option<String>,
    },
    Shutdown,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum DaemonResponse {
    Ok(Value),
    Err { status: &'static str, error: String, kind: crate::error::ErrorKind },
}

impl Daemon {
    pub fn new(config: Arc<Config>, resources: Arc<ResourceStateManager>) -> Arc<Self> {
        Arc::new(Self {
            config,
            resources,
            servers: Mutex::new(HashMap::new()),
            tool_index: Mutex::new(HashMap::new()),
            shutdown: tokio::sync::Notify::new(),
        })
    }

    /// Unconditionally checks for an already-running daemon (a stale socket
    /// file left by a crash must not block a fresh start, but a genuinely
    /// live daemon must), removes a stale socket file if there is one, binds
    /// the control socket with owner-only permissions, and writes the PID
    /// file. Synchronous so `main` can map a bind failure straight to a
    /// usage-error exit code before any async machinery starts.
    pub fn bind(&self) -> anyhow::Result<UnixListener> {
        let socket_path = paths::daemon_socket_path(&self.config)?;

        if paths::is_daemon_running(&self.config) {
            anyhow::bail!("a daemon is already running at {}", socket_path.display());
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path)?;
        #[cfg(unix)]
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;

        paths::write_pid_file(&self.config)?;
        log::info!("daemon: listening on {}", socket_path.display());
        Ok(listener)
    }

    /// Runs the accept loop and background sweeps on an already-bound
    /// listener (see [`Self::bind`]) until `shutdown` is called or the
    /// process exits.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        self.clone().spawn_auto_start_servers();
        self.clone().spawn_idle_sweep();

        let result = self.accept_loop(listener).await;

        self.shutdown_all().await;
        let _ = std::fs::remove_file(paths::daemon_socket_path(&self.config)?);
        let _ = std::fs::remove_file(paths::daemon_pid_file_path(&self.config)?);
        result
    }

    async fn accept_loop(self: &Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let daemon = Arc::clone(self);
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_client(stream).await {
                            log::debug!("daemon: client connection ended: {e:#}");
                        }
                    });
                }
                () = self.shutdown.notified() => {
                    log::info!("daemon: shutdown requested");
                    return Ok(());
                }
            }
        }
    }

    /// Reads the configured server list (`servers.json` in the config
    /// directory, a map of server name to [`ToolServerSpec`]) and spawns
    /// every entry marked `auto_start`. Missing or unreadable config is
    /// treated as "no servers configured", not an error.
    fn spawn_auto_start_servers(self: Arc<Self>) {
        tokio::spawn(async move {
            let Ok(config_dir) = Config::config_dir() else { return };
            let path = config_dir.join("servers.json");
            let specs: HashMap<String, ToolServerSpec> = crate::statefile::load_or_default(&path);
            for (name, spec) in specs {
                if !spec.auto_start {
                    continue;
                }
                log::info!("daemon: auto-starting server {name}");
                if let Err(e) = self.start_server(&name, spec).await {
                    log::warn!("daemon: failed to auto-start server {name}: {e}");
                }
            }
        });
    }

    fn spawn_idle_sweep(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(self.config.daemon_idle_sweep_secs));
            loop {
                interval.tick().await;
                self.reap_idle_servers().await;
                let report = self.resources.sweep(now_millis(), true).await;
                if !report.expired_locks.is_empty() {
                    log::info!("daemon: released {} expired resource locks", report.expired_locks.len());
                }
            }
        });
    }

    async fn reap_idle_servers(&self) {
        const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);
        let mut stale = Vec::new();
        {
            let servers = self.servers.lock().await;
            for (name, record) in servers.iter() {
                let limit = record.handle.idle_timeout().unwrap_or(DEFAULT_IDLE_TIMEOUT);
                if record.last_used.lock().await.elapsed() > limit {
                    stale.push(name.clone());
                }
            }
        }
        for name in stale {
            log::info!("daemon: reaping idle server {name}");
            self.stop_server(&name).await;
        }
    }

    async fn handle_client(self: &Arc<Self>, stream: UnixStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut decoder = JsonFrameDecoder::new();
        let mut reader = tokio::io::BufReader::new(read_half);

        loop {
            use tokio::io::AsyncBufReadExt;
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                break;
            }

            for frame in decoder.feed(&line)? {
                let response = self.dispatch(frame).await;
                let mut out = serde_json::to_vec(&response)?;
                out.push(b'\n');
                write_half.write_all(&out).await?;
            }
        }
        Ok(())
    }

    async fn dispatch(self: &Arc<Self>, frame: Value) -> DaemonResponse {
        let request: DaemonRequest = match serde_json::from_value(frame) {
            Ok(r) => r,
            Err(e) => {
                return err_response(&BridgeError::Validation {
                    message: format!("malformed daemon request: {e}"),
                })
            }
        };

        match request {
            DaemonRequest::DaemonStatus => {
                let resources = self.resources.sweep(now_millis(), false).await;
                DaemonResponse::Ok(serde_json::json!({
                    "servers": self.servers.lock().await.len(),
                    "resources": resources,
                }))
            }
            DaemonRequest::ListServers => {
                let servers = self.servers.lock().await;
                let names: Vec<&String> = servers.keys().collect();
                DaemonResponse::Ok(serde_json::json!({ "servers": names }))
            }
            DaemonRequest::ListTools => {
                let index = self.tool_index.lock().await;
                let tools: Vec<serde_json::Value> = index
                    .values()
                    .flat_map(|routes| {
                        routes.iter().enumerate().map(|(i, r)| {
                            serde_json::json!({
                                "tool": r.tool,
                                "server_id": r.server,
                                "canonical": i == 0,
                            })
                        })
                    })
                    .collect();
                DaemonResponse::Ok(serde_json::json!({ "tools": tools }))
            }
            DaemonRequest::ServerStatus { name } => match self.servers.lock().await.get(&name) {
                Some(record) => DaemonResponse::Ok(serde_json::json!({
                    "name": name,
                    "priority": record.handle.priority(),
                    "tools": record.handle.tools().await,
                    "idle_secs": record.last_used.lock().await.elapsed().as_secs(),
                })),
                None => err_response(&BridgeError::NotFound { what: format!("server {name}") }),
            },
            DaemonRequest::StartServer { name, spec } => match self.start_server(&name, spec).await {
                Ok(()) => DaemonResponse::Ok(serde_json::json!({ "started": name })),
                Err(e) => err_response(&e),
            },
            DaemonRequest::StopServer { name } => {
                self.stop_server(&name).await;
                DaemonResponse::Ok(serde_json::json!({ "stopped": name }))
            }
            DaemonRequest::ToolCall { tool, params, server_id } => {
                match self.call_tool(&tool, params, server_id.as_deref()).await {
                    Ok(v) => DaemonResponse::Ok(v),
                    Err(e) => err_response(&e),
                }
            }
            DaemonRequest::Shutdown => {
                self.shutdown.notify_one();
                DaemonResponse::Ok(serde_json::json!({ "shutting_down": true }))
            }
        }
    }

    /// Spawns a tool subprocess, performs the `initialize`/`tools/list`
    /// handshake, and registers its tools. A tool name collision is
    /// resolved by priority: routes for the same bare name are sorted
    /// descending, and only the top one is reachable without an explicit
    /// `server_id`.
    pub async fn start_server(&self, name: &str, spec: ToolServerSpec) -> Result<(), BridgeError> {
        if self.servers.lock().await.contains_key(name) {
            return Err(BridgeError::Busy { resource: name.to_string() });
        }

        let handle = ToolServer::spawn(name, spec)
            .await
            .map_err(BridgeError::Internal)?;
        let tools = handle.tools().await;
        let priority = handle.priority();

        let mut index = self.tool_index.lock().await;
        for tool in tools {
            let routes = index.entry(tool.name.clone()).or_default();
            routes.push(ToolRoute {
                server: name.to_string(),
                tool: tool.name.clone(),
                priority,
            });
            routes.sort_by(|a, b| b.priority.cmp(&a.priority));
        }
        drop(index);

        if let Some(check) = handle.health_check() {
            self.spawn_health_check(name.to_string(), Arc::clone(&handle), check.clone());
        }

        self.servers.lock().await.insert(
            name.to_string(),
            ServerRecord {
                handle,
                last_used: Mutex::new(Instant::now()),
            },
        );
        Ok(())
    }

    /// Calls the server's configured health-check tool on an interval,
    /// stopping once the server is no longer registered.
    fn spawn_health_check(self: &Arc<Self>, name: String, handle: Arc<ToolServer>, check: HealthCheckSpec) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(check.interval_secs.max(1)));
            loop {
                interval.tick().await;
                if !daemon.servers.lock().await.contains_key(&name) {
                    break;
                }
                if let Err(e) = handle.call_tool(&check.tool, serde_json::json!({})).await {
                    log::warn!("daemon: health check failed for server {name}: {e}");
                }
            }
        });
    }

    /// Gracefully shuts down one server: stdin close, bounded wait, then
    /// kill. Removes its tools from the namespace.
    pub async fn stop_server(&self, name: &str) {
        let record = self.servers.lock().await.remove(name);
        let Some(record) = record else { return };
        record.handle.shutdown().await;

        let mut index = self.tool_index.lock().await;
        index.retain(|_, routes| {
            routes.retain(|route| route.server != name);
            !routes.is_empty()
        });
    }

    /// Resolves a tool name through the namespace and calls it, touching
    /// the owning server's idle clock. With `server_id` set, resolves to
    /// that specific server's route instead of the canonical (highest
    /// priority) one.
    pub async fn call_tool(
        &self,
        tool: &str,
        params: Value,
        server_id: Option<&str>,
    ) -> Result<Value, BridgeError> {
        let routes = self
            .tool_index
            .lock()
            .await
            .get(tool)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound { what: format!("tool {tool}") })?;

        let route = match server_id {
            Some(server_id) => routes
                .iter()
                .find(|r| r.server == server_id)
                .ok_or_else(|| BridgeError::NotFound {
                    what: format!("tool {tool} on server {server_id}"),
                })?,
            None => routes.first().ok_or_else(|| BridgeError::NotFound {
                what: format!("tool {tool}"),
            })?,
        };

        let servers = self.servers.lock().await;
        let record = servers
            .get(&route.server)
            .ok_or_else(|| BridgeError::NotFound { what: format!("server {}", route.server) })?;
        *record.last_used.lock().await = Instant::now();
        record.handle.call_tool(&route.tool, params).await
    }

    /// Wakes the accept loop so it exits `serve` and runs its own cleanup,
    /// mirroring the `shutdown` control-socket command.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Shuts down every managed server in parallel.
    pub async fn shutdown_all(&self) {
        let names: Vec<String> = self.servers.lock().await.keys().cloned().collect();
        let mut handles = Vec::new();
        for name in names {
            handles.push(self.stop_server(&name));
        }
        futures_util::future::join_all(handles).await;
    }
}

fn err_response(err: &BridgeError) -> DaemonResponse {
    DaemonResponse::Err {
        status: "error",
        error: err.to_string(),
        kind: err.kind(),
    }
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

    fn test_config() -> Arc<Config> {
        let mut config = Config::default();
        config.daemon_socket_dir =
            std::env::temp_dir().join(format!("ccm-daemon-test-{}", uuid::Uuid::new_v4()));
        Arc::new(config)
    }

    fn test_resources() -> Arc<ResourceStateManager> {
        let dir = std::env::temp_dir().join(format!("ccm-daemon-resources-test-{}", uuid::Uuid::new_v4()));
        Arc::new(ResourceStateManager::new(dir.join("resources.json")))
    }

    #[tokio::test]
    async fn test_call_unknown_tool_is_not_found() {
        let daemon = Daemon::new(test_config(), test_resources());
        let result = daemon
            .call_tool("nonexistent_tool", serde_json::json!({}), None)
            .await;
        assert!(matches!(result, Err(BridgeError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_stop_unknown_server_is_a_no_op() {
        let daemon = Daemon::new(test_config(), test_resources());
        daemon.stop_server("nonexistent").await;
        assert!(daemon.servers.lock().await.is_empty());
    }
}
