//! A single MCP tool subprocess: spawn, handshake, call, shut down.
//!
//! Speaks line-delimited JSON-RPC over the child's stdin/stdout, the same
//! framing the CLI's own MCP stdio bridge uses on its side of the wire.
//! One reader task owns the child's stdout and resolves pending calls by
//! JSON-RPC `id`; every other task writes through a shared, lock-guarded
//! stdin handle so requests from concurrent callers never interleave.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};

use crate::error::BridgeError;

/// How a server is launched: command, arguments, and extra environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerSpec {
    /// Executable to run.
    pub command: String,
    /// Arguments passed to the executable.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables added on top of the daemon's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the subprocess. Defaults to the daemon's own
    /// working directory when unset.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Whether the daemon spawns this server on its own startup rather than
    /// waiting for the first tool call routed to it.
    #[serde(default)]
    pub auto_start: bool,
    /// Collision-resolution priority when two servers export a tool with the
    /// same bare name: the highest-priority server claims the bare name, the
    /// rest are only reachable by an explicit `server_id`. Higher wins; ties
    /// break on registration order.
    #[serde(default)]
    pub priority: i32,
    /// How long this server may sit unused before the idle sweep reaps it.
    /// Accepts a bare number of seconds or a suffixed duration (`90s`,
    /// `30m`, `2h`). Defaults to the daemon's own idle-reap window when unset.
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub idle_timeout: Option<Duration>,
    /// Tool name to call on an interval to confirm the server is still
    /// responsive, alongside the interval itself in seconds. `None` disables
    /// health checking for this server.
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// Periodic liveness check for a running tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// Tool to call with empty arguments.
    pub tool: String,
    /// Seconds between checks.
    pub interval_secs: u64,
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse_duration_suffix(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {s:?}"))),
    }
}

/// Parses a bare number of seconds or an `s`/`m`/`h`-suffixed duration.
fn parse_duration_suffix(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let (digits, multiplier) = match raw.strip_suffix('h') {
        Some(d) => (d, 3600),
        None => match raw.strip_suffix('m') {
            Some(d) => (d, 60),
            None => (raw.strip_suffix('s').unwrap_or(raw), 1),
        },
    };
    digits.trim().parse::<u64>().ok().map(|n| Duration::from_secs(n * multiplier))
}

/// A tool advertised by a server's `tools/list` response, qualified with the
/// server that exports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Bare tool name as the server names it.
    pub name: String,
    /// Human-readable description, if the server provided one.
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema for the tool's input, if the server provided one.
    #[serde(default)]
    pub input_schema: Option<Value>,
    /// Name of the server exporting this tool.
    #[serde(default)]
    pub server_id: String,
    /// Whether the daemon's namespace resolves the bare name to this server
    /// (the only server name callers need for an unambiguous tool), or
    /// whether this entry is only reachable via an explicit `server_id`.
    #[serde(default)]
    pub canonical: bool,
}

const INIT_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A running tool subprocess and its handshake state.
pub struct ToolServer {
    name: String,
    spec: ToolServerSpec,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    next_id: AtomicU64,
    tools: Mutex<Vec<ToolDescriptor>>,
}

impl ToolServer {
    /// Spawns the subprocess and performs the `initialize` →
    /// `notifications/initialized` → `tools/list` handshake.
    pub async fn spawn(name: &str, spec: ToolServerSpec) -> Result<Arc<Self>> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn tool server {name} ({})", spec.command))?;

        let stdin = child.stdin.take().context("child stdin not piped")?;
        let stdout = child.stdout.take().context("child stdout not piped")?;
        let stderr = child.stderr.take().context("child stderr not piped")?;

        let pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        spawn_stderr_logger(name.to_string(), stderr);
        spawn_reader(name.to_string(), stdout, Arc::clone(&pending));

        let server = Arc::new(Self {
            name: name.to_string(),
            spec,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            next_id: AtomicU64::new(1),
            tools: Mutex::new(Vec::new()),
        });

        server.initialize().await?;
        let mut tools = server.fetch_tools().await?;
        for tool in &mut tools {
            tool.server_id = name.to_string();
        }
        *server.tools.lock().await = tools;

        Ok(server)
    }

    async fn initialize(&self) -> Result<()> {
        self.request_raw(
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "clientInfo": { "name": "claude-chrome-mcp", "version": env!("CARGO_PKG_VERSION") },
                "capabilities": {},
            }),
            INIT_TIMEOUT,
        )
        .await
        .with_context(|| format!("tool server {} failed to initialize", self.name))?;

        self.notify("notifications/initialized", json!({})).await?;
        Ok(())
    }

    async fn fetch_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let result = self
            .request_raw("tools/list", json!({}), INIT_TIMEOUT)
            .await
            .with_context(|| format!("tool server {} failed to list tools", self.name))?;

        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(serde_json::from_value(tools).unwrap_or_default())
    }

    /// The tools this server currently advertises.
    pub async fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().await.clone()
    }

    /// Collision-resolution priority from this server's spec.
    pub fn priority(&self) -> i32 {
        self.spec.priority
    }

    /// This server's configured idle-reap window, if any.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.spec.idle_timeout
    }

    /// This server's configured health check, if any.
    pub fn health_check(&self) -> Option<&HealthCheckSpec> {
        self.spec.health_check.as_ref()
    }

    /// Calls one tool by its bare (unqualified) name.
    pub async fn call_tool(&self, tool: &str, params: Value) -> Result<Value, BridgeError> {
        self.request_raw(
            "tools/call",
            json!({ "name": tool, "arguments": params }),
            CALL_TIMEOUT,
        )
        .await
        .map_err(|e| BridgeError::Upstream { message: e.to_string() })
    }

    async fn request_raw(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        self.write_line(&frame).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => {
                if let Some(err) = value.get("error") {
                    anyhow::bail!("tool server {} returned error: {err}", self.name);
                }
                Ok(value.get("result").cloned().unwrap_or(Value::Null))
            }
            Ok(Err(_)) => anyhow::bail!("tool server {} closed before responding", self.name),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                anyhow::bail!("tool server {} timed out on {method}", self.name)
            }
        }
    }

    async fn notify(&self, method: &str, params: Value) -> Result<()> {
        self.write_line(&json!({ "jsonrpc": "2.0", "method": method, "params": params }))
            .await
    }

    async fn write_line(&self, value: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(&line).await.context("tool server stdin write failed")?;
        stdin.flush().await.context("tool server stdin flush failed")
    }

    /// Closes stdin, waits up to a grace period for the process to exit on
    /// its own, then kills it.
    pub async fn shutdown(&self) {
        {
            let mut stdin = self.stdin.lock().await;
            let _ = stdin.shutdown().await;
        }

        let mut child = self.child.lock().await;
        match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => log::info!("tool server {} exited: {status}", self.name),
            Ok(Err(e)) => log::warn!("tool server {} wait failed: {e}", self.name),
            Err(_) => {
                log::warn!("tool server {} did not exit in time, killing", self.name);
                let _ = child.kill().await;
            }
        }
    }
}

fn spawn_reader(
    name: String,
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stdout);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let Ok(value) = serde_json::from_str::<Value>(line.trim()) else {
                log::debug!("tool server {name}: ignoring non-JSON line on stdout");
                continue;
            };
            let Some(id) = value.get("id").and_then(Value::as_u64) else {
                continue; // notification, not a response
            };
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(value);
            }
        }
        log::info!("tool server {name}: stdout closed");
    });
}

fn spawn_stderr_logger(name: String, stderr: tokio::process::ChildStderr) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => log::debug!("tool server {name} stderr: {}", line.trim_end()),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec(command: &str) -> ToolServerSpec {
        ToolServerSpec {
            command: command.to_string(),
            args: vec![],
            env: HashMap::new(),
            cwd: None,
            auto_start: false,
            priority: 0,
            idle_timeout: None,
            health_check: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command_fails() {
        let spec = test_spec("ccm-definitely-not-a-real-binary");
        let result = ToolServer::spawn("broken", spec).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_spawn_and_initialize_against_cat() {
        // `cat` never answers JSON-RPC, so initialization must time out
        // rather than hang, and shutdown must still succeed.
        let spec = test_spec("cat");
        let result = ToolServer::spawn("echo-cat", spec).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_duration_suffix_variants() {
        assert_eq!(parse_duration_suffix("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_suffix("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration_suffix("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration_suffix("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration_suffix("nope"), None);
    }
}
