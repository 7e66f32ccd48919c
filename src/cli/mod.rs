//! Command-line surface: argument parsing and daemon-socket dispatch.
//!
//! `ccm` talks to the already-running daemon over its Unix socket for every
//! subcommand except `daemon start`, which spawns the daemon (and the hub
//! client it depends on) in this process.

use crate::config::Config;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Local AI coding assistant bridge to a running browser's Claude.ai tabs.
#[derive(Parser, Debug)]
#[command(name = "ccm", version, about)]
pub struct Cli {
    /// Emit machine-readable JSON instead of formatted text.
    #[arg(long, global = true)]
    pub json: bool,
    /// Verbose logging to stderr in addition to the log file.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,
    /// Override the default request timeout, in milliseconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,
    /// Route a tool call to a specific server name instead of the default
    /// namespace resolution.
    #[arg(long, global = true)]
    pub server: Option<String>,
    /// Override the config directory.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage the daemon process.
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// List registered tool servers.
    Servers,
    /// List every callable tool across all servers.
    Tools,
    /// Any other invocation is treated as `<tool> [args...]`.
    #[command(external_subcommand)]
    Tool(Vec<String>),
}

#[derive(Subcommand, Debug)]
pub enum DaemonAction {
    /// Start the daemon in the foreground.
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Report whether the daemon is running.
    Status,
}

/// Process exit codes: `0` success, `1` usage/validation error, `2` tool/runtime error.
pub mod exit_code {
    /// Command completed successfully.
    pub const OK: i32 = 0;
    /// Arguments could not be parsed into a valid request.
    pub const USAGE: i32 = 1;
    /// Command ran but failed (tool error, daemon unreachable, ...).
    pub const FAILURE: i32 = 2;
}

/// Runs the parsed CLI, returning the process exit code.
pub async fn dispatch(cli: Cli) -> i32 {
    match cli.command {
        Commands::Daemon { action } => dispatch_daemon_action(&cli, action).await,
        Commands::Servers => dispatch_request(&cli, json!({ "cmd": "list_servers" })).await,
        Commands::Tools => dispatch_request(&cli, json!({ "cmd": "list_tools" })).await,
        Commands::Tool(args) => match parse_tool_invocation(&args) {
            Ok((tool, params)) => {
                dispatch_request(
                    &cli,
                    json!({ "cmd": "tool_call", "tool": tool, "params": params, "server_id": cli.server }),
                )
                .await
            }
            Err(message) => {
                eprintln!("error: {message}");
                exit_code::USAGE
            }
        },
    }
}

async fn dispatch_daemon_action(cli: &Cli, action: DaemonAction) -> i32 {
    match action {
        DaemonAction::Start => {
            eprintln!("error: run `ccm daemon start` via the supervisor entry point, not dispatch()");
            exit_code::USAGE
        }
        DaemonAction::Stop => dispatch_request(cli, json!({ "cmd": "shutdown" })).await,
        DaemonAction::Status => dispatch_request(cli, json!({ "cmd": "daemon_status" })).await,
    }
}

async fn dispatch_request(cli: &Cli, request: Value) -> i32 {
    let config = match load_config(cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code::FAILURE;
        }
    };

    let timeout_ms = cli.timeout.unwrap_or(config.request_timeout_ms);
    match tokio::time::timeout(
        std::time::Duration::from_millis(timeout_ms),
        send_request(&config, request),
    )
    .await
    {
        Ok(Ok(response)) => print_response(cli, &response),
        Ok(Err(e)) => {
            eprintln!("error: {e}");
            exit_code::FAILURE
        }
        Err(_) => {
            eprintln!("error: daemon did not respond within {timeout_ms}ms");
            exit_code::FAILURE
        }
    }
}

async fn send_request(config: &Config, request: Value) -> anyhow::Result<Value> {
    let socket_path = crate::daemon::daemon_socket_path(config)?;
    let stream = UnixStream::connect(&socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("daemon not reachable at {}: {e}", socket_path.display()))?;

    let (read_half, mut write_half) = stream.into_split();
    let mut line = serde_json::to_vec(&request)?;
    line.push(b'\n');
    write_half.write_all(&line).await?;

    let mut reader = BufReader::new(read_half);
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;
    Ok(serde_json::from_str(response_line.trim())?)
}

fn print_response(cli: &Cli, response: &Value) -> i32 {
    let is_error = response.get("status").and_then(Value::as_str) == Some("error");
    if cli.json {
        println!("{response}");
    } else if is_error {
        eprintln!(
            "error: {}",
            response.get("error").and_then(Value::as_str).unwrap_or("unknown error")
        );
    } else {
        println!("{}", serde_json::to_string_pretty(response).unwrap_or_default());
    }
    if is_error {
        exit_code::FAILURE
    } else {
        exit_code::OK
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Arc<Config>> {
    if let Some(dir) = &cli.config {
        std::env::set_var("CCM_CONFIG_DIR", dir);
    }
    Ok(Arc::new(Config::load()?))
}

/// Parameter name suffixes that are treated as comma-separated arrays even
/// when passed as a single `--key a,b,c` argument.
const ARRAY_SUFFIXES: &[&str] = &[
    "Ids", "List", "Items", "Files", "Paths", "Names", "Types", "Tags", "Values",
];

/// Parses `<tool> [args...]` into a tool name and a JSON params object.
///
/// Supported argument forms, in priority order:
/// 1. A single remaining argument that parses as a JSON object literal is
///    used as the params object verbatim.
/// 2. `--key value` pairs are collected into the params object. `--flag`
///    with no following value (or followed by another `--flag`) is `true`;
///    `--no-flag` is `false`. A key whose name ends in one of
///    [`ARRAY_SUFFIXES`] splits a comma-separated value into a JSON array.
///    Other values are parsed as JSON when possible (so `--count 3` becomes
///    a number) and fall back to a plain string otherwise.
/// 3. Any remaining bare arguments are collected under `"args"` as a JSON
///    array of strings.
pub fn parse_tool_invocation(args: &[String]) -> Result<(String, Value), String> {
    let Some((tool, rest)) = args.split_first() else {
        return Err("expected a tool name".to_string());
    };

    if rest.len() == 1 {
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&rest[0]) {
            return Ok((tool.clone(), Value::Object(map)));
        }
    }

    let mut params = serde_json::Map::new();
    let mut positional = Vec::new();
    let mut i = 0;
    while i < rest.len() {
        let arg = &rest[i];
        if let Some(key) = arg.strip_prefix("--") {
            if let Some(negated) = key.strip_prefix("no-") {
                params.insert(negated.to_string(), Value::Bool(false));
                i += 1;
                continue;
            }

            let next_is_flag = rest.get(i + 1).is_some_and(|v| v.starts_with("--"));
            if i + 1 >= rest.len() || next_is_flag {
                params.insert(key.to_string(), Value::Bool(true));
                i += 1;
                continue;
            }

            let value = &rest[i + 1];
            let parsed = if ARRAY_SUFFIXES.iter().any(|suffix| key.ends_with(suffix)) {
                Value::Array(value.split(',').map(|v| Value::String(v.to_string())).collect())
            } else {
                serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.clone()))
            };
            params.insert(key.to_string(), parsed);
            i += 2;
        } else {
            positional.push(Value::String(arg.clone()));
            i += 1;
        }
    }

    if !positional.is_empty() {
        params.insert("args".to_string(), Value::Array(positional));
    }

    Ok((tool.clone(), Value::Object(params)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tool_invocation_requires_tool_name() {
        let result = parse_tool_invocation(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_tool_invocation_json_literal() {
        let args = vec!["tabs.create".to_string(), r#"{"url":"https://claude.ai"}"#.to_string()];
        let (tool, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(tool, "tabs.create");
        assert_eq!(params["url"], "https://claude.ai");
    }

    #[test]
    fn test_parse_tool_invocation_key_value_pairs() {
        let args = vec![
            "tabs.navigate".to_string(),
            "--tab_id".to_string(),
            "3".to_string(),
            "--url".to_string(),
            "https://claude.ai".to_string(),
        ];
        let (tool, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(tool, "tabs.navigate");
        assert_eq!(params["tab_id"], 3);
        assert_eq!(params["url"], "https://claude.ai");
    }

    #[test]
    fn test_parse_tool_invocation_positional_args() {
        let args = vec!["shell.run".to_string(), "ls".to_string(), "-la".to_string()];
        let (tool, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(tool, "shell.run");
        assert_eq!(params["args"], json!(["ls", "-la"]));
    }

    #[test]
    fn test_parse_tool_invocation_trailing_flag_with_no_value_is_boolean_true() {
        let args = vec!["tabs.create".to_string(), "--headless".to_string()];
        let (_, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(params["headless"], true);
    }

    #[test]
    fn test_parse_tool_invocation_no_prefix_is_boolean_false() {
        let args = vec!["tabs.create".to_string(), "--no-headless".to_string()];
        let (_, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(params["headless"], false);
    }

    #[test]
    fn test_parse_tool_invocation_array_suffix_splits_on_comma() {
        let args = vec![
            "tabs.close".to_string(),
            "--tabIds".to_string(),
            "1,2,3".to_string(),
        ];
        let (_, params) = parse_tool_invocation(&args).unwrap();
        assert_eq!(params["tabIds"], json!(["1", "2", "3"]));
    }
}
