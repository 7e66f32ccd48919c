//! `ccm` — CLI entry point for the Claude Chrome MCP bridge.
//!
//! This binary is thin: `claude_chrome_mcp` (the library) owns the hub,
//! hub client, daemon, and supervisor. `main` wires up logging, the panic
//! hook, and dispatches to either the foreground supervised run (`daemon
//! start`) or a one-shot request against an already-running daemon.

use anyhow::Result;
use claude_chrome_mcp::cli::{exit_code, Cli, Commands, DaemonAction};
use claude_chrome_mcp::{
    Config, Daemon, HubClient, LifecycleSupervisor, OperationManager, ResourceStateManager,
};
use clap::Parser;
use mimalloc::MiMalloc;
use std::sync::Arc;

/// mimalloc provides better multi-threaded performance than the system
/// allocator for the hub's connection-heavy workload.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn init_logging() -> Result<()> {
    let log_path = if let Ok(path) = std::env::var("CCM_LOG_FILE") {
        std::path::PathBuf::from(path)
    } else if let Ok(config_dir) = std::env::var("CCM_CONFIG_DIR") {
        std::path::PathBuf::from(config_dir).join("ccm.log")
    } else if claude_chrome_mcp::env::is_test_mode() {
        std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ccm.log")
    } else {
        std::path::PathBuf::from("/tmp/ccm.log")
    };

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let log_file = std::fs::File::create(&log_path)
        .unwrap_or_else(|e| panic!("failed to create log file at {log_path:?}: {e}"));

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
    Ok(())
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        default_hook(panic_info);
    }));
}

/// Runs the hub client, daemon, and supervisor together in the foreground
/// until a shutdown signal arrives. This is what `ccm daemon start` runs.
/// Binds the control socket synchronously before spawning anything, so a
/// second `daemon start` against an already-running daemon fails fast with
/// a usage error instead of silently losing the race inside a task.
async fn run_supervised(config: Arc<Config>) -> i32 {
    let state_dir = match Config::state_dir() {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code::FAILURE;
        }
    };
    let operations = Arc::new(OperationManager::new(state_dir.join("operations.json")));
    let resources = Arc::new(ResourceStateManager::new(state_dir.join("resources.json")));
    let hub_client = HubClient::new(Arc::clone(&config), operations);
    let daemon = Daemon::new(Arc::clone(&config), resources);

    let listener = match daemon.bind() {
        Ok(l) => l,
        Err(e) => {
            eprintln!("error: {e}");
            return exit_code::USAGE;
        }
    };

    let supervisor = LifecycleSupervisor::new(Arc::clone(&config), state_dir.join("supervisor.json"));
    if let Err(e) = supervisor.install_signal_handlers() {
        eprintln!("error: {e}");
        return exit_code::FAILURE;
    }

    let daemon_for_socket = Arc::clone(&daemon);
    let socket_task = tokio::spawn(async move {
        if let Err(e) = daemon_for_socket.serve(listener).await {
            log::error!("daemon: control socket exited: {e:#}");
        }
    });

    let daemon_for_supervisor = Arc::clone(&daemon);
    if let Err(e) = supervisor.run(hub_client, daemon_for_supervisor).await {
        eprintln!("error: {e}");
        return exit_code::FAILURE;
    }

    daemon.request_shutdown();
    let _ = tokio::time::timeout(std::time::Duration::from_secs(5), socket_task).await;
    exit_code::OK
}

fn main() -> Result<()> {
    init_logging()?;
    install_panic_hook();

    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new()?;
    let code = runtime.block_on(async {
        if let Commands::Daemon { action: DaemonAction::Start } = &cli.command {
            let config = match Config::load() {
                Ok(c) => Arc::new(c),
                Err(e) => {
                    eprintln!("error: {e}");
                    return exit_code::FAILURE;
                }
            };
            run_supervised(config).await
        } else {
            claude_chrome_mcp::cli::dispatch(cli).await
        }
    });

    std::process::exit(code);
}
