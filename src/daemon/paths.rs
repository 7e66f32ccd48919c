//! Daemon PID file and control-socket path resolution.
//!
//! Mirrors the hub's own PID-file/socket-path bookkeeping: one daemon per
//! machine, living under `config.daemon_socket_dir` (which itself defaults
//! to the runtime dir rather than the config dir, since macOS caps Unix
//! socket paths at 104 bytes).

use crate::config::Config;
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

/// Path to the daemon's control socket.
pub fn daemon_socket_path(config: &Config) -> Result<PathBuf> {
    if !config.daemon_socket_dir.exists() {
        fs::create_dir_all(&config.daemon_socket_dir).with_context(|| {
            format!(
                "failed to create daemon socket directory: {}",
                config.daemon_socket_dir.display()
            )
        })?;
    }
    Ok(config.daemon_socket_dir.join("daemon.sock"))
}

/// Path to the daemon's PID file.
pub fn daemon_pid_file_path(config: &Config) -> Result<PathBuf> {
    Ok(config.daemon_socket_dir.join("daemon.pid"))
}

/// Writes the current process id to the daemon's PID file.
pub fn write_pid_file(config: &Config) -> Result<()> {
    let path = daemon_pid_file_path(config)?;
    fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write PID file: {}", path.display()))
}

/// Reads the PID recorded in the daemon's PID file, if any.
pub fn read_pid_file(config: &Config) -> Option<u32> {
    let path = daemon_pid_file_path(config).ok()?;
    fs::read_to_string(&path).ok()?.trim().parse().ok()
}

/// `true` if the PID file names a process that is still alive.
#[cfg(unix)]
pub fn is_daemon_running(config: &Config) -> bool {
    let Some(pid) = read_pid_file(config) else { return false };
    // SAFETY: signal 0 performs no action beyond an existence/permission
    // check; `pid` is a plain integer, not a pointer or resource handle.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn is_daemon_running(config: &Config) -> bool {
    read_pid_file(config).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.daemon_socket_dir =
            std::env::temp_dir().join(format!("ccm-paths-test-{}", uuid::Uuid::new_v4()));
        config
    }

    #[test]
    fn test_socket_path_ends_with_sock() {
        let config = test_config();
        let path = daemon_socket_path(&config).unwrap();
        assert!(path.to_string_lossy().ends_with("daemon.sock"));
    }

    #[test]
    fn test_is_daemon_running_false_without_pid_file() {
        let config = test_config();
        assert!(!is_daemon_running(&config));
    }

    #[test]
    fn test_write_then_read_pid_file_round_trips() {
        let config = test_config();
        let _ = daemon_socket_path(&config); // ensures the dir exists
        write_pid_file(&config).unwrap();
        assert_eq!(read_pid_file(&config), Some(std::process::id()));
        assert!(is_daemon_running(&config));
    }
}
