//! Configuration loading and persistence.
//!
//! Layered the same way the rest of the crate's ambient stack is: a
//! serialized file under the per-user config directory, overridden by
//! environment variables, with a hand-written default as the floor.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::{fs, path::PathBuf};

/// Process-wide configuration for the hub, hub client, daemon, and supervisor.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Port the Hub binds on loopback.
    pub hub_port: u16,
    /// Whether the Hub shuts itself down 5s after its last peer disconnects.
    pub hub_auto_drain: bool,
    /// Interval, in milliseconds, between the Hub's outbound liveness pings
    /// to each connected peer. A peer that misses two consecutive pings is
    /// force-closed.
    pub hub_keepalive_interval_ms: u64,
    /// Base delay, in milliseconds, for the hub client's reconnect backoff.
    pub reconnect_base_delay_ms: u64,
    /// Cap, in milliseconds, for the hub client's reconnect backoff.
    pub reconnect_max_delay_ms: u64,
    /// Seconds of sustained connection since the last attempt before the
    /// reconnect backoff counter resets.
    pub reconnect_quiet_secs: u64,
    /// Default deadline, in milliseconds, for a hub-client request awaiting
    /// a response from the extension.
    pub request_timeout_ms: u64,
    /// Directory under which the daemon's Unix-domain socket is created.
    pub daemon_socket_dir: PathBuf,
    /// Idle-reap sweep interval, in seconds, for the daemon's subprocess pool.
    pub daemon_idle_sweep_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let daemon_socket_dir = if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ccm-test")
        } else {
            dirs::runtime_dir()
                .or_else(dirs::cache_dir)
                .map(|d| d.join(crate::env::APP_NAME))
                .unwrap_or_else(|| PathBuf::from("/tmp").join(crate::env::APP_NAME))
        };

        Self {
            hub_port: crate::env::DEFAULT_HUB_PORT,
            hub_auto_drain: false,
            hub_keepalive_interval_ms: 30_000,
            reconnect_base_delay_ms: 250,
            reconnect_max_delay_ms: 30_000,
            reconnect_quiet_secs: 60,
            request_timeout_ms: 10_000,
            daemon_socket_dir,
            daemon_idle_sweep_secs: 30,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// Directory selection priority:
    /// 1. `#[cfg(test)]` (unit tests): `tmp/ccm-test`
    /// 2. `CCM_CONFIG_DIR` env var: explicit override
    /// 3. `CCM_ENV=test`: `tmp/ccm-test` (integration tests)
    /// 4. Default: platform config dir
    pub fn config_dir() -> Result<PathBuf> {
        let dir = {
            #[cfg(test)]
            {
                PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ccm-test")
            }

            #[cfg(not(test))]
            {
                if let Ok(dir) = std::env::var("CCM_CONFIG_DIR") {
                    PathBuf::from(dir)
                } else if crate::env::is_test_mode() {
                    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/ccm-test")
                } else {
                    dirs::config_dir()
                        .context("could not determine config directory")?
                        .join(crate::env::APP_NAME)
                }
            }
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Returns the state directory (operation/resource state files, logs),
    /// creating it if necessary. Separate from `config_dir` so an operator
    /// can point config and state at different places.
    pub fn state_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("CCM_STATE_DIR") {
            PathBuf::from(dir)
        } else {
            Self::config_dir()?.join("state")
        };
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Loads configuration from file, applying environment variable
    /// overrides on top.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_dir()?.join("config.json");
        if config_path.exists() {
            let content = fs::read_to_string(&config_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            anyhow::bail!("config file not found")
        }
    }

    fn apply_env_overrides(&mut self) {
        self.hub_port = crate::env::hub_port();
        self.hub_auto_drain = self.hub_auto_drain || crate::env::hub_auto_drain();

        if let Ok(v) = std::env::var("CCM_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = v.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Ok(v) = std::env::var("CCM_DAEMON_SOCKET_DIR") {
            self.daemon_socket_dir = PathBuf::from(v);
        }
    }

    /// Persists the current configuration to disk with restrictive
    /// permissions.
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_dir()?.join("config.json");
        fs::write(&config_path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.hub_port, crate::env::DEFAULT_HUB_PORT);
        assert!(!config.hub_auto_drain);
        assert_eq!(config.request_timeout_ms, 10_000);
    }

    #[test]
    fn test_config_roundtrip_serialization() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.hub_port, config.hub_port);
        assert_eq!(loaded.daemon_idle_sweep_secs, config.daemon_idle_sweep_secs);
    }
}
