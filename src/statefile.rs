//! Shared persist-on-write JSON state file helper.
//!
//! Both the Operation Manager and the Resource State Manager rewrite a
//! single JSON file on every mutation and need the same recovery behavior
//! when that file is corrupted: quarantine it and start from an empty
//! state rather than refuse to boot.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// Loads `T` from `path`, quarantining the file (renaming it aside with a
/// `.corrupt-<timestamp>` suffix) and returning `T::default()` if it fails
/// to parse. A missing file also yields the default, silently.
pub fn load_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let Ok(content) = std::fs::read_to_string(path) else {
        return T::default();
    };

    match serde_json::from_str(&content) {
        Ok(value) => value,
        Err(e) => {
            log::warn!(
                "state file {} is corrupted ({e}); quarantining and starting fresh",
                path.display()
            );
            quarantine(path);
            T::default()
        }
    }
}

/// Writes `value` to `path` as pretty JSON with `0600` permissions,
/// creating the parent directory if necessary. Failures are logged, not
/// propagated: callers treat persistence as best-effort and keep the
/// in-memory state authoritative.
pub fn save_best_effort<T: Serialize>(path: &Path, value: &T) {
    if let Err(e) = save(path, value) {
        log::warn!("failed to persist state file {}: {e:#}", path.display());
    }
}

fn save<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(value).context("serializing state")?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;

    #[cfg(unix)]
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("setting permissions on {}", path.display()))?;

    Ok(())
}

fn quarantine(path: &Path) {
    let quarantined: PathBuf = path.with_extension(format!(
        "corrupt-{}",
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    ));
    if let Err(e) = std::fs::rename(path, &quarantined) {
        log::warn!("failed to quarantine corrupt state file {}: {e}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Default, Serialize, Deserialize, PartialEq, Debug)]
    struct Sample {
        count: u32,
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let value = Sample { count: 7 };
        save_best_effort(&path, &value);
        let loaded: Sample = load_or_default(&path);
        assert_eq!(loaded, value);
    }

    #[test]
    fn test_missing_file_yields_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let loaded: Sample = load_or_default(&path);
        assert_eq!(loaded, Sample::default());
    }

    #[test]
    fn test_corrupted_file_is_quarantined_and_default_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let loaded: Sample = load_or_default(&path);
        assert_eq!(loaded, Sample::default());
        assert!(!path.exists());

        let quarantined: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(quarantined.len(), 1);
    }
}
