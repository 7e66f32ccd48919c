//! Process ancestry inspection.
//!
//! Used by the hub client to auto-detect which editor or tool spawned the
//! current process, for display and logging purposes only.

use std::process::Command;

/// Gets the parent PID of a process.
///
/// # Platform Support
///
/// - **macOS**: Uses `ps -o ppid= -p <pid>`
/// - **Linux**: Reads `/proc/<pid>/stat`
/// - **Other**: Always returns `None`
pub fn get_parent_pid(pid: u32) -> Option<u32> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("ps")
            .arg("-o")
            .arg("ppid=")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .ok()?;
        let ppid_str = String::from_utf8_lossy(&output.stdout);
        ppid_str.trim().parse().ok()
    }

    #[cfg(target_os = "linux")]
    {
        let stat_path = format!("/proc/{}/stat", pid);
        let stat = std::fs::read_to_string(&stat_path).ok()?;
        // Format: pid (comm) state ppid ...
        let parts: Vec<&str> = stat.split_whitespace().collect();
        parts.get(3)?.parse().ok()
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = pid;
        None
    }
}

/// Gets the process name for a PID, used to identify the spawning editor.
///
/// # Platform Support
///
/// - **macOS**: Uses `ps -o comm= -p <pid>`
/// - **Linux**: Reads `/proc/<pid>/comm`
/// - **Other**: Always returns `None`
pub fn get_process_name(pid: u32) -> Option<String> {
    #[cfg(target_os = "macos")]
    {
        let output = Command::new("ps")
            .arg("-o")
            .arg("comm=")
            .arg("-p")
            .arg(pid.to_string())
            .output()
            .ok()?;
        let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }

    #[cfg(target_os = "linux")]
    {
        let comm_path = format!("/proc/{}/comm", pid);
        std::fs::read_to_string(&comm_path)
            .ok()
            .map(|s| s.trim().to_string())
    }

    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        let _ = pid;
        None
    }
}

/// Walks the process ancestry from the current process upward, returning
/// the first ancestor name that looks like a known editor/tool host.
///
/// Falls back to `None` if ancestry cannot be inspected or no recognized
/// ancestor is found within `max_depth` hops.
pub fn detect_host_from_ancestry(max_depth: u32) -> Option<String> {
    let mut pid = std::process::id();
    for _ in 0..max_depth {
        let ppid = get_parent_pid(pid)?;
        if let Some(name) = get_process_name(ppid) {
            if is_known_host_name(&name) {
                return Some(name);
            }
        }
        pid = ppid;
    }
    None
}

fn is_known_host_name(name: &str) -> bool {
    const KNOWN: &[&str] = &["code", "cursor", "zed", "nvim", "vim", "emacs", "claude"];
    let lower = name.to_ascii_lowercase();
    KNOWN.iter().any(|k| lower.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_parent_pid_for_current_process() {
        let our_pid = std::process::id();
        let ppid = get_parent_pid(our_pid);

        #[cfg(any(target_os = "macos", target_os = "linux"))]
        assert!(ppid.is_some());

        if let Some(parent) = ppid {
            assert_ne!(parent, our_pid);
        }
    }

    #[test]
    fn test_get_parent_pid_invalid_pid() {
        let ppid = get_parent_pid(u32::MAX);
        assert!(ppid.is_none());
    }

    #[test]
    fn test_is_known_host_name_matches_substring() {
        assert!(is_known_host_name("Code Helper"));
        assert!(is_known_host_name("cursor"));
        assert!(!is_known_host_name("bash"));
    }

    #[test]
    fn test_detect_host_from_ancestry_does_not_panic() {
        let _ = detect_host_from_ancestry(4);
    }
}
