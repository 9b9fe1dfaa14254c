//! Pidfile handling.
//!
//! A stale pidfile is removed only after verifying no process holds the
//! recorded pid. `-z` kills the recorded daemon and cleans up its pidfile
//! and socket.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use confmgr_common::{BackendError, BackendResult};

/// Reads the pid recorded in the pidfile, if the file exists and parses.
pub fn read_pid(path: &Path) -> BackendResult<Option<u32>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|e| BackendError::io(format!("reading pidfile {}", path.display()), e))?;
    Ok(text.trim().parse().ok())
}

/// True if a process with this pid is alive.
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

/// Returns the pid of a live daemon recorded in the pidfile.
///
/// A pidfile whose process is gone is stale and removed here.
pub fn check(path: &Path) -> BackendResult<Option<u32>> {
    match read_pid(path)? {
        Some(pid) if pid_alive(pid) => Ok(Some(pid)),
        Some(_) => {
            std::fs::remove_file(path)
                .map_err(|e| BackendError::io("removing stale pidfile", e))?;
            Ok(None)
        }
        None => Ok(None),
    }
}

/// Kills the daemon recorded in the pidfile and removes pidfile + socket.
pub async fn zap(pidfile: &Path, sock: &Path) -> BackendResult<()> {
    if let Some(pid) = read_pid(pidfile)? {
        if pid_alive(pid) {
            info!(pid = pid, "killing running daemon");
            let status = Command::new("kill")
                .arg(pid.to_string())
                .status()
                .await
                .map_err(|e| BackendError::io("spawning kill", e))?;
            if !status.success() {
                return Err(BackendError::internal(format!(
                    "kill {pid} exited with {status}"
                )));
            }
            // Give it a moment to unwind before removing its files.
            for _ in 0..50 {
                if !pid_alive(pid) {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
    remove(pidfile);
    if sock.exists() {
        let _ = std::fs::remove_file(sock);
    }
    Ok(())
}

/// Writes the current pid, returning it.
pub fn write(path: &Path) -> BackendResult<u32> {
    let pid = std::process::id();
    std::fs::write(path, format!("{pid}\n"))
        .map_err(|e| BackendError::io(format!("writing pidfile {}", path.display()), e))?;
    Ok(pid)
}

/// Removes the pidfile, ignoring a missing file.
pub fn remove(path: &Path) {
    let _ = std::fs::remove_file(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("d.pid");
        let pid = write(&pidfile).unwrap();
        assert_eq!(read_pid(&pidfile).unwrap(), Some(pid));
        // Our own pid is alive, so check reports a running daemon.
        assert_eq!(check(&pidfile).unwrap(), Some(pid));
        remove(&pidfile);
        assert_eq!(read_pid(&pidfile).unwrap(), None);
    }

    #[test]
    fn test_stale_pidfile_removed() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("d.pid");
        // Pid far beyond pid_max is never alive.
        std::fs::write(&pidfile, "4194399999\n").unwrap();
        assert_eq!(check(&pidfile).unwrap(), None);
        assert!(!pidfile.exists());
    }

    #[test]
    fn test_garbage_pidfile_is_not_a_daemon() {
        let dir = TempDir::new().unwrap();
        let pidfile = dir.path().join("d.pid");
        std::fs::write(&pidfile, "not-a-pid\n").unwrap();
        assert_eq!(read_pid(&pidfile).unwrap(), None);
    }
}
