//! Spawns the daemon on first use if it isn't already running, coordinating
//! with other processes doing the same thing via the on-disk spawn lock
//! (spec.md §6 `terminal-host.spawn.lock`, stale after 10s).

use std::path::Path;
use std::time::{Duration, Instant};

use termhost_paths::HostPaths;
use tracing::{info, warn};

use crate::errors::ClientError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ensures a daemon is listening on `paths.socket_path()`, spawning
/// `daemon_binary` if necessary. Safe to call concurrently from multiple
/// processes — only one actually spawns; the rest poll for the socket.
pub fn ensure_daemon_running(
    paths: &HostPaths,
    daemon_binary: &Path,
    total_timeout: Duration,
) -> Result<(), ClientError> {
    if paths.socket_path().exists() {
        return Ok(());
    }

    paths.ensure_state_dir()?;
    let deadline = Instant::now() + total_timeout;

    if paths.acquire_spawn_lock()? {
        let result = spawn_and_wait(paths, daemon_binary, deadline);
        paths.release_spawn_lock();
        return result;
    }

    // Someone else is spawning. Poll for the socket, but don't wait forever
    // behind a spawner that died without releasing the lock.
    while Instant::now() < deadline {
        if paths.socket_path().exists() {
            return Ok(());
        }
        if let Some(age_ms) = paths.spawn_lock_age_ms() {
            if age_ms > 10_000 {
                warn!(event = "client.autostart.spawn_lock_stale", age_ms);
                if paths.acquire_spawn_lock()? {
                    let result = spawn_and_wait(paths, daemon_binary, deadline);
                    paths.release_spawn_lock();
                    return result;
                }
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    Err(ClientError::SpawnTimeout)
}

fn spawn_and_wait(
    paths: &HostPaths,
    daemon_binary: &Path,
    deadline: Instant,
) -> Result<(), ClientError> {
    info!(event = "client.autostart.spawning", binary = %daemon_binary.display());
    std::process::Command::new(daemon_binary)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()?;

    while Instant::now() < deadline {
        if paths.socket_path().exists() {
            info!(event = "client.autostart.daemon_ready");
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    Err(ClientError::SpawnTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_immediately_when_socket_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::from_dir(dir.path().to_path_buf());
        paths.ensure_state_dir().unwrap();
        let _listener = std::os::unix::net::UnixListener::bind(paths.socket_path()).unwrap();

        ensure_daemon_running(&paths, Path::new("/bin/true"), Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn times_out_when_nothing_creates_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let paths = HostPaths::from_dir(dir.path().to_path_buf());
        let result = ensure_daemon_running(&paths, Path::new("/bin/true"), Duration::from_millis(300));
        assert!(matches!(result, Err(ClientError::SpawnTimeout)));
    }
}
