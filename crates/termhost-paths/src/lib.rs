use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("home directory not found — set $HOME environment variable")]
    HomeNotFound,
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Centralized path construction and file-mode management for the per-user
/// state directory (spec.md §6): default `~/.<app>` or `~/.<app>-dev`.
///
/// Single source of truth for every path the daemon and client need. Use
/// `resolve()` in production code and `from_dir()` in tests.
#[derive(Debug, Clone)]
pub struct HostPaths {
    state_dir: PathBuf,
}

/// Default spawn lock staleness threshold (spec.md §4.G, §5).
pub const SPAWN_LOCK_STALE_MS: u128 = 10_000;

impl HostPaths {
    /// Resolve paths from the user's home directory. `dev` selects the
    /// `-dev` suffixed directory so a development daemon never collides with
    /// a production one on the same host.
    pub fn resolve(app_name: &str, dev: bool) -> Result<Self, PathError> {
        let home = dirs::home_dir().ok_or(PathError::HomeNotFound)?;
        let dir_name = if dev {
            format!(".{app_name}-dev")
        } else {
            format!(".{app_name}")
        };
        Ok(Self {
            state_dir: home.join(dir_name),
        })
    }

    /// Create paths from an explicit base directory. Use in tests.
    pub fn from_dir(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }

    /// The base state directory.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("terminal-host.sock")
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join("terminal-host.pid")
    }

    pub fn token_file(&self) -> PathBuf {
        self.state_dir.join("terminal-host.token")
    }

    pub fn spawn_lock_file(&self) -> PathBuf {
        self.state_dir.join("terminal-host.spawn.lock")
    }

    pub fn log_file(&self) -> PathBuf {
        self.state_dir.join("daemon.log")
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join("config.toml")
    }

    /// Create the state directory (mode 0700) if it doesn't already exist.
    pub fn ensure_state_dir(&self) -> Result<(), PathError> {
        std::fs::create_dir_all(&self.state_dir).map_err(|e| PathError::Io {
            path: self.state_dir.clone(),
            source: e,
        })?;
        #[cfg(unix)]
        {
            let perms = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(&self.state_dir, perms).map_err(|e| PathError::Io {
                path: self.state_dir.clone(),
                source: e,
            })?;
        }
        Ok(())
    }

    /// Write the pidfile (mode 0644) with the given pid as decimal text.
    pub fn write_pid_file(&self, pid: u32) -> Result<(), PathError> {
        write_with_mode(&self.pid_file(), pid.to_string().as_bytes(), 0o644)
    }

    /// Read back the pidfile, if present.
    pub fn read_pid_file(&self) -> Option<u32> {
        std::fs::read_to_string(self.pid_file())
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Write the token file (mode 0600) with a hex-encoded random token.
    pub fn write_token_file(&self, token_hex: &str) -> Result<(), PathError> {
        write_with_mode(&self.token_file(), token_hex.as_bytes(), 0o600)
    }

    /// Read the token file, trimming trailing whitespace.
    pub fn read_token_file(&self) -> Option<String> {
        std::fs::read_to_string(self.token_file())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Attempt to atomically create the spawn lock file, writing the current
    /// epoch-millisecond timestamp. Fails if the file already exists and is
    /// not stale (spec.md §4.G: stale after 10 s).
    pub fn acquire_spawn_lock(&self) -> Result<bool, PathError> {
        let path = self.spawn_lock_file();
        if let Some(age_ms) = self.spawn_lock_age_ms() {
            if age_ms < SPAWN_LOCK_STALE_MS {
                return Ok(false);
            }
            let _ = std::fs::remove_file(&path);
        }
        let now_ms = now_epoch_ms();
        let mut opts = OpenOptions::new();
        opts.write(true).create_new(true);
        #[cfg(unix)]
        opts.mode(0o600);
        match opts.open(&path) {
            Ok(mut f) => {
                use std::io::Write;
                f.write_all(now_ms.to_string().as_bytes())
                    .map_err(|e| PathError::Io {
                        path: path.clone(),
                        source: e,
                    })?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(PathError::Io { path, source: e }),
        }
    }

    /// Release the spawn lock, if held.
    pub fn release_spawn_lock(&self) {
        let _ = std::fs::remove_file(self.spawn_lock_file());
    }

    /// Age of the spawn lock in milliseconds, or `None` if it doesn't exist
    /// or its contents can't be parsed.
    pub fn spawn_lock_age_ms(&self) -> Option<u128> {
        let contents = std::fs::read_to_string(self.spawn_lock_file()).ok()?;
        let created_ms: u128 = contents.trim().parse().ok()?;
        Some(now_epoch_ms().saturating_sub(created_ms))
    }

    /// Open the log file for append (mode 0644), creating it if necessary.
    pub fn open_log_file(&self) -> Result<std::fs::File, PathError> {
        let path = self.log_file();
        let mut opts = OpenOptions::new();
        opts.create(true).append(true);
        #[cfg(unix)]
        opts.mode(0o644);
        opts.open(&path).map_err(|e| PathError::Io { path, source: e })
    }
}

fn now_epoch_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

fn write_with_mode(path: &Path, bytes: &[u8], #[allow(unused_variables)] mode: u32) -> Result<(), PathError> {
    use std::io::Write;
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(mode);
    let mut f = opts.open(path).map_err(|e| PathError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    f.write_all(bytes).map_err(|e| PathError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    #[cfg(unix)]
    {
        let perms = std::fs::Permissions::from_mode(mode);
        std::fs::set_permissions(path, perms).map_err(|e| PathError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}
