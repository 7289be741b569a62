//! Daemon configuration (SPEC_FULL.md §12), read from `<state-dir>/config.toml`.
//!
//! Every field has a literal default matching the table in SPEC_FULL.md §12;
//! a missing or unparsable file falls back to defaults with a `tracing::warn!`,
//! the same posture the source's `load_daemon_config()` used.

use serde::{Deserialize, Serialize};

use crate::errors::{ConfigError, DaemonError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub scrollback_lines: usize,
    pub pty_output_batch_bytes: usize,
    pub pty_output_batch_ms: u64,
    pub stdin_queue_high_watermark: usize,
    pub stdin_queue_low_watermark: usize,
    pub stdin_queue_hard_limit: usize,
    pub session_stdin_queue_bytes: usize,
    pub client_notify_queue_bytes: usize,
    pub attach_flush_timeout_ms: u64,
    pub kill_escalation_ms: u64,
    pub kill_force_exit_ms: u64,
    pub session_retention_secs: u64,
    pub spawn_lock_stale_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub daemon_spawn_timeout_secs: u64,
    pub max_frame_len: usize,
    pub tombstone_capacity: usize,
    pub admission_max_concurrent: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            scrollback_lines: 10_000,
            pty_output_batch_bytes: 131_072,
            pty_output_batch_ms: 32,
            stdin_queue_high_watermark: 8_388_608,
            stdin_queue_low_watermark: 4_194_304,
            stdin_queue_hard_limit: 67_108_864,
            session_stdin_queue_bytes: 2_097_152,
            client_notify_queue_bytes: 2_097_152,
            attach_flush_timeout_ms: 500,
            kill_escalation_ms: 2000,
            kill_force_exit_ms: 1000,
            session_retention_secs: 5,
            spawn_lock_stale_secs: 10,
            request_timeout_secs: 30,
            connect_timeout_secs: 5,
            daemon_spawn_timeout_secs: 2,
            max_frame_len: 67_108_864,
            tombstone_capacity: 128,
            admission_max_concurrent: 4,
        }
    }
}

impl DaemonConfig {
    /// Validate configuration values, mirroring the source's `DaemonConfig::validate`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pty_output_batch_bytes == 0 {
            return Err(ConfigError::OutOfRange("pty_output_batch_bytes must be > 0".into()));
        }
        if self.stdin_queue_low_watermark >= self.stdin_queue_high_watermark {
            return Err(ConfigError::OutOfRange(
                "stdin_queue_low_watermark must be < stdin_queue_high_watermark".into(),
            ));
        }
        if self.stdin_queue_high_watermark >= self.stdin_queue_hard_limit {
            return Err(ConfigError::OutOfRange(
                "stdin_queue_high_watermark must be < stdin_queue_hard_limit".into(),
            ));
        }
        if self.session_stdin_queue_bytes == 0 {
            return Err(ConfigError::OutOfRange("session_stdin_queue_bytes must be > 0".into()));
        }
        if self.client_notify_queue_bytes == 0 {
            return Err(ConfigError::OutOfRange("client_notify_queue_bytes must be > 0".into()));
        }
        if self.admission_max_concurrent == 0 {
            return Err(ConfigError::OutOfRange("admission_max_concurrent must be > 0".into()));
        }
        if self.max_frame_len == 0 {
            return Err(ConfigError::OutOfRange("max_frame_len must be > 0".into()));
        }
        Ok(())
    }
}

/// Wrapper matching the on-disk shape: `[daemon]` table at the top of
/// `config.toml`, keeping room for sibling sections owned by other tools
/// that might share the same state directory.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    daemon: DaemonConfig,
}

/// Load `<state-dir>/config.toml`, falling back to defaults on any failure.
pub fn load_daemon_config(config_path: &std::path::Path) -> Result<DaemonConfig, DaemonError> {
    let config = match std::fs::read_to_string(config_path) {
        Ok(contents) => match toml::from_str::<ConfigFile>(&contents) {
            Ok(file) => file.daemon,
            Err(e) => {
                tracing::warn!(
                    event = "daemon.config.parse_failed",
                    path = %config_path.display(),
                    error = %e,
                );
                DaemonConfig::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => DaemonConfig::default(),
        Err(e) => {
            tracing::warn!(
                event = "daemon.config.read_failed",
                path = %config_path.display(),
                error = %e,
            );
            DaemonConfig::default()
        }
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let c = DaemonConfig::default();
        assert_eq!(c.scrollback_lines, 10_000);
        assert_eq!(c.pty_output_batch_bytes, 131_072);
        assert_eq!(c.stdin_queue_hard_limit, 67_108_864);
        assert_eq!(c.tombstone_capacity, 128);
        assert_eq!(c.admission_max_concurrent, 4);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn rejects_inverted_watermarks() {
        let mut c = DaemonConfig::default();
        c.stdin_queue_low_watermark = c.stdin_queue_high_watermark;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_zero_batch_bytes() {
        let mut c = DaemonConfig::default();
        c.pty_output_batch_bytes = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_daemon_config(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn load_parses_daemon_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[daemon]\nscrollback_lines = 500\n").unwrap();
        let config = load_daemon_config(&path).unwrap();
        assert_eq!(config.scrollback_lines, 500);
        assert_eq!(config.admission_max_concurrent, 4);
    }

    #[test]
    fn load_falls_back_on_unparsable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();
        let config = load_daemon_config(&path).unwrap();
        assert_eq!(config, DaemonConfig::default());
    }
}
