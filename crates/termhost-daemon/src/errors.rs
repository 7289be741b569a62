use termhost_protocol::ErrorCode;

/// Configuration validation failures (SPEC_FULL.md §12).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    OutOfRange(String),
}

/// All error types for the daemon crate (SPEC_FULL.md §13: superset of the
/// source's `DaemonError`, extended with session-registry and emulator
/// variants, mapping 1:1 onto `ErrorCode` via `error_code()`).
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("daemon already running (pid {0})")]
    AlreadyRunning(u32),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already exists: {0}")]
    SessionAlreadyExists(String),

    #[error("session not attachable: {0}")]
    SessionNotAttachable(String),

    #[error("invalid geometry: cols={cols} rows={rows}")]
    InvalidGeometry { cols: i64, rows: i64 },

    #[error("subprocess stdin queue full for session {0}")]
    WriteQueueFull(String),

    #[error("pty subprocess error: {0}")]
    SubprocessError(String),

    #[error("authentication failed")]
    AuthFailed,

    #[error("protocol version mismatch: client={client} daemon={daemon}")]
    ProtocolMismatch { client: u32, daemon: u32 },

    #[error("request received before successful hello")]
    NotAuthenticated,

    #[error("unknown request type: {0}")]
    UnknownRequest(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("frame codec error: {0}")]
    Frame(#[from] termhost_protocol::FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("path error: {0}")]
    Path(#[from] termhost_paths::PathError),

    #[error("shutdown timeout exceeded")]
    ShutdownTimeout,
}

impl DaemonError {
    /// Maps onto the wire-level `ErrorCode` taxonomy (spec.md §7).
    pub fn error_code(&self) -> ErrorCode {
        match self {
            DaemonError::AuthFailed => ErrorCode::AuthFailed,
            DaemonError::ProtocolMismatch { .. } => ErrorCode::ProtocolMismatch,
            DaemonError::NotAuthenticated => ErrorCode::NotAuthenticated,
            DaemonError::UnknownRequest(_) => ErrorCode::UnknownRequest,
            DaemonError::SessionNotFound(_) | DaemonError::SessionNotAttachable(_) => {
                ErrorCode::SessionNotFound
            }
            DaemonError::InvalidGeometry { .. } => ErrorCode::InvalidGeometry,
            DaemonError::WriteQueueFull(_) => ErrorCode::WriteQueueFull,
            DaemonError::SubprocessError(_) => ErrorCode::SubprocessError,
            _ => ErrorCode::Unknown,
        }
    }

    /// Whether this error is caused by user input, vs. internal/environmental.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DaemonError::SessionNotFound(_)
                | DaemonError::SessionAlreadyExists(_)
                | DaemonError::SessionNotAttachable(_)
                | DaemonError::InvalidGeometry { .. }
                | DaemonError::AuthFailed
                | DaemonError::ProtocolMismatch { .. }
                | DaemonError::NotAuthenticated
                | DaemonError::UnknownRequest(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_mapping() {
        assert_eq!(DaemonError::AuthFailed.error_code(), ErrorCode::AuthFailed);
        assert_eq!(
            DaemonError::SessionNotFound("s1".into()).error_code(),
            ErrorCode::SessionNotFound
        );
        assert_eq!(
            DaemonError::WriteQueueFull("s1".into()).error_code(),
            ErrorCode::WriteQueueFull
        );
    }

    #[test]
    fn user_error_classification() {
        assert!(DaemonError::SessionNotFound("x".into()).is_user_error());
        assert!(DaemonError::AuthFailed.is_user_error());
        assert!(!DaemonError::ShutdownTimeout.is_user_error());
        assert!(!DaemonError::SubprocessError("boom".into()).is_user_error());
    }
}
