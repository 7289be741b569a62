//! Error type for the host-embeddable client (spec.md §4.H/§4.I).

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("daemon ipc error: {0}")]
    Ipc(#[from] termhost_protocol::IpcError),

    #[error("path resolution error: {0}")]
    Path(#[from] termhost_paths::PathError),

    #[error("timed out waiting for daemon to start listening")]
    SpawnTimeout,

    #[error("failed to spawn daemon process: {0}")]
    SpawnFailed(#[from] std::io::Error),

    #[error("session admission rejected: at capacity")]
    AdmissionRejected,

    #[error("unknown pane: {0}")]
    UnknownPane(String),

    #[error("unexpected daemon response: {0}")]
    UnexpectedResponse(String),
}
