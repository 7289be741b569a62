#[derive(Debug, thiserror::Error)]
pub enum PtyHostError {
    #[error("pty error: {0}")]
    Pty(String),

    #[error("frame error: {0}")]
    Frame(#[from] termhost_protocol::FrameError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("stdin closed before a spawn frame arrived")]
    NoSpawnFrame,
}
