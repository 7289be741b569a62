//! Bounded queue feeding bytes into the PTY's stdin, with watermark-based
//! backpressure and EAGAIN exponential backoff (spec.md §4.B).

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, warn};

use crate::errors::PtyHostError;
use crate::pty::ManagedPty;

pub const HIGH_WATERMARK: usize = 8 * 1024 * 1024;
pub const LOW_WATERMARK: usize = 4 * 1024 * 1024;
pub const HARD_LIMIT: usize = 64 * 1024 * 1024;

const BACKOFF_START: Duration = Duration::from_millis(2);
const BACKOFF_MAX: Duration = Duration::from_millis(50);

/// FIFO byte queue bounded by `HARD_LIMIT`. The daemon is expected to pause
/// its own `Write` frame submission once `is_above_high_watermark()` is true
/// and resume once it drops below `LOW_WATERMARK`; this queue enforces the
/// hard limit as a final backstop.
#[derive(Default)]
pub struct StdinQueue {
    chunks: VecDeque<Vec<u8>>,
    queued_bytes: usize,
}

impl StdinQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a chunk. Returns `false` (and drops the chunk) if it would
    /// exceed `HARD_LIMIT`.
    pub fn push(&mut self, data: Vec<u8>) -> bool {
        if self.queued_bytes + data.len() > HARD_LIMIT {
            warn!(
                event = "ptyhost.stdin_queue.overflow",
                queued_bytes = self.queued_bytes,
                incoming = data.len(),
            );
            return false;
        }
        self.queued_bytes += data.len();
        self.chunks.push_back(data);
        true
    }

    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    pub fn is_above_high_watermark(&self) -> bool {
        self.queued_bytes >= HIGH_WATERMARK
    }

    pub fn is_below_low_watermark(&self) -> bool {
        self.queued_bytes <= LOW_WATERMARK
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Drain everything currently queued into the PTY, retrying on
    /// would-block with exponential backoff. Returns once the queue is empty
    /// or a hard write error occurs.
    pub async fn drain_into(&mut self, pty: &ManagedPty) -> Result<(), PtyHostError> {
        while let Some(chunk) = self.chunks.pop_front() {
            self.queued_bytes -= chunk.len();
            self.write_with_backoff(pty, &chunk).await?;
        }
        Ok(())
    }

    async fn write_with_backoff(&self, pty: &ManagedPty, chunk: &[u8]) -> Result<(), PtyHostError> {
        let mut backoff = BACKOFF_START;
        loop {
            match pty.write_stdin(chunk) {
                Ok(()) => return Ok(()),
                Err(PtyHostError::Pty(msg)) if msg.contains("WouldBlock") || msg.contains("EAGAIN") => {
                    debug!(event = "ptyhost.stdin_queue.backoff", millis = backoff.as_millis() as u64);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_tracks_queued_bytes() {
        let mut q = StdinQueue::new();
        assert!(q.push(vec![0u8; 100]));
        assert_eq!(q.queued_bytes(), 100);
    }

    #[test]
    fn push_rejects_beyond_hard_limit() {
        let mut q = StdinQueue::new();
        assert!(q.push(vec![0u8; HARD_LIMIT]));
        assert!(!q.push(vec![0u8; 1]));
    }

    #[test]
    fn watermarks_trip_at_configured_thresholds() {
        let mut q = StdinQueue::new();
        q.push(vec![0u8; HIGH_WATERMARK]);
        assert!(q.is_above_high_watermark());
        assert!(!q.is_below_low_watermark());
    }
}
