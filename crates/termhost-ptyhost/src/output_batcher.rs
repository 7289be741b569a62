//! Batches PTY output into `Data` frames on a size/time budget (spec.md §4.D:
//! 128 KiB or 32 ms, whichever comes first).
//!
//! Grounded on the daemon's old `spawn_pty_reader` (kild-daemon's
//! `pty/output.rs`), which ran the blocking PTY read loop on a dedicated
//! blocking task and forwarded chunks over a channel — the same shape, but
//! forwarding raw bytes to a batching task instead of a broadcast channel.

use std::io::Read;

use tokio::sync::mpsc;
use tracing::debug;

pub const BATCH_MAX_BYTES: usize = 128 * 1024;
pub const BATCH_MAX_DELAY: std::time::Duration = std::time::Duration::from_millis(32);

/// Spawns a blocking task that reads from the PTY master and forwards raw
/// chunks to `tx`. Exits when the reader hits EOF or an error.
pub fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!(event = "ptyhost.output_batcher.reader_eof");
                    break;
                }
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(event = "ptyhost.output_batcher.reader_error", error = %e);
                    break;
                }
            }
        }
    })
}

/// Accumulates raw chunks from `rx` and emits them as coalesced batches, each
/// at most `BATCH_MAX_BYTES`, flushed at most every `BATCH_MAX_DELAY`.
pub struct OutputBatcher {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl OutputBatcher {
    pub fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
        }
    }

    /// Waits for the next batch to flush: either `BATCH_MAX_BYTES` worth of
    /// data has accumulated, `BATCH_MAX_DELAY` has elapsed since the first
    /// byte arrived, or the channel closed (subprocess reader exited).
    ///
    /// Returns `None` once the channel is closed and no more data remains.
    pub async fn next_batch(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.pending.is_empty() {
                let deadline = tokio::time::sleep(BATCH_MAX_DELAY);
                tokio::pin!(deadline);
                tokio::select! {
                    _ = &mut deadline => return Some(std::mem::take(&mut self.pending)),
                    chunk = self.rx.recv() => match chunk {
                        Some(chunk) => {
                            self.pending.extend_from_slice(&chunk);
                            if self.pending.len() >= BATCH_MAX_BYTES {
                                return Some(std::mem::take(&mut self.pending));
                            }
                        }
                        None => return Some(std::mem::take(&mut self.pending)),
                    }
                }
            } else {
                match self.rx.recv().await {
                    Some(chunk) => self.pending.extend_from_slice(&chunk),
                    None => return None,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn flushes_on_channel_close_with_partial_batch() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"hello".to_vec()).unwrap();
        drop(tx);
        let mut batcher = OutputBatcher::new(rx);
        assert_eq!(batcher.next_batch().await, Some(b"hello".to_vec()));
        assert_eq!(batcher.next_batch().await, None);
    }

    #[tokio::test]
    async fn coalesces_multiple_chunks_below_size_threshold() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(b"abc".to_vec()).unwrap();
        tx.send(b"def".to_vec()).unwrap();
        drop(tx);
        let mut batcher = OutputBatcher::new(rx);
        assert_eq!(batcher.next_batch().await, Some(b"abcdef".to_vec()));
    }

    #[tokio::test]
    async fn flushes_once_size_threshold_reached() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(vec![0u8; BATCH_MAX_BYTES]).unwrap();
        tx.send(b"extra".to_vec()).unwrap();
        let mut batcher = OutputBatcher::new(rx);
        let first = batcher.next_batch().await.unwrap();
        assert_eq!(first.len(), BATCH_MAX_BYTES);
    }
}
