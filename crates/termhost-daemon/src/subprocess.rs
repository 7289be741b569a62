//! Daemon-side half of Component B: spawns `termhost-ptyhost` as a standalone
//! OS process per session and drives the binary frame protocol over its
//! stdin/stdout (spec.md §4.B, §6). Isolating the PTY's blocking I/O behind a
//! process boundary is what keeps this daemon's own reactor non-blocking.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{error, warn};

use termhost_protocol::{
    encode, encode_resize, encode_signal_name, encode_spawn, Frame, FrameDecoder, FrameType,
    SpawnPayload,
};

use crate::errors::DaemonError;

const WRITE_CHUNK_LEN: usize = 8 * 1024;

/// Bound on in-flight decoded frames awaiting session consumption. Backed by
/// a bounded channel so a session actor that stops polling (because a client
/// is lagging, spec.md §4.D) propagates backpressure through to the
/// subprocess's own stdout read loop, and from there to the PTY itself.
pub const FRAMES_CHANNEL_CAPACITY: usize = 64;

/// Resolve the `termhost-ptyhost` binary as a sibling of the running
/// `termhost-daemon` executable, matching this workspace's `[[bin]]` layout.
///
/// Integration tests run from `target/.../deps/`, one level below where
/// `cargo test` actually places sibling binaries, so `TERMHOST_PTYHOST_BIN`
/// lets them point this at `env!("CARGO_BIN_EXE_termhost-ptyhost")` directly.
pub fn default_ptyhost_binary() -> Result<PathBuf, DaemonError> {
    if let Ok(path) = std::env::var("TERMHOST_PTYHOST_BIN") {
        return Ok(PathBuf::from(path));
    }
    let mut path = std::env::current_exe()?;
    path.pop();
    path.push(if cfg!(windows) {
        "termhost-ptyhost.exe"
    } else {
        "termhost-ptyhost"
    });
    Ok(path)
}

/// A live handle to one `termhost-ptyhost` child process.
///
/// Frames decoded from its stdout are forwarded, already parsed, to the
/// channel supplied at spawn time — the owning `Session` reads from that
/// channel rather than touching the subprocess's stdio directly.
pub struct PtySubprocess {
    child: Child,
    stdin_tx: mpsc::UnboundedSender<(usize, Vec<u8>)>,
    pending_stdin_bytes: Arc<AtomicUsize>,
    pid: u32,
}

impl PtySubprocess {
    /// Spawns the subprocess, waits for its `Ready` frame, sends `Spawn`, and
    /// waits for `Spawned` to learn the shell's pid (spec.md §4.B startup).
    pub async fn spawn(
        binary_path: &std::path::Path,
        shell: &str,
        args: &[String],
        cwd: &str,
        cols: u16,
        rows: u16,
        env: HashMap<String, String>,
        max_frame_len: usize,
        frames_tx: mpsc::Sender<Frame>,
    ) -> Result<Self, DaemonError> {
        let mut child = Command::new(binary_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DaemonError::SubprocessError("no stdin handle".into()))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| DaemonError::SubprocessError("no stdout handle".into()))?;

        let mut decoder = FrameDecoder::new(max_frame_len.try_into().unwrap_or(u32::MAX));
        let ready = read_frame_of_type(&mut stdout, &mut decoder, FrameType::Ready).await?;
        let _ = ready;

        let spawn_payload = SpawnPayload {
            shell: shell.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_string(),
            cols,
            rows,
            env,
        };
        let mut buf = Vec::new();
        encode_spawn(&spawn_payload, &mut buf)?;
        stdin.write_all(&buf).await?;
        stdin.flush().await?;

        let spawned = read_frame_of_type(&mut stdout, &mut decoder, FrameType::Spawned).await?;
        let pid = termhost_protocol::decode_spawned(&spawned.payload)?;

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<(usize, Vec<u8>)>();
        let pending_stdin_bytes = Arc::new(AtomicUsize::new(0));
        let pending_for_writer = pending_stdin_bytes.clone();
        tokio::spawn(async move {
            while let Some((payload_len, bytes)) = stdin_rx.recv().await {
                let failed = stdin.write_all(&bytes).await.is_err() || stdin.flush().await.is_err();
                pending_for_writer.fetch_sub(payload_len, Ordering::SeqCst);
                if failed {
                    break;
                }
            }
        });

        tokio::spawn(run_stdout_reader(stdout, decoder, frames_tx));

        Ok(Self { child, stdin_tx, pending_stdin_bytes, pid })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Outstanding bytes handed to the stdin writer task but not yet flushed
    /// to the subprocess — the real drain signal `enqueue_stdin` bounds
    /// against (spec.md §4.D).
    pub fn pending_stdin_bytes(&self) -> usize {
        self.pending_stdin_bytes.load(Ordering::SeqCst)
    }

    /// Chunks `data` into `<= 8 KiB` pieces and enqueues one `Write` frame
    /// per chunk (spec.md §4.A: "producer may chunk large payloads").
    pub fn write(&self, data: &[u8]) {
        for chunk in data.chunks(WRITE_CHUNK_LEN) {
            let mut buf = Vec::new();
            encode(FrameType::Write, chunk, &mut buf);
            self.pending_stdin_bytes.fetch_add(chunk.len(), Ordering::SeqCst);
            if self.stdin_tx.send((chunk.len(), buf)).is_err() {
                self.pending_stdin_bytes.fetch_sub(chunk.len(), Ordering::SeqCst);
            }
        }
    }

    pub fn resize(&self, cols: u32, rows: u32) {
        let mut buf = Vec::new();
        encode(FrameType::Resize, &encode_resize(cols, rows), &mut buf);
        let _ = self.stdin_tx.send((0, buf));
    }

    pub fn signal(&self, name: Option<&str>) {
        let mut buf = Vec::new();
        encode(FrameType::Signal, &encode_signal_name(name), &mut buf);
        let _ = self.stdin_tx.send((0, buf));
    }

    /// Starts kill escalation in the subprocess (spec.md §4.B).
    pub fn kill(&self, signal_name: Option<&str>) {
        let mut buf = Vec::new();
        encode(FrameType::Kill, &encode_signal_name(signal_name), &mut buf);
        let _ = self.stdin_tx.send((0, buf));
    }

    /// Immediate, unconditional teardown — closing the stdin sender drops the
    /// writer task, and `kill_on_drop` on the child guarantees the OS process
    /// dies even if the subprocess never reaps its own `Dispose` frame.
    pub fn dispose(&mut self) {
        let mut buf = Vec::new();
        encode(FrameType::Dispose, &[], &mut buf);
        let _ = self.stdin_tx.send((0, buf));
    }

    /// Safety net for a wedged subprocess: kill the OS process tree directly.
    pub async fn force_kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(event = "daemon.subprocess.force_kill_failed", error = %e);
        }
    }
}

async fn read_frame_of_type(
    stdout: &mut tokio::process::ChildStdout,
    decoder: &mut FrameDecoder,
    expected: FrameType,
) -> Result<Frame, DaemonError> {
    loop {
        if let Some(frame) = decoder.decode_next()? {
            if frame.frame_type == expected {
                return Ok(frame);
            }
            continue;
        }
        let mut buf = [0u8; 4096];
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            return Err(DaemonError::SubprocessError(format!(
                "stdout closed before {:?} frame",
                expected
            )));
        }
        decoder.feed(&buf[..n]);
    }
}

async fn run_stdout_reader(
    mut stdout: tokio::process::ChildStdout,
    mut decoder: FrameDecoder,
    frames_tx: mpsc::Sender<Frame>,
) {
    let mut buf = [0u8; 8192];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);
        loop {
            match decoder.decode_next() {
                Ok(Some(frame)) => {
                    // Awaiting here is the backpressure mechanism: once the
                    // session actor stops draining (a lagging client, spec.md
                    // §4.D), this channel fills and stops this loop from
                    // reading further PTY output at all.
                    if frames_tx.send(frame).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(event = "daemon.subprocess.decode_failed", error = %e);
                    return;
                }
            }
        }
    }
}
