//! PTY subprocess entry point (spec.md §4.B).
//!
//! One process per session. Owns exactly one PTY and speaks the binary frame
//! protocol over stdin/stdout with its parent daemon. Isolating the PTY's
//! blocking I/O behind a process boundary keeps the daemon's own reactor
//! non-blocking — this is the whole reason the subprocess exists.

mod errors;
mod kill;
mod output_batcher;
mod pty;
mod stdin_queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use termhost_protocol::{encode, encode_exit, encode_spawned, FrameDecoder, FrameType, FrameError};

use crate::errors::PtyHostError;
use crate::pty::ManagedPty;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        error!(event = "ptyhost.main.fatal", error = %e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), PtyHostError> {
    let (out_tx, out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let writer_task = tokio::spawn(run_stdout_writer(out_rx));

    let mut stdin = tokio::io::stdin();
    let mut decoder = FrameDecoder::new(termhost_protocol::DEFAULT_MAX_FRAME_LEN);

    let mut ready = Vec::new();
    encode(FrameType::Ready, &[], &mut ready);
    out_tx.send(ready).ok();

    let spawn_payload = read_spawn_frame(&mut stdin, &mut decoder).await?;
    info!(event = "ptyhost.main.spawn_received", shell = %spawn_payload.shell);

    let pty = ManagedPty::spawn(
        &spawn_payload.shell,
        &spawn_payload.args,
        &spawn_payload.cwd,
        spawn_payload.cols,
        spawn_payload.rows,
        &spawn_payload.env,
    )
    .map_err(|e| {
        let mut buf = Vec::new();
        encode(FrameType::Error, e.to_string().as_bytes(), &mut buf);
        let _ = out_tx.send(buf);
        e
    })?;

    let pid = pty.pid().unwrap_or(0);
    let mut spawned = Vec::new();
    encode(FrameType::Spawned, &encode_spawned(pid), &mut spawned);
    out_tx.send(spawned).ok();

    let reader = pty
        .try_clone_reader()
        .map_err(|e| PtyHostError::Pty(e.to_string()))?;
    let pty = Arc::new(Mutex::new(pty));

    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    output_batcher::spawn_reader(reader, raw_tx);
    let batcher_handle = tokio::spawn(run_output_batcher(raw_rx, out_tx.clone()));

    let mut stdin_queue = stdin_queue::StdinQueue::new();
    let exit_reported = Arc::new(AtomicBool::new(false));
    tokio::spawn(watch_natural_exit(
        pty.clone(),
        out_tx.clone(),
        exit_reported.clone(),
    ));

    // Paused once the queue crosses HIGH_WATERMARK, resumed once it drains
    // below LOW_WATERMARK — stops reading further `Write` frames from the
    // daemon so its own stdin write eventually blocks too (spec.md §4.B).
    let mut stdin_paused = false;

    loop {
        if stdin_paused {
            if stdin_queue.is_below_low_watermark() {
                stdin_paused = false;
            } else {
                if !stdin_queue.is_empty() {
                    let guard = pty.lock().await;
                    if let Err(e) = stdin_queue.drain_into(&guard).await {
                        warn!(event = "ptyhost.main.stdin_drain_failed", error = %e);
                    }
                }
                if batcher_handle.is_finished() {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                continue;
            }
        }

        let mut chunk = [0u8; 8192];
        let n = stdin.read(&mut chunk).await?;
        if n == 0 {
            // Parent closed stdin: treat like Dispose.
            let _ = kill::dispose(&pty).await;
            break;
        }
        decoder.feed(&chunk[..n]);
        while let Some(frame) = decode_next(&mut decoder)? {
            match frame.frame_type {
                FrameType::Write => {
                    if !stdin_queue.push(frame.payload) {
                        let mut buf = Vec::new();
                        encode(FrameType::Error, b"Input backlog exceeded hard limit", &mut buf);
                        let _ = out_tx.send(buf);
                    } else if stdin_queue.is_above_high_watermark() {
                        stdin_paused = true;
                    }
                }
                FrameType::Resize => {
                    let (cols, rows) = termhost_protocol::decode_resize(&frame.payload)?;
                    let mut guard = pty.lock().await;
                    if let Err(e) = guard.resize(cols as u16, rows as u16) {
                        warn!(event = "ptyhost.main.resize_failed", error = %e);
                    }
                }
                FrameType::Signal => {
                    let name = termhost_protocol::decode_signal_name(&frame.payload, "SIGINT");
                    if let Err(e) = kill::send_signal(&pty, &name).await {
                        warn!(event = "ptyhost.main.signal_failed", error = %e);
                    }
                }
                FrameType::Kill => {
                    if exit_reported.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    let name = termhost_protocol::decode_signal_name(&frame.payload, "SIGTERM");
                    let pty = pty.clone();
                    let out_tx = out_tx.clone();
                    tokio::spawn(async move {
                        let outcome = kill::escalate(pty, &name).await.unwrap_or(kill::ExitOutcome {
                            exit_code: -1,
                            signal: 9,
                        });
                        let mut buf = Vec::new();
                        encode(FrameType::Exit, &encode_exit(outcome.exit_code, outcome.signal), &mut buf);
                        let _ = out_tx.send(buf);
                    });
                }
                FrameType::Dispose => {
                    stdin_queue.drain_into(&*pty.lock().await).await.ok();
                    kill::dispose(&pty).await.ok();
                }
                _ => {}
            }
        }

        if !stdin_queue.is_empty() {
            let guard = pty.lock().await;
            if let Err(e) = stdin_queue.drain_into(&guard).await {
                warn!(event = "ptyhost.main.stdin_drain_failed", error = %e);
            }
        }

        if batcher_handle.is_finished() {
            break;
        }
    }

    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

fn decode_next(decoder: &mut FrameDecoder) -> Result<Option<termhost_protocol::Frame>, FrameError> {
    decoder.decode_next()
}

async fn read_spawn_frame(
    stdin: &mut tokio::io::Stdin,
    decoder: &mut FrameDecoder,
) -> Result<termhost_protocol::SpawnPayload, PtyHostError> {
    loop {
        if let Some(frame) = decoder.decode_next()? {
            if frame.frame_type == FrameType::Spawn {
                return Ok(termhost_protocol::decode_spawn(&frame.payload)?);
            }
            continue;
        }
        let mut buf = [0u8; 4096];
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            return Err(PtyHostError::NoSpawnFrame);
        }
        decoder.feed(&buf[..n]);
    }
}

/// Polls for the child exiting on its own (not via `Kill`), emitting the
/// `Exit` frame exactly once. `exit_reported` is shared with the `Kill`
/// handler so only one of the two paths ever reports the exit.
async fn watch_natural_exit(
    pty: Arc<Mutex<ManagedPty>>,
    out_tx: mpsc::UnboundedSender<Vec<u8>>,
    exit_reported: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let status = {
            let mut guard = pty.lock().await;
            guard.try_wait().ok().flatten()
        };
        if let Some(status) = status {
            if exit_reported.swap(true, Ordering::SeqCst) {
                return;
            }
            let exit_code = if status.success() { 0 } else { status.exit_code() as i32 };
            let mut buf = Vec::new();
            encode(FrameType::Exit, &encode_exit(exit_code, 0), &mut buf);
            let _ = out_tx.send(buf);
            return;
        }
    }
}

async fn run_stdout_writer(mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut stdout = tokio::io::stdout();
    while let Some(bytes) = rx.recv().await {
        if stdout.write_all(&bytes).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;
    }
}

async fn run_output_batcher(rx: mpsc::UnboundedReceiver<Vec<u8>>, out_tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut batcher = output_batcher::OutputBatcher::new(rx);
    while let Some(batch) = batcher.next_batch().await {
        if batch.is_empty() {
            continue;
        }
        let mut buf = Vec::new();
        encode(FrameType::Data, &batch, &mut buf);
        if out_tx.send(buf).is_err() {
            break;
        }
    }
}
