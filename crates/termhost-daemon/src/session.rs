//! Component D: binds one `PtySubprocess` + one `Emulator` + the clients
//! currently attached to it (spec.md §4.D). Each session runs as its own
//! tokio task — a small cooperative event loop, matching spec.md §5's
//! "single-threaded, non-blocking" concurrency model scaled out per session
//! rather than per daemon.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use termhost_protocol::{
    DaemonMessage, EmulatorSnapshot, ErrorCode, Frame, FrameType, SessionId, SessionInfo,
    SessionStatus,
};

use crate::config::DaemonConfig;
use crate::emulator::Emulator;
use crate::errors::DaemonError;
use crate::subprocess::PtySubprocess;

pub type ClientId = u64;

/// Commands accepted by a running session actor (spec.md §4.D operations).
pub enum SessionCommand {
    Attach {
        client_id: ClientId,
        sender: mpsc::Sender<DaemonMessage>,
        respond: oneshot::Sender<EmulatorSnapshot>,
    },
    Detach {
        client_id: ClientId,
    },
    Write {
        data: Vec<u8>,
        respond: oneshot::Sender<Result<(), DaemonError>>,
    },
    Resize {
        cols: u16,
        rows: u16,
    },
    Signal {
        name: Option<String>,
    },
    Kill {
        signal: Option<String>,
    },
    ClearScrollback,
    Snapshot {
        respond: oneshot::Sender<EmulatorSnapshot>,
    },
    Info {
        respond: oneshot::Sender<SessionInfo>,
    },
    Status {
        respond: oneshot::Sender<SessionStatus>,
    },
    Dispose,
}

/// A handle a registry keeps instead of the session state itself — actual
/// state lives inside the actor task spawned by `spawn_session`.
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub cmd_tx: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub async fn attach(
        &self,
        client_id: ClientId,
        sender: mpsc::Sender<DaemonMessage>,
    ) -> Result<EmulatorSnapshot, DaemonError> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Attach { client_id, sender, respond })
            .map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))?;
        rx.await.map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))
    }

    pub fn detach(&self, client_id: ClientId) {
        let _ = self.cmd_tx.send(SessionCommand::Detach { client_id });
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<(), DaemonError> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Write { data, respond })
            .map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))?;
        rx.await.map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))?
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        let _ = self.cmd_tx.send(SessionCommand::Resize { cols, rows });
    }

    pub fn signal(&self, name: Option<String>) {
        let _ = self.cmd_tx.send(SessionCommand::Signal { name });
    }

    pub fn kill(&self, signal: Option<String>) {
        let _ = self.cmd_tx.send(SessionCommand::Kill { signal });
    }

    pub fn clear_scrollback(&self) {
        let _ = self.cmd_tx.send(SessionCommand::ClearScrollback);
    }

    pub async fn info(&self) -> Result<SessionInfo, DaemonError> {
        let (respond, rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Info { respond })
            .map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))?;
        rx.await.map_err(|_| DaemonError::SessionNotFound(self.session_id.to_string()))
    }

    pub fn dispose(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Dispose);
    }

    /// Whether a `createOrAttach` for this id should reattach here, or treat
    /// the session as absent and respawn (spec.md §4.E rule 2: a terminating
    /// or exited session is not attachable).
    pub async fn is_attachable(&self) -> bool {
        let (respond, rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Status { respond }).is_err() {
            return false;
        }
        matches!(rx.await, Ok(SessionStatus::Ready) | Ok(SessionStatus::Attachable))
    }
}

struct SessionActor {
    session_id: SessionId,
    pane_id: termhost_protocol::PaneId,
    workspace_id: termhost_protocol::WorkspaceId,
    subprocess: PtySubprocess,
    emulator: Emulator,
    status: SessionStatus,
    clients: HashMap<ClientId, mpsc::Sender<DaemonMessage>>,
    waiting_for_drain: HashSet<ClientId>,
    stdin_limit: usize,
    created_at: DateTime<Utc>,
    last_attached_at: Option<DateTime<Utc>>,
    pid: u32,
    cols: u16,
    rows: u16,
    exit: Option<(i32, u32)>,
    exit_notify: mpsc::UnboundedSender<SessionId>,
}

/// Per-client event queue depth (spec.md §4.D "Fan-out and backpressure") —
/// a message-count approximation of `client_notify_queue_bytes` since the
/// channel itself has no notion of payload size.
pub const CLIENT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// How often a paused session actor checks whether a lagging client has
/// drained enough to resume forwarding PTY output to it.
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Spawns a session actor task and returns a handle the registry can keep.
#[allow(clippy::too_many_arguments)]
pub fn spawn_session(
    session_id: SessionId,
    pane_id: termhost_protocol::PaneId,
    workspace_id: termhost_protocol::WorkspaceId,
    subprocess: PtySubprocess,
    frames_rx: mpsc::Receiver<Frame>,
    cols: u16,
    rows: u16,
    scrollback_lines: usize,
    config: &DaemonConfig,
    exit_notify: mpsc::UnboundedSender<SessionId>,
) -> SessionHandle {
    let pid = subprocess.pid();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let actor = SessionActor {
        session_id: session_id.clone(),
        pane_id,
        workspace_id,
        subprocess,
        emulator: Emulator::new(cols, rows, scrollback_lines),
        status: SessionStatus::Ready,
        clients: HashMap::new(),
        waiting_for_drain: HashSet::new(),
        stdin_limit: config.session_stdin_queue_bytes,
        created_at: Utc::now(),
        last_attached_at: None,
        pid,
        cols,
        rows,
        exit: None,
        exit_notify,
    };
    tokio::spawn(run_session_actor(actor, cmd_rx, frames_rx));
    SessionHandle { session_id, cmd_tx }
}

async fn run_session_actor(
    mut actor: SessionActor,
    mut cmd_rx: mpsc::UnboundedReceiver<SessionCommand>,
    mut frames_rx: mpsc::Receiver<Frame>,
) {
    actor.status = SessionStatus::Attachable;
    let mut drain_retry = tokio::time::interval(DRAIN_RETRY_INTERVAL);
    drain_retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        let budget = if actor.clients.is_empty() {
            Duration::from_millis(25)
        } else {
            Duration::from_millis(5)
        };
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => {
                        if matches!(cmd, SessionCommand::Dispose) {
                            actor.handle_command(cmd);
                            // Safety net: `dispose()` only asks the subprocess
                            // to exit cleanly; guarantee the OS process tree
                            // is gone (spec.md §4.D).
                            actor.subprocess.force_kill().await;
                            break;
                        }
                        actor.handle_command(cmd);
                    }
                    None => break,
                }
            }
            // Paused — a slow client hasn't drained — while `waiting_for_drain`
            // is non-empty, so a wedged client backs up PTY consumption rather
            // than growing an unbounded queue (spec.md §4.D).
            frame = frames_rx.recv(), if actor.waiting_for_drain.is_empty() => {
                match frame {
                    Some(frame) => actor.handle_frame(frame, budget),
                    None => {
                        if actor.exit.is_none() {
                            actor.finish_exit(-1, 0);
                        }
                    }
                }
            }
            _ = drain_retry.tick(), if !actor.waiting_for_drain.is_empty() => {
                actor.retry_drain();
            }
        }
    }
    info!(event = "daemon.session.actor_stopped", session_id = %actor.session_id);
}

impl SessionActor {
    fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Attach { client_id, sender, respond } => {
                self.clients.insert(client_id, sender);
                self.last_attached_at = Some(Utc::now());
                let _ = respond.send(self.emulator.snapshot());
            }
            SessionCommand::Detach { client_id } => {
                self.clients.remove(&client_id);
            }
            SessionCommand::Write { data, respond } => {
                let result = self.enqueue_stdin(&data);
                let _ = respond.send(result);
            }
            SessionCommand::Resize { cols, rows } => {
                self.cols = cols;
                self.rows = rows;
                self.emulator.resize(cols, rows);
                self.subprocess.resize(cols as u32, rows as u32);
            }
            SessionCommand::Signal { name } => {
                self.subprocess.signal(name.as_deref());
            }
            SessionCommand::Kill { signal } => {
                if self.status != SessionStatus::Exited {
                    self.status = SessionStatus::Terminating;
                    self.subprocess.kill(signal.as_deref());
                }
            }
            SessionCommand::ClearScrollback => {
                self.emulator.clear_scrollback();
            }
            SessionCommand::Snapshot { respond } => {
                let _ = respond.send(self.emulator.snapshot());
            }
            SessionCommand::Info { respond } => {
                let _ = respond.send(self.to_session_info());
            }
            SessionCommand::Status { respond } => {
                let _ = respond.send(self.status);
            }
            SessionCommand::Dispose => {
                self.emulator.dispose();
                self.subprocess.dispose();
            }
        }
    }

    /// Tracks real outstanding bytes via the subprocess's own pending-write
    /// counter, only decrementing once a chunk is actually flushed to the
    /// PTY — a flood of sub-limit writes can't bypass `stdin_limit` the way
    /// an optimistic increment-then-undo estimate could (spec.md §4.D, §8).
    fn enqueue_stdin(&mut self, data: &[u8]) -> Result<(), DaemonError> {
        let pending = self.subprocess.pending_stdin_bytes();
        if exceeds_stdin_limit(pending, data.len(), self.stdin_limit) {
            return Err(DaemonError::WriteQueueFull(self.session_id.to_string()));
        }
        self.subprocess.write(data);
        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame, budget: Duration) {
        match frame.frame_type {
            FrameType::Data => {
                let start = std::time::Instant::now();
                self.emulator.feed(&frame.payload);
                if start.elapsed() > budget {
                    warn!(
                        event = "daemon.session.emulator_pump_over_budget",
                        session_id = %self.session_id,
                    );
                }
                let data_base64 = base64::engine::general_purpose::STANDARD.encode(&frame.payload);
                self.broadcast(DaemonMessage::data_event(self.session_id.clone(), data_base64));

                // Nothing is watching, but the PTY still expects answers to
                // status queries (CPR/DA) a real terminal would have sent
                // (spec.md §4.C).
                let replies = self.emulator.drain_pending_replies();
                if !replies.is_empty() && self.clients.is_empty() {
                    self.subprocess.write(&replies);
                }
            }
            FrameType::Exit => {
                if let Ok((code, signal)) = termhost_protocol::decode_exit(&frame.payload) {
                    self.finish_exit(code, signal);
                }
            }
            FrameType::Error => {
                let message = String::from_utf8_lossy(&frame.payload).into_owned();
                self.broadcast(DaemonMessage::terminal_error_event(
                    self.session_id.clone(),
                    ErrorCode::SubprocessError,
                    &message,
                ));
            }
            _ => {}
        }
    }

    fn finish_exit(&mut self, code: i32, signal: u32) {
        if self.exit.is_some() {
            return;
        }
        self.exit = Some((code, signal));
        self.status = SessionStatus::Exited;
        let reason = if signal != 0 {
            format!("signal:{signal}")
        } else {
            "exited".to_string()
        };
        self.broadcast(DaemonMessage::exit_event(self.session_id.clone(), code, &reason));
        // Covers both explicit kill and the shell exiting on its own — either
        // way the registry needs to schedule retention + removal exactly once
        // (spec.md §4.E).
        let _ = self.exit_notify.send(self.session_id.clone());
    }

    /// Fans `msg` out to every attached client. A client whose channel is
    /// full is not dropped — it's marked `waiting_for_drain`, which pauses
    /// this session's own PTY-output consumption until it catches up, so one
    /// slow client can't grow daemon memory without bound (spec.md §4.D).
    fn broadcast(&mut self, msg: DaemonMessage) {
        let mut closed = Vec::new();
        for (&client_id, sender) in self.clients.iter() {
            match sender.try_send(msg.clone()) {
                Ok(()) => {
                    self.waiting_for_drain.remove(&client_id);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        event = "daemon.session.client_backpressure",
                        session_id = %self.session_id,
                        client_id,
                    );
                    self.waiting_for_drain.insert(client_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(client_id);
                }
            }
        }
        for client_id in closed {
            self.clients.remove(&client_id);
            self.waiting_for_drain.remove(&client_id);
        }
    }

    /// Re-checks lagging clients and clears anyone who has since drained.
    fn retry_drain(&mut self) {
        let clients = &self.clients;
        self.waiting_for_drain.retain(|client_id| match clients.get(client_id) {
            Some(sender) => sender.capacity() == 0,
            None => false,
        });
    }

    fn to_session_info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            pane_id: self.pane_id.clone(),
            workspace_id: self.workspace_id.clone(),
            cols: self.cols,
            rows: self.rows,
            is_alive: self.exit.is_none(),
            created_at: self.created_at.to_rfc3339(),
            last_attached_at: self.last_attached_at.map(|t| t.to_rfc3339()),
            pid: Some(self.pid),
        }
    }
}

/// Whether adding `incoming` bytes to `pending` outstanding bytes would
/// exceed `limit` — the predicate `enqueue_stdin` enforces against the
/// subprocess's real pending-write counter.
fn exceeds_stdin_limit(pending: usize, incoming: usize, limit: usize) -> bool {
    pending.saturating_add(incoming) > limit
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_stdin_limit_rejects_single_write_over_limit() {
        assert!(exceeds_stdin_limit(0, 1024 + 1, 1024));
    }

    #[test]
    fn exceeds_stdin_limit_allows_single_write_under_limit() {
        assert!(!exceeds_stdin_limit(0, 500, 1024));
    }

    #[test]
    fn exceeds_stdin_limit_flags_a_flood_of_small_writes() {
        // No single write exceeds the limit, but the bound must still catch
        // a flood of sub-limit writes once their sum does.
        let limit = 1024usize;
        let chunk = 100usize;
        let mut pending = 0usize;
        let mut rejected = false;
        for _ in 0..20 {
            if exceeds_stdin_limit(pending, chunk, limit) {
                rejected = true;
                break;
            }
            pending += chunk;
        }
        assert!(rejected, "a flood of sub-limit writes must eventually hit the bound");
    }
}
