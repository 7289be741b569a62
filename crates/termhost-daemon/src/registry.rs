//! Component E: the daemon-wide `sessionId -> Session` map (spec.md §4.E).
//! `createOrAttach` is deduplicated per session id so that two concurrent
//! requests for the same id never spawn two subprocesses — the second caller
//! blocks on the first's in-flight creation and then attaches normally.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use termhost_protocol::{
    CreateOrAttachRequest, EmulatorSnapshot, SessionId, SessionInfo, WorkspaceId,
};

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::session::{spawn_session, ClientId, SessionHandle};
use crate::subprocess::PtySubprocess;

type Slot = Arc<Mutex<Option<SessionHandle>>>;

pub struct SessionRegistry {
    slots: Mutex<HashMap<SessionId, Slot>>,
    config: DaemonConfig,
    ptyhost_binary: PathBuf,
    exit_tx: mpsc::UnboundedSender<SessionId>,
    exit_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionId>>>,
}

pub struct CreateOrAttachOutcome {
    pub is_new: bool,
    pub was_recovered: bool,
    pub pid: Option<u32>,
    pub snapshot: EmulatorSnapshot,
}

impl SessionRegistry {
    pub fn new(config: DaemonConfig, ptyhost_binary: PathBuf) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
            ptyhost_binary,
            exit_tx,
            exit_rx: std::sync::Mutex::new(Some(exit_rx)),
        }
    }

    /// Starts the background task that reaps sessions whose PTY exited on
    /// its own rather than via an explicit `kill()` (spec.md §4.E) — the
    /// actor's `finish_exit` notifies this channel exactly once per session.
    pub fn start(self: &Arc<Self>) {
        let exit_rx = self.exit_rx.lock().unwrap().take();
        let Some(mut exit_rx) = exit_rx else { return };
        let registry = self.clone();
        tokio::spawn(async move {
            while let Some(session_id) = exit_rx.recv().await {
                if let Some(handle) = registry.get(&session_id).await {
                    registry.schedule_reap(session_id, handle);
                }
            }
        });
    }

    async fn slot_for(&self, session_id: &SessionId) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Creates a new session or attaches to an existing one with the same
    /// session id (spec.md §4.D/§4.E `createOrAttach`).
    pub async fn create_or_attach(
        &self,
        request: CreateOrAttachRequest,
        client_id: ClientId,
        notify: mpsc::Sender<termhost_protocol::DaemonMessage>,
    ) -> Result<(SessionHandle, CreateOrAttachOutcome), DaemonError> {
        if request.cols == 0 || request.rows == 0 {
            return Err(DaemonError::InvalidGeometry {
                cols: request.cols as i64,
                rows: request.rows as i64,
            });
        }

        let slot = self.slot_for(&request.session_id).await;
        let mut guard = slot.lock().await;

        if let Some(handle) = guard.as_ref() {
            if handle.is_attachable().await {
                let snapshot = handle.attach(client_id, notify).await?;
                return Ok((
                    handle.clone(),
                    CreateOrAttachOutcome { is_new: false, was_recovered: true, pid: None, snapshot },
                ));
            }
            // Terminating or exited: treat as absent and respawn in its place
            // (spec.md §4.E rule 2) rather than wrongly "recovering" it.
            *guard = None;
        }

        let (frames_tx, frames_rx) = mpsc::channel(crate::subprocess::FRAMES_CHANNEL_CAPACITY);
        let subprocess = PtySubprocess::spawn(
            &self.ptyhost_binary,
            &request.shell,
            &request.args,
            &request.cwd,
            request.cols,
            request.rows,
            request.env.clone(),
            self.config.max_frame_len,
            frames_tx,
        )
        .await?;
        let pid = subprocess.pid();

        let handle = spawn_session(
            request.session_id.clone(),
            request.pane_id.clone(),
            request.workspace_id.clone(),
            subprocess,
            frames_rx,
            request.cols,
            request.rows,
            self.config.scrollback_lines,
            &self.config,
            self.exit_tx.clone(),
        );
        let snapshot = handle.attach(client_id, notify).await?;
        *guard = Some(handle.clone());
        info!(event = "daemon.registry.session_created", session_id = %request.session_id, pid);

        Ok((
            handle,
            CreateOrAttachOutcome { is_new: true, was_recovered: false, pid: Some(pid), snapshot },
        ))
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        let slots = self.slots.lock().await;
        let slot = slots.get(session_id)?.clone();
        drop(slots);
        slot.lock().await.clone()
    }

    pub async fn list_sessions(&self) -> Vec<SessionInfo> {
        let ids: Vec<SessionId> = self.slots.lock().await.keys().cloned().collect();
        let mut infos = Vec::new();
        for id in ids {
            if let Some(handle) = self.get(&id).await {
                if let Ok(info) = handle.info().await {
                    infos.push(info);
                }
            }
        }
        infos
    }

    /// Idempotent kill: a session already gone is not an error (spec.md §4.E).
    /// Reap scheduling happens uniformly from `finish_exit`'s natural-exit
    /// notification, whether the exit was triggered by this kill or by the
    /// shell exiting on its own.
    pub async fn kill(self: &Arc<Self>, session_id: &SessionId, signal: Option<String>) {
        let Some(handle) = self.get(session_id).await else {
            return;
        };
        handle.kill(signal);
    }

    pub async fn kill_all(self: &Arc<Self>) {
        let ids: Vec<SessionId> = self.slots.lock().await.keys().cloned().collect();
        for id in ids {
            self.kill(&id, None).await;
        }
    }

    pub async fn kill_by_workspace(self: &Arc<Self>, workspace_id: &WorkspaceId) {
        let ids: Vec<SessionId> = self.slots.lock().await.keys().cloned().collect();
        for id in ids {
            if let Some(handle) = self.get(&id).await {
                if let Ok(info) = handle.info().await {
                    if &info.workspace_id == workspace_id {
                        self.kill(&id, None).await;
                    }
                }
            }
        }
    }

    pub async fn detach_client(&self, session_id: &SessionId, client_id: ClientId) {
        if let Some(handle) = self.get(session_id).await {
            handle.detach(client_id);
        }
    }

    pub async fn dispose_all(&self) {
        let ids: Vec<SessionId> = self.slots.lock().await.keys().cloned().collect();
        for id in ids {
            if let Some(handle) = self.get(&id).await {
                handle.dispose();
            }
        }
    }

    /// Removes the session from the map `session_retention_secs` after exit,
    /// giving stragglers a window to attach and see the final event
    /// (spec.md §4.E "5s post-exit retention").
    fn schedule_reap(self: &Arc<Self>, session_id: SessionId, handle: SessionHandle) {
        let retention = Duration::from_secs(self.config.session_retention_secs);
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(200)).await;
                match handle.info().await {
                    Ok(info) if !info.is_alive => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
            tokio::time::sleep(retention).await;
            registry.slots.lock().await.remove(&session_id);
            handle.dispose();
            tracing::debug!(event = "daemon.registry.session_reaped", session_id = %session_id);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_or_attach_rejects_zero_geometry() {
        let registry = SessionRegistry::new(DaemonConfig::default(), PathBuf::from("/bin/true"));
        let request = CreateOrAttachRequest {
            session_id: SessionId::new("s1"),
            pane_id: termhost_protocol::PaneId::new("p1"),
            tab_id: None,
            workspace_id: WorkspaceId::new("w1"),
            cols: 0,
            rows: 24,
            cwd: "/".into(),
            shell: "/bin/sh".into(),
            args: vec![],
            env: Default::default(),
        };
        let (tx, _rx) = mpsc::channel(8);
        let result = registry.create_or_attach(request, 1, tx).await;
        assert!(matches!(result, Err(DaemonError::InvalidGeometry { .. })));
    }

    #[tokio::test]
    async fn unknown_session_get_returns_none() {
        let registry = SessionRegistry::new(DaemonConfig::default(), PathBuf::from("/bin/true"));
        assert!(registry.get(&SessionId::new("missing")).await.is_none());
    }
}
