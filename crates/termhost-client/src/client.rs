//! Component H: the host-embeddable daemon client. Wraps
//! `termhost_protocol::IpcConnection` with typed request methods and
//! autostart, so embedding hosts never touch the wire format directly.

use std::path::Path;
use std::time::Duration;

use termhost_protocol::{
    ClientMessage, CreateOrAttachRequest, DaemonMessage, EmulatorSnapshot, IpcConnection,
    SessionId, SessionInfo,
};
use termhost_paths::HostPaths;

use crate::autostart::ensure_daemon_running;
use crate::errors::ClientError;

pub struct DaemonClient {
    conn: IpcConnection,
    next_id: u64,
}

impl DaemonClient {
    /// Connects to the daemon, autospawning it first if its socket is
    /// missing (spec.md §4.H).
    pub fn connect(paths: &HostPaths, daemon_binary: &Path) -> Result<Self, ClientError> {
        ensure_daemon_running(paths, daemon_binary, Duration::from_secs(5))?;
        let token = paths.read_token_file().ok_or(ClientError::SpawnTimeout)?;
        let conn = IpcConnection::connect_and_hello(&paths.socket_path(), &token)?;
        Ok(Self { conn, next_id: 1 })
    }

    fn next_id(&mut self) -> String {
        let id = self.next_id;
        self.next_id += 1;
        id.to_string()
    }

    pub fn list_sessions(&mut self) -> Result<Vec<SessionInfo>, ClientError> {
        let id = self.next_id();
        let response = self.conn.send(&ClientMessage::ListSessions { id })?;
        match response {
            DaemonMessage::SessionList { sessions, .. } => Ok(sessions),
            other => Err(protocol_mismatch(other)),
        }
    }

    pub fn create_or_attach(
        &mut self,
        request: CreateOrAttachRequest,
    ) -> Result<(bool, Option<u32>, EmulatorSnapshot), ClientError> {
        let id = self.next_id();
        let response = self.conn.send(&ClientMessage::CreateOrAttach { id, request })?;
        match response {
            DaemonMessage::CreateOrAttachOk { is_new, pid, snapshot, .. } => {
                Ok((is_new, pid, snapshot))
            }
            other => Err(protocol_mismatch(other)),
        }
    }

    /// Fire-and-forget stdin write — matches `ClientMessage::Write` with no
    /// `id`, which the daemon processes without sending a response.
    pub fn write_no_ack(&mut self, session_id: SessionId, data_base64: String) -> Result<(), ClientError> {
        self.conn.send_notification(&ClientMessage::Write {
            id: None,
            session_id,
            data: data_base64,
        })?;
        Ok(())
    }

    pub fn resize(&mut self, session_id: SessionId, cols: u16, rows: u16) -> Result<(), ClientError> {
        let id = self.next_id();
        self.conn.send(&ClientMessage::Resize { id, session_id, cols, rows })?;
        Ok(())
    }

    pub fn kill(&mut self, session_id: SessionId, delete_history: bool) -> Result<(), ClientError> {
        let id = self.next_id();
        self.conn.send(&ClientMessage::Kill { id, session_id, delete_history })?;
        Ok(())
    }

    pub fn clear_scrollback(&mut self, session_id: SessionId) -> Result<(), ClientError> {
        let id = self.next_id();
        self.conn.send(&ClientMessage::ClearScrollback { id, session_id })?;
        Ok(())
    }

    /// Blocks for the next pushed event (`data`/`exit`/`terminalError`).
    pub fn read_event(&mut self) -> Result<DaemonMessage, ClientError> {
        Ok(self.conn.read_message()?)
    }
}

fn protocol_mismatch(response: DaemonMessage) -> ClientError {
    ClientError::UnexpectedResponse(format!("{response:?}"))
}
