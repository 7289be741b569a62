use serde::{Deserialize, Serialize};

use crate::types::{CreateOrAttachRequest, EmulatorSnapshot, SessionId, SessionInfo};

/// Stable error codes returned in `{ok:false, error:{code,message}}` responses
/// and mapped from internal daemon errors (spec.md §7).
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthFailed,
    ProtocolMismatch,
    NotAuthenticated,
    UnknownRequest,
    SessionNotFound,
    InvalidGeometry,
    WriteQueueFull,
    SubprocessError,
    ConnectionLost,
    RequestTimeout,
    DaemonSpawnFailed,
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    pub fn from_code(code: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(code.to_string()))
            .unwrap_or(ErrorCode::Unknown)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ProtocolMismatch => "PROTOCOL_MISMATCH",
            ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
            ErrorCode::UnknownRequest => "UNKNOWN_REQUEST",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::InvalidGeometry => "INVALID_GEOMETRY",
            ErrorCode::WriteQueueFull => "WRITE_QUEUE_FULL",
            ErrorCode::SubprocessError => "SUBPROCESS_ERROR",
            ErrorCode::ConnectionLost => "CONNECTION_LOST",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::DaemonSpawnFailed => "DAEMON_SPAWN_FAILED",
            ErrorCode::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

pub const PROTOCOL_VERSION: u32 = 1;

/// Client -> daemon requests (spec.md §4.F dispatch table). Each line on the
/// wire is one of these tagged by `"type"`. `Write` doubles as a notification:
/// when `id` is `None` the daemon processes it but sends no response, which is
/// how the client library's `writeNoAck` (spec.md §4.H) is expressed on the wire.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "hello")]
    Hello {
        id: String,
        token: String,
        protocol_version: u32,
    },

    #[serde(rename = "list_sessions")]
    ListSessions { id: String },

    #[serde(rename = "create_or_attach")]
    CreateOrAttach {
        id: String,
        #[serde(flatten)]
        request: CreateOrAttachRequest,
    },

    #[serde(rename = "write")]
    Write {
        #[serde(default)]
        id: Option<String>,
        session_id: SessionId,
        /// Base64-encoded bytes to write to the PTY.
        data: String,
    },

    #[serde(rename = "resize")]
    Resize {
        id: String,
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },

    #[serde(rename = "signal")]
    Signal {
        id: String,
        session_id: SessionId,
        #[serde(default)]
        signal: Option<String>,
    },

    #[serde(rename = "detach")]
    Detach { id: String, session_id: SessionId },

    #[serde(rename = "kill")]
    Kill {
        id: String,
        session_id: SessionId,
        #[serde(default)]
        delete_history: bool,
    },

    #[serde(rename = "kill_all")]
    KillAll { id: String },

    #[serde(rename = "clear_scrollback")]
    ClearScrollback { id: String, session_id: SessionId },

    #[serde(rename = "shutdown")]
    Shutdown { id: String },
}

impl ClientMessage {
    /// Extract the request id, if any (`Write` notifications carry none).
    pub fn id(&self) -> Option<&str> {
        match self {
            ClientMessage::Hello { id, .. }
            | ClientMessage::ListSessions { id }
            | ClientMessage::CreateOrAttach { id, .. }
            | ClientMessage::Resize { id, .. }
            | ClientMessage::Signal { id, .. }
            | ClientMessage::Detach { id, .. }
            | ClientMessage::Kill { id, .. }
            | ClientMessage::KillAll { id }
            | ClientMessage::ClearScrollback { id, .. }
            | ClientMessage::Shutdown { id } => Some(id),
            ClientMessage::Write { id, .. } => id.as_deref(),
        }
    }

    /// True for requests that are valid before a successful `hello`.
    pub fn is_pre_auth(&self) -> bool {
        matches!(self, ClientMessage::Hello { .. })
    }
}

/// Daemon -> client responses and events (spec.md §3, §4.F).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DaemonMessage {
    #[serde(rename = "hello_ok")]
    HelloOk {
        id: String,
        protocol_version: u32,
        daemon_version: String,
        daemon_pid: u32,
    },

    #[serde(rename = "session_list")]
    SessionList { id: String, sessions: Vec<SessionInfo> },

    #[serde(rename = "create_or_attach_ok")]
    CreateOrAttachOk {
        id: String,
        is_new: bool,
        was_recovered: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        snapshot: EmulatorSnapshot,
    },

    #[serde(rename = "ack")]
    Ack { id: String },

    /// Streaming session event. No `id` — pushed to every attached client.
    #[serde(rename = "event")]
    Event {
        event: String,
        session_id: SessionId,
        payload: serde_json::Value,
    },

    #[serde(rename = "error")]
    Error {
        id: String,
        code: ErrorCode,
        message: String,
    },
}

impl DaemonMessage {
    pub fn data_event(session_id: SessionId, data_base64: String) -> Self {
        DaemonMessage::Event {
            event: "data".to_string(),
            session_id,
            payload: serde_json::json!({ "type": "data", "data": data_base64 }),
        }
    }

    pub fn exit_event(session_id: SessionId, exit_code: i32, reason: &str) -> Self {
        DaemonMessage::Event {
            event: "exit".to_string(),
            session_id,
            payload: serde_json::json!({ "exitCode": exit_code, "reason": reason }),
        }
    }

    pub fn terminal_error_event(session_id: SessionId, code: ErrorCode, message: &str) -> Self {
        DaemonMessage::Event {
            event: "terminalError".to_string(),
            session_id,
            payload: serde_json::json!({ "code": code.to_string(), "message": message }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaneId, WorkspaceId};
    use std::collections::HashMap;

    #[test]
    fn hello_request_roundtrip() {
        let msg = ClientMessage::Hello {
            id: "1".to_string(),
            token: "a".repeat(64),
            protocol_version: PROTOCOL_VERSION,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"hello""#));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id(), Some("1"));
        assert!(parsed.is_pre_auth());
    }

    #[test]
    fn write_without_id_is_a_notification() {
        let json = r#"{"type":"write","session_id":"s1","data":"aGk="}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id(), None);
        assert!(!parsed.is_pre_auth());
    }

    #[test]
    fn write_with_id_carries_it_through() {
        let json = r#"{"type":"write","id":"9","session_id":"s1","data":"aGk="}"#;
        let parsed: ClientMessage = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.id(), Some("9"));
    }

    #[test]
    fn create_or_attach_flattens_request_fields() {
        let msg = ClientMessage::CreateOrAttach {
            id: "2".to_string(),
            request: CreateOrAttachRequest {
                session_id: SessionId::new("s1"),
                pane_id: PaneId::new("p1"),
                tab_id: None,
                workspace_id: WorkspaceId::new("w1"),
                cols: 80,
                rows: 24,
                cwd: "/tmp".to_string(),
                shell: "/bin/sh".to_string(),
                args: vec![],
                env: HashMap::new(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""session_id":"s1""#));
        assert!(json.contains(r#""pane_id":"p1""#));
        let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id(), Some("2"));
    }

    #[test]
    fn error_code_unknown_deserialization() {
        let json = r#"{"type":"error","id":"1","code":"SOME_FUTURE_ERROR","message":"x"}"#;
        let parsed: DaemonMessage = serde_json::from_str(json).unwrap();
        if let DaemonMessage::Error { code, .. } = parsed {
            assert_eq!(code, ErrorCode::Unknown);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn error_code_display_matches_wire_format() {
        assert_eq!(ErrorCode::WriteQueueFull.to_string(), "WRITE_QUEUE_FULL");
        assert_eq!(
            serde_json::to_string(&ErrorCode::AuthFailed).unwrap(),
            r#""AUTH_FAILED""#
        );
    }

    #[test]
    fn event_helpers_build_expected_shapes() {
        let data = DaemonMessage::data_event(SessionId::new("s1"), "aGk=".to_string());
        let json = serde_json::to_string(&data).unwrap();
        assert!(json.contains(r#""event":"data""#));
        assert!(json.contains(r#""data":"aGk=""#));

        let exit = DaemonMessage::exit_event(SessionId::new("s1"), 0, "killed");
        let json = serde_json::to_string(&exit).unwrap();
        assert!(json.contains(r#""reason":"killed""#));
    }

    #[test]
    fn all_request_variants_roundtrip() {
        let messages: Vec<ClientMessage> = vec![
            ClientMessage::ListSessions { id: "1".into() },
            ClientMessage::Resize {
                id: "2".into(),
                session_id: SessionId::new("s"),
                cols: 80,
                rows: 24,
            },
            ClientMessage::Signal {
                id: "3".into(),
                session_id: SessionId::new("s"),
                signal: Some("SIGINT".into()),
            },
            ClientMessage::Detach {
                id: "4".into(),
                session_id: SessionId::new("s"),
            },
            ClientMessage::Kill {
                id: "5".into(),
                session_id: SessionId::new("s"),
                delete_history: true,
            },
            ClientMessage::KillAll { id: "6".into() },
            ClientMessage::ClearScrollback {
                id: "7".into(),
                session_id: SessionId::new("s"),
            },
            ClientMessage::Shutdown { id: "8".into() },
        ];
        for msg in messages {
            let json = serde_json::to_string(&msg).unwrap();
            let parsed: ClientMessage = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed.id(), msg.id());
        }
    }
}
