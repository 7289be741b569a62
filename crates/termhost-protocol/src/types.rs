use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Generate a newtype wrapper around `String` with standard trait impls.
///
/// Each generated type gets: `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`,
/// `Serialize`/`Deserialize` (transparent), `Display`, `Deref<Target=str>`,
/// `AsRef<str>`, `Borrow<str>`, `From<String>`, `From<&str>`.
macro_rules! newtype_string {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::ops::Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

newtype_string! {
    /// Identifies one daemon-owned terminal session.
    SessionId
}

newtype_string! {
    /// Host-side pane identifier; opaque to the daemon, used for addressability
    /// and as the tombstone key (spec.md §3, §4.I).
    PaneId
}

newtype_string! {
    /// Host-side tab identifier; opaque to the daemon.
    TabId
}

newtype_string! {
    /// Host-side workspace identifier; opaque to the daemon, used by
    /// `killByWorkspace` and startup reconciliation (spec.md §4.E, §4.I).
    WorkspaceId
}

/// Session lifecycle state (spec.md §4.D: `spawning -> ready -> attachable ->
/// terminating -> exited -> disposed`). `disposed` is represented by removal
/// from the registry rather than as a wire variant, since a disposed session
/// can no longer be reported.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Spawning,
    Ready,
    Attachable,
    Terminating,
    Exited,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Spawning => write!(f, "spawning"),
            SessionStatus::Ready => write!(f, "ready"),
            SessionStatus::Attachable => write!(f, "attachable"),
            SessionStatus::Terminating => write!(f, "terminating"),
            SessionStatus::Exited => write!(f, "exited"),
        }
    }
}

/// Summary of a daemon session as returned via `listSessions` (spec.md §4.E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
    pub pane_id: PaneId,
    pub workspace_id: WorkspaceId,
    pub cols: u16,
    pub rows: u16,
    pub is_alive: bool,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attached_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Request payload for `createOrAttach` (spec.md §4.F dispatch table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrAttachRequest {
    pub session_id: SessionId,
    pub pane_id: PaneId,
    #[serde(default)]
    pub tab_id: Option<TabId>,
    pub workspace_id: WorkspaceId,
    pub cols: u16,
    pub rows: u16,
    pub cwd: String,
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// DEC private modes tracked by the headless emulator (spec.md §4.C table).
pub const TRACKED_DEC_MODES: &[u16] = &[
    1, 6, 7, 9, 25, 47, 1000, 1001, 1002, 1003, 1004, 1005, 1006, 1049, 2004,
];

/// Modes that default to "on"; every other tracked mode defaults to "off".
pub const DEFAULT_ON_MODES: &[u16] = &[7, 25];

/// Result of `Session::attach` / `SessionRegistry::createOrAttach` (spec.md §4.C, §4.D).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorSnapshot {
    pub snapshot_ansi: String,
    pub rehydrate_sequences: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub scrollback_lines: usize,
    pub modes: HashMap<u16, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_info_serde() {
        let info = SessionInfo {
            session_id: SessionId::new("s1"),
            pane_id: PaneId::new("p1"),
            workspace_id: WorkspaceId::new("w1"),
            cols: 80,
            rows: 24,
            is_alive: true,
            created_at: "2026-02-09T14:30:00Z".to_string(),
            last_attached_at: Some("2026-02-09T14:31:00Z".to_string()),
            pid: Some(12345),
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(json.contains(r#""pid":12345"#));
        let parsed: SessionInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.session_id, info.session_id);
        assert_eq!(parsed.pid, Some(12345));
    }

    #[test]
    fn test_session_info_optional_fields_omitted() {
        let info = SessionInfo {
            session_id: SessionId::new("s1"),
            pane_id: PaneId::new("p1"),
            workspace_id: WorkspaceId::new("w1"),
            cols: 80,
            rows: 24,
            is_alive: false,
            created_at: "2026-02-09T14:30:00Z".to_string(),
            last_attached_at: None,
            pid: None,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("last_attached_at"));
        assert!(!json.contains("\"pid\""));
    }

    #[test]
    fn test_session_status_display_and_wire_format() {
        assert_eq!(SessionStatus::Attachable.to_string(), "attachable");
        assert_eq!(
            serde_json::to_string(&SessionStatus::Terminating).unwrap(),
            r#""terminating""#
        );
    }

    #[test]
    fn test_session_status_roundtrip() {
        for status in [
            SessionStatus::Spawning,
            SessionStatus::Ready,
            SessionStatus::Attachable,
            SessionStatus::Terminating,
            SessionStatus::Exited,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            let parsed: SessionStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
        }
    }

    macro_rules! test_newtype {
        ($name:ident, $ty:ty) => {
            mod $name {
                use super::super::*;
                use std::collections::{HashMap, HashSet};

                #[test]
                fn serde_transparent_roundtrip() {
                    let val = <$ty>::new("test-value");
                    let json = serde_json::to_string(&val).unwrap();
                    assert_eq!(json, r#""test-value""#);
                    let parsed: $ty = serde_json::from_str(&json).unwrap();
                    assert_eq!(parsed, val);
                }

                #[test]
                fn display() {
                    let val = <$ty>::new("hello");
                    assert_eq!(val.to_string(), "hello");
                }

                #[test]
                fn deref_to_str() {
                    let val = <$ty>::new("abc");
                    let s: &str = &val;
                    assert_eq!(s, "abc");
                    assert_eq!(val.len(), 3);
                }

                #[test]
                fn from_string_and_str_ref() {
                    let a: $ty = String::from("owned").into();
                    assert_eq!(&*a, "owned");
                    let b: $ty = "borrowed".into();
                    assert_eq!(&*b, "borrowed");
                }

                #[test]
                fn hash_set_and_hashmap_borrow_lookup() {
                    let mut set = HashSet::new();
                    set.insert(<$ty>::new("a"));
                    set.insert(<$ty>::new("a"));
                    assert_eq!(set.len(), 1);

                    let mut map = HashMap::new();
                    map.insert(<$ty>::new("key"), 42);
                    assert_eq!(map.get("key"), Some(&42));
                }

                #[test]
                fn into_inner_and_as_ref() {
                    let val = <$ty>::new("inner");
                    assert_eq!(val.as_ref() as &str, "inner");
                    assert_eq!(val.into_inner(), "inner");
                }
            }
        };
    }

    test_newtype!(session_id, SessionId);
    test_newtype!(pane_id, PaneId);
    test_newtype!(workspace_id, WorkspaceId);
}
