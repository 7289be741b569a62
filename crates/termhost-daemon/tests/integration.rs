//! End-to-end tests for the daemon's client-server roundtrip (spec.md §8).
//!
//! These start a real server bound to a temp-directory socket, connect with
//! the shared `termhost_protocol::IpcConnection`, and exercise the full NDJSON
//! IPC protocol including PTY subprocess spawn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use termhost_daemon::DaemonConfig;
use termhost_paths::HostPaths;
use termhost_protocol::{
    ClientMessage, CreateOrAttachRequest, DaemonMessage, IpcConnection, PaneId, SessionId,
    WorkspaceId, PROTOCOL_VERSION,
};

fn ptyhost_binary() -> PathBuf {
    PathBuf::from(std::env::var("CARGO_BIN_EXE_termhost-ptyhost").expect(
        "CARGO_BIN_EXE_termhost-ptyhost not set (termhost-ptyhost must be a dev-dependency)",
    ))
}

fn test_paths(dir: &std::path::Path) -> HostPaths {
    HostPaths::from_dir(dir.to_path_buf())
}

async fn start_server(paths: HostPaths) -> tokio::task::JoinHandle<Result<(), termhost_daemon::DaemonError>> {
    unsafe {
        std::env::set_var("TERMHOST_PTYHOST_BIN", ptyhost_binary());
    }
    let config = DaemonConfig::default();
    let handle = tokio::spawn(termhost_daemon::run_server(paths, config));
    tokio::time::sleep(Duration::from_millis(150)).await;
    handle
}

async fn connect(paths: &HostPaths) -> IpcConnection {
    let socket_path = paths.socket_path();
    let token = paths.read_token_file().expect("token file written by run_server");
    tokio::task::spawn_blocking(move || IpcConnection::connect_and_hello(&socket_path, &token))
        .await
        .unwrap()
        .unwrap()
}

fn create_or_attach_request(session_id: &str) -> ClientMessage {
    ClientMessage::CreateOrAttach {
        id: "1".to_string(),
        request: CreateOrAttachRequest {
            session_id: SessionId::new(session_id),
            pane_id: PaneId::new(format!("pane-{session_id}")),
            tab_id: None,
            workspace_id: WorkspaceId::new("w1"),
            cols: 80,
            rows: 24,
            cwd: "/tmp".to_string(),
            shell: "/bin/sh".to_string(),
            args: vec![],
            env: HashMap::new(),
        },
    }
}

#[tokio::test]
async fn hello_handshake_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let conn = connect(&paths).await;
    drop(conn);

    let shutdown_paths = paths.clone();
    let mut conn = tokio::task::spawn_blocking(move || {
        let token = shutdown_paths.read_token_file().unwrap();
        IpcConnection::connect_and_hello(&shutdown_paths.socket_path(), &token).unwrap()
    })
    .await
    .unwrap();
    tokio::task::spawn_blocking(move || {
        conn.send(&ClientMessage::Shutdown { id: "s".to_string() }).unwrap()
    })
    .await
    .unwrap();

    let result = tokio::time::timeout(Duration::from_secs(3), server).await;
    assert!(result.is_ok(), "server should shut down after the shutdown request");
}

#[tokio::test]
async fn hello_with_wrong_token_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let socket_path = paths.socket_path();
    let result = tokio::task::spawn_blocking(move || {
        IpcConnection::connect_and_hello(&socket_path, "0".repeat(64).as_str())
    })
    .await
    .unwrap();
    assert!(result.is_err());

    shutdown_server(&paths).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), server).await;
}

#[tokio::test]
async fn create_write_attach_and_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let mut conn = connect(&paths).await;
    let request = create_or_attach_request("s1");
    let response = tokio::task::spawn_blocking(move || conn.send(&request).map(|r| (r, conn)))
        .await
        .unwrap();
    let (response, mut conn) = response.unwrap();
    let (is_new, pid) = match response {
        DaemonMessage::CreateOrAttachOk { is_new, pid, .. } => (is_new, pid),
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(is_new);
    assert!(pid.is_some());

    let write = ClientMessage::Write {
        id: None,
        session_id: SessionId::new("s1"),
        data: base64_encode(b"echo hello\n"),
    };
    conn = tokio::task::spawn_blocking(move || {
        conn.send_notification(&write).unwrap();
        conn
    })
    .await
    .unwrap();

    let got_data = tokio::time::timeout(Duration::from_secs(2), async move {
        loop {
            let (msg, next_conn) = tokio::task::spawn_blocking(move || {
                let msg = conn.read_message();
                (msg, conn)
            })
            .await
            .unwrap();
            conn = next_conn;
            match msg {
                Ok(DaemonMessage::Event { event, .. }) if event == "data" => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(got_data, "expected at least one data event from the echoed command");

    shutdown_server(&paths).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), server).await;
}

#[tokio::test]
async fn clear_scrollback_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let mut conn = connect(&paths).await;
    let request = create_or_attach_request("s2");
    conn = tokio::task::spawn_blocking(move || {
        conn.send(&request).unwrap();
        conn
    })
    .await
    .unwrap();

    let clear = ClientMessage::ClearScrollback { id: "2".to_string(), session_id: SessionId::new("s2") };
    let response = tokio::task::spawn_blocking(move || conn.send(&clear))
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(response, DaemonMessage::Ack { .. }));

    shutdown_server(&paths).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), server).await;
}

#[tokio::test]
async fn kill_then_list_sessions_reflects_exit() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let mut conn = connect(&paths).await;
    let request = create_or_attach_request("s3");
    conn = tokio::task::spawn_blocking(move || {
        conn.send(&request).unwrap();
        conn
    })
    .await
    .unwrap();

    let kill = ClientMessage::Kill {
        id: "3".to_string(),
        session_id: SessionId::new("s3"),
        delete_history: false,
    };
    conn = tokio::task::spawn_blocking(move || {
        conn.send(&kill).unwrap();
        conn
    })
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let list = ClientMessage::ListSessions { id: "4".to_string() };
    let response = tokio::task::spawn_blocking(move || conn.send(&list))
        .await
        .unwrap()
        .unwrap();
    match response {
        DaemonMessage::SessionList { sessions, .. } => {
            let found = sessions.iter().find(|s| s.session_id == SessionId::new("s3"));
            if let Some(info) = found {
                assert!(!info.is_alive, "killed session should report as not alive");
            }
        }
        other => panic!("unexpected response: {other:?}"),
    }

    shutdown_server(&paths).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), server).await;
}

#[tokio::test]
async fn unknown_session_operations_return_session_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let paths = test_paths(dir.path());
    let server = start_server(paths.clone()).await;

    let mut conn = connect(&paths).await;
    let resize = ClientMessage::Resize {
        id: "1".to_string(),
        session_id: SessionId::new("nonexistent"),
        cols: 80,
        rows: 24,
    };
    let result = tokio::task::spawn_blocking(move || conn.send(&resize))
        .await
        .unwrap();
    assert!(result.is_err());

    shutdown_server(&paths).await;
    let _ = tokio::time::timeout(Duration::from_secs(3), server).await;
}

async fn shutdown_server(paths: &HostPaths) {
    let paths = paths.clone();
    let _ = tokio::task::spawn_blocking(move || {
        let token = paths.read_token_file().unwrap();
        let mut conn = IpcConnection::connect_and_hello(&paths.socket_path(), &token)?;
        conn.send(&ClientMessage::Shutdown { id: "shutdown".to_string() })
    })
    .await
    .unwrap();
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

// Sanity check that the protocol version constant used in this test file
// matches the crate's, so a future bump doesn't silently drift.
#[test]
fn protocol_version_is_one() {
    assert_eq!(PROTOCOL_VERSION, 1);
}
