pub mod shutdown;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use termhost_paths::HostPaths;

use crate::config::DaemonConfig;
use crate::errors::DaemonError;
use crate::registry::SessionRegistry;
use crate::subprocess::default_ptyhost_binary;
use crate::transport::handle_connection;

/// Single-instance check: a pid file pointing at a still-alive process means
/// another daemon already owns this state directory (spec.md §4.G).
fn daemon_already_running(paths: &HostPaths) -> bool {
    match paths.read_pid_file() {
        Some(pid) => is_process_alive(pid),
        None => false,
    }
}

#[cfg(unix)]
fn is_process_alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn is_process_alive(_pid: u32) -> bool {
    false
}

fn generate_token() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Runs the daemon: single-instance lock, auth token, Unix socket accept
/// loop, graceful shutdown (spec.md §4.G).
pub async fn run_server(paths: HostPaths, config: DaemonConfig) -> Result<(), DaemonError> {
    paths.ensure_state_dir()?;

    if daemon_already_running(&paths) {
        let pid = paths.read_pid_file().unwrap_or(0);
        return Err(DaemonError::AlreadyRunning(pid));
    }

    let token = match paths.read_token_file() {
        Some(token) => token,
        None => {
            let token = generate_token();
            paths.write_token_file(&token)?;
            token
        }
    };

    let socket_path = paths.socket_path();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;

    let daemon_pid = std::process::id();
    paths.write_pid_file(daemon_pid)?;

    info!(
        event = "daemon.server.started",
        pid = daemon_pid,
        socket = %socket_path.display(),
    );

    let registry = Arc::new(SessionRegistry::new(config.clone(), default_ptyhost_binary()?));
    registry.start();
    let shutdown = CancellationToken::new();
    let next_client_id = AtomicU64::new(1);

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        shutdown::wait_for_shutdown_signal(signal_shutdown).await;
    });

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let client_id = next_client_id.fetch_add(1, Ordering::Relaxed);
                        let registry = registry.clone();
                        let token = token.clone();
                        let shutdown_token = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(
                                stream,
                                client_id,
                                registry,
                                token,
                                daemon_pid,
                                env!("CARGO_PKG_VERSION"),
                                shutdown_token,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        error!(event = "daemon.server.accept_failed", error = %e);
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!(event = "daemon.server.shutdown_started");
                break;
            }
        }
    }

    registry.dispose_all().await;
    cleanup(&paths);
    info!(event = "daemon.server.shutdown_completed");
    Ok(())
}

fn cleanup(paths: &HostPaths) {
    let socket_path = paths.socket_path();
    if socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&socket_path) {
            warn!(event = "daemon.server.socket_cleanup_failed", error = %e);
        }
    }
    // pid/token files are left in place only on crash; a clean shutdown
    // removes the pid file so the next launch's liveness check passes.
    let pid_path = paths.pid_file();
    if pid_path.exists() {
        if let Err(e) = std::fs::remove_file(&pid_path) {
            warn!(event = "daemon.server.pid_cleanup_failed", error = %e);
        }
    }
}
