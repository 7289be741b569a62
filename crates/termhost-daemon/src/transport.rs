//! Component F: per-connection NDJSON request/response and event streaming
//! (spec.md §4.F). One UTF-8 JSON object per line; `hello` must be the first
//! message, verified with a constant-time token comparison.

use std::sync::Arc;

use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{info, warn};

use termhost_protocol::{ClientMessage, DaemonMessage, ErrorCode, PROTOCOL_VERSION};

use crate::errors::DaemonError;
use crate::registry::SessionRegistry;
use crate::session::{ClientId, CLIENT_EVENT_CHANNEL_CAPACITY};

/// Reads one NDJSON line and deserializes it; `Ok(None)` on clean EOF.
pub async fn read_message(
    reader: &mut BufReader<OwnedReadHalf>,
) -> Result<Option<ClientMessage>, DaemonError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let msg: ClientMessage = serde_json::from_str(trimmed)?;
    Ok(Some(msg))
}

pub async fn write_message(
    writer: &mut OwnedWriteHalf,
    msg: &DaemonMessage,
) -> Result<(), DaemonError> {
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Drives one accepted connection end-to-end: authentication, request
/// dispatch, and forwarding session events pushed from `registry` back to
/// this client.
pub async fn handle_connection(
    stream: tokio::net::UnixStream,
    client_id: ClientId,
    registry: Arc<SessionRegistry>,
    expected_token: String,
    daemon_pid: u32,
    daemon_version: &'static str,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;
    let (notify_tx, mut notify_rx) = mpsc::channel::<DaemonMessage>(CLIENT_EVENT_CHANNEL_CAPACITY);

    let mut authenticated = false;
    let mut attached_sessions: Vec<termhost_protocol::SessionId> = Vec::new();

    loop {
        tokio::select! {
            incoming = read_message(&mut reader) => {
                let msg = match incoming {
                    Ok(Some(msg)) => msg,
                    Ok(None) => break,
                    Err(e) => {
                        warn!(event = "daemon.transport.read_failed", client_id, error = %e);
                        break;
                    }
                };

                if !authenticated {
                    match msg {
                        ClientMessage::Hello { id, token, protocol_version } => {
                            if protocol_version != PROTOCOL_VERSION {
                                let _ = write_message(&mut writer, &DaemonMessage::Error {
                                    id,
                                    code: ErrorCode::ProtocolMismatch,
                                    message: format!(
                                        "client={protocol_version} daemon={PROTOCOL_VERSION}"
                                    ),
                                }).await;
                                break;
                            }
                            if !constant_time_eq(token.as_bytes(), expected_token.as_bytes()) {
                                let _ = write_message(&mut writer, &DaemonMessage::Error {
                                    id,
                                    code: ErrorCode::AuthFailed,
                                    message: "invalid token".into(),
                                }).await;
                                break;
                            }
                            authenticated = true;
                            let _ = write_message(&mut writer, &DaemonMessage::HelloOk {
                                id,
                                protocol_version: PROTOCOL_VERSION,
                                daemon_version: daemon_version.to_string(),
                                daemon_pid,
                            }).await;
                        }
                        other => {
                            if let Some(id) = other.id() {
                                let _ = write_message(&mut writer, &DaemonMessage::Error {
                                    id: id.to_string(),
                                    code: ErrorCode::NotAuthenticated,
                                    message: "hello required before any other request".into(),
                                }).await;
                            }
                            break;
                        }
                    }
                    continue;
                }

                if let Err(e) = dispatch(
                    msg,
                    client_id,
                    &registry,
                    &notify_tx,
                    &mut writer,
                    &mut attached_sessions,
                    &shutdown,
                ).await {
                    warn!(event = "daemon.transport.dispatch_failed", client_id, error = %e);
                }
            }
            event = notify_rx.recv() => {
                match event {
                    Some(msg) => {
                        if write_message(&mut writer, &msg).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    for session_id in attached_sessions {
        registry.detach_client(&session_id, client_id).await;
    }
    info!(event = "daemon.transport.connection_closed", client_id);
}

async fn dispatch(
    msg: ClientMessage,
    client_id: ClientId,
    registry: &Arc<SessionRegistry>,
    notify_tx: &mpsc::Sender<DaemonMessage>,
    writer: &mut OwnedWriteHalf,
    attached_sessions: &mut Vec<termhost_protocol::SessionId>,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Result<(), DaemonError> {
    match msg {
        ClientMessage::Hello { id, .. } => {
            write_message(writer, &DaemonMessage::Error {
                id,
                code: ErrorCode::UnknownRequest,
                message: "already authenticated".into(),
            }).await
        }

        ClientMessage::ListSessions { id } => {
            let sessions = registry.list_sessions().await;
            write_message(writer, &DaemonMessage::SessionList { id, sessions }).await
        }

        ClientMessage::CreateOrAttach { id, request } => {
            let session_id = request.session_id.clone();
            match registry.create_or_attach(request, client_id, notify_tx.clone()).await {
                Ok((_, outcome)) => {
                    attached_sessions.push(session_id);
                    write_message(writer, &DaemonMessage::CreateOrAttachOk {
                        id,
                        is_new: outcome.is_new,
                        was_recovered: outcome.was_recovered,
                        pid: outcome.pid,
                        snapshot: outcome.snapshot,
                    }).await
                }
                Err(e) => write_error(writer, id, &e).await,
            }
        }

        ClientMessage::Write { id, session_id, data } => {
            let result = async {
                let handle = registry
                    .get(&session_id)
                    .await
                    .ok_or_else(|| DaemonError::SessionNotFound(session_id.to_string()))?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(data.as_bytes())
                    .map_err(DaemonError::from)?;
                handle.write(bytes).await
            }
            .await;
            match (id, result) {
                (Some(id), Ok(())) => write_message(writer, &DaemonMessage::Ack { id }).await,
                (Some(id), Err(e)) => write_error(writer, id, &e).await,
                (None, _) => Ok(()),
            }
        }

        ClientMessage::Resize { id, session_id, cols, rows } => {
            match registry.get(&session_id).await {
                Some(handle) => {
                    handle.resize(cols, rows);
                    write_message(writer, &DaemonMessage::Ack { id }).await
                }
                None => write_error(writer, id, &DaemonError::SessionNotFound(session_id.to_string())).await,
            }
        }

        ClientMessage::Signal { id, session_id, signal } => {
            match registry.get(&session_id).await {
                Some(handle) => {
                    handle.signal(signal);
                    write_message(writer, &DaemonMessage::Ack { id }).await
                }
                None => write_error(writer, id, &DaemonError::SessionNotFound(session_id.to_string())).await,
            }
        }

        ClientMessage::Detach { id, session_id } => {
            registry.detach_client(&session_id, client_id).await;
            attached_sessions.retain(|s| s != &session_id);
            write_message(writer, &DaemonMessage::Ack { id }).await
        }

        ClientMessage::Kill { id, session_id, delete_history: _ } => {
            registry.kill(&session_id, None).await;
            write_message(writer, &DaemonMessage::Ack { id }).await
        }

        ClientMessage::KillAll { id } => {
            registry.kill_all().await;
            write_message(writer, &DaemonMessage::Ack { id }).await
        }

        ClientMessage::ClearScrollback { id, session_id } => {
            match registry.get(&session_id).await {
                Some(handle) => {
                    handle.clear_scrollback();
                    write_message(writer, &DaemonMessage::Ack { id }).await
                }
                None => write_error(writer, id, &DaemonError::SessionNotFound(session_id.to_string())).await,
            }
        }

        ClientMessage::Shutdown { id } => {
            write_message(writer, &DaemonMessage::Ack { id }).await?;
            shutdown.cancel();
            Ok(())
        }

        _ => unreachable!("all ClientMessage variants are handled above"),
    }
}

async fn write_error(
    writer: &mut OwnedWriteHalf,
    id: String,
    err: &DaemonError,
) -> Result<(), DaemonError> {
    write_message(writer, &DaemonMessage::Error {
        id,
        code: err.error_code(),
        message: err.to_string(),
    }).await
}

/// Avoids leaking token length/content through comparison timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
