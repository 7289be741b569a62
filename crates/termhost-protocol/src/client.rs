//! Shared synchronous NDJSON IPC client for the local Unix socket transport.
//!
//! Provides `IpcConnection` for connecting to the terminal host daemon and
//! sending typed `ClientMessage`/`DaemonMessage` requests, plus a `hello()`
//! helper that performs the mandatory auth handshake (spec.md §4.F).

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use crate::{ClientMessage, DaemonMessage, ErrorCode, PROTOCOL_VERSION};

/// Error from the shared IPC client layer.
#[non_exhaustive]
#[derive(Debug)]
pub enum IpcError {
    /// Daemon socket does not exist or connection was refused.
    NotRunning { path: String },
    /// Socket exists but connection failed for a non-`ConnectionRefused` reason.
    ConnectionFailed(std::io::Error),
    /// Daemon returned an explicit error response.
    DaemonError { code: ErrorCode, message: String },
    /// Protocol-level error (serialization, empty response, invalid JSON).
    ProtocolError { message: String },
    /// Other I/O error.
    Io(std::io::Error),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::NotRunning { path } => {
                write!(f, "daemon is not running (socket not found at {})", path)
            }
            IpcError::ConnectionFailed(e) => write!(f, "connection failed: {}", e),
            IpcError::DaemonError { code, message } => {
                write!(f, "daemon error [{}]: {}", code, message)
            }
            IpcError::ProtocolError { message } => write!(f, "protocol error: {}", message),
            IpcError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IpcError::ConnectionFailed(e) | IpcError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        IpcError::Io(e)
    }
}

/// RAII guard that restores a Unix socket's read timeout on drop.
struct TimeoutGuard<'a> {
    stream: &'a UnixStream,
    orig_timeout: Option<Duration>,
}

impl Drop for TimeoutGuard<'_> {
    fn drop(&mut self) {
        let _ = self.stream.set_read_timeout(self.orig_timeout);
    }
}

/// A synchronous NDJSON connection to the terminal host daemon, over a local
/// Unix domain socket. Remote (TCP/TLS) transport is out of scope (spec.md §1
/// Non-goals).
#[derive(Debug)]
pub struct IpcConnection {
    stream: UnixStream,
}

impl IpcConnection {
    /// Connect to the daemon at the given Unix socket path.
    ///
    /// Checks that the socket file exists, connects, and configures timeouts
    /// (30s read, 5s write). Returns `IpcError::NotRunning` if the socket
    /// doesn't exist or connection is refused.
    pub fn connect(socket_path: &Path) -> Result<Self, IpcError> {
        if !socket_path.exists() {
            return Err(IpcError::NotRunning {
                path: socket_path.display().to_string(),
            });
        }

        let stream = UnixStream::connect(socket_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                IpcError::NotRunning {
                    path: socket_path.display().to_string(),
                }
            } else {
                IpcError::ConnectionFailed(e)
            }
        })?;

        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;

        Ok(Self { stream })
    }

    /// Connect and immediately perform the mandatory `hello` handshake.
    ///
    /// The daemon closes the connection if the first message isn't a valid
    /// `hello` (spec.md §4.F), so this should be the first thing any caller
    /// does after `connect`.
    pub fn connect_and_hello(socket_path: &Path, token: &str) -> Result<Self, IpcError> {
        let mut conn = Self::connect(socket_path)?;
        conn.hello(token)?;
        Ok(conn)
    }

    /// Send the `hello` request and validate the response.
    pub fn hello(&mut self, token: &str) -> Result<DaemonMessage, IpcError> {
        let response = self.send(&ClientMessage::Hello {
            id: "hello".to_string(),
            token: token.to_string(),
            protocol_version: PROTOCOL_VERSION,
        })?;
        match &response {
            DaemonMessage::HelloOk { .. } => Ok(response),
            other => Err(IpcError::ProtocolError {
                message: format!("expected hello_ok, got {:?}", other),
            }),
        }
    }

    /// Send a typed request and read one typed response.
    ///
    /// Serializes `request` as JSON, writes it as a single line, flushes,
    /// then reads one line of JSON response. Converts `DaemonMessage::Error`
    /// into `IpcError::DaemonError`.
    pub fn send(&mut self, request: &ClientMessage) -> Result<DaemonMessage, IpcError> {
        let msg = serde_json::to_string(request).map_err(|e| IpcError::ProtocolError {
            message: e.to_string(),
        })?;

        writeln!(self.stream, "{}", msg)?;
        self.stream.flush()?;
        // Transient BufReader — not stored as a field because the
        // request-response protocol expects exactly one response line per
        // send(). Storing it would risk buffering extra data from the stream.
        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        reader.read_line(&mut line)?;

        if line.is_empty() {
            return Err(IpcError::ProtocolError {
                message: "empty response from daemon".to_string(),
            });
        }

        let response: DaemonMessage =
            serde_json::from_str(&line).map_err(|e| IpcError::ProtocolError {
                message: format!("invalid JSON response: {}", e),
            })?;

        if let DaemonMessage::Error { code, message, .. } = response {
            return Err(IpcError::DaemonError { code, message });
        }

        Ok(response)
    }

    /// Send a `write` notification (no `id`, no response expected).
    pub fn send_notification(&mut self, request: &ClientMessage) -> Result<(), IpcError> {
        debug_assert!(
            request.id().is_none(),
            "send_notification called with a request that carries an id"
        );
        let msg = serde_json::to_string(request).map_err(|e| IpcError::ProtocolError {
            message: e.to_string(),
        })?;
        writeln!(self.stream, "{}", msg)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read one line of pushed `DaemonMessage::Event` traffic.
    ///
    /// Used by callers that keep a connection open to receive streaming
    /// `data`/`exit`/`terminalError` events after `createOrAttach`.
    pub fn read_message(&mut self) -> Result<DaemonMessage, IpcError> {
        let mut reader = BufReader::new(&self.stream);
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Err(IpcError::ProtocolError {
                message: "connection closed by daemon".to_string(),
            });
        }
        serde_json::from_str(&line).map_err(|e| IpcError::ProtocolError {
            message: format!("invalid JSON response: {}", e),
        })
    }

    /// Override the read timeout on the underlying socket.
    ///
    /// Callers like autospawn probes use shorter timeouts than the default 30s.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), IpcError> {
        Ok(self.stream.set_read_timeout(timeout)?)
    }

    /// Check if the connection is still usable (peer hasn't closed).
    ///
    /// Temporarily sets a 1ms read timeout (restored via RAII guard, even on
    /// panic) and attempts a read. Returns `false` if the peer has definitely
    /// closed, `true` otherwise.
    pub fn is_alive(&self) -> bool {
        use std::io::Read;

        let orig_timeout = self.stream.read_timeout().ok().flatten();
        let _guard = TimeoutGuard {
            stream: &self.stream,
            orig_timeout,
        };

        // Fail-closed: if we can't set the probe timeout, assume broken.
        if self
            .stream
            .set_read_timeout(Some(Duration::from_millis(1)))
            .is_err()
        {
            return false;
        }

        let mut buf = [0u8; 1];
        let mut stream_ref = &self.stream;
        match stream_ref.read(&mut buf) {
            Ok(0) => false, // EOF — peer closed
            Ok(_) => true,  // Unexpected data but socket alive (possible protocol violation)
            Err(ref e)
                if e.kind() == std::io::ErrorKind::TimedOut
                    || e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                true
            }
            Err(_) => false,
        }
    }
}
