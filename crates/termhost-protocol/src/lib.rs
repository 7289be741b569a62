//! Wire protocol shared by every piece of the terminal host: the binary
//! subprocess frame codec (daemon <-> PTY host, spec.md §4.A), the NDJSON
//! client/daemon message types (spec.md §4.F), and a blocking Unix-socket
//! `IpcConnection` with an optional thread-local connection pool.

#[cfg(unix)]
pub mod client;
pub mod frame;
mod messages;
#[cfg(unix)]
pub mod pool;
pub mod types;

#[cfg(unix)]
pub use client::{IpcConnection, IpcError};
pub use frame::{
    decode_exit, decode_resize, decode_signal_name, decode_spawn, decode_spawned, encode,
    encode_exit, encode_resize, encode_signal_name, encode_spawn, encode_spawned, Frame,
    FrameDecoder, FrameError, FrameType, SpawnPayload, DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
pub use messages::{ClientMessage, DaemonMessage, ErrorCode, PROTOCOL_VERSION};
pub use types::{
    CreateOrAttachRequest, EmulatorSnapshot, PaneId, SessionId, SessionInfo, SessionStatus, TabId,
    WorkspaceId, DEFAULT_ON_MODES, TRACKED_DEC_MODES,
};
