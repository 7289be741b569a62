//! Binary framing used between the daemon and the PTY subprocess on stdio.
//!
//! Header: `[type: u8][len: u32 LE]` followed by `len` payload bytes. No CRC —
//! stdio pipes are lossless. The decoder is a streaming state machine that
//! tolerates arbitrary chunk boundaries.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const HEADER_LEN: usize = 5;
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Ready = 0x01,
    Spawn = 0x02,
    Spawned = 0x03,
    Data = 0x04,
    Write = 0x05,
    Resize = 0x06,
    Kill = 0x07,
    Signal = 0x08,
    Dispose = 0x09,
    Exit = 0x0A,
    Error = 0x0B,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Ready),
            0x02 => Some(Self::Spawn),
            0x03 => Some(Self::Spawned),
            0x04 => Some(Self::Data),
            0x05 => Some(Self::Write),
            0x06 => Some(Self::Resize),
            0x07 => Some(Self::Kill),
            0x08 => Some(Self::Signal),
            0x09 => Some(Self::Dispose),
            0x0A => Some(Self::Exit),
            0x0B => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame length {len} exceeds configured maximum {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("unknown frame type byte {0:#04x}")]
    UnknownType(u8),

    #[error("malformed payload for {frame_type:?}: {message}")]
    MalformedPayload {
        frame_type: FrameType,
        message: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Appends one encoded frame (header + payload) to `out`.
pub fn encode(frame_type: FrameType, payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(HEADER_LEN + payload.len());
    out.push(frame_type as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Streaming decoder holding a partial-frame buffer across chunk boundaries.
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: u32,
}

impl FrameDecoder {
    pub fn new(max_frame_len: u32) -> Self {
        Self {
            buf: Vec::with_capacity(HEADER_LEN * 4),
            max_frame_len,
        }
    }

    /// Appends newly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempts to decode one complete frame from the buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Compacts the buffer
    /// only when a frame is actually emitted.
    pub fn decode_next(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes(self.buf[1..HEADER_LEN].try_into().unwrap());
        if len > self.max_frame_len {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let type_byte = self.buf[0];
        let frame_type =
            FrameType::from_u8(type_byte).ok_or(FrameError::UnknownType(type_byte))?;
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(0..total);
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }

    /// Drains every complete frame currently buffered.
    pub fn decode_all(&mut self) -> Result<Vec<Frame>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode_next()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnPayload {
    pub shell: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

pub fn encode_spawn(payload: &SpawnPayload, out: &mut Vec<u8>) -> Result<(), FrameError> {
    let json = serde_json::to_vec(payload)
        .map_err(|e| FrameError::MalformedPayload {
            frame_type: FrameType::Spawn,
            message: e.to_string(),
        })?;
    encode(FrameType::Spawn, &json, out);
    Ok(())
}

pub fn decode_spawn(payload: &[u8]) -> Result<SpawnPayload, FrameError> {
    serde_json::from_slice(payload).map_err(|e| FrameError::MalformedPayload {
        frame_type: FrameType::Spawn,
        message: e.to_string(),
    })
}

pub fn encode_spawned(pid: u32) -> Vec<u8> {
    pid.to_le_bytes().to_vec()
}

pub fn decode_spawned(payload: &[u8]) -> Result<u32, FrameError> {
    let bytes: [u8; 4] = payload
        .try_into()
        .map_err(|_| FrameError::MalformedPayload {
            frame_type: FrameType::Spawned,
            message: format!("expected 4 bytes, got {}", payload.len()),
        })?;
    Ok(u32::from_le_bytes(bytes))
}

pub fn encode_resize(cols: u32, rows: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&cols.to_le_bytes());
    buf.extend_from_slice(&rows.to_le_bytes());
    buf
}

pub fn decode_resize(payload: &[u8]) -> Result<(u32, u32), FrameError> {
    if payload.len() != 8 {
        return Err(FrameError::MalformedPayload {
            frame_type: FrameType::Resize,
            message: format!("expected 8 bytes, got {}", payload.len()),
        });
    }
    let cols = u32::from_le_bytes(payload[0..4].try_into().unwrap());
    let rows = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    Ok((cols, rows))
}

pub fn encode_exit(exit_code: i32, signal: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&exit_code.to_le_bytes());
    buf.extend_from_slice(&signal.to_le_bytes());
    buf
}

pub fn decode_exit(payload: &[u8]) -> Result<(i32, u32), FrameError> {
    if payload.len() != 8 {
        return Err(FrameError::MalformedPayload {
            frame_type: FrameType::Exit,
            message: format!("expected 8 bytes, got {}", payload.len()),
        });
    }
    let exit_code = i32::from_le_bytes(payload[0..4].try_into().unwrap());
    let signal = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    Ok((exit_code, signal))
}

/// Encodes a signal-name payload for `Kill`/`Signal` frames (empty means "use default").
pub fn encode_signal_name(name: Option<&str>) -> Vec<u8> {
    name.unwrap_or("").as_bytes().to_vec()
}

pub fn decode_signal_name(payload: &[u8], default: &str) -> String {
    if payload.is_empty() {
        default.to_string()
    } else {
        String::from_utf8_lossy(payload).into_owned()
    }
}
