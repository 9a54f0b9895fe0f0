//! Framed wire protocol for inter-node links.
//!
//! Every frame is `type:u8 | length:u32 BE | body[length]`, with the body
//! length capped at 16 MiB to bound allocation from a hostile peer. All
//! multi-byte integers are big-endian. Protocol version 1.
//!
//! Live frame types are HANDSHAKE, HEARTBEAT, and SEND. The LINK through
//! DOWN opcodes are reserved: their bodies follow the SEND convention
//! (peer PIDs plus a reason string) but are never emitted.

use std::io::{Read, Write};

/// Wire protocol version carried in every handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Upper bound on a frame body.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

// ── Frame types ──────────────────────────────────────────────────────────

pub const FRAME_HANDSHAKE: u8 = 0x01;
pub const FRAME_HEARTBEAT: u8 = 0x02;
pub const FRAME_SEND: u8 = 0x03;
// Reserved opcodes; never emitted.
pub const FRAME_LINK: u8 = 0x04;
pub const FRAME_UNLINK: u8 = 0x05;
pub const FRAME_EXIT: u8 = 0x06;
pub const FRAME_MONITOR: u8 = 0x07;
pub const FRAME_DEMONITOR: u8 = 0x08;
pub const FRAME_DOWN: u8 = 0x09;

/// SEND bodies carry two PIDs before the payload.
const SEND_HEADER_LEN: usize = 16;

// ---------------------------------------------------------------------------
// WireError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Declared body length exceeds [`MAX_FRAME_LEN`].
    FrameTooLarge(u32),
    /// Body shorter than the frame type's fixed header.
    ShortBody { kind: u8, len: usize },
    /// Peer speaks a different protocol version.
    VersionMismatch(u8),
    /// Peer presented the wrong cookie.
    CookieMismatch,
    /// A zero cookie is never acceptable.
    ZeroCookie,
    /// Handshake node name is malformed.
    BadName,
    Io(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WireError::FrameTooLarge(len) => {
                write!(f, "frame body of {} bytes exceeds {} cap", len, MAX_FRAME_LEN)
            }
            WireError::ShortBody { kind, len } => {
                write!(f, "frame 0x{:02X} body too short ({} bytes)", kind, len)
            }
            WireError::VersionMismatch(got) => {
                write!(f, "protocol version {} (expected {})", got, PROTOCOL_VERSION)
            }
            WireError::CookieMismatch => write!(f, "cookie mismatch"),
            WireError::ZeroCookie => write!(f, "zero cookie rejected"),
            WireError::BadName => write!(f, "malformed node name"),
            WireError::Io(msg) => write!(f, "wire io: {}", msg),
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(err: std::io::Error) -> Self {
        WireError::Io(err.to_string())
    }
}

// ---------------------------------------------------------------------------
// Frame IO
// ---------------------------------------------------------------------------

/// Write one frame: `type | length BE | body`.
pub fn write_frame(w: &mut impl Write, kind: u8, body: &[u8]) -> Result<(), WireError> {
    if body.len() as u32 > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(body.len() as u32));
    }
    w.write_all(&[kind])?;
    w.write_all(&(body.len() as u32).to_be_bytes())?;
    w.write_all(body)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, enforcing the body length cap before allocating.
pub fn read_frame(r: &mut impl Read) -> Result<(u8, Vec<u8>), WireError> {
    let mut header = [0u8; 5];
    r.read_exact(&mut header)?;
    let kind = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body)?;
    Ok((kind, body))
}

// ---------------------------------------------------------------------------
// HANDSHAKE
// ---------------------------------------------------------------------------

/// `version:u8 | cookie:u64 BE | name_len:u8 | name[name_len]`.
pub fn encode_handshake(cookie: u64, name: &str) -> Result<Vec<u8>, WireError> {
    let name_bytes = name.as_bytes();
    if name_bytes.is_empty() || name_bytes.len() > u8::MAX as usize {
        return Err(WireError::BadName);
    }
    let mut body = Vec::with_capacity(1 + 8 + 1 + name_bytes.len());
    body.push(PROTOCOL_VERSION);
    body.extend_from_slice(&cookie.to_be_bytes());
    body.push(name_bytes.len() as u8);
    body.extend_from_slice(name_bytes);
    Ok(body)
}

/// Parse a handshake body. Returns `(version, cookie, name)`.
pub fn parse_handshake(body: &[u8]) -> Result<(u8, u64, String), WireError> {
    if body.len() < 10 {
        return Err(WireError::ShortBody {
            kind: FRAME_HANDSHAKE,
            len: body.len(),
        });
    }
    let version = body[0];
    let cookie = u64::from_be_bytes(body[1..9].try_into().unwrap());
    let name_len = body[9] as usize;
    if body.len() < 10 + name_len || name_len == 0 {
        return Err(WireError::BadName);
    }
    let name = std::str::from_utf8(&body[10..10 + name_len])
        .map_err(|_| WireError::BadName)?
        .to_string();
    Ok((version, cookie, name))
}

/// Validate a parsed handshake against our expectations.
pub fn validate_handshake(
    version: u8,
    cookie: u64,
    expected_cookie: u64,
) -> Result<(), WireError> {
    if version != PROTOCOL_VERSION {
        return Err(WireError::VersionMismatch(version));
    }
    if cookie == 0 {
        return Err(WireError::ZeroCookie);
    }
    if cookie != expected_cookie {
        return Err(WireError::CookieMismatch);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SEND
// ---------------------------------------------------------------------------

/// `target_pid:u64 BE | sender_pid:u64 BE | payload`.
pub fn encode_send(target_pid: u64, sender_pid: u64, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(SEND_HEADER_LEN + payload.len());
    body.extend_from_slice(&target_pid.to_be_bytes());
    body.extend_from_slice(&sender_pid.to_be_bytes());
    body.extend_from_slice(payload);
    body
}

/// Parse a SEND body. Returns `(target_pid, sender_pid, payload)`.
pub fn parse_send(body: &[u8]) -> Result<(u64, u64, &[u8]), WireError> {
    if body.len() < SEND_HEADER_LEN {
        return Err(WireError::ShortBody {
            kind: FRAME_SEND,
            len: body.len(),
        });
    }
    let target = u64::from_be_bytes(body[0..8].try_into().unwrap());
    let sender = u64::from_be_bytes(body[8..16].try_into().unwrap());
    Ok((target, sender, &body[SEND_HEADER_LEN..]))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
