//! Self-describing TLV serializer for runtime values.
//!
//! Every value is prefixed by a one-byte type tag, enabling recursive
//! encode/decode. The format is shared by checkpoints and distributed
//! message payloads. All multi-byte integers are big-endian. Format
//! version 1.
//!
//! Functions and closures are never serializable: code identity cannot be
//! captured in a byte stream, so both tags exist only to fail fast.

use std::sync::Arc;

use crate::block::Pid;
use crate::value::{Value, ValueMap};

/// Format version written by checkpoint headers.
pub const FORMAT_VERSION: u32 = 1;

// ── Type tags ────────────────────────────────────────────────────────────

pub const TAG_NIL: u8 = 0x00;
pub const TAG_BOOL: u8 = 0x01; // u8 payload
pub const TAG_INT: u8 = 0x02; // i64 BE
pub const TAG_FLOAT: u8 = 0x03; // f64 BE (IEEE 754 bits)
pub const TAG_STRING: u8 = 0x04; // u32 len + bytes
pub const TAG_ARRAY: u8 = 0x05; // u32 count + count * value
pub const TAG_MAP: u8 = 0x06; // u32 count + count * (u32 key_len + key, value)
pub const TAG_PID: u8 = 0x07; // u64 BE
pub const TAG_FUNCTION: u8 = 0x08; // never written
pub const TAG_BYTES: u8 = 0x09; // u32 len + bytes
pub const TAG_RESULT: u8 = 0x0A; // u8 is_ok + value
pub const TAG_OPTION: u8 = 0x0B; // u8 is_some + [value]
pub const TAG_VECTOR: u8 = 0x0E; // u32 count + count * value
pub const TAG_CLOSURE: u8 = 0x0F; // never written

// ── Safety limits ────────────────────────────────────────────────────────

/// Maximum string/bytes length (16 MiB).
const MAX_BLOB_LEN: u32 = 16 * 1024 * 1024;

/// Maximum collection element count (1 million).
const MAX_COLLECTION_LEN: u32 = 1_000_000;

// ── CodecError ───────────────────────────────────────────────────────────

/// Errors raised during encode/decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended mid-value.
    UnexpectedEof,
    /// Unknown or forbidden type tag.
    InvalidTag(u8),
    /// Attempted to serialize a function or closure.
    NotSerializable(&'static str),
    /// A length field exceeds the safety limit.
    PayloadTooLarge(u32),
    /// A string payload is not valid UTF-8.
    InvalidUtf8,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::UnexpectedEof => write!(f, "tlv: unexpected end of input"),
            CodecError::InvalidTag(tag) => write!(f, "tlv: invalid type tag 0x{:02X}", tag),
            CodecError::NotSerializable(what) => {
                write!(f, "tlv: {} values cannot be serialized", what)
            }
            CodecError::PayloadTooLarge(len) => {
                write!(f, "tlv: length {} exceeds safety limit", len)
            }
            CodecError::InvalidUtf8 => write!(f, "tlv: string payload is not valid UTF-8"),
        }
    }
}

// ── Encoding ─────────────────────────────────────────────────────────────

/// Append the TLV encoding of `value` to `out`.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<(), CodecError> {
    match value {
        Value::Nil => out.push(TAG_NIL),
        Value::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        Value::Int(n) => {
            out.push(TAG_INT);
            out.extend_from_slice(&n.to_be_bytes());
        }
        Value::Float(x) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&x.to_be_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STRING);
            encode_blob(s.as_bytes(), out)?;
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            encode_blob(b, out)?;
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            encode_seq(items, out)?;
        }
        Value::Vector(items) => {
            out.push(TAG_VECTOR);
            encode_seq(items, out)?;
        }
        Value::Map(m) => {
            out.push(TAG_MAP);
            if m.len() as u32 > MAX_COLLECTION_LEN {
                return Err(CodecError::PayloadTooLarge(m.len() as u32));
            }
            out.extend_from_slice(&(m.len() as u32).to_be_bytes());
            // Sorted keys: a deterministic byte stream for identical maps.
            let mut keys: Vec<&String> = m.keys().collect();
            keys.sort();
            for key in keys {
                encode_blob(key.as_bytes(), out)?;
                encode_value(&m[key], out)?;
            }
        }
        Value::Pid(pid) => {
            out.push(TAG_PID);
            out.extend_from_slice(&pid.0.to_be_bytes());
        }
        Value::Result(ok, inner) => {
            out.push(TAG_RESULT);
            out.push(*ok as u8);
            encode_value(inner, out)?;
        }
        Value::Option(inner) => {
            out.push(TAG_OPTION);
            match inner {
                Some(v) => {
                    out.push(1);
                    encode_value(v, out)?;
                }
                None => out.push(0),
            }
        }
        Value::Func(_) => return Err(CodecError::NotSerializable("function")),
        Value::Closure(_) => return Err(CodecError::NotSerializable("closure")),
    }
    Ok(())
}

fn encode_blob(bytes: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
    if bytes.len() as u32 > MAX_BLOB_LEN {
        return Err(CodecError::PayloadTooLarge(bytes.len() as u32));
    }
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn encode_seq(items: &[Value], out: &mut Vec<u8>) -> Result<(), CodecError> {
    if items.len() as u32 > MAX_COLLECTION_LEN {
        return Err(CodecError::PayloadTooLarge(items.len() as u32));
    }
    out.extend_from_slice(&(items.len() as u32).to_be_bytes());
    for item in items {
        encode_value(item, out)?;
    }
    Ok(())
}

/// Encode a single value into a fresh buffer.
pub fn to_bytes(value: &Value) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    encode_value(value, &mut out)?;
    Ok(out)
}

// ── Decoding ─────────────────────────────────────────────────────────────

/// Byte reader tracking its position in the input.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn i64(&mut self) -> Result<i64, CodecError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn blob(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()?;
        if len > MAX_BLOB_LEN {
            return Err(CodecError::PayloadTooLarge(len));
        }
        self.take(len as usize)
    }

    fn string(&mut self) -> Result<&'a str, CodecError> {
        std::str::from_utf8(self.blob()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn count(&mut self) -> Result<u32, CodecError> {
        let n = self.u32()?;
        if n > MAX_COLLECTION_LEN {
            return Err(CodecError::PayloadTooLarge(n));
        }
        Ok(n)
    }
}

/// Decode one value from the reader.
pub fn decode_value(r: &mut Reader<'_>) -> Result<Value, CodecError> {
    match r.u8()? {
        TAG_NIL => Ok(Value::Nil),
        TAG_BOOL => Ok(Value::Bool(r.u8()? != 0)),
        TAG_INT => Ok(Value::Int(r.i64()?)),
        TAG_FLOAT => Ok(Value::Float(r.f64()?)),
        TAG_STRING => Ok(Value::Str(Arc::from(r.string()?))),
        TAG_BYTES => Ok(Value::Bytes(r.blob()?.to_vec())),
        TAG_ARRAY => {
            let n = r.count()?;
            let mut items = Vec::with_capacity(n.min(1024) as usize);
            for _ in 0..n {
                items.push(decode_value(r)?);
            }
            Ok(Value::Array(Arc::new(items)))
        }
        TAG_VECTOR => {
            let n = r.count()?;
            let mut items = Vec::with_capacity(n.min(1024) as usize);
            for _ in 0..n {
                items.push(decode_value(r)?);
            }
            Ok(Value::Vector(items.into()))
        }
        TAG_MAP => {
            let n = r.count()?;
            let mut map = ValueMap::default();
            for _ in 0..n {
                let key = r.string()?.to_string();
                let value = decode_value(r)?;
                map.insert(key, value);
            }
            Ok(Value::Map(Arc::new(map)))
        }
        TAG_PID => Ok(Value::Pid(Pid(r.u64()?))),
        TAG_RESULT => {
            let ok = r.u8()? != 0;
            Ok(Value::Result(ok, Box::new(decode_value(r)?)))
        }
        TAG_OPTION => {
            if r.u8()? != 0 {
                Ok(Value::Option(Some(Box::new(decode_value(r)?))))
            } else {
                Ok(Value::Option(None))
            }
        }
        TAG_FUNCTION => Err(CodecError::NotSerializable("function")),
        TAG_CLOSURE => Err(CodecError::NotSerializable("closure")),
        tag => Err(CodecError::InvalidTag(tag)),
    }
}

/// Decode a single value that must span the whole buffer.
pub fn from_bytes(bytes: &[u8]) -> Result<Value, CodecError> {
    let mut r = Reader::new(bytes);
    let value = decode_value(&mut r)?;
    if r.remaining() != 0 {
        return Err(CodecError::InvalidTag(bytes[bytes.len() - r.remaining()]));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
