// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Service wire protocol, versions v0 and v1.
//!
//! Both versions share the frame alignment:
//!
//! ```text
//! u32 length (BE) | u8 version | u32 request_id (BE) | varbytes ... | varbytes body
//! ```
//!
//! Requests carry `varbytes method_name` before the body. Responses carry
//! `u8 call_state`, then (v1 only) `varbytes error_msg`, then the body.
//! `varbytes` is a u32 big-endian length followed by that many bytes.

use crate::config::SERVICE_MAX_FRAME_SIZE;
use crate::service::CallState;
use std::io::{self, Read, Write};

/// Oldest protocol this implementation speaks.
pub const PROTOCOL_V0: u8 = 0;
/// Current protocol; adds `error_msg` to responses.
pub const PROTOCOL_V1: u8 = 1;

/// One request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub version: u8,
    pub request_id: u32,
    pub method: String,
    pub body: Vec<u8>,
}

/// One response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub version: u8,
    pub request_id: u32,
    pub call_state: CallState,
    /// Only on the wire in v1.
    pub error_msg: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum ProtocolError {
    Io(io::Error),
    /// Frame shorter than its fixed fields or varbytes run past the end.
    Malformed,
    /// Version byte this implementation does not speak.
    UnsupportedVersion(u8),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolError::Io(e) => write!(f, "service i/o error: {}", e),
            ProtocolError::Malformed => write!(f, "malformed service frame"),
            ProtocolError::UnsupportedVersion(v) => {
                write!(f, "unsupported service protocol version {}", v)
            }
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProtocolError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ProtocolError {
    fn from(e: io::Error) -> Self {
        ProtocolError::Io(e)
    }
}

type Result<T> = std::result::Result<T, ProtocolError>;

fn put_varbytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(ProtocolError::Malformed);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_varbytes(&mut self) -> Result<&'a [u8]> {
        let len = self.get_u32()? as usize;
        self.take(len)
    }
}

/// Serialize a request (no outer length prefix).
pub fn encode_request(frame: &RequestFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + frame.method.len() + frame.body.len() + 8);
    out.push(frame.version);
    out.extend_from_slice(&frame.request_id.to_be_bytes());
    put_varbytes(&mut out, frame.method.as_bytes());
    put_varbytes(&mut out, &frame.body);
    out
}

pub fn decode_request(buf: &[u8]) -> Result<RequestFrame> {
    let mut r = FieldReader { buf, pos: 0 };
    let version = r.get_u8()?;
    if version > PROTOCOL_V1 {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let request_id = r.get_u32()?;
    let method = String::from_utf8(r.get_varbytes()?.to_vec())
        .map_err(|_| ProtocolError::Malformed)?;
    let body = r.get_varbytes()?.to_vec();
    Ok(RequestFrame {
        version,
        request_id,
        method,
        body,
    })
}

/// Serialize a response in the frame's own version (v0 omits error_msg).
pub fn encode_response(frame: &ResponseFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + frame.error_msg.len() + frame.body.len() + 8);
    out.push(frame.version);
    out.extend_from_slice(&frame.request_id.to_be_bytes());
    out.push(frame.call_state.as_u8());
    if frame.version >= PROTOCOL_V1 {
        put_varbytes(&mut out, frame.error_msg.as_bytes());
    }
    put_varbytes(&mut out, &frame.body);
    out
}

pub fn decode_response(buf: &[u8]) -> Result<ResponseFrame> {
    let mut r = FieldReader { buf, pos: 0 };
    let version = r.get_u8()?;
    if version > PROTOCOL_V1 {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    let request_id = r.get_u32()?;
    let call_state = CallState::from_u8(r.get_u8()?);
    let error_msg = if version >= PROTOCOL_V1 {
        String::from_utf8(r.get_varbytes()?.to_vec()).map_err(|_| ProtocolError::Malformed)?
    } else {
        String::new()
    };
    let body = r.get_varbytes()?.to_vec();
    Ok(ResponseFrame {
        version,
        request_id,
        call_state,
        error_msg,
        body,
    })
}

/// Write one frame with the outer length prefix.
pub fn write_frame<W: Write>(writer: &mut W, frame_bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(frame_bytes.len() as u32).to_be_bytes())?;
    writer.write_all(frame_bytes)?;
    writer.flush()
}

/// Read one frame body (outer length prefix stripped). `Ok(None)` on
/// clean EOF.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > SERVICE_MAX_FRAME_SIZE {
        return Err(ProtocolError::Malformed);
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
