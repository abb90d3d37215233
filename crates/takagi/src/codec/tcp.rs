// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! RFC 8323 stream framing.
//!
//! TCP carries no version, type, or message-id; reliability and ordering
//! come from the transport. Each frame is:
//!
//! ```text
//! +-------------+-------------+--------+-------+----------------------+
//! | Len | TKL   | Len ext     | Code   | Token | Options / 0xFF / Pay |
//! | (4b)| (4b)  | (0/1/2/4 B) | (1 B)  |       |                      |
//! +-------------+-------------+--------+-------+----------------------+
//! ```
//!
//! The length field covers only the options-and-payload region (marker
//! included), not the code byte or token. Length nibble encoding extends
//! the RFC 7252 option scheme with a four-byte form: 0..=12 self,
//! 13 -> one byte (len-13), 14 -> two bytes (len-269), 15 -> four bytes
//! (len-65805).
//!
//! [`FrameReader`] accumulates stream bytes incrementally so connection
//! threads with read timeouts can resume a partially received frame
//! (same shape as a poll-driven length-prefix codec).

use super::{decode_options_and_payload, encode_options_and_payload, CodecError, Reader};
use crate::config::MAX_TOKEN_LENGTH;
use crate::message::{Message, Transport};
use std::fmt;
use std::io::{self, Read};

/// Default cap on a single TCP frame (matches the advertised CSM
/// Max-Message-Size).
pub const DEFAULT_MAX_FRAME_SIZE: usize = crate::config::CSM_MAX_MESSAGE_SIZE as usize;

/// Encode a message for the TCP transport.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    if message.token.len() > MAX_TOKEN_LENGTH {
        return Err(CodecError::Malformed("token longer than 8 bytes"));
    }

    let mut body = Vec::new();
    encode_options_and_payload(&mut body, &message.options, &message.payload)?;

    let len = body.len();
    let tkl = message.token.len() as u8;
    let mut buf = Vec::with_capacity(6 + message.token.len() + len);
    if len <= 12 {
        buf.push(((len as u8) << 4) | tkl);
    } else if len <= 268 {
        buf.push((13 << 4) | tkl);
        buf.push((len - 13) as u8);
    } else if len <= 65804 {
        buf.push((14 << 4) | tkl);
        buf.extend_from_slice(&((len - 269) as u16).to_be_bytes());
    } else {
        buf.push((15 << 4) | tkl);
        buf.extend_from_slice(&((len - 65805) as u32).to_be_bytes());
    }
    buf.push(message.code);
    buf.extend_from_slice(&message.token);
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Decode one complete TCP frame. The buffer must hold exactly one frame.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader::new(buf);
    let first = reader.read_u8()?;
    let tkl = usize::from(first & 0x0F);
    if tkl > MAX_TOKEN_LENGTH {
        return Err(CodecError::Malformed("token length exceeds 8"));
    }

    let len = match first >> 4 {
        n @ 0..=12 => usize::from(n),
        13 => 13 + usize::from(reader.read_u8()?),
        14 => 269 + usize::from(reader.read_u16()?),
        _ => {
            let hi = reader.read_u16()?;
            let lo = reader.read_u16()?;
            65805 + ((usize::from(hi) << 16) | usize::from(lo))
        }
    };

    let code = reader.read_u8()?;
    let token = reader.read_bytes(tkl)?.to_vec();
    let body = reader.read_bytes(len)?;
    if !reader.is_empty() {
        return Err(CodecError::Malformed("trailing bytes after frame"));
    }

    let mut body_reader = Reader::new(body);
    let (options, payload) = decode_options_and_payload(&mut body_reader)?;

    Ok(Message {
        transport: Transport::Tcp,
        mtype: None,
        message_id: None,
        token,
        code,
        options,
        payload,
    })
}

// ============================================================================
// Incremental stream reader
// ============================================================================

/// Frame-level read failure.
#[derive(Debug)]
pub enum FrameError {
    /// Underlying stream error.
    Io(io::Error),
    /// Frame contents failed to decode.
    Codec(CodecError),
    /// Peer closed the stream.
    Closed,
    /// Frame larger than the configured cap.
    TooLarge(usize),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Io(e) => write!(f, "stream error: {}", e),
            FrameError::Codec(e) => write!(f, "frame decode failed: {}", e),
            FrameError::Closed => write!(f, "stream closed by peer"),
            FrameError::TooLarge(n) => write!(f, "frame of {} bytes exceeds cap", n),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FrameError::Io(e) => Some(e),
            FrameError::Codec(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CodecError> for FrameError {
    fn from(e: CodecError) -> Self {
        FrameError::Codec(e)
    }
}

/// Incremental frame reader for TCP streams.
///
/// Maintains partial-read state so a read timeout between polls does not
/// lose the bytes of an unfinished frame.
#[derive(Debug)]
pub struct FrameReader {
    buf: Vec<u8>,
    max_size: usize,
    frames_decoded: u64,
    bytes_decoded: u64,
}

impl FrameReader {
    /// Create a reader with the given frame-size cap.
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(1024),
            max_size,
            frames_decoded: 0,
            bytes_decoded: 0,
        }
    }

    /// Create a reader with the default cap.
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Frames successfully decoded so far.
    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Total frame bytes decoded so far.
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Total frame length promised by the accumulated header bytes, or
    /// `None` while the header itself is still incomplete.
    fn wanted(&self) -> Option<usize> {
        let first = *self.buf.first()?;
        let tkl = usize::from(first & 0x0F);
        let (ext, fixed) = match first >> 4 {
            n @ 0..=12 => (0usize, usize::from(n)),
            13 => (1, 13),
            14 => (2, 269),
            _ => (4, 65805),
        };
        if self.buf.len() < 1 + ext {
            return None;
        }
        let mut extra = 0usize;
        for byte in &self.buf[1..1 + ext] {
            extra = (extra << 8) | usize::from(*byte);
        }
        Some(1 + ext + 1 + tkl + fixed + extra)
    }

    /// Pull bytes from the stream and return the next complete message.
    ///
    /// Returns `Ok(None)` when the stream has no complete frame yet
    /// (including `WouldBlock`/timeout on non-blocking or timed reads).
    pub fn poll<R: Read>(&mut self, stream: &mut R) -> Result<Option<Message>, FrameError> {
        loop {
            if let Some(total) = self.wanted() {
                if total > self.max_size {
                    return Err(FrameError::TooLarge(total));
                }
                if self.buf.len() >= total {
                    let frame: Vec<u8> = self.buf.drain(..total).collect();
                    let message = decode(&frame)?;
                    self.frames_decoded += 1;
                    self.bytes_decoded += total as u64;
                    return Ok(Some(message));
                }
            }

            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk) {
                Ok(0) => return Err(FrameError::Closed),
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FrameError::Io(e)),
            }
        }
    }
}
