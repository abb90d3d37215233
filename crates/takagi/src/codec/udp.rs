// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! RFC 7252 datagram framing.
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...       | 0xFF | Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::{decode_options_and_payload, encode_options_and_payload, CodecError, Reader};
use crate::config::{COAP_VERSION, MAX_TOKEN_LENGTH};
use crate::message::{Message, MessageType, Transport};

/// Fixed header length (version/type/TKL, code, message-id).
pub const HEADER_SIZE: usize = 4;

/// Encode a message for the UDP transport.
///
/// The message must carry a type and message-id (both are mandatory in the
/// datagram header) and a token of at most 8 bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    let mtype = message
        .mtype
        .ok_or(CodecError::Malformed("udp message without type"))?;
    let message_id = message
        .message_id
        .ok_or(CodecError::Malformed("udp message without message-id"))?;
    if message.token.len() > MAX_TOKEN_LENGTH {
        return Err(CodecError::Malformed("token longer than 8 bytes"));
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + message.token.len() + 16 + message.payload.len());
    buf.push((COAP_VERSION << 6) | (mtype.to_wire() << 4) | message.token.len() as u8);
    buf.push(message.code);
    buf.extend_from_slice(&message_id.to_be_bytes());
    buf.extend_from_slice(&message.token);
    encode_options_and_payload(&mut buf, &message.options, &message.payload)?;
    Ok(buf)
}

/// Decode a datagram into a message.
pub fn decode(buf: &[u8]) -> Result<Message, CodecError> {
    let mut reader = Reader::new(buf);
    if reader.remaining() < HEADER_SIZE {
        return Err(CodecError::Short);
    }

    let first = reader.read_u8()?;
    let version = first >> 6;
    if version != COAP_VERSION {
        return Err(CodecError::BadVersion(version));
    }
    let mtype = MessageType::from_wire(first >> 4);
    let tkl = usize::from(first & 0x0F);
    if tkl > MAX_TOKEN_LENGTH {
        return Err(CodecError::Malformed("token length exceeds 8"));
    }

    let code = reader.read_u8()?;
    let message_id = reader.read_u16()?;
    let token = reader.read_bytes(tkl)?.to_vec();
    let (options, payload) = decode_options_and_payload(&mut reader)?;

    Ok(Message {
        transport: Transport::Udp,
        mtype: Some(mtype),
        message_id: Some(message_id),
        token,
        code,
        options,
        payload,
    })
}
