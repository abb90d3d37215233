// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 takagi contributors

//! application/cbor payload codec (content-format 60).
//!
//! Hand-written RFC 8949 subset covering the JSON data model: null,
//! booleans, integers, doubles, text strings, arrays, and maps with text
//! keys. Definite lengths only; tags and indefinite-length items are
//! rejected on decode. That is the full surface CoAP payload exchange
//! needs here, and it keeps the wire layer free of parser state.

use super::{PayloadCodec, SerError};
use serde_json::{Map, Number, Value};

// RFC 8949 major types (Sec.3.1).
const MAJOR_UINT: u8 = 0;
const MAJOR_NINT: u8 = 1;
const MAJOR_BYTES: u8 = 2;
const MAJOR_TEXT: u8 = 3;
const MAJOR_ARRAY: u8 = 4;
const MAJOR_MAP: u8 = 5;
const MAJOR_SIMPLE: u8 = 7;

const SIMPLE_FALSE: u8 = 20;
const SIMPLE_TRUE: u8 = 21;
const SIMPLE_NULL: u8 = 22;
const ADDITIONAL_F64: u8 = 27;

/// CBOR codec over the JSON value model.
pub struct CborCodec;

impl PayloadCodec for CborCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, SerError> {
        let mut buf = Vec::new();
        write_value(&mut buf, value)?;
        Ok(buf)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, SerError> {
        let mut reader = CborReader { buf: bytes, pos: 0 };
        let value = reader.read_value()?;
        if reader.pos != bytes.len() {
            return Err(SerError::Decode("trailing bytes after item".into()));
        }
        Ok(value)
    }

    fn mime(&self) -> &'static str {
        "application/cbor"
    }
}

fn write_header(buf: &mut Vec<u8>, major: u8, value: u64) {
    let type_bits = major << 5;
    if value < 24 {
        buf.push(type_bits | value as u8);
    } else if value <= u64::from(u8::MAX) {
        buf.push(type_bits | 24);
        buf.push(value as u8);
    } else if value <= u64::from(u16::MAX) {
        buf.push(type_bits | 25);
        buf.extend_from_slice(&(value as u16).to_be_bytes());
    } else if value <= u64::from(u32::MAX) {
        buf.push(type_bits | 26);
        buf.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        buf.push(type_bits | 27);
        buf.extend_from_slice(&value.to_be_bytes());
    }
}

fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), SerError> {
    match value {
        Value::Null => buf.push((MAJOR_SIMPLE << 5) | SIMPLE_NULL),
        Value::Bool(false) => buf.push((MAJOR_SIMPLE << 5) | SIMPLE_FALSE),
        Value::Bool(true) => buf.push((MAJOR_SIMPLE << 5) | SIMPLE_TRUE),
        Value::Number(n) => write_number(buf, n)?,
        Value::String(s) => {
            write_header(buf, MAJOR_TEXT, s.len() as u64);
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Array(items) => {
            write_header(buf, MAJOR_ARRAY, items.len() as u64);
            for item in items {
                write_value(buf, item)?;
            }
        }
        Value::Object(map) => {
            write_header(buf, MAJOR_MAP, map.len() as u64);
            for (key, item) in map {
                write_header(buf, MAJOR_TEXT, key.len() as u64);
                buf.extend_from_slice(key.as_bytes());
                write_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn write_number(buf: &mut Vec<u8>, n: &Number) -> Result<(), SerError> {
    if let Some(u) = n.as_u64() {
        write_header(buf, MAJOR_UINT, u);
    } else if let Some(i) = n.as_i64() {
        // Negative: encoded as -1 - n (RFC 8949 Sec.3.1)
        write_header(buf, MAJOR_NINT, !(i as u64));
    } else if let Some(f) = n.as_f64() {
        buf.push((MAJOR_SIMPLE << 5) | ADDITIONAL_F64);
        buf.extend_from_slice(&f.to_be_bytes());
    } else {
        return Err(SerError::Encode(format!("unencodable number {}", n)));
    }
    Ok(())
}

struct CborReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborReader<'a> {
    fn read_u8(&mut self) -> Result<u8, SerError> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| SerError::Decode("truncated item".into()))?;
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SerError> {
        if self.buf.len() - self.pos < n {
            return Err(SerError::Decode("truncated item".into()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_length(&mut self, additional: u8) -> Result<u64, SerError> {
        match additional {
            0..=23 => Ok(u64::from(additional)),
            24 => Ok(u64::from(self.read_u8()?)),
            25 => {
                let b = self.read_bytes(2)?;
                Ok(u64::from(u16::from_be_bytes([b[0], b[1]])))
            }
            26 => {
                let b = self.read_bytes(4)?;
                Ok(u64::from(u32::from_be_bytes([b[0], b[1], b[2], b[3]])))
            }
            27 => {
                let b = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(u64::from_be_bytes(raw))
            }
            _ => Err(SerError::Decode(
                "indefinite lengths are not supported".into(),
            )),
        }
    }

    fn read_value(&mut self) -> Result<Value, SerError> {
        let initial = self.read_u8()?;
        let major = initial >> 5;
        let additional = initial & 0x1F;

        match major {
            MAJOR_UINT => Ok(Value::Number(Number::from(self.read_length(additional)?))),
            MAJOR_NINT => {
                let n = self.read_length(additional)?;
                let i = i64::try_from(n)
                    .ok()
                    .and_then(|v| v.checked_neg())
                    .and_then(|v| v.checked_sub(1))
                    .ok_or_else(|| SerError::Decode("negative integer overflow".into()))?;
                Ok(Value::Number(Number::from(i)))
            }
            MAJOR_BYTES => {
                // No byte-string slot in the JSON model; reject rather
                // than guess at a lossy mapping.
                Err(SerError::Decode("byte strings are not supported".into()))
            }
            MAJOR_TEXT => {
                let len = self.read_length(additional)? as usize;
                let raw = self.read_bytes(len)?;
                let text = std::str::from_utf8(raw)
                    .map_err(|e| SerError::Decode(format!("invalid utf-8: {}", e)))?;
                Ok(Value::String(text.to_string()))
            }
            MAJOR_ARRAY => {
                let len = self.read_length(additional)? as usize;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(self.read_value()?);
                }
                Ok(Value::Array(items))
            }
            MAJOR_MAP => {
                let len = self.read_length(additional)? as usize;
                let mut map = Map::new();
                for _ in 0..len {
                    let key = match self.read_value()? {
                        Value::String(s) => s,
                        _ => return Err(SerError::Decode("non-text map key".into())),
                    };
                    map.insert(key, self.read_value()?);
                }
                Ok(Value::Object(map))
            }
            6 => Err(SerError::Decode("tags are not supported".into())),
            _ => match additional {
                SIMPLE_FALSE => Ok(Value::Bool(false)),
                SIMPLE_TRUE => Ok(Value::Bool(true)),
                SIMPLE_NULL => Ok(Value::Null),
                ADDITIONAL_F64 => {
                    let b = self.read_bytes(8)?;
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(b);
                    let f = f64::from_be_bytes(raw);
                    Number::from_f64(f)
                        .map(Value::Number)
                        .ok_or_else(|| SerError::Decode("non-finite float".into()))
                }
                _ => Err(SerError::Decode("unsupported simple value".into())),
            },
        }
    }
}
