//! AMF0 subset: the value kinds RTMP command messages actually use
//! (number, boolean, string, object, ECMA array, null/undefined).

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};

const MARKER_NUMBER: u8 = 0x00;
const MARKER_BOOLEAN: u8 = 0x01;
const MARKER_STRING: u8 = 0x02;
const MARKER_OBJECT: u8 = 0x03;
const MARKER_NULL: u8 = 0x05;
const MARKER_UNDEFINED: u8 = 0x06;
const MARKER_ECMA_ARRAY: u8 = 0x08;
const MARKER_OBJECT_END: u8 = 0x09;
const MARKER_LONG_STRING: u8 = 0x0C;

/// Object/array nesting guard.
const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(HashMap<String, AmfValue>),
    Null,
    Undefined,
}

impl AmfValue {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn object_field(&self, key: &str) -> Option<&AmfValue> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }
}

fn eof() -> StreamError {
    StreamError::Protocol("unexpected end of AMF payload".to_string())
}

/// Decode every value in the buffer.
pub fn decode_all(buf: &mut Bytes) -> StreamResult<Vec<AmfValue>> {
    let mut values = Vec::new();
    while buf.has_remaining() {
        values.push(decode(buf, 0)?);
    }
    Ok(values)
}

fn decode(buf: &mut Bytes, depth: usize) -> StreamResult<AmfValue> {
    if depth > MAX_DEPTH {
        return Err(StreamError::Protocol("AMF nesting too deep".to_string()));
    }
    if !buf.has_remaining() {
        return Err(eof());
    }
    match buf.get_u8() {
        MARKER_NUMBER => {
            if buf.remaining() < 8 {
                return Err(eof());
            }
            Ok(AmfValue::Number(buf.get_f64()))
        }
        MARKER_BOOLEAN => {
            if !buf.has_remaining() {
                return Err(eof());
            }
            Ok(AmfValue::Boolean(buf.get_u8() != 0))
        }
        MARKER_STRING => decode_short_string(buf).map(AmfValue::String),
        MARKER_LONG_STRING => {
            if buf.remaining() < 4 {
                return Err(eof());
            }
            let len = buf.get_u32() as usize;
            if buf.remaining() < len {
                return Err(eof());
            }
            let raw = buf.split_to(len);
            Ok(AmfValue::String(String::from_utf8_lossy(&raw).into_owned()))
        }
        MARKER_OBJECT => decode_object_body(buf, depth),
        MARKER_ECMA_ARRAY => {
            // Associative count is advisory; the body terminates like an
            // object.
            if buf.remaining() < 4 {
                return Err(eof());
            }
            let _count = buf.get_u32();
            decode_object_body(buf, depth)
        }
        MARKER_NULL => Ok(AmfValue::Null),
        MARKER_UNDEFINED => Ok(AmfValue::Undefined),
        other => Err(StreamError::Protocol(format!(
            "unsupported AMF0 marker 0x{other:02x}"
        ))),
    }
}

fn decode_short_string(buf: &mut Bytes) -> StreamResult<String> {
    if buf.remaining() < 2 {
        return Err(eof());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(eof());
    }
    let raw = buf.split_to(len);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

fn decode_object_body(buf: &mut Bytes, depth: usize) -> StreamResult<AmfValue> {
    let mut map = HashMap::new();
    loop {
        let key = decode_short_string(buf)?;
        if key.is_empty() {
            if !buf.has_remaining() {
                return Err(eof());
            }
            let marker = buf.get_u8();
            if marker == MARKER_OBJECT_END {
                return Ok(AmfValue::Object(map));
            }
            return Err(StreamError::Protocol(format!(
                "expected object end, got 0x{marker:02x}"
            )));
        }
        let value = decode(buf, depth + 1)?;
        map.insert(key, value);
    }
}

/// Encode a sequence of values.
#[must_use]
pub fn encode_all(values: &[AmfValue]) -> Bytes {
    let mut buf = BytesMut::new();
    for value in values {
        encode(&mut buf, value);
    }
    buf.freeze()
}

fn encode(buf: &mut BytesMut, value: &AmfValue) {
    match value {
        AmfValue::Number(n) => {
            buf.put_u8(MARKER_NUMBER);
            buf.put_f64(*n);
        }
        AmfValue::Boolean(b) => {
            buf.put_u8(MARKER_BOOLEAN);
            buf.put_u8(u8::from(*b));
        }
        AmfValue::String(s) => {
            if s.len() > u16::MAX as usize {
                buf.put_u8(MARKER_LONG_STRING);
                buf.put_u32(s.len() as u32);
            } else {
                buf.put_u8(MARKER_STRING);
                buf.put_u16(s.len() as u16);
            }
            buf.put_slice(s.as_bytes());
        }
        AmfValue::Object(map) => {
            buf.put_u8(MARKER_OBJECT);
            for (key, value) in map {
                buf.put_u16(key.len() as u16);
                buf.put_slice(key.as_bytes());
                encode(buf, value);
            }
            buf.put_u16(0);
            buf.put_u8(MARKER_OBJECT_END);
        }
        AmfValue::Null => buf.put_u8(MARKER_NULL),
        AmfValue::Undefined => buf.put_u8(MARKER_UNDEFINED),
    }
}

/// Shorthand for building AMF object values.
#[must_use]
pub fn object(pairs: &[(&str, AmfValue)]) -> AmfValue {
    AmfValue::Object(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect(),
    )
}
