//! RTMP chunk stream codec.
//!
//! The decoder is sans-io: the session feeds it raw bytes and drains
//! complete messages. Interleaved chunk streams reassemble through
//! per-csid state; type-3 continuation chunks inherit the previous
//! header for their stream.

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{StreamError, StreamResult};

pub const DEFAULT_CHUNK_SIZE: usize = 128;
/// Chunk size this server advertises to peers.
pub const SERVER_CHUNK_SIZE: usize = 4096;

const EXTENDED_TIMESTAMP: u32 = 0xFF_FFFF;

pub mod msg_type {
    pub const SET_CHUNK_SIZE: u8 = 1;
    pub const ABORT: u8 = 2;
    pub const ACK: u8 = 3;
    pub const USER_CONTROL: u8 = 4;
    pub const WINDOW_ACK_SIZE: u8 = 5;
    pub const SET_PEER_BANDWIDTH: u8 = 6;
    pub const AUDIO: u8 = 8;
    pub const VIDEO: u8 = 9;
    pub const DATA_AMF0: u8 = 18;
    pub const COMMAND_AMF0: u8 = 20;
}

pub mod csid {
    pub const CONTROL: u32 = 2;
    pub const COMMAND: u32 = 3;
    pub const AUDIO: u32 = 4;
    pub const VIDEO: u32 = 5;
    pub const DATA: u32 = 6;
}

#[derive(Debug, Clone)]
pub struct RtmpMessage {
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

#[derive(Default)]
struct CsidState {
    timestamp: u32,
    timestamp_delta: u32,
    msg_length: u32,
    msg_type: u8,
    msg_stream_id: u32,
    /// Whether the last full header used the extended timestamp field;
    /// type-3 chunks on this stream then carry it too.
    has_extended: bool,
    partial: BytesMut,
}

/// Streaming chunk decoder.
pub struct ChunkDecoder {
    buffer: BytesMut,
    chunk_size: usize,
    streams: HashMap<u32, CsidState>,
}

impl Default for ChunkDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            streams: HashMap::new(),
        }
    }

    /// Peer announced a new inbound chunk size.
    pub fn set_chunk_size(&mut self, size: usize) {
        self.chunk_size = size.clamp(1, 0x00FF_FFFF);
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Drain the next complete message, or None if more bytes are
    /// needed.
    ///
    /// Header state commits only once the whole chunk (header + body)
    /// is buffered, so a short read never half-applies a delta.
    pub fn next_message(&mut self) -> StreamResult<Option<RtmpMessage>> {
        loop {
            let Some((consumed, chunk_csid, fmt, header)) = self.parse_header()? else {
                return Ok(None);
            };

            let (partial_len, known_length) = {
                let state = self.streams.entry(chunk_csid).or_default();
                (state.partial.len(), state.msg_length)
            };
            // fmt 0/1 always open a new message on this chunk stream.
            let carried = if fmt <= 1 { 0 } else { partial_len };
            let msg_length = header.msg_length.unwrap_or(known_length) as usize;
            if msg_length > 16 * 1024 * 1024 {
                return Err(StreamError::Protocol(format!(
                    "message length {msg_length} exceeds sanity bound"
                )));
            }
            let body_len = msg_length.saturating_sub(carried).min(self.chunk_size);

            if self.buffer.len() < consumed + body_len {
                return Ok(None);
            }

            self.buffer.advance(consumed);
            let body = self.buffer.split_to(body_len);

            let state = self
                .streams
                .get_mut(&chunk_csid)
                .expect("state created above");
            if fmt <= 1 {
                state.partial.clear();
            }
            apply_header(state, fmt, &header);
            state.partial.extend_from_slice(&body);

            if state.partial.len() >= state.msg_length as usize {
                let payload = std::mem::take(&mut state.partial).freeze();
                return Ok(Some(RtmpMessage {
                    type_id: state.msg_type,
                    stream_id: state.msg_stream_id,
                    timestamp: state.timestamp,
                    payload,
                }));
            }
        }
    }

    /// Parse the basic + message header without consuming. Returns
    /// (bytes consumed by headers, csid, fmt, header fields).
    fn parse_header(&self) -> StreamResult<Option<(usize, u32, u8, HeaderFields)>> {
        let buf = &self.buffer[..];
        if buf.is_empty() {
            return Ok(None);
        }

        let b0 = buf[0];
        let fmt = b0 >> 6;
        let csid0 = u32::from(b0 & 0x3F);
        let (basic_len, chunk_csid) = match csid0 {
            0 => {
                if buf.len() < 2 {
                    return Ok(None);
                }
                (2, 64 + u32::from(buf[1]))
            }
            1 => {
                if buf.len() < 3 {
                    return Ok(None);
                }
                (3, 64 + u32::from(buf[1]) + 256 * u32::from(buf[2]))
            }
            n => (1, n),
        };

        let header_len = match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            3 => 0,
            _ => unreachable!("fmt is two bits"),
        };
        if buf.len() < basic_len + header_len {
            return Ok(None);
        }

        let header_bytes = &buf[basic_len..basic_len + header_len];
        let mut fields = HeaderFields::default();
        let mut consumed = basic_len + header_len;

        match fmt {
            0 => {
                fields.timestamp = Some(read_u24(&header_bytes[0..3]));
                fields.msg_length = Some(read_u24(&header_bytes[3..6]));
                fields.msg_type = Some(header_bytes[6]);
                fields.msg_stream_id = Some(u32::from_le_bytes([
                    header_bytes[7],
                    header_bytes[8],
                    header_bytes[9],
                    header_bytes[10],
                ]));
            }
            1 => {
                fields.timestamp_delta = Some(read_u24(&header_bytes[0..3]));
                fields.msg_length = Some(read_u24(&header_bytes[3..6]));
                fields.msg_type = Some(header_bytes[6]);
            }
            2 => {
                fields.timestamp_delta = Some(read_u24(&header_bytes[0..3]));
            }
            _ => {}
        }

        // Extended timestamp rides after the header when the 24-bit
        // field saturates; type-3 chunks repeat it while their stream's
        // running header is extended.
        let ts_field = fields.timestamp.or(fields.timestamp_delta);
        let fmt3_extended = fmt == 3
            && self
                .streams
                .get(&chunk_csid)
                .is_some_and(|state| state.has_extended);
        if ts_field == Some(EXTENDED_TIMESTAMP) || fmt3_extended {
            if buf.len() < consumed + 4 {
                return Ok(None);
            }
            let ext = u32::from_be_bytes([
                buf[consumed],
                buf[consumed + 1],
                buf[consumed + 2],
                buf[consumed + 3],
            ]);
            if fields.timestamp.is_some() {
                fields.timestamp = Some(ext);
                fields.extended = true;
            } else if fields.timestamp_delta.is_some() {
                fields.timestamp_delta = Some(ext);
                fields.extended = true;
            }
            consumed += 4;
        }

        Ok(Some((consumed, chunk_csid, fmt, fields)))
    }
}

#[derive(Debug, Default)]
struct HeaderFields {
    timestamp: Option<u32>,
    timestamp_delta: Option<u32>,
    msg_length: Option<u32>,
    msg_type: Option<u8>,
    msg_stream_id: Option<u32>,
    extended: bool,
}

fn apply_header(state: &mut CsidState, fmt: u8, header: &HeaderFields) {
    match fmt {
        0 => {
            state.timestamp = header.timestamp.unwrap_or(0);
            state.timestamp_delta = 0;
            state.msg_length = header.msg_length.unwrap_or(0);
            state.msg_type = header.msg_type.unwrap_or(0);
            state.msg_stream_id = header.msg_stream_id.unwrap_or(0);
            state.has_extended = header.extended;
        }
        1 => {
            state.timestamp_delta = header.timestamp_delta.unwrap_or(0);
            state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
            state.msg_length = header.msg_length.unwrap_or(0);
            state.msg_type = header.msg_type.unwrap_or(0);
            state.has_extended = header.extended;
        }
        2 => {
            state.timestamp_delta = header.timestamp_delta.unwrap_or(0);
            state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
            state.has_extended = header.extended;
        }
        _ => {
            // fmt 3: a continuation keeps the running header; a fresh
            // message on the stream repeats the previous delta.
            if state.partial.is_empty() {
                state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
            }
        }
    }
}

fn read_u24(bytes: &[u8]) -> u32 {
    (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2])
}

fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u8((value >> 8) as u8);
    buf.put_u8(value as u8);
}

/// Encode a message as a type-0 chunk followed by type-3 continuations.
#[must_use]
pub fn encode_message(chunk_csid: u32, message: &RtmpMessage, chunk_size: usize) -> Bytes {
    let chunk_size = chunk_size.max(1);
    let mut buf = BytesMut::with_capacity(message.payload.len() + 32);
    let csid_byte = (chunk_csid & 0x3F) as u8;

    let (ts_field, extended) = if message.timestamp >= EXTENDED_TIMESTAMP {
        (EXTENDED_TIMESTAMP, true)
    } else {
        (message.timestamp, false)
    };

    buf.put_u8(csid_byte); // fmt 0
    put_u24(&mut buf, ts_field);
    put_u24(&mut buf, message.payload.len() as u32);
    buf.put_u8(message.type_id);
    buf.put_u32_le(message.stream_id);
    if extended {
        buf.put_u32(message.timestamp);
    }

    let mut offset = 0;
    while offset < message.payload.len() {
        if offset > 0 {
            buf.put_u8(0xC0 | csid_byte); // fmt 3 continuation
            if extended {
                buf.put_u32(message.timestamp);
            }
        }
        let end = (offset + chunk_size).min(message.payload.len());
        buf.put_slice(&message.payload[offset..end]);
        offset = end;
    }
    buf.freeze()
}

/// Control message payload builders.
#[must_use]
pub fn set_chunk_size_payload(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

#[must_use]
pub fn window_ack_size_payload(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

#[must_use]
pub fn set_peer_bandwidth_payload(size: u32, limit_type: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u32(size);
    buf.put_u8(limit_type);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(payload_len: usize) -> RtmpMessage {
        RtmpMessage {
            type_id: msg_type::COMMAND_AMF0,
            stream_id: 0,
            timestamp: 1000,
            payload: Bytes::from((0..payload_len).map(|i| i as u8).collect::<Vec<u8>>()),
        }
    }

    #[test]
    fn small_message_round_trips() {
        let message = command(40);
        let wire = encode_message(csid::COMMAND, &message, DEFAULT_CHUNK_SIZE);

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&wire);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.type_id, message.type_id);
        assert_eq!(decoded.timestamp, 1000);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn oversized_message_splits_into_continuations() {
        let message = command(DEFAULT_CHUNK_SIZE * 3 + 17);
        let wire = encode_message(csid::COMMAND, &message, DEFAULT_CHUNK_SIZE);

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&wire);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.payload.len(), DEFAULT_CHUNK_SIZE * 3 + 17);
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn partial_bytes_wait_for_more() {
        let message = command(300);
        let wire = encode_message(csid::COMMAND, &message, DEFAULT_CHUNK_SIZE);

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&wire[..50]);
        assert!(decoder.next_message().expect("decode").is_none());

        decoder.extend(&wire[50..]);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn interleaved_chunk_streams_reassemble() {
        let audio = RtmpMessage {
            type_id: msg_type::AUDIO,
            stream_id: 1,
            timestamp: 10,
            payload: Bytes::from(vec![0xAAu8; 200]),
        };
        let video = RtmpMessage {
            type_id: msg_type::VIDEO,
            stream_id: 1,
            timestamp: 10,
            payload: Bytes::from(vec![0xBBu8; 200]),
        };

        // Interleave at the chunk level: audio chunk 1, video chunk 1,
        // audio chunk 2, video chunk 2.
        let audio_wire = encode_message(csid::AUDIO, &audio, DEFAULT_CHUNK_SIZE);
        let video_wire = encode_message(csid::VIDEO, &video, DEFAULT_CHUNK_SIZE);
        let audio_split = 1 + 11 + DEFAULT_CHUNK_SIZE;
        let video_split = 1 + 11 + DEFAULT_CHUNK_SIZE;

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&audio_wire[..audio_split]);
        decoder.extend(&video_wire[..video_split]);
        decoder.extend(&audio_wire[audio_split..]);
        decoder.extend(&video_wire[video_split..]);

        let first = decoder.next_message().expect("decode").expect("complete");
        let second = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(first.type_id, msg_type::AUDIO);
        assert!(first.payload.iter().all(|&b| b == 0xAA));
        assert_eq!(second.type_id, msg_type::VIDEO);
        assert!(second.payload.iter().all(|&b| b == 0xBB));
    }

    #[test]
    fn larger_peer_chunk_size_respected() {
        let message = command(5000);
        let wire = encode_message(csid::COMMAND, &message, 4096);

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(4096);
        decoder.extend(&wire);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.payload, message.payload);
    }

    #[test]
    fn extended_timestamp_round_trips() {
        let message = RtmpMessage {
            timestamp: 0x0100_0000,
            ..command(10)
        };
        let wire = encode_message(csid::COMMAND, &message, DEFAULT_CHUNK_SIZE);

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&wire);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.timestamp, 0x0100_0000);
    }

    #[test]
    fn extended_timestamp_repeats_on_continuations() {
        let message = RtmpMessage {
            timestamp: 0x0100_0000,
            ..command(DEFAULT_CHUNK_SIZE * 2 + 5)
        };
        let wire = encode_message(csid::COMMAND, &message, DEFAULT_CHUNK_SIZE);

        let mut decoder = ChunkDecoder::new();
        decoder.extend(&wire);
        let decoded = decoder.next_message().expect("decode").expect("complete");
        assert_eq!(decoded.timestamp, 0x0100_0000);
        assert_eq!(decoded.payload, message.payload);
    }
}
