// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming trace payload builder.
//!
//! A payload is the body of one `/v0.4/traces` request: a msgpack array of
//! trace chunks. Chunks are encoded as they arrive into a single buffer that
//! starts with eight reserved bytes; when the payload is read out, the tail
//! of the reserved region is rewritten with the narrowest array header that
//! fits the chunk count (`fixarray` up to 15, `array16` up to 65535,
//! `array32` beyond) and the bytes stream from there.

use crate::msgpack::encode_chunk;
use crate::span::Span;
use std::fmt;
use std::io::Read;

/// Reserved space for the outer array header. Large enough for any of the
/// three msgpack array encodings.
const HEADER_RESERVED: usize = 8;

/// Hard ceiling on the encoded size. Pushes that would cross it fail and the
/// caller must flush first.
pub const MAX_PAYLOAD_SIZE: usize = 9_500_000;

/// Soft ceiling: crossing it should trigger a flush but the push succeeds.
pub const SOFT_PAYLOAD_SIZE: usize = 5_000_000;

#[derive(Debug, PartialEq)]
pub enum PayloadError {
    /// Appending the chunk would exceed [`MAX_PAYLOAD_SIZE`].
    Full { chunk_size: usize },
    /// The chunk could not be msgpack-encoded.
    Encoding(String),
}

impl fmt::Display for PayloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayloadError::Full { chunk_size } => {
                write!(f, "payload full, cannot fit {chunk_size} more bytes")
            }
            PayloadError::Encoding(msg) => write!(f, "chunk encoding failed: {msg}"),
        }
    }
}

impl std::error::Error for PayloadError {}

/// Size and count snapshot of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadStats {
    /// Bytes the reader would produce right now (header + chunks).
    pub size: usize,
    /// Number of chunks appended since the last clear.
    pub item_count: u32,
}

impl PayloadStats {
    pub fn over_soft_limit(&self) -> bool {
        self.size > SOFT_PAYLOAD_SIZE
    }
}

pub struct Payload {
    /// Reserved header bytes followed by the encoded chunks.
    buffer: Vec<u8>,
    count: u32,
    /// Byte offset the reader has reached, measured in output bytes.
    read_pos: usize,
}

impl Default for Payload {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("size", &self.stats().size)
            .field("item_count", &self.count)
            .finish()
    }
}

fn array_header(count: u32) -> ([u8; 5], usize) {
    let mut bytes = [0u8; 5];
    if count <= 15 {
        bytes[0] = 0x90 | count as u8;
        (bytes, 1)
    } else if count <= u16::MAX as u32 {
        bytes[0] = 0xdc;
        bytes[1..3].copy_from_slice(&(count as u16).to_be_bytes());
        (bytes, 3)
    } else {
        bytes[0] = 0xdd;
        bytes[1..5].copy_from_slice(&count.to_be_bytes());
        (bytes, 5)
    }
}

impl Payload {
    pub fn new() -> Self {
        Payload {
            buffer: vec![0u8; HEADER_RESERVED],
            count: 0,
            read_pos: 0,
        }
    }

    fn header_len(&self) -> usize {
        array_header(self.count).1
    }

    /// Append one encoded trace chunk.
    ///
    /// On error nothing is retained: a `Full` error leaves the payload
    /// exactly as it was so the caller can flush and retry the same chunk.
    pub fn push(&mut self, chunk: &[Span]) -> Result<PayloadStats, PayloadError> {
        let encoded = encode_chunk(chunk).map_err(|e| PayloadError::Encoding(e.to_string()))?;

        let next_count = self.count + 1;
        let next_size =
            array_header(next_count).1 + (self.buffer.len() - HEADER_RESERVED) + encoded.len();
        if next_size > MAX_PAYLOAD_SIZE {
            return Err(PayloadError::Full {
                chunk_size: encoded.len(),
            });
        }

        self.buffer.extend_from_slice(&encoded);
        self.count = next_count;
        Ok(self.stats())
    }

    pub fn stats(&self) -> PayloadStats {
        PayloadStats {
            size: self.header_len() + (self.buffer.len() - HEADER_RESERVED),
            item_count: self.count,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Rewind the reader so the same bytes can be produced again (retry).
    pub fn reset(&mut self) {
        self.read_pos = 0;
    }

    /// Drop all content and start over with an empty payload.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.buffer.resize(HEADER_RESERVED, 0);
        self.count = 0;
        self.read_pos = 0;
    }

    /// Drain the payload into a contiguous body buffer.
    pub fn into_body(mut self) -> Vec<u8> {
        self.reset();
        let mut body = Vec::with_capacity(self.stats().size);
        #[allow(clippy::unwrap_used)]
        self.read_to_end(&mut body).unwrap(); // in-memory read is infallible
        body
    }
}

impl Read for Payload {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        // Write the narrowest header into the tail of the reserved region on
        // every call; the count cannot change while a reader is draining.
        let (header, header_len) = array_header(self.count);
        let start = HEADER_RESERVED - header_len;
        self.buffer[start..HEADER_RESERVED].copy_from_slice(&header[..header_len]);

        let source = &self.buffer[start..];
        let remaining = &source[self.read_pos.min(source.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msgpack::decode_traces;
    use crate::span::Span;

    fn chunk(name: &str) -> Vec<Span> {
        vec![Span {
            name: name.to_string(),
            span_id: 1,
            ..Default::default()
        }]
    }

    #[test]
    fn empty_payload_is_an_empty_array() {
        let mut payload = Payload::new();
        let mut body = Vec::new();
        payload.read_to_end(&mut body).unwrap();
        assert_eq!(body, vec![0x90]);
        assert_eq!(decode_traces(&body).unwrap(), Vec::<Vec<Span>>::new());
    }

    #[test]
    fn size_matches_reader_output() {
        let mut payload = Payload::new();
        for i in 0..20 {
            payload.push(&chunk(&format!("span-{i}"))).unwrap();
        }
        let stats = payload.stats();
        let mut body = Vec::new();
        payload.read_to_end(&mut body).unwrap();
        assert_eq!(stats.size, body.len());
        assert_eq!(stats.item_count, 20);
    }

    #[test]
    fn header_narrows_to_fixarray() {
        let mut payload = Payload::new();
        payload.push(&chunk("a")).unwrap();
        let body = payload.into_body();
        assert_eq!(body[0], 0x91);
        let decoded = decode_traces(&body).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0][0].name, "a");
    }

    #[test]
    fn header_widens_to_array16() {
        let mut payload = Payload::new();
        for _ in 0..16 {
            payload.push(&chunk("x")).unwrap();
        }
        let body = payload.into_body();
        assert_eq!(body[0], 0xdc);
        assert_eq!(u16::from_be_bytes([body[1], body[2]]), 16);
        assert_eq!(decode_traces(&body).unwrap().len(), 16);
    }

    #[test]
    fn reset_replays_the_same_bytes() {
        let mut payload = Payload::new();
        payload.push(&chunk("retry")).unwrap();
        let mut first = Vec::new();
        payload.read_to_end(&mut first).unwrap();
        payload.reset();
        let mut second = Vec::new();
        payload.read_to_end(&mut second).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn clear_starts_from_empty() {
        let mut payload = Payload::new();
        payload.push(&chunk("a")).unwrap();
        payload.clear();
        assert!(payload.is_empty());
        assert_eq!(payload.stats().size, 1); // just the empty fixarray header
    }

    #[test]
    fn push_past_hard_limit_fails_and_rolls_back() {
        let mut payload = Payload::new();
        let big = vec![Span {
            name: "x".repeat(3_000_000),
            ..Default::default()
        }];
        payload.push(&big).unwrap();
        payload.push(&big).unwrap();
        payload.push(&big).unwrap();
        let stats_before = payload.stats();
        assert!(stats_before.over_soft_limit());
        let err = payload.push(&big).unwrap_err();
        assert!(matches!(err, PayloadError::Full { .. }));
        assert_eq!(payload.stats(), stats_before);
        // Still decodable after the failed push.
        let body = payload.into_body();
        assert_eq!(decode_traces(&body).unwrap().len(), 3);
    }

    #[test]
    fn soft_limit_flag() {
        let stats = PayloadStats {
            size: SOFT_PAYLOAD_SIZE + 1,
            item_count: 1,
        };
        assert!(stats.over_soft_limit());
        let stats = PayloadStats {
            size: SOFT_PAYLOAD_SIZE,
            item_count: 1,
        };
        assert!(!stats.over_soft_limit());
    }
}
