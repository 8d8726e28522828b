//! Chunked frame codec for the coordinator protocol.
//!
//! A frame on the wire is `[type:u32_le][header_size:u32_le]
//! [chunk_count:u32_le][payload]`. The high bit of the type field is a
//! protocol marker: it is set on every outgoing frame and stripped on
//! receive. `header_size` is reserved and currently always zero.
//!
//! Messages whose total size exceeds [`MAX_CHUNK_SIZE`] are split into
//! `chunk_count` frames that all carry an identical header; the receiver
//! reassembles them in the order they arrive on the same peer. Both
//! transports are reliable, so a missing chunk means the peer went away —
//! the incomplete group is dropped once it has sat around too long.

use std::time::{Duration, Instant};
use thiserror::Error;

/// Marker bit set on the type field of every outgoing frame.
pub const PROTO_MASK: u32 = 0x8000_0000;

/// Fixed size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Per-chunk payload budget used when auto-sizing the chunk count.
pub const MAX_CHUNK_SIZE: usize = 1024;

/// Errors produced while parsing inbound frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// The input is shorter than the 12-byte frame header.
    #[error("frame of {0} bytes is too small for the {FRAME_HEADER_LEN}-byte header")]
    MalformedFrame(usize),

    /// The header declares zero chunks, which no writer ever emits.
    #[error("frame declares zero chunks")]
    ZeroChunks,
}

/// One decoded wire frame — either a whole message or one chunk of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message type with the protocol marker already stripped.
    pub msg_type: u32,
    /// Number of frames the full message was split into (>= 1).
    pub chunk_count: u32,
    /// This frame's slice of the message payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Parses a single frame, stripping the protocol marker from the type.
    ///
    /// A short input yields [`CodecError::MalformedFrame`]; the caller
    /// discards the frame but keeps the session open.
    pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
        if data.len() < FRAME_HEADER_LEN {
            return Err(CodecError::MalformedFrame(data.len()));
        }

        let msg_type = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) & !PROTO_MASK;
        // data[4..8] is the reserved header_size field, always zero today.
        let chunk_count = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
        if chunk_count == 0 {
            return Err(CodecError::ZeroChunks);
        }

        Ok(Frame {
            msg_type,
            chunk_count,
            payload: data[FRAME_HEADER_LEN..].to_vec(),
        })
    }
}

/// Encodes `payload` into one or more framed byte buffers.
///
/// `chunks == 0` auto-sizes: enough chunks that each stays within
/// [`MAX_CHUNK_SIZE`], with a floor of one, so payloads up to 1024 bytes
/// ship as a single frame. An explicit `chunks >= 1` forces that exact
/// split. Every emitted frame repeats the same header.
pub fn encode_frames(msg_type: u32, payload: &[u8], chunks: u32) -> Vec<Vec<u8>> {
    let chunks = if chunks == 0 {
        auto_chunk_count(payload.len())
    } else {
        chunks
    };

    let chunk_size = (payload.len() + chunks as usize - 1) / chunks.max(1) as usize;
    let mut frames = Vec::with_capacity(chunks as usize);

    for i in 0..chunks as usize {
        let start = (i * chunk_size).min(payload.len());
        let end = (start + chunk_size).min(payload.len());

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + (end - start));
        frame.extend_from_slice(&(msg_type | PROTO_MASK).to_le_bytes());
        frame.extend_from_slice(&0u32.to_le_bytes()); // reserved header size
        frame.extend_from_slice(&chunks.to_le_bytes());
        frame.extend_from_slice(&payload[start..end]);
        frames.push(frame);
    }

    frames
}

// The auto-sizer counts the type and header-size fields plus the payload;
// the chunk-count field is not part of the total. Preserved as-is for wire
// compatibility with existing peers.
fn auto_chunk_count(payload_len: usize) -> u32 {
    let total = 8 + payload_len;
    ((total + MAX_CHUNK_SIZE - 1) / MAX_CHUNK_SIZE).max(1) as u32
}

/// Reassembles chunked messages arriving on a single peer.
///
/// One assembler per peer; chunks of a group must arrive back to back,
/// which both transports guarantee for a well-behaved sender. A frame that
/// does not belong to the in-flight group preempts it.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    msg_type: u32,
    expected: u32,
    received: u32,
    buffer: Vec<u8>,
    started: Option<Instant>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one frame; returns `(msg_type, payload)` once the message is
    /// complete. Single-chunk frames complete immediately.
    pub fn push(&mut self, frame: Frame) -> Option<(u32, Vec<u8>)> {
        if frame.chunk_count <= 1 {
            self.reset();
            return Some((frame.msg_type, frame.payload));
        }

        let matches_group = self.started.is_some()
            && frame.msg_type == self.msg_type
            && frame.chunk_count == self.expected;
        if !matches_group {
            self.reset();
            self.msg_type = frame.msg_type;
            self.expected = frame.chunk_count;
            self.started = Some(Instant::now());
        }

        self.buffer.extend_from_slice(&frame.payload);
        self.received += 1;

        if self.received >= self.expected {
            let msg_type = self.msg_type;
            let payload = std::mem::take(&mut self.buffer);
            self.reset();
            return Some((msg_type, payload));
        }
        None
    }

    /// Drops the in-flight group if it has been incomplete longer than
    /// `timeout`. Returns true when something was discarded.
    pub fn expire(&mut self, timeout: Duration) -> bool {
        match self.started {
            Some(started) if started.elapsed() > timeout => {
                self.reset();
                true
            }
            _ => false,
        }
    }

    fn reset(&mut self) {
        self.msg_type = 0;
        self.expected = 0;
        self.received = 0;
        self.buffer.clear();
        self.started = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassemble(frames: &[Vec<u8>]) -> Option<(u32, Vec<u8>)> {
        let mut assembler = FrameAssembler::new();
        let mut out = None;
        for bytes in frames {
            let frame = Frame::decode(bytes).unwrap();
            out = assembler.push(frame);
        }
        out
    }

    #[test]
    fn single_frame_roundtrip() {
        let payload = b"hello coordinator".to_vec();
        let frames = encode_frames(6006, &payload, 0);
        assert_eq!(frames.len(), 1);

        let frame = Frame::decode(&frames[0]).unwrap();
        assert_eq!(frame.msg_type, 6006);
        assert_eq!(frame.chunk_count, 1);
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn outgoing_frames_carry_proto_marker() {
        let frames = encode_frames(9109, b"x", 0);
        let raw_type = u32::from_le_bytes(frames[0][0..4].try_into().unwrap());
        assert_eq!(raw_type & PROTO_MASK, PROTO_MASK);
        assert_eq!(raw_type & !PROTO_MASK, 9109);
    }

    #[test]
    fn chunk_sizes_for_2500_bytes_in_three_chunks() {
        let payload = vec![7u8; 2500];
        let frames = encode_frames(6008, &payload, 3);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), 12 + 834);
        assert_eq!(frames[1].len(), 12 + 834);
        assert_eq!(frames[2].len(), 12 + 832);

        let (msg_type, reassembled) = reassemble(&frames).unwrap();
        assert_eq!(msg_type, 6008);
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn auto_chunking_splits_large_payloads() {
        // 8 header-ish bytes + 3000 payload bytes => 3 chunks
        let payload = vec![1u8; 3000];
        let frames = encode_frames(6014, &payload, 0);
        assert_eq!(frames.len(), 3);

        let (_, reassembled) = reassemble(&frames).unwrap();
        assert_eq!(reassembled, payload);
    }

    #[test]
    fn payloads_at_the_single_frame_boundary() {
        // GetTotalSize-style accounting: 1016 payload bytes + 8 = 1024
        let frames = encode_frames(1, &vec![0u8; 1016], 0);
        assert_eq!(frames.len(), 1);

        let frames = encode_frames(1, &vec![0u8; 1017], 0);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn roundtrip_across_chunk_counts() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        for k in 1..=9u32 {
            let frames = encode_frames(42, &payload, k);
            assert_eq!(frames.len(), k as usize);
            let (msg_type, reassembled) = reassemble(&frames).unwrap();
            assert_eq!(msg_type, 42);
            assert_eq!(reassembled, payload, "chunk count {}", k);
        }
    }

    #[test]
    fn empty_payload_roundtrip() {
        let frames = encode_frames(3, &[], 0);
        assert_eq!(frames.len(), 1);
        let frame = Frame::decode(&frames[0]).unwrap();
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn short_input_is_malformed() {
        assert_eq!(Frame::decode(&[0u8; 11]), Err(CodecError::MalformedFrame(11)));
        assert_eq!(Frame::decode(&[]), Err(CodecError::MalformedFrame(0)));
    }

    #[test]
    fn zero_chunk_header_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(5u32 | PROTO_MASK).to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        assert_eq!(Frame::decode(&bytes), Err(CodecError::ZeroChunks));
    }

    #[test]
    fn new_group_preempts_incomplete_one() {
        let mut assembler = FrameAssembler::new();

        let stale = encode_frames(10, &vec![1u8; 3000], 3);
        let frame = Frame::decode(&stale[0]).unwrap();
        assert!(assembler.push(frame).is_none());

        // A different message type starts over; the stale bytes are gone.
        let fresh_payload = vec![2u8; 2048];
        let fresh = encode_frames(11, &fresh_payload, 2);
        assert!(assembler.push(Frame::decode(&fresh[0]).unwrap()).is_none());
        let (msg_type, payload) = assembler
            .push(Frame::decode(&fresh[1]).unwrap())
            .expect("second chunk completes the group");
        assert_eq!(msg_type, 11);
        assert_eq!(payload, fresh_payload);
    }

    #[test]
    fn incomplete_group_expires() {
        let mut assembler = FrameAssembler::new();
        let frames = encode_frames(10, &vec![1u8; 3000], 3);
        assembler.push(Frame::decode(&frames[0]).unwrap());

        assert!(!assembler.expire(Duration::from_secs(60)));
        assert!(assembler.expire(Duration::from_secs(0)));
        // Nothing left to expire afterwards.
        assert!(!assembler.expire(Duration::from_secs(0)));
    }
}
