//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte big-endian unsigned length `N` followed by exactly
//! `N` payload bytes. No padding, no checksum.
//!
//! The deframer keeps the received chunks in a queue instead of one
//! contiguous buffer, so a partial read never forces a copy of everything
//! buffered so far. A payload is only assembled (and only copied when it
//! straddles chunks) once all of its bytes have arrived.

use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::Encoder;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors produced while framing or deframing.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Announced frame length exceeds the configured maximum.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// Payload cannot be represented behind a 32-bit length prefix.
    #[error("payload of {0} bytes does not fit a 32-bit length prefix")]
    PayloadTooLong(usize),

    /// Frame arrived complete but its content is not a valid message.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// Underlying transport failure while writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One complete, length-delimited unit from the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Bytes);

impl Frame {
    /// Payload bytes, without the length prefix.
    pub fn payload(&self) -> &Bytes {
        &self.0
    }

    pub fn into_payload(self) -> Bytes {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Incremental frame decoder and encoder.
///
/// Call [`feed`](Self::feed) with every chunk read from the transport, then
/// [`pull`](Self::pull) until it returns `Ok(None)`. Chunk boundaries may fall
/// anywhere relative to frame boundaries.
#[derive(Debug, Default)]
pub struct FrameCodec {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    max_frame_len: Option<usize>,
    /// Payload bytes of a rejected oversized frame still to be skipped.
    discarding: usize,
}

impl FrameCodec {
    /// Create a codec without a frame size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a codec rejecting frames larger than `max` payload bytes.
    pub fn with_max_frame_len(max: usize) -> Self {
        Self {
            max_frame_len: Some(max),
            ..Self::default()
        }
    }

    /// Create a codec from an optional limit, as read from configuration.
    pub fn with_limit(max: Option<usize>) -> Self {
        Self {
            max_frame_len: max,
            ..Self::default()
        }
    }

    /// Number of bytes received but not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Append a chunk of received bytes.
    pub fn feed(&mut self, chunk: impl Into<Bytes>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        self.buffered += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Dequeue the next complete frame, in arrival order.
    ///
    /// Returns `Ok(None)` when more input is needed; nothing is consumed in
    /// that case. An oversized frame is reported once, after which its
    /// payload is skipped as it arrives.
    pub fn pull(&mut self) -> Result<Option<Frame>, FramingError> {
        self.skip_discarded();
        if self.discarding > 0 {
            return Ok(None);
        }

        let Some(prefix) = self.peek_prefix() else {
            return Ok(None);
        };
        let len = u32::from_be_bytes(prefix) as usize;

        if let Some(max) = self.max_frame_len {
            if len > max {
                self.consume(LENGTH_PREFIX_LEN);
                self.discarding = len;
                self.skip_discarded();
                return Err(FramingError::FrameTooLarge { len, max });
            }
        }

        // The prefix stays buffered until the whole payload is here.
        if self.buffered < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }

        self.consume(LENGTH_PREFIX_LEN);
        Ok(Some(Frame(self.take(len))))
    }

    fn peek_prefix(&self) -> Option<[u8; LENGTH_PREFIX_LEN]> {
        if self.buffered < LENGTH_PREFIX_LEN {
            return None;
        }

        let mut prefix = [0u8; LENGTH_PREFIX_LEN];
        let mut filled = 0;
        for chunk in &self.chunks {
            let n = (LENGTH_PREFIX_LEN - filled).min(chunk.len());
            prefix[filled..filled + n].copy_from_slice(&chunk[..n]);
            filled += n;
            if filled == LENGTH_PREFIX_LEN {
                break;
            }
        }
        Some(prefix)
    }

    /// Drop `n` buffered bytes. Caller guarantees `n <= self.buffered`.
    fn consume(&mut self, mut n: usize) {
        self.buffered -= n;
        while n > 0 {
            let Some(front) = self.chunks.front_mut() else {
                break;
            };
            if front.len() > n {
                front.advance(n);
                n = 0;
            } else {
                n -= front.len();
                self.chunks.pop_front();
            }
        }
    }

    /// Remove and return `n` buffered bytes. Caller guarantees `n <= self.buffered`.
    fn take(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }

        // Zero-copy when the payload sits inside the front chunk.
        if let Some(front) = self.chunks.front_mut() {
            if front.len() >= n {
                let payload = front.split_to(n);
                if front.is_empty() {
                    self.chunks.pop_front();
                }
                self.buffered -= n;
                return payload;
            }
        }

        let mut payload = BytesMut::with_capacity(n);
        let mut left = n;
        while left > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };
            if chunk.len() > left {
                payload.extend_from_slice(&chunk.split_to(left));
                self.chunks.push_front(chunk);
                left = 0;
            } else {
                left -= chunk.len();
                payload.extend_from_slice(&chunk);
            }
        }
        self.buffered -= n;
        payload.freeze()
    }

    fn skip_discarded(&mut self) {
        let n = self.discarding.min(self.buffered);
        if n > 0 {
            self.consume(n);
            self.discarding -= n;
            tracing::trace!(skipped = n, remaining = self.discarding, "Skipping oversized frame bytes");
        }
    }
}

/// Write one frame (length prefix + payload) into `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) -> Result<(), FramingError> {
    let len = u32::try_from(payload.len()).map_err(|_| FramingError::PayloadTooLong(payload.len()))?;
    dst.reserve(LENGTH_PREFIX_LEN + payload.len());
    dst.put_u32(len);
    dst.extend_from_slice(payload);
    Ok(())
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if let Some(max) = self.max_frame_len {
            if item.len() > max {
                return Err(FramingError::FrameTooLarge { len: item.len(), max });
            }
        }
        encode_frame(&item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(payloads: &[&[u8]]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for payload in payloads {
            encode_frame(payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn drain(codec: &mut FrameCodec) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.pull().unwrap() {
            frames.push(frame.into_payload());
        }
        frames
    }

    #[test]
    fn prefix_split_across_two_chunks() {
        let mut codec = FrameCodec::new();

        codec.feed(&b"\x00\x00"[..]);
        assert!(codec.pull().unwrap().is_none());
        assert_eq!(codec.buffered(), 2);

        codec.feed(&b"\x00\x05hello"[..]);
        let frame = codec.pull().unwrap().expect("one frame");
        assert_eq!(frame.payload().as_ref(), b"hello");
        assert!(codec.pull().unwrap().is_none());
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn incomplete_payload_keeps_prefix_buffered() {
        let mut codec = FrameCodec::new();
        codec.feed(&b"\x00\x00\x00\x05hel"[..]);
        assert!(codec.pull().unwrap().is_none());
        assert_eq!(codec.buffered(), 7);

        codec.feed(&b"lo"[..]);
        assert_eq!(drain(&mut codec), vec![Bytes::from_static(b"hello")]);
    }

    #[test]
    fn every_split_offset_yields_same_frames() {
        let payloads: [&[u8]; 4] = [b"hello", b"", b"a somewhat longer payload", b"x"];
        let stream = encoded(&payloads);

        let mut whole = FrameCodec::new();
        whole.feed(stream.clone());
        let expected = drain(&mut whole);
        assert_eq!(expected.len(), payloads.len());

        for split in 0..=stream.len() {
            let mut codec = FrameCodec::new();
            let mut frames = Vec::new();
            codec.feed(stream[..split].to_vec());
            frames.extend(drain(&mut codec));
            codec.feed(stream[split..].to_vec());
            frames.extend(drain(&mut codec));
            assert_eq!(frames, expected, "split at offset {split}");
            assert_eq!(codec.buffered(), 0);
        }
    }

    #[test]
    fn arbitrary_chunk_sizes_preserve_order() {
        let payloads: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i; usize::from(i) * 3]).collect();
        let refs: Vec<&[u8]> = payloads.iter().map(Vec::as_slice).collect();
        let stream = encoded(&refs);

        for chunk_size in [1, 2, 3, 5, 7, 64, stream.len()] {
            let mut codec = FrameCodec::new();
            let mut frames = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                codec.feed(chunk.to_vec());
                frames.extend(drain(&mut codec));
            }
            let frames: Vec<Vec<u8>> = frames.into_iter().map(|b| b.to_vec()).collect();
            assert_eq!(frames, payloads, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn oversized_frame_is_skipped_and_stream_resumes() {
        let mut codec = FrameCodec::with_max_frame_len(8);
        let stream = encoded(&[b"this payload is too long", b"ok"]);

        // Deliver in two pieces so the discard spans a feed boundary.
        codec.feed(stream[..10].to_vec());
        match codec.pull() {
            Err(FramingError::FrameTooLarge { len, max }) => {
                assert_eq!(len, 24);
                assert_eq!(max, 8);
            }
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
        assert!(codec.pull().unwrap().is_none());

        codec.feed(stream[10..].to_vec());
        assert_eq!(drain(&mut codec), vec![Bytes::from_static(b"ok")]);
    }

    #[test]
    fn encoder_writes_big_endian_prefix() {
        let mut codec = FrameCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut dst).unwrap();
        assert_eq!(&dst[..], b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn encoder_respects_limit() {
        let mut codec = FrameCodec::with_max_frame_len(2);
        let mut dst = BytesMut::new();
        let err = codec.encode(Bytes::from_static(b"hello"), &mut dst).unwrap_err();
        assert!(matches!(err, FramingError::FrameTooLarge { len: 5, max: 2 }));
        assert!(dst.is_empty());
    }
}
