//! Transport framing and the compression marker.
//!
//! # Frame Format
//!
//! Each frame on the byte stream consists of:
//! - 3 bytes: payload length (big-endian)
//! - N bytes: payload
//!
//! A payload carries exactly one node:
//! - 1 byte: flags (bit 1 = compressed)
//! - M bytes: encoded node, or a compressed body
//!
//! # Compression
//!
//! Encoded nodes larger than the configured threshold (1KB by default) are
//! compressed with LZ4 when that actually makes them smaller. A compressed
//! body starts with the uncompressed length as a 4-byte little-endian
//! integer, which is validated before any buffer is allocated.

use bytes::{Buf, BytesMut};

use crate::binary::{self, BinaryNode, DEFAULT_MAX_DEPTH};
use crate::error::{ProtocolError, Result};

/// Compression threshold in bytes. Nodes larger than this are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum payload size expressible by the length prefix.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Largest node accepted after decompression (16 MB).
pub const MAX_NODE_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size: 3 bytes of length.
pub const FRAME_HEADER_SIZE: usize = 3;

/// Flags leading every frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Flag indicating the node is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0010;

    /// Create a new empty flags set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Create flags from a raw byte value.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Get the raw byte value of the flags.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Check if the compressed flag is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a new flags with compressed set or cleared.
    #[inline]
    pub fn with_compressed(mut self, compressed: bool) -> Self {
        if compressed {
            self.0 |= Self::COMPRESSED;
        } else {
            self.0 &= !Self::COMPRESSED;
        }
        self
    }
}

/// Length-prefix codec for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a codec accepting the largest expressible frames.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a tighter frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Returns the largest accepted payload.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Prefixes a payload with its length.
    pub fn encode(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_frame_size,
            });
        }
        let len = (payload.len() as u32).to_be_bytes();
        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        output.extend_from_slice(&len[1..]);
        output.extend_from_slice(payload);
        Ok(output)
    }

    /// Try to decode one frame, returning None if more data is needed.
    ///
    /// On success returns the payload and the number of bytes consumed.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([0, data[0], data[1], data[2]]) as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let total = FRAME_HEADER_SIZE + len;
        if data.len() < total {
            return Ok(None);
        }
        Ok(Some((data[FRAME_HEADER_SIZE..total].to_vec(), total)))
    }

    /// Decode one complete frame.
    pub fn decode(&self, data: &[u8]) -> Result<(Vec<u8>, usize)> {
        self.try_decode(data)?.ok_or_else(|| {
            ProtocolError::Deserialization(format!(
                "insufficient data for frame: have {} bytes",
                data.len()
            ))
        })
    }
}

/// Reassembles frames from arbitrarily chunked input.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    codec: FrameCodec,
}

impl FrameDecoder {
    /// Create a decoder with the default frame size limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a decoder around a specific codec.
    pub fn with_codec(codec: FrameCodec) -> Self {
        Self {
            buffer: BytesMut::new(),
            codec,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete payload.
    ///
    /// An error means the length prefix itself is unusable; the stream can
    /// no longer be resynchronized.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self.codec.try_decode(&self.buffer)? {
            Some((payload, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

/// Converts nodes to frame payloads and back, applying the compression marker.
#[derive(Debug, Clone)]
pub struct NodeCodec {
    compression_threshold: usize,
    compression_enabled: bool,
    max_depth: usize,
}

impl Default for NodeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCodec {
    /// Create a codec with compression enabled above the default threshold.
    pub fn new() -> Self {
        Self {
            compression_threshold: COMPRESSION_THRESHOLD,
            compression_enabled: true,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }

    /// Create a codec that never compresses outbound nodes.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
            ..Self::new()
        }
    }

    /// Set the size above which outbound nodes are compressed.
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set the maximum nesting depth.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Returns the maximum nesting depth.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Encodes a node into a frame payload (flags byte plus body).
    pub fn encode_payload(&self, node: &BinaryNode) -> Result<Vec<u8>> {
        let encoded = binary::encode_node_with_depth(node, self.max_depth)?;

        if self.compression_enabled && encoded.len() > self.compression_threshold {
            let compressed = lz4_flex::compress_prepend_size(&encoded);
            if compressed.len() < encoded.len() {
                let mut payload = Vec::with_capacity(1 + compressed.len());
                payload.push(FrameFlags::new().with_compressed(true).as_byte());
                payload.extend_from_slice(&compressed);
                return Ok(payload);
            }
        }

        let mut payload = Vec::with_capacity(1 + encoded.len());
        payload.push(FrameFlags::new().as_byte());
        payload.extend_from_slice(&encoded);
        Ok(payload)
    }

    /// Encodes a node into a complete length-prefixed frame.
    pub fn encode_frame(&self, node: &BinaryNode) -> Result<Vec<u8>> {
        FrameCodec::new().encode(&self.encode_payload(node)?)
    }

    /// Decodes a frame payload, decompressing first when flagged.
    pub fn decode_payload(&self, payload: &[u8]) -> Result<BinaryNode> {
        let (&flags, body) = payload
            .split_first()
            .ok_or_else(|| ProtocolError::malformed("empty frame payload"))?;

        if FrameFlags::from_byte(flags).is_compressed() {
            let node_bytes = decompress(body)?;
            binary::decode_node_with_depth(&node_bytes, self.max_depth)
        } else {
            binary::decode_node_with_depth(body, self.max_depth)
        }
    }
}

fn decompress(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 4 {
        return Err(ProtocolError::malformed("compressed body too short"));
    }
    let declared = u32::from_le_bytes([body[0], body[1], body[2], body[3]]) as usize;
    let block = &body[4..];
    // LZ4 cannot expand a block by more than 255x.
    let plausible = block.len().saturating_mul(255).saturating_add(16);
    if declared > MAX_NODE_SIZE || declared > plausible {
        return Err(ProtocolError::malformed(format!(
            "declared uncompressed size {declared} is not plausible"
        )));
    }
    let output = lz4_flex::block::decompress(block, declared)
        .map_err(|e| ProtocolError::malformed(format!("failed to decompress payload: {e}")))?;
    if output.len() != declared {
        return Err(ProtocolError::malformed(format!(
            "decompressed {} bytes, expected {declared}",
            output.len()
        )));
    }
    Ok(output)
}

/// Outcome of decoding one frame from a [`NodeStream`].
#[derive(Debug)]
pub enum Decoded {
    /// A well-formed node.
    Node(BinaryNode),
    /// The frame was intact but its node was not; it has been skipped.
    Dropped(ProtocolError),
}

/// Streaming decoder yielding successive top-level nodes.
#[derive(Debug, Default)]
pub struct NodeStream {
    frames: FrameDecoder,
    codec: NodeCodec,
}

impl NodeStream {
    /// Create a stream decoder from its parts.
    pub fn new(frames: FrameDecoder, codec: NodeCodec) -> Self {
        Self { frames, codec }
    }

    /// Appends received bytes.
    pub fn push(&mut self, chunk: &[u8]) {
        self.frames.extend(chunk);
    }

    /// Returns the next decoded frame, or None if more input is needed.
    ///
    /// Malformed nodes are reported as [`Decoded::Dropped`] without
    /// disturbing later frames; an `Err` means the framing is corrupt.
    pub fn next_node(&mut self) -> Result<Option<Decoded>> {
        let Some(payload) = self.frames.next_frame()? else {
            return Ok(None);
        };
        Ok(Some(match self.codec.decode_payload(&payload) {
            Ok(node) => Decoded::Node(node),
            Err(err) => Decoded::Dropped(err),
        }))
    }
}
