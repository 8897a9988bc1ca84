//! Packet framing codec shared by client streams and bridge channels.
//!
//! Wire layout of one frame:
//!
//! ```text
//! +----------------+--------+---------------------------------+
//! | length (u32 BE)| method | payload                         |
//! +----------------+--------+---------------------------------+
//!                  |<------------- length bytes ------------->|
//! ```
//!
//! `method` is `0` for a raw payload and `1` for a zstd-compressed one. The
//! uncompressed payload is the packet id (u32 BE) followed by the body.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

/// Hard upper bound on the length field and on decompressed payloads.
pub const MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Payloads at or below this size are always sent raw.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 256;

const LENGTH_PREFIX: usize = 4;
const METHOD_LEN: usize = 1;
const PACKET_ID_LEN: usize = 4;

/// Compression method byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionMethod {
    Raw = 0,
    Zstd = 1,
}

impl TryFrom<u8> for CompressionMethod {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CompressionMethod::Raw),
            1 => Ok(CompressionMethod::Zstd),
            other => Err(DecodeError::Malformed(format!(
                "unknown compression method {}",
                other
            ))),
        }
    }
}

/// One logical packet: an id plus opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            id,
            body: body.into(),
        }
    }

    fn payload_len(&self) -> usize {
        PACKET_ID_LEN + self.body.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The frame can never become valid; the owning connection must be closed
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("I/O error while reading frame: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("packet of {len} bytes exceeds maximum frame length {max}")]
    TooLarge { len: usize, max: usize },
    #[error("compression failed: {0}")]
    Compression(io::Error),
    #[error("I/O error while writing frame: {0}")]
    Io(#[from] io::Error),
}

/// Stateless frame codec.
///
/// The struct only carries configuration, so one instance can be cloned
/// freely and used from any number of tasks.
#[derive(Debug, Clone)]
pub struct PacketCodec {
    compression_threshold: usize,
    max_frame_length: usize,
    compression_level: i32,
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            max_frame_length: MAX_FRAME_LENGTH,
            compression_level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    #[must_use]
    pub fn with_compression_threshold(mut self, threshold: usize) -> Self {
        self.compression_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max.min(MAX_FRAME_LENGTH);
        self
    }

    pub fn compression_threshold(&self) -> usize {
        self.compression_threshold
    }

    /// Encodes a packet into one complete frame.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::with_capacity(LENGTH_PREFIX + METHOD_LEN + packet.payload_len());
        self.encode_into(packet, &mut dst)?;
        Ok(dst.freeze())
    }

    fn encode_into(&self, packet: &Packet, dst: &mut BytesMut) -> Result<(), EncodeError> {
        let payload_len = packet.payload_len();
        if METHOD_LEN + payload_len > self.max_frame_length {
            return Err(EncodeError::TooLarge {
                len: payload_len,
                max: self.max_frame_length,
            });
        }

        if payload_len > self.compression_threshold {
            let mut payload = Vec::with_capacity(payload_len);
            payload.extend_from_slice(&packet.id.to_be_bytes());
            payload.extend_from_slice(&packet.body);

            let compressed = zstd::bulk::compress(&payload, self.compression_level)
                .map_err(EncodeError::Compression)?;
            // Only worth it when the output is actually smaller.
            if compressed.len() < payload.len() {
                dst.reserve(LENGTH_PREFIX + METHOD_LEN + compressed.len());
                dst.put_u32((METHOD_LEN + compressed.len()) as u32);
                dst.put_u8(CompressionMethod::Zstd as u8);
                dst.put_slice(&compressed);
                return Ok(());
            }
        }

        dst.reserve(LENGTH_PREFIX + METHOD_LEN + payload_len);
        dst.put_u32((METHOD_LEN + payload_len) as u32);
        dst.put_u8(CompressionMethod::Raw as u8);
        dst.put_u32(packet.id);
        dst.put_slice(&packet.body);
        Ok(())
    }

    /// Decodes one complete frame, length prefix included.
    ///
    /// Trailing bytes after the declared length are a protocol error.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet, DecodeError> {
        if frame.len() < LENGTH_PREFIX {
            return Err(DecodeError::Malformed("frame shorter than length prefix".into()));
        }
        let length = self.read_length(frame)?;
        if frame.len() != LENGTH_PREFIX + length {
            return Err(DecodeError::Malformed(format!(
                "frame declares {} bytes but carries {}",
                length,
                frame.len() - LENGTH_PREFIX
            )));
        }
        self.decode_body(&frame[LENGTH_PREFIX..])
    }

    fn read_length(&self, src: &[u8]) -> Result<usize, DecodeError> {
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length == 0 {
            return Err(DecodeError::Malformed("empty frame".into()));
        }
        if length > self.max_frame_length {
            return Err(DecodeError::Malformed(format!(
                "frame length {} exceeds maximum {}",
                length, self.max_frame_length
            )));
        }
        Ok(length)
    }

    /// Decodes the bytes after the length prefix: method byte plus payload.
    fn decode_body(&self, body: &[u8]) -> Result<Packet, DecodeError> {
        let method = CompressionMethod::try_from(body[0])?;
        let payload = &body[METHOD_LEN..];

        let payload = match method {
            CompressionMethod::Raw => Bytes::copy_from_slice(payload),
            CompressionMethod::Zstd => {
                let decompressed = zstd::bulk::decompress(payload, self.max_frame_length)
                    .map_err(|e| DecodeError::Malformed(format!("zstd decompression failed: {}", e)))?;
                Bytes::from(decompressed)
            }
        };

        if payload.len() < PACKET_ID_LEN {
            return Err(DecodeError::Malformed(format!(
                "payload of {} bytes has no packet id",
                payload.len()
            )));
        }
        let mut payload = payload;
        let id = payload.get_u32();
        Ok(Packet { id, body: payload })
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = self.read_length(src)?;
        if src.len() < LENGTH_PREFIX + length {
            src.reserve(LENGTH_PREFIX + length - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let body = src.split_to(length);
        self.decode_body(&body).map(Some)
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = EncodeError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_into(&item, dst)
    }
}
