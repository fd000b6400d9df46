//! Compressed protocol envelope.
//!
//! Once `CLIENT_COMPRESS` is negotiated, the byte stream of ordinary frames
//! is carried inside compressed packets with a 7-byte header:
//! - 3 bytes: length of the (possibly compressed) body
//! - 1 byte: compressed sequence number
//! - 3 bytes: uncompressed length, or 0 when the body is stored as-is
//!
//! Bodies are zlib streams.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::protocol::MAX_PACKET_SIZE;

pub const COMPRESSED_HEADER_SIZE: usize = 7;

/// Bodies shorter than this are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

/// Raised inside an `io::Error` of kind `InvalidData` when the envelope is bad.
#[derive(Debug)]
pub enum EnvelopeError {
    Sequence { expected: u8, actual: u8 },
    Inflate(String),
    LengthMismatch { declared: usize, actual: usize },
}

impl std::fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvelopeError::Sequence { expected, actual } => write!(
                f,
                "compressed packet out of order: expected sequence {expected}, got {actual}"
            ),
            EnvelopeError::Inflate(msg) => write!(f, "cannot inflate compressed packet: {msg}"),
            EnvelopeError::LengthMismatch { declared, actual } => write!(
                f,
                "compressed packet inflated to {actual} bytes, header declared {declared}"
            ),
        }
    }
}

impl std::error::Error for EnvelopeError {}

fn invalid(err: EnvelopeError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Encode one compressed packet around `body` (at most `MAX_PACKET_SIZE` bytes).
pub fn encode_envelope(body: &[u8], sequence: u8, out: &mut Vec<u8>) -> io::Result<()> {
    let (stored, uncompressed_len) = if body.len() < MIN_COMPRESS_LENGTH {
        (body.to_vec(), 0)
    } else {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
        encoder.write_all(body)?;
        let deflated = encoder.finish()?;
        if deflated.len() < body.len() {
            (deflated, body.len())
        } else {
            (body.to_vec(), 0)
        }
    };

    out.extend_from_slice(&(stored.len() as u32).to_le_bytes()[..3]);
    out.push(sequence);
    out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
    out.extend_from_slice(&stored);
    Ok(())
}

/// Per-connection state of the compressed layer.
#[derive(Debug, Default)]
pub struct CompressionState {
    sequence: u8,
    inbound: Vec<u8>,
    pos: usize,
}

impl CompressionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new command exchange.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
    }

    /// Wrap already-framed bytes and write them out.
    pub fn write<W: Write + ?Sized>(&mut self, w: &mut W, data: &[u8]) -> io::Result<()> {
        let mut out = Vec::with_capacity(data.len() + COMPRESSED_HEADER_SIZE);
        let mut chunks = data.chunks(MAX_PACKET_SIZE).peekable();
        if chunks.peek().is_none() {
            encode_envelope(&[], self.sequence, &mut out)?;
            self.sequence = self.sequence.wrapping_add(1);
        }
        for chunk in chunks {
            encode_envelope(chunk, self.sequence, &mut out)?;
            self.sequence = self.sequence.wrapping_add(1);
        }
        w.write_all(&out)?;
        w.flush()
    }

    /// Read decompressed bytes, pulling more compressed packets as needed.
    pub fn read<R: Read + ?Sized>(&mut self, r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.inbound.len() {
            self.fill(r)?;
        }
        let n = buf.len().min(self.inbound.len() - self.pos);
        buf[..n].copy_from_slice(&self.inbound[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn fill<R: Read + ?Sized>(&mut self, r: &mut R) -> io::Result<()> {
        let mut header = [0u8; COMPRESSED_HEADER_SIZE];
        r.read_exact(&mut header)?;
        let stored_len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        let sequence = header[3];
        let uncompressed_len = u32::from_le_bytes([header[4], header[5], header[6], 0]) as usize;

        if sequence != self.sequence {
            return Err(invalid(EnvelopeError::Sequence {
                expected: self.sequence,
                actual: sequence,
            }));
        }
        self.sequence = self.sequence.wrapping_add(1);

        let mut body = vec![0u8; stored_len];
        r.read_exact(&mut body)?;

        self.inbound = if uncompressed_len == 0 {
            body
        } else {
            let mut inflated = Vec::with_capacity(uncompressed_len);
            ZlibDecoder::new(body.as_slice())
                .read_to_end(&mut inflated)
                .map_err(|e| invalid(EnvelopeError::Inflate(e.to_string())))?;
            if inflated.len() != uncompressed_len {
                return Err(invalid(EnvelopeError::LengthMismatch {
                    declared: uncompressed_len,
                    actual: inflated.len(),
                }));
            }
            inflated
        };
        self.pos = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn short_bodies_are_stored() {
        let mut out = Vec::new();
        encode_envelope(b"\x01\x00\x00\x00\x0e", 3, &mut out).unwrap();
        assert_eq!(&out[..7], &[5, 0, 0, 3, 0, 0, 0]);
        assert_eq!(&out[7..], b"\x01\x00\x00\x00\x0e");
    }

    #[test]
    fn compressible_bodies_shrink_and_inflate() {
        let body = vec![b'a'; 4096];
        let mut state = CompressionState::new();
        let mut wire = Vec::new();
        state.write(&mut wire, &body).unwrap();
        assert!(wire.len() < body.len());
        assert_eq!(&wire[4..7], &[0x00, 0x10, 0x00]);

        let mut reader = CompressionState::new();
        let mut cursor = Cursor::new(wire);
        let mut out = vec![0u8; body.len()];
        let mut filled = 0;
        while filled < out.len() {
            filled += reader.read(&mut cursor, &mut out[filled..]).unwrap();
        }
        assert_eq!(out, body);
    }

    #[test]
    fn out_of_order_envelope_is_rejected() {
        let mut wire = Vec::new();
        encode_envelope(b"hello", 2, &mut wire).unwrap();
        let mut state = CompressionState::new();
        let err = state
            .read(&mut Cursor::new(wire), &mut [0u8; 5])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("expected sequence 0"));
    }
}
