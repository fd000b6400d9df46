//! Packet framing.
//!
//! A logical packet is split into frames of at most [`MAX_PACKET_SIZE`]
//! bytes. A frame shorter than the maximum ends the packet, so a payload
//! whose length is an exact multiple of the maximum is followed by an empty
//! frame. Every frame carries the next sequence number of the exchange;
//! the sequence restarts at zero with each command.

#![allow(clippy::cast_possible_truncation)]

use std::io::{self, Read, Write};
use std::time::Duration;

use dolphin_core::Error;
use dolphin_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};

use super::compress::{CompressionState, EnvelopeError};
use super::{MAX_PACKET_SIZE, PacketHeader};
use crate::config::{SslMode, TlsConfig};
use crate::transport::{Detached, Transport};

/// Append the frames for `payload` to `out`, starting at `sequence`.
///
/// Returns the sequence number following the last frame.
pub fn encode_frames(payload: &[u8], mut sequence: u8, out: &mut Vec<u8>) -> u8 {
    out.reserve(payload.len() + PacketHeader::SIZE * (payload.len() / MAX_PACKET_SIZE + 1));
    let mut offset = 0;
    loop {
        let chunk = (payload.len() - offset).min(MAX_PACKET_SIZE);
        let header = PacketHeader {
            payload_length: chunk as u32,
            sequence_id: sequence,
        };
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload[offset..offset + chunk]);
        sequence = sequence.wrapping_add(1);
        offset += chunk;
        if chunk < MAX_PACKET_SIZE {
            return sequence;
        }
    }
}

/// Read one logical packet, checking and advancing `sequence`.
#[allow(clippy::result_large_err)]
pub fn read_frames<R: Read + ?Sized>(r: &mut R, sequence: &mut u8) -> Result<Vec<u8>, Error> {
    let mut payload = Vec::new();
    let mut first = true;
    loop {
        let mut header = [0u8; PacketHeader::SIZE];
        let got = read_full(r, &mut header)?;
        if got == 0 && first {
            return Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: "server closed the connection".to_string(),
                source: None,
            }));
        }
        if got < PacketHeader::SIZE {
            return Err(framing_error(
                format!("truncated packet header: {got} of 4 bytes"),
                Some(header[..got].to_vec()),
            ));
        }

        let header = PacketHeader::from_bytes(&header);
        if header.sequence_id != *sequence {
            return Err(framing_error(
                format!(
                    "packets out of order: expected sequence {}, got {}",
                    *sequence, header.sequence_id
                ),
                None,
            ));
        }
        *sequence = sequence.wrapping_add(1);

        let len = header.payload_length as usize;
        let start = payload.len();
        payload.resize(start + len, 0);
        let got = read_full(r, &mut payload[start..])?;
        if got < len {
            return Err(framing_error(
                format!("truncated packet: expected {len} bytes, got {got}"),
                None,
            ));
        }

        if len < MAX_PACKET_SIZE {
            return Ok(payload);
        }
        first = false;
    }
}

/// Fill `buf` until it is full or the stream ends; returns the bytes read.
#[allow(clippy::result_large_err)]
fn read_full<R: Read + ?Sized>(r: &mut R, buf: &mut [u8]) -> Result<usize, Error> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_error(e)),
        }
    }
    Ok(filled)
}

fn framing_error(message: String, raw_data: Option<Vec<u8>>) -> Error {
    Error::Protocol(ProtocolError {
        message,
        raw_data,
        source: None,
    })
}

/// Map a transport failure onto the error taxonomy.
pub(crate) fn io_error(e: io::Error) -> Error {
    match e.kind() {
        io::ErrorKind::InvalidData
            if e.get_ref().is_some_and(|inner| inner.is::<EnvelopeError>()) =>
        {
            Error::Protocol(ProtocolError {
                message: e.to_string(),
                raw_data: None,
                source: Some(Box::new(e)),
            })
        }
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout,
        _ => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: format!("connection lost: {e}"),
            source: Some(Box::new(e)),
        }),
    }
}

/// Reads through the compressed layer when it is active.
struct Inbound<'a> {
    io: &'a mut dyn Transport,
    compression: Option<&'a mut CompressionState>,
}

impl Read for Inbound<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.compression.as_deref_mut() {
            Some(state) => match state.read(&mut *self.io, buf) {
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(0),
                other => other,
            },
            None => self.io.read(buf),
        }
    }
}

/// Packet-level I/O over a [`Transport`].
#[derive(Debug)]
pub struct PacketCodec {
    io: Box<dyn Transport>,
    sequence: u8,
    compression: Option<CompressionState>,
}

impl PacketCodec {
    pub fn new(io: Box<dyn Transport>) -> Self {
        Self {
            io,
            sequence: 0,
            compression: None,
        }
    }

    /// Start a new exchange: sequence numbers restart at zero.
    pub fn reset_sequence(&mut self) {
        self.sequence = 0;
        if let Some(state) = &mut self.compression {
            state.reset_sequence();
        }
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Send one logical packet with the current sequence number.
    #[allow(clippy::result_large_err)]
    pub fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut framed = Vec::new();
        self.sequence = encode_frames(payload, self.sequence, &mut framed);
        tracing::trace!(len = payload.len(), next_seq = self.sequence, "packet out");
        match &mut self.compression {
            Some(state) => state.write(&mut *self.io, &framed).map_err(io_error),
            None => {
                self.io.write_all(&framed).map_err(io_error)?;
                self.io.flush().map_err(io_error)
            }
        }
    }

    /// Reset the sequence and send a command packet.
    #[allow(clippy::result_large_err)]
    pub fn write_command(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.reset_sequence();
        self.write_packet(payload)
    }

    /// Read one logical packet.
    #[allow(clippy::result_large_err)]
    pub fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        let mut inbound = Inbound {
            io: &mut *self.io,
            compression: self.compression.as_mut(),
        };
        let payload = read_frames(&mut inbound, &mut self.sequence)?;
        tracing::trace!(len = payload.len(), next_seq = self.sequence, "packet in");
        Ok(payload)
    }

    /// Switch to the compressed protocol after a successful handshake.
    pub fn enable_compression(&mut self) {
        self.compression = Some(CompressionState::new());
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }

    pub fn is_secure(&self) -> bool {
        self.io.is_secure()
    }

    /// Replace the transport with a TLS session over it.
    #[allow(clippy::result_large_err)]
    pub fn upgrade_tls(
        &mut self,
        tls: &TlsConfig,
        server_name: &str,
        mode: SslMode,
    ) -> Result<(), Error> {
        let io = std::mem::replace(&mut self.io, Box::new(Detached));
        self.io = io.upgrade_tls(tls, server_name, mode)?;
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.io.set_read_timeout(timeout).map_err(io_error)
    }

    /// Close the transport; errors are irrelevant at this point.
    pub fn shutdown(&mut self) {
        let _ = self.io.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_lengths(wire: &[u8]) -> Vec<(usize, u8)> {
        let mut out = Vec::new();
        let mut pos = 0;
        while pos < wire.len() {
            let header: [u8; 4] = wire[pos..pos + 4].try_into().unwrap();
            let h = PacketHeader::from_bytes(&header);
            out.push((h.payload_length as usize, h.sequence_id));
            pos += 4 + h.payload_length as usize;
        }
        out
    }

    #[test]
    fn frame_split_and_reassembly_at_boundaries() {
        let max = MAX_PACKET_SIZE;
        let cases: [(usize, Vec<usize>); 6] = [
            (0, vec![0]),
            (1, vec![1]),
            (max - 1, vec![max - 1]),
            (max, vec![max, 0]),
            (max + 1, vec![max, 1]),
            (2 * max, vec![max, max, 0]),
        ];

        for (len, expected_frames) in cases {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let mut wire = Vec::new();
            let next = encode_frames(&payload, 3, &mut wire);

            let frames = frame_lengths(&wire);
            let lengths: Vec<usize> = frames.iter().map(|(l, _)| *l).collect();
            assert_eq!(lengths, expected_frames, "payload length {len}");
            for (i, (_, seq)) in frames.iter().enumerate() {
                assert_eq!(*seq as usize, 3 + i);
            }
            assert_eq!(next as usize, 3 + frames.len());

            let mut seq = 3;
            let decoded = read_frames(&mut Cursor::new(&wire), &mut seq).unwrap();
            assert_eq!(decoded.len(), len);
            assert!(decoded == payload, "payload length {len} did not survive");
            assert_eq!(seq, next);
        }
    }

    #[test]
    fn sequence_mismatch_is_a_framing_error() {
        let mut wire = Vec::new();
        encode_frames(b"\x00\x00\x00\x02\x00\x00\x00", 2, &mut wire);

        let mut seq = 1;
        let err = read_frames(&mut Cursor::new(&wire), &mut seq).unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::ProtocolFraming);
        assert!(err.to_string().contains("expected sequence 1, got 2"));
    }

    #[test]
    fn clean_eof_is_connection_loss() {
        let mut seq = 0;
        let err = read_frames(&mut Cursor::new(Vec::<u8>::new()), &mut seq).unwrap_err();
        assert!(err.is_connection_lost());
    }

    #[test]
    fn truncated_frame_is_a_framing_error() {
        let mut seq = 0;
        let err = read_frames(&mut Cursor::new(vec![5u8, 0, 0, 0, b'a']), &mut seq).unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::ProtocolFraming);

        let mut seq = 0;
        let err = read_frames(&mut Cursor::new(vec![5u8, 0]), &mut seq).unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::ProtocolFraming);
    }

    #[test]
    fn sequence_wraps_after_255() {
        let mut wire = Vec::new();
        let next = encode_frames(b"x", 255, &mut wire);
        assert_eq!(next, 0);
        let mut seq = 255;
        assert_eq!(read_frames(&mut Cursor::new(&wire), &mut seq).unwrap(), b"x");
        assert_eq!(seq, 0);
    }
}
