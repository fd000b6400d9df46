//! Cursor over a packet payload.
//!
//! Every read returns `None` when the payload is too short, so callers turn
//! truncation into a protocol error at the point where context is known.

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::{EofPacket, ErrPacket, OkPacket};

/// A reader for protocol data types.
#[derive(Debug)]
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        bytes.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(|[b]| b)
    }

    pub fn read_u16_le(&mut self) -> Option<u16> {
        self.read_array().map(u16::from_le_bytes)
    }

    /// Read a 3-byte little-endian integer.
    pub fn read_u24_le(&mut self) -> Option<u32> {
        self.read_array::<3>()
            .map(|[a, b, c]| u32::from_le_bytes([a, b, c, 0]))
    }

    pub fn read_u32_le(&mut self) -> Option<u32> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_u64_le(&mut self) -> Option<u64> {
        self.read_array().map(u64::from_le_bytes)
    }

    pub fn read_i8(&mut self) -> Option<i8> {
        self.read_array().map(i8::from_le_bytes)
    }

    pub fn read_i16_le(&mut self) -> Option<i16> {
        self.read_array().map(i16::from_le_bytes)
    }

    pub fn read_i32_le(&mut self) -> Option<i32> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Option<i64> {
        self.read_array().map(i64::from_le_bytes)
    }

    pub fn read_f32_le(&mut self) -> Option<f32> {
        self.read_array().map(f32::from_le_bytes)
    }

    pub fn read_f64_le(&mut self) -> Option<f64> {
        self.read_array().map(f64::from_le_bytes)
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the value itself
    /// - 0xFC / 0xFD / 0xFE: 2, 3 or 8 byte value follows
    /// - 0xFB: NULL marker (returns `None`)
    pub fn read_lenenc_int(&mut self) -> Option<u64> {
        match self.read_u8()? {
            first @ 0x00..=0xFA => Some(u64::from(first)),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFB | 0xFF => None,
        }
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Option<&'a [u8]> {
        let len = usize::try_from(self.read_lenenc_int()?).ok()?;
        self.read_bytes(len)
    }

    /// Read a length-encoded string (lossy UTF-8).
    pub fn read_lenenc_string(&mut self) -> Option<String> {
        self.read_lenenc_bytes()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read a null-terminated byte run. A missing terminator consumes the rest.
    pub fn read_null_bytes(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        match rest.iter().position(|&b| b == 0) {
            Some(end) => {
                self.pos += end + 1;
                &rest[..end]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }

    /// Read a null-terminated string.
    pub fn read_null_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_null_bytes()).into_owned()
    }

    /// Read a fixed-length string.
    pub fn read_string(&mut self, len: usize) -> Option<String> {
        self.read_bytes(len)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = self.data.get(self.pos..).unwrap_or_default();
        self.pos = self.data.len();
        rest
    }

    /// Skip `n` bytes; false if fewer remain.
    pub fn skip(&mut self, n: usize) -> bool {
        self.read_bytes(n).is_some()
    }

    /// Parse an OK packet (leading 0x00 or 0xFE marker optional).
    ///
    /// - affected_rows: lenenc int
    /// - last_insert_id: lenenc int
    /// - status_flags: 2 bytes
    /// - warnings: 2 bytes
    /// - info: rest of packet
    pub fn parse_ok_packet(&mut self) -> Option<OkPacket> {
        if matches!(self.peek(), Some(0x00 | 0xFE)) {
            self.skip(1);
        }

        let affected_rows = self.read_lenenc_int()?;
        let last_insert_id = self.read_lenenc_int()?;
        let status_flags = self.read_u16_le()?;
        let warnings = self.read_u16_le()?;
        let info = self.read_rest_string();

        Some(OkPacket {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            info,
        })
    }

    /// Parse an Error packet.
    ///
    /// - 0xFF marker
    /// - error_code: 2 bytes
    /// - '#' then 5-byte SQL state (protocol 4.1)
    /// - message: rest of packet
    pub fn parse_err_packet(&mut self) -> Option<ErrPacket> {
        if self.peek() == Some(0xFF) {
            self.skip(1);
        }

        let error_code = self.read_u16_le()?;
        let sql_state = if self.peek() == Some(b'#') {
            self.skip(1);
            self.read_string(5)?
        } else {
            String::new()
        };
        let error_message = self.read_rest_string();

        Some(ErrPacket {
            error_code,
            sql_state,
            error_message,
        })
    }

    /// Parse an EOF packet: 0xFE, warnings (2), status flags (2).
    pub fn parse_eof_packet(&mut self) -> Option<EofPacket> {
        if self.peek() == Some(0xFE) {
            self.skip(1);
        }

        let warnings = self.read_u16_le()?;
        let status_flags = self.read_u16_le()?;

        Some(EofPacket {
            warnings,
            status_flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_width_integers() {
        let mut reader = PacketReader::new(&[0x42, 0x34, 0x12, 0x56, 0x34, 0x12]);
        assert_eq!(reader.read_u8(), Some(0x42));
        assert_eq!(reader.read_u16_le(), Some(0x1234));
        assert_eq!(reader.read_u24_le(), Some(0x0012_3456));
        assert_eq!(reader.read_u8(), None);
    }

    #[test]
    fn test_read_lenenc_int() {
        assert_eq!(PacketReader::new(&[0x42]).read_lenenc_int(), Some(0x42));
        assert_eq!(
            PacketReader::new(&[0xFC, 0x34, 0x12]).read_lenenc_int(),
            Some(0x1234)
        );
        assert_eq!(
            PacketReader::new(&[0xFD, 0x56, 0x34, 0x12]).read_lenenc_int(),
            Some(0x0012_3456)
        );
        assert_eq!(
            PacketReader::new(&[0xFE, 1, 0, 0, 0, 0, 0, 0, 0]).read_lenenc_int(),
            Some(1)
        );
        assert_eq!(PacketReader::new(&[0xFB]).read_lenenc_int(), None);
    }

    #[test]
    fn test_truncated_lenenc_string() {
        let mut reader = PacketReader::new(&[0x05, b'a', b'b']);
        assert_eq!(reader.read_lenenc_string(), None);
    }

    #[test]
    fn test_null_string_without_terminator() {
        let mut reader = PacketReader::new(b"abc\0def");
        assert_eq!(reader.read_null_string(), "abc");
        assert_eq!(reader.read_null_string(), "def");
        assert!(reader.is_empty());
    }

    #[test]
    fn test_parse_ok_packet() {
        let data = [0x00, 0x05, 0x0A, 0x03, 0x00, 0x01, 0x00];
        let ok = PacketReader::new(&data).parse_ok_packet().unwrap();
        assert_eq!(ok.affected_rows, 5);
        assert_eq!(ok.last_insert_id, 10);
        assert_eq!(ok.status_flags, 0x0003);
        assert_eq!(ok.warnings, 1);
        assert!(ok.info.is_empty());
    }

    #[test]
    fn test_parse_err_packet() {
        let mut data = vec![0xFF, 0x26, 0x04, b'#'];
        data.extend_from_slice(b"23000");
        data.extend_from_slice(b"Duplicate entry");
        let err = PacketReader::new(&data).parse_err_packet().unwrap();
        assert_eq!(err.error_code, 1062);
        assert_eq!(err.sql_state, "23000");
        assert_eq!(err.error_message, "Duplicate entry");
    }

    #[test]
    fn test_parse_eof_packet() {
        let eof = PacketReader::new(&[0xFE, 0x02, 0x00, 0x08, 0x00])
            .parse_eof_packet()
            .unwrap();
        assert_eq!(eof.warnings, 2);
        assert_eq!(eof.status_flags, 0x0008);
    }
}
