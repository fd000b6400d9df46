//! Payload builder for protocol data types.
//!
//! The writer only builds payloads; framing into sequence-numbered
//! packets is done by [`PacketCodec`](crate::protocol::PacketCodec).

#![allow(clippy::cast_possible_truncation)]

use crate::protocol::Command;

/// A writer for protocol data.
#[derive(Debug, Default)]
pub struct PacketWriter {
    buffer: Vec<u8>,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Start a command payload with its command byte.
    pub fn command(command: Command) -> Self {
        let mut writer = Self::new();
        writer.write_u8(command as u8);
        writer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16_le(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write the low 3 bytes of `value`.
    pub fn write_u24_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn write_u32_le(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer.
    ///
    /// - below 251: 1 byte
    /// - 0xFC + 2 bytes, 0xFD + 3 bytes, 0xFE + 8 bytes otherwise
    pub fn write_lenenc_int(&mut self, value: u64) {
        if value < 251 {
            self.write_u8(value as u8);
        } else if value < 0x1_0000 {
            self.write_u8(0xFC);
            self.write_u16_le(value as u16);
        } else if value < 0x0100_0000 {
            self.write_u8(0xFD);
            self.write_u24_le(value as u32);
        } else {
            self.write_u8(0xFE);
            self.write_u64_le(value);
        }
    }

    pub fn write_lenenc_string(&mut self, s: &str) {
        self.write_lenenc_bytes(s.as_bytes());
    }

    pub fn write_lenenc_bytes(&mut self, data: &[u8]) {
        self.write_lenenc_int(data.len() as u64);
        self.buffer.extend_from_slice(data);
    }

    pub fn write_null_string(&mut self, s: &str) {
        self.buffer.extend_from_slice(s.as_bytes());
        self.buffer.push(0);
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_zeros(&mut self, count: usize) {
        self.buffer.resize(self.buffer.len() + count, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_lenenc_int_boundaries() {
        let cases: [(u64, &[u8]); 5] = [
            (250, &[250]),
            (251, &[0xFC, 251, 0]),
            (0xFFFF, &[0xFC, 0xFF, 0xFF]),
            (0x1_0000, &[0xFD, 0, 0, 1]),
            (0x0100_0000, &[0xFE, 0, 0, 0, 1, 0, 0, 0, 0]),
        ];
        for (value, expected) in cases {
            let mut writer = PacketWriter::new();
            writer.write_lenenc_int(value);
            assert_eq!(writer.as_bytes(), expected, "value {value}");
        }
    }

    #[test]
    fn test_command_prefix() {
        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(b"SELECT 1");
        assert_eq!(writer.as_bytes()[0], 0x03);
        assert_eq!(&writer.as_bytes()[1..], b"SELECT 1");
    }

    #[test]
    fn test_null_string_and_u24() {
        let mut writer = PacketWriter::new();
        writer.write_null_string("root");
        writer.write_u24_le(0x0012_3456);
        assert_eq!(writer.as_bytes(), b"root\0\x56\x34\x12");
    }
}
