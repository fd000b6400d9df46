//! Column metadata and value conversion.
//!
//! Text-protocol rows carry every value as a string; binary-protocol rows
//! use a fixed encoding per field type. Both decode into [`Value`] using the
//! column definition (type, unsigned flag, character set). Client-side
//! parameter interpolation for emulated statements also lives here.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

use dolphin_core::error::{StatementError, StatementErrorKind};
use dolphin_core::temporal::{self, MICROS_PER_DAY, MICROS_PER_SECOND};
use dolphin_core::{Error, Value};

use crate::protocol::charset;
use crate::protocol::{PacketReader, PacketWriter};

/// MySQL field type codes (`MYSQL_TYPE_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Unknown codes are treated as strings.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFF => FieldType::Geometry,
            _ => FieldType::String,
        }
    }

    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    /// Types whose values may be binary or text depending on the charset.
    #[must_use]
    pub const fn is_string_like(self) -> bool {
        matches!(
            self,
            FieldType::VarChar
                | FieldType::VarString
                | FieldType::String
                | FieldType::Enum
                | FieldType::Set
                | FieldType::TinyBlob
                | FieldType::MediumBlob
                | FieldType::LongBlob
                | FieldType::Blob
        )
    }

    #[must_use]
    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const BINARY: u16 = 128;
    pub const AUTO_INCREMENT: u16 = 512;
}

/// Column definition from a result set or prepare response.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub schema: String,
    /// Table name or alias
    pub table: String,
    /// Column name or alias
    pub name: String,
    pub org_name: String,
    pub charset: u16,
    pub column_length: u32,
    pub column_type: FieldType,
    pub flags: u16,
    pub decimals: u8,
}

impl ColumnDef {
    /// Parse a column definition packet (protocol 4.1).
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let mut reader = PacketReader::new(payload);
        let _catalog = reader.read_lenenc_bytes()?;
        let schema = reader.read_lenenc_string()?;
        let table = reader.read_lenenc_string()?;
        let _org_table = reader.read_lenenc_bytes()?;
        let name = reader.read_lenenc_string()?;
        let org_name = reader.read_lenenc_string()?;
        let _fixed_len = reader.read_lenenc_int()?;
        let charset = reader.read_u16_le()?;
        let column_length = reader.read_u32_le()?;
        let column_type = FieldType::from_u8(reader.read_u8()?);
        let flags = reader.read_u16_le()?;
        let decimals = reader.read_u8()?;

        Some(Self {
            schema,
            table,
            name,
            org_name,
            charset,
            column_length,
            column_type,
            flags,
            decimals,
        })
    }

    #[must_use]
    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    #[must_use]
    pub const fn is_not_null(&self) -> bool {
        self.flags & column_flags::NOT_NULL != 0
    }

    /// Byte-valued rather than character-valued.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self.column_type, FieldType::Bit | FieldType::Geometry)
            || (self.column_type.is_string_like() && self.charset == u16::from(charset::BINARY))
    }
}

fn text_or(text: &str, parsed: Option<Value>) -> Value {
    parsed.unwrap_or_else(|| Value::Text(text.to_string()))
}

/// Decode a text-protocol value.
///
/// Zero dates (`0000-00-00`, with or without a time part) have no calendar
/// value and decode as [`Value::Null`].
pub fn decode_text_value(column: &ColumnDef, data: &[u8]) -> Value {
    if column.is_binary() {
        return Value::Bytes(data.to_vec());
    }
    let text = String::from_utf8_lossy(data);
    let unsigned = column.is_unsigned();

    match column.column_type {
        FieldType::Tiny if unsigned => text_or(&text, text.parse::<u8>().ok().map(|v| Value::SmallInt(i16::from(v)))),
        FieldType::Tiny => text_or(&text, text.parse().ok().map(Value::TinyInt)),
        FieldType::Short if unsigned => text_or(&text, text.parse::<u16>().ok().map(|v| Value::Int(i32::from(v)))),
        FieldType::Short | FieldType::Year => text_or(&text, text.parse().ok().map(Value::SmallInt)),
        FieldType::Long | FieldType::Int24 if unsigned => {
            text_or(&text, text.parse::<u32>().ok().map(|v| Value::BigInt(i64::from(v))))
        }
        FieldType::Long | FieldType::Int24 => text_or(&text, text.parse().ok().map(Value::Int)),
        FieldType::LongLong if unsigned => text_or(&text, text.parse().ok().map(Value::from_u64)),
        FieldType::LongLong => text_or(&text, text.parse().ok().map(Value::BigInt)),
        FieldType::Float => text_or(&text, text.parse().ok().map(Value::Float)),
        FieldType::Double => text_or(&text, text.parse().ok().map(Value::Double)),
        FieldType::Decimal | FieldType::NewDecimal => Value::Decimal(text.into_owned()),
        FieldType::Json => text_or(&text, serde_json::from_str(&text).ok().map(Value::Json)),
        FieldType::Null => Value::Null,
        FieldType::Date | FieldType::NewDate => {
            if is_zero_date(&text) {
                Value::Null
            } else {
                text_or(&text, temporal::parse_date(&text).map(Value::Date))
            }
        }
        FieldType::DateTime | FieldType::Timestamp | FieldType::DateTime2 | FieldType::Timestamp2 => {
            if is_zero_date(&text) {
                Value::Null
            } else {
                text_or(&text, temporal::parse_timestamp(&text).map(Value::Timestamp))
            }
        }
        FieldType::Time | FieldType::Time2 => text_or(&text, temporal::parse_time(&text).map(Value::Time)),
        _ => Value::Text(text.into_owned()),
    }
}

fn is_zero_date(text: &str) -> bool {
    text.starts_with("0000-00-00")
}

/// Decode the values of a binary-protocol row (payload includes the 0x00 header).
///
/// As in the text protocol, zero dates decode as [`Value::Null`]. The server
/// sends them as zero-length DATE/DATETIME bodies or with a zero month or day.
pub fn decode_binary_row(columns: &[ColumnDef], payload: &[u8]) -> Option<Vec<Value>> {
    let mut reader = PacketReader::new(payload);
    reader.read_u8()?;
    let bitmap = reader.read_bytes((columns.len() + 7 + 2) / 8)?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(Value::Null);
        } else {
            values.push(decode_binary_value(&mut reader, column)?);
        }
    }
    Some(values)
}

fn decode_binary_value(reader: &mut PacketReader<'_>, column: &ColumnDef) -> Option<Value> {
    let unsigned = column.is_unsigned();
    Some(match column.column_type {
        FieldType::Tiny if unsigned => Value::SmallInt(i16::from(reader.read_u8()?)),
        FieldType::Tiny => Value::TinyInt(reader.read_i8()?),
        FieldType::Short if unsigned => Value::Int(i32::from(reader.read_u16_le()?)),
        FieldType::Short | FieldType::Year => Value::SmallInt(reader.read_i16_le()?),
        FieldType::Long | FieldType::Int24 if unsigned => {
            Value::BigInt(i64::from(reader.read_u32_le()?))
        }
        FieldType::Long | FieldType::Int24 => Value::Int(reader.read_i32_le()?),
        FieldType::LongLong if unsigned => Value::from_u64(reader.read_u64_le()?),
        FieldType::LongLong => Value::BigInt(reader.read_i64_le()?),
        FieldType::Float => Value::Float(reader.read_f32_le()?),
        FieldType::Double => Value::Double(reader.read_f64_le()?),
        FieldType::Null => Value::Null,
        FieldType::Date | FieldType::NewDate => {
            let len = reader.read_u8()? as usize;
            let body = reader.read_bytes(len)?;
            decode_binary_date(body)
        }
        FieldType::DateTime | FieldType::Timestamp | FieldType::DateTime2 | FieldType::Timestamp2 => {
            let len = reader.read_u8()? as usize;
            let body = reader.read_bytes(len)?;
            decode_binary_datetime(body)
        }
        FieldType::Time | FieldType::Time2 => {
            let len = reader.read_u8()? as usize;
            let body = reader.read_bytes(len)?;
            Value::Time(decode_binary_time(body))
        }
        _ => {
            let data = reader.read_lenenc_bytes()?;
            decode_text_value(column, data)
        }
    })
}

fn decode_binary_date(body: &[u8]) -> Value {
    if body.len() < 4 {
        return Value::Null;
    }
    let year = i32::from(u16::from_le_bytes([body[0], body[1]]));
    let (month, day) = (u32::from(body[2]), u32::from(body[3]));
    if month == 0 || day == 0 {
        return Value::Null;
    }
    Value::Date(temporal::ymd_to_days(year, month, day))
}

fn decode_binary_datetime(body: &[u8]) -> Value {
    let Value::Date(days) = decode_binary_date(body) else {
        return Value::Null;
    };
    let mut micros = i64::from(days) * MICROS_PER_DAY;
    if body.len() >= 7 {
        let (h, m, s) = (i64::from(body[4]), i64::from(body[5]), i64::from(body[6]));
        micros += (h * 3600 + m * 60 + s) * MICROS_PER_SECOND;
    }
    if body.len() >= 11 {
        micros += i64::from(u32::from_le_bytes([body[7], body[8], body[9], body[10]]));
    }
    Value::Timestamp(micros)
}

fn decode_binary_time(body: &[u8]) -> i64 {
    if body.len() < 8 {
        return 0;
    }
    let negative = body[0] != 0;
    let days = i64::from(u32::from_le_bytes([body[1], body[2], body[3], body[4]]));
    let (h, m, s) = (i64::from(body[5]), i64::from(body[6]), i64::from(body[7]));
    let mut micros = ((days * 24 + h) * 3600 + m * 60 + s) * MICROS_PER_SECOND;
    if body.len() >= 12 {
        micros += i64::from(u32::from_le_bytes([body[8], body[9], body[10], body[11]]));
    }
    if negative { -micros } else { micros }
}

/// Parameter type code and flag byte for the binary protocol.
pub fn param_type(value: &Value) -> (FieldType, u8) {
    let field_type = match value {
        Value::Null => FieldType::Null,
        Value::Bool(_) | Value::TinyInt(_) => FieldType::Tiny,
        Value::SmallInt(_) => FieldType::Short,
        Value::Int(_) => FieldType::Long,
        Value::BigInt(_) | Value::UnsignedBigInt(_) => FieldType::LongLong,
        Value::Float(_) => FieldType::Float,
        Value::Double(_) => FieldType::Double,
        Value::Decimal(_) => FieldType::NewDecimal,
        Value::Text(_) | Value::Json(_) => FieldType::VarString,
        Value::Bytes(_) => FieldType::Blob,
        Value::Date(_) => FieldType::Date,
        Value::Time(_) => FieldType::Time,
        Value::Timestamp(_) => FieldType::DateTime,
    };
    let flags = if matches!(value, Value::UnsignedBigInt(_)) {
        0x80
    } else {
        0x00
    };
    (field_type, flags)
}

/// Append the binary encoding of a non-NULL parameter.
pub fn encode_binary_param(writer: &mut PacketWriter, value: &Value) {
    match value {
        Value::Null => {}
        Value::Bool(b) => writer.write_u8(u8::from(*b)),
        Value::TinyInt(i) => writer.write_u8(*i as u8),
        Value::SmallInt(i) => writer.write_u16_le(*i as u16),
        Value::Int(i) => writer.write_u32_le(*i as u32),
        Value::BigInt(i) => writer.write_u64_le(*i as u64),
        Value::UnsignedBigInt(u) => writer.write_u64_le(*u),
        Value::Float(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Double(f) => writer.write_bytes(&f.to_le_bytes()),
        Value::Decimal(s) | Value::Text(s) => writer.write_lenenc_string(s),
        Value::Json(j) => writer.write_lenenc_string(&j.to_string()),
        Value::Bytes(b) => writer.write_lenenc_bytes(b),
        Value::Date(days) => {
            let (y, m, d) = temporal::days_to_ymd(*days);
            writer.write_u8(4);
            writer.write_u16_le(y as u16);
            writer.write_u8(m as u8);
            writer.write_u8(d as u8);
        }
        Value::Time(micros) => encode_binary_time(writer, *micros),
        Value::Timestamp(micros) => {
            let (days, of_day) = temporal::split_timestamp(*micros);
            let (y, m, d) = temporal::days_to_ymd(days);
            let secs = of_day / MICROS_PER_SECOND;
            let frac = (of_day % MICROS_PER_SECOND) as u32;
            writer.write_u8(if frac == 0 { 7 } else { 11 });
            writer.write_u16_le(y as u16);
            writer.write_u8(m as u8);
            writer.write_u8(d as u8);
            writer.write_u8((secs / 3600) as u8);
            writer.write_u8(((secs / 60) % 60) as u8);
            writer.write_u8((secs % 60) as u8);
            if frac != 0 {
                writer.write_u32_le(frac);
            }
        }
    }
}

fn encode_binary_time(writer: &mut PacketWriter, micros: i64) {
    let negative = micros < 0;
    let abs = micros.unsigned_abs();
    let frac = (abs % 1_000_000) as u32;
    let secs = abs / 1_000_000;
    let days = secs / 86_400;
    let rem = secs % 86_400;

    writer.write_u8(if frac == 0 { 8 } else { 12 });
    writer.write_u8(u8::from(negative));
    writer.write_u32_le(days as u32);
    writer.write_u8((rem / 3600) as u8);
    writer.write_u8(((rem / 60) % 60) as u8);
    writer.write_u8((rem % 60) as u8);
    if frac != 0 {
        writer.write_u32_le(frac);
    }
}

/// Quote a string literal.
///
/// With `NO_BACKSLASH_ESCAPES` in effect only quotes are doubled.
pub fn escape_string(s: &str, no_backslash_escapes: bool) -> String {
    let mut result = String::with_capacity(s.len() + 2);
    result.push('\'');
    for ch in s.chars() {
        match ch {
            '\'' => result.push_str("''"),
            _ if no_backslash_escapes => result.push(ch),
            '\\' => result.push_str("\\\\"),
            '\0' => result.push_str("\\0"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\x1a' => result.push_str("\\Z"),
            _ => result.push(ch),
        }
    }
    result.push('\'');
    result
}

/// Hex literal for binary data.
pub fn escape_bytes(data: &[u8]) -> String {
    use std::fmt::Write;
    let mut result = String::with_capacity(data.len() * 2 + 3);
    result.push_str("X'");
    for byte in data {
        let _ = write!(result, "{byte:02X}");
    }
    result.push('\'');
    result
}

fn format_float(f: f64) -> String {
    if f.is_finite() {
        f.to_string()
    } else {
        "NULL".to_string()
    }
}

/// Render a value as an SQL literal.
pub fn format_value_for_sql(value: &Value, no_backslash_escapes: bool) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        Value::TinyInt(i) => i.to_string(),
        Value::SmallInt(i) => i.to_string(),
        Value::Int(i) => i.to_string(),
        Value::BigInt(i) => i.to_string(),
        Value::UnsignedBigInt(u) => u.to_string(),
        Value::Float(f) => format_float(f64::from(*f)),
        Value::Double(f) => format_float(*f),
        Value::Decimal(s) => escape_string(s, no_backslash_escapes),
        Value::Text(s) => escape_string(s, no_backslash_escapes),
        Value::Bytes(b) => escape_bytes(b),
        Value::Json(j) => escape_string(&j.to_string(), no_backslash_escapes),
        Value::Date(d) => format!("'{}'", temporal::format_date(*d)),
        Value::Time(t) => format!("'{}'", temporal::format_time(*t)),
        Value::Timestamp(t) => format!("'{}'", temporal::format_timestamp(*t)),
    }
}

/// Byte offsets of `?` placeholders outside literals, identifiers and comments.
pub fn placeholder_positions(sql: &str, no_backslash_escapes: bool) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let mut positions = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'?' => {
                positions.push(i);
                i += 1;
            }
            quote @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() {
                    let b = bytes[i];
                    if b == b'\\' && quote != b'`' && !no_backslash_escapes {
                        i += 2;
                        continue;
                    }
                    i += 1;
                    if b == quote {
                        if bytes.get(i) == Some(&quote) {
                            i += 1;
                        } else {
                            break;
                        }
                    }
                }
            }
            b'#' => i = skip_line(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-')
                && bytes.get(i + 2).is_none_or(|c| c.is_ascii_whitespace()) =>
            {
                i = skip_line(bytes, i);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i += 2;
                while i < bytes.len() && !(bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/')) {
                    i += 1;
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    positions
}

fn skip_line(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

/// Number of `?` placeholders in `sql`.
pub fn count_placeholders(sql: &str) -> usize {
    placeholder_positions(sql, false).len()
}

/// Substitute escaped literals for `?` placeholders.
#[allow(clippy::result_large_err)]
pub fn interpolate_params(
    sql: &str,
    params: &[Value],
    no_backslash_escapes: bool,
) -> Result<String, Error> {
    let positions = placeholder_positions(sql, no_backslash_escapes);
    if positions.len() != params.len() {
        return Err(Error::Statement(StatementError {
            kind: StatementErrorKind::ParameterCount,
            sql: sql.to_string(),
            message: format!(
                "statement has {} placeholders but {} parameters were bound",
                positions.len(),
                params.len()
            ),
        }));
    }
    if params.is_empty() {
        return Ok(sql.to_string());
    }

    let mut result = String::with_capacity(sql.len() + params.len() * 16);
    let mut last = 0;
    for (pos, param) in positions.into_iter().zip(params) {
        result.push_str(&sql[last..pos]);
        result.push_str(&format_value_for_sql(param, no_backslash_escapes));
        last = pos + 1;
    }
    result.push_str(&sql[last..]);
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(field_type: FieldType, flags: u16, charset: u16) -> ColumnDef {
        ColumnDef {
            schema: "test".to_string(),
            table: "t".to_string(),
            name: "c".to_string(),
            org_name: "c".to_string(),
            charset,
            column_length: 11,
            column_type: field_type,
            flags,
            decimals: 0,
        }
    }

    #[test]
    fn test_escape_string() {
        assert_eq!(escape_string("it's", false), "'it''s'");
        assert_eq!(escape_string("a\\b", false), "'a\\\\b'");
        assert_eq!(escape_string("line\nbreak", false), "'line\\nbreak'");
        assert_eq!(escape_string("a\\b\n", true), "'a\\b\n'");
    }

    #[test]
    fn test_interpolate_skips_literals_and_comments() {
        let sql = "SELECT '?', `a?`, ? /* ? */ -- ?\n, ? # ?";
        assert_eq!(count_placeholders(sql), 2);
        let out = interpolate_params(sql, &[Value::Int(1), Value::Text("x".into())], false)
            .unwrap();
        assert_eq!(out, "SELECT '?', `a?`, 1 /* ? */ -- ?\n, 'x' # ?");
    }

    #[test]
    fn test_backslash_quote_inside_literal() {
        assert_eq!(count_placeholders(r"SELECT 'it\'s ?', ?"), 1);
        assert_eq!(placeholder_positions(r"SELECT 'a\', ?", true).len(), 1);
    }

    #[test]
    fn test_interpolate_count_mismatch() {
        let err = interpolate_params("SELECT ?", &[], false).unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::Usage);
    }

    #[test]
    fn test_format_temporal_literals() {
        let days = temporal::ymd_to_days(2024, 2, 29);
        assert_eq!(format_value_for_sql(&Value::Date(days), false), "'2024-02-29'");
        assert_eq!(
            format_value_for_sql(&Value::Bytes(vec![0xDE, 0xAD]), false),
            "X'DEAD'"
        );
    }

    #[test]
    fn test_decode_text_unsigned_and_dates() {
        let col = column(FieldType::LongLong, column_flags::UNSIGNED, 33);
        assert_eq!(
            decode_text_value(&col, b"18446744073709551615"),
            Value::UnsignedBigInt(u64::MAX)
        );
        let col = column(FieldType::Date, 0, 63);
        assert_eq!(decode_text_value(&col, b"0000-00-00"), Value::Null);
        assert_eq!(decode_text_value(&col, b"1970-01-02"), Value::Date(1));
        let col = column(FieldType::Blob, column_flags::BINARY, 63);
        assert_eq!(decode_text_value(&col, b"\x01\x02"), Value::Bytes(vec![1, 2]));
        let col = column(FieldType::Blob, 0, 224);
        assert_eq!(decode_text_value(&col, b"text"), Value::Text("text".into()));
    }

    #[test]
    fn test_binary_row_with_nulls_and_temporals() {
        let columns = [
            column(FieldType::LongLong, 0, 63),
            column(FieldType::VarString, 0, 224),
            column(FieldType::DateTime, 0, 63),
        ];
        let ts = temporal::parse_timestamp("2024-05-06 07:08:09.5").unwrap();
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        // column 1 NULL: bit 1 + 2 = 3
        w.write_u8(0b0000_1000);
        w.write_u64_le(5);
        encode_binary_param(&mut w, &Value::Timestamp(ts));

        let values = decode_binary_row(&columns, w.as_bytes()).unwrap();
        assert_eq!(values, vec![Value::BigInt(5), Value::Null, Value::Timestamp(ts)]);
    }

    #[test]
    fn test_binary_zero_dates_are_null() {
        let columns = [
            column(FieldType::Date, 0, 63),
            column(FieldType::DateTime, 0, 63),
            column(FieldType::DateTime, 0, 63),
        ];
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u8(0);
        w.write_u8(0);
        w.write_u8(4);
        w.write_bytes(&[0, 0, 0, 0]);
        w.write_u8(7);
        w.write_bytes(&[0xE8, 0x07, 0, 0, 1, 2, 3]);

        let values = decode_binary_row(&columns, w.as_bytes()).unwrap();
        assert_eq!(values, vec![Value::Null, Value::Null, Value::Null]);
    }

    #[test]
    fn test_binary_time_sign_and_days() {
        let micros = -((26 * 3600 + 5) * MICROS_PER_SECOND + 7);
        let mut w = PacketWriter::new();
        encode_binary_time(&mut w, micros);
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 12);
        assert_eq!(decode_binary_time(&bytes[1..]), micros);
    }

    #[test]
    fn test_column_def_parse() {
        let mut w = PacketWriter::new();
        for s in ["def", "db", "t", "t", "id", "id"] {
            w.write_lenenc_string(s);
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(63);
        w.write_u32_le(20);
        w.write_u8(FieldType::LongLong as u8);
        w.write_u16_le(column_flags::NOT_NULL | column_flags::UNSIGNED);
        w.write_u8(0);
        w.write_zeros(2);

        let col = ColumnDef::parse(w.as_bytes()).unwrap();
        assert_eq!(col.name, "id");
        assert_eq!(col.column_type, FieldType::LongLong);
        assert!(col.is_unsigned());
        assert!(col.is_not_null());
    }
}
