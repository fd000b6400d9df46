//! Binary protocol command payloads.
//!
//! - COM_STMT_PREPARE: server answers with a prepare-OK header followed by
//!   parameter and column definitions
//! - COM_STMT_EXECUTE: statement id, flags, iteration count, NULL bitmap,
//!   parameter types and values
//! - COM_STMT_SEND_LONG_DATA: one chunk of a parameter, no response
//! - COM_STMT_BULK_EXECUTE (MariaDB): many parameter rows in one command
//! - COM_STMT_CLOSE / COM_STMT_RESET

#![allow(clippy::cast_possible_truncation)]

use dolphin_core::Value;

use super::{Command, PacketReader, PacketWriter};
use crate::types::{encode_binary_param, param_type};

/// Header of a COM_STMT_PREPARE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StmtPrepareOk {
    pub statement_id: u32,
    pub num_columns: u16,
    pub num_params: u16,
    pub warnings: u16,
}

/// Parse the first packet of a successful prepare.
pub fn parse_stmt_prepare_ok(data: &[u8]) -> Option<StmtPrepareOk> {
    let mut reader = PacketReader::new(data);
    if reader.read_u8()? != 0x00 {
        return None;
    }
    let statement_id = reader.read_u32_le()?;
    let num_columns = reader.read_u16_le()?;
    let num_params = reader.read_u16_le()?;
    reader.skip(1);
    let warnings = reader.read_u16_le().unwrap_or(0);
    Some(StmtPrepareOk {
        statement_id,
        num_columns,
        num_params,
        warnings,
    })
}

pub fn stmt_prepare_payload(sql: &str) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtPrepare);
    writer.write_bytes(sql.as_bytes());
    writer.into_bytes()
}

/// Build COM_STMT_EXECUTE. Parameters flagged in `long_data` were already
/// streamed and are omitted from the value section.
pub fn stmt_execute_payload(statement_id: u32, params: &[Value], long_data: &[bool]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(16 + params.len() * 16);
    writer.write_u8(Command::StmtExecute as u8);
    writer.write_u32_le(statement_id);
    // CURSOR_TYPE_NO_CURSOR
    writer.write_u8(0x00);
    writer.write_u32_le(1);

    if !params.is_empty() {
        let mut null_bitmap = vec![0u8; params.len().div_ceil(8)];
        for (i, param) in params.iter().enumerate() {
            if param.is_null() {
                null_bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        writer.write_bytes(&null_bitmap);

        // new-params-bound
        writer.write_u8(1);
        for param in params {
            let (field_type, flags) = param_type(param);
            writer.write_u8(field_type as u8);
            writer.write_u8(flags);
        }

        for (i, param) in params.iter().enumerate() {
            if !long_data.get(i).copied().unwrap_or(false) {
                encode_binary_param(&mut writer, param);
            }
        }
    }

    writer.into_bytes()
}

/// Build one COM_STMT_SEND_LONG_DATA chunk.
pub fn stmt_send_long_data_payload(statement_id: u32, param_index: u16, chunk: &[u8]) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(7 + chunk.len());
    writer.write_u8(Command::StmtSendLongData as u8);
    writer.write_u32_le(statement_id);
    writer.write_u16_le(param_index);
    writer.write_bytes(chunk);
    writer.into_bytes()
}

/// Indicator bytes in a bulk parameter row.
mod bulk_indicator {
    pub const NONE: u8 = 0;
    pub const NULL: u8 = 1;
}

/// Build COM_STMT_BULK_EXECUTE for `rows` (all of the same arity).
///
/// Types are taken from the first row; a NULL there is sent as a string type.
pub fn stmt_bulk_execute_payload(statement_id: u32, rows: &[Vec<Value>]) -> Vec<u8> {
    const SEND_TYPES_TO_SERVER: u16 = 128;

    let mut writer = PacketWriter::with_capacity(64 + rows.len() * 32);
    writer.write_u8(Command::StmtBulkExecute as u8);
    writer.write_u32_le(statement_id);
    writer.write_u16_le(SEND_TYPES_TO_SERVER);

    let first = rows.first().map_or(&[][..], Vec::as_slice);
    for value in first {
        let (field_type, flags) = match value {
            Value::Null => (crate::types::FieldType::VarString, 0),
            other => param_type(other),
        };
        writer.write_u8(field_type as u8);
        writer.write_u8(flags);
    }

    for row in rows {
        for value in row {
            if value.is_null() {
                writer.write_u8(bulk_indicator::NULL);
            } else {
                writer.write_u8(bulk_indicator::NONE);
                encode_binary_param(&mut writer, value);
            }
        }
    }
    writer.into_bytes()
}

pub fn stmt_close_payload(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtClose);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}

pub fn stmt_reset_payload(statement_id: u32) -> Vec<u8> {
    let mut writer = PacketWriter::command(Command::StmtReset);
    writer.write_u32_le(statement_id);
    writer.into_bytes()
}
