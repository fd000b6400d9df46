//! Streaming access to the results of one command.
//!
//! A command can produce several results (multi-statement text, stored
//! procedures). [`ResultStream`] exposes them one at a time: read rows
//! with [`ResultStream::next_row`], check [`ResultStream::has_more_results`],
//! then [`ResultStream::advance`]. Dropping the stream drains whatever is
//! left so the connection is ready for the next command.

use std::sync::Arc;

use dolphin_core::{ColumnInfo, Error, QueryResult, ResultSet, Row, UpdateCount, Value};

use crate::connection::MySqlConnection;
use crate::protocol::{MAX_PACKET_SIZE, PacketReader, PacketType, server_status};
use crate::types::{ColumnDef, decode_binary_row, decode_text_value};

/// What the current result is.
#[derive(Debug, Clone)]
pub enum ResultKind {
    Rows(Arc<ColumnInfo>),
    Update(UpdateCount),
}

#[derive(Debug)]
enum Current {
    Rows {
        defs: Arc<[ColumnDef]>,
        info: Arc<ColumnInfo>,
        warnings: u16,
        done: bool,
    },
    Update(UpdateCount),
    Finished,
}

/// Results of a command, read lazily from the connection.
#[derive(Debug)]
pub struct ResultStream<'c> {
    conn: &'c mut MySqlConnection,
    sql: Option<String>,
    binary: bool,
    current: Current,
    more: bool,
}

impl<'c> ResultStream<'c> {
    /// Read the first result of a command that was just sent.
    ///
    /// `reset_on_error` names a statement whose long data must be
    /// discarded with COM_STMT_RESET if the command fails.
    #[allow(clippy::result_large_err)]
    pub(crate) fn start(
        conn: &'c mut MySqlConnection,
        sql: Option<String>,
        binary: bool,
        reset_on_error: Option<u32>,
    ) -> Result<Self, Error> {
        let mut stream = Self {
            conn,
            sql,
            binary,
            current: Current::Finished,
            more: false,
        };
        match stream.read_result() {
            Ok(current) => {
                stream.current = current;
                Ok(stream)
            }
            Err(e) => {
                if let Some(statement_id) = reset_on_error {
                    if !stream.conn.is_broken() {
                        if let Err(reset) = stream.conn.reset_statement(statement_id) {
                            tracing::debug!(statement_id, error = %reset, "statement reset failed");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn read_result(&mut self) -> Result<Current, Error> {
        self.more = false;
        let packet = self.conn.read_packet()?;
        match PacketType::of(&packet) {
            PacketType::Ok => {
                let ok = PacketReader::new(&packet)
                    .parse_ok_packet()
                    .ok_or_else(|| self.conn.malformed("invalid OK packet"))?;
                self.conn.apply_ok(&ok);
                self.more = ok.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0;
                Ok(Current::Update(UpdateCount {
                    affected_rows: ok.affected_rows,
                    last_insert_id: ok.last_insert_id,
                    warnings: ok.warnings,
                }))
            }
            PacketType::Error => Err(self.conn.server_error(&packet, self.sql.as_deref())),
            PacketType::LocalInfile => Err(self.refuse_local_infile(&packet[1..])),
            PacketType::Eof | PacketType::Data => self.read_columns(&packet),
        }
    }

    #[allow(clippy::result_large_err)]
    fn read_columns(&mut self, header: &[u8]) -> Result<Current, Error> {
        let count = PacketReader::new(header)
            .read_lenenc_int()
            .ok_or_else(|| self.conn.malformed("invalid result set header"))?;
        let count = usize::try_from(count)
            .map_err(|_| self.conn.malformed("column count out of range"))?;

        let mut defs = Vec::with_capacity(count);
        for _ in 0..count {
            let packet = self.conn.read_packet()?;
            defs.push(
                ColumnDef::parse(&packet)
                    .ok_or_else(|| self.conn.malformed("invalid column definition"))?,
            );
        }
        if !self.conn.deprecate_eof() {
            self.conn.read_packet()?;
        }

        let info = Arc::new(ColumnInfo::new(defs.iter().map(|d| d.name.clone()).collect()));
        Ok(Current::Rows {
            defs: defs.into(),
            info,
            warnings: 0,
            done: false,
        })
    }

    /// Answer a LOCAL INFILE request with an empty file and report it.
    fn refuse_local_infile(&mut self, file_name: &[u8]) -> Error {
        let name = String::from_utf8_lossy(file_name).into_owned();
        tracing::warn!(file = %name, "refusing LOCAL INFILE request");
        if let Err(e) = self.conn.write_packet(&[]) {
            return e;
        }
        match self.conn.read_packet() {
            Ok(reply) if PacketType::of(&reply) == PacketType::Ok => {
                if let Some(ok) = PacketReader::new(&reply).parse_ok_packet() {
                    self.conn.apply_ok(&ok);
                    self.more = ok.status_flags & server_status::SERVER_MORE_RESULTS_EXISTS != 0;
                }
            }
            Ok(_) => {}
            Err(e) => return e,
        }
        Error::Custom(format!(
            "LOCAL INFILE is not supported (server asked for '{name}')"
        ))
    }

    /// Column names of the current result, if it has rows.
    pub fn columns(&self) -> Option<&Arc<ColumnInfo>> {
        match &self.current {
            Current::Rows { info, .. } => Some(info),
            _ => None,
        }
    }

    /// Column definitions of the current result, if it has rows.
    pub fn column_defs(&self) -> Option<&[ColumnDef]> {
        match &self.current {
            Current::Rows { defs, .. } => Some(&defs[..]),
            _ => None,
        }
    }

    /// Update count of the current result, if it has no rows.
    pub fn update_count(&self) -> Option<UpdateCount> {
        match &self.current {
            Current::Update(count) => Some(*count),
            _ => None,
        }
    }

    pub fn kind(&self) -> Option<ResultKind> {
        match &self.current {
            Current::Rows { info, .. } => Some(ResultKind::Rows(Arc::clone(info))),
            Current::Update(count) => Some(ResultKind::Update(*count)),
            Current::Finished => None,
        }
    }

    /// Next row of the current result; `None` once it is exhausted.
    #[allow(clippy::result_large_err)]
    pub fn next_row(&mut self) -> Result<Option<Row>, Error> {
        let Current::Rows {
            defs,
            info,
            warnings,
            done,
        } = &mut self.current
        else {
            return Ok(None);
        };
        if *done {
            return Ok(None);
        }

        let packet = self.conn.read_packet()?;
        match packet.first() {
            Some(0xFF) => {
                *done = true;
                Err(self.conn.server_error(&packet, self.sql.as_deref()))
            }
            Some(0xFE) if packet.len() < MAX_PACKET_SIZE => {
                *done = true;
                let mut reader = PacketReader::new(&packet);
                let (status, warning_count) = if self.conn.deprecate_eof() {
                    let ok = reader
                        .parse_ok_packet()
                        .ok_or_else(|| self.conn.malformed("invalid end of result set"))?;
                    self.conn.apply_ok(&ok);
                    (ok.status_flags, ok.warnings)
                } else {
                    let eof = reader
                        .parse_eof_packet()
                        .ok_or_else(|| self.conn.malformed("invalid EOF packet"))?;
                    self.conn.apply_status(eof.status_flags);
                    (eof.status_flags, eof.warnings)
                };
                *warnings = warning_count;
                self.more = status & server_status::SERVER_MORE_RESULTS_EXISTS != 0;
                Ok(None)
            }
            _ => {
                let values = if self.binary {
                    decode_binary_row(defs, &packet)
                } else {
                    decode_text_row(defs, &packet)
                }
                .ok_or_else(|| self.conn.malformed("malformed row"))?;
                Ok(Some(Row::with_columns(Arc::clone(info), values)))
            }
        }
    }

    /// Whether another result follows the current one. Known once the
    /// current rows have been read to the end.
    pub fn has_more_results(&self) -> bool {
        self.more
    }

    /// Move to the next result, discarding unread rows of the current one.
    #[allow(clippy::result_large_err)]
    pub fn advance(&mut self) -> Result<Option<ResultKind>, Error> {
        while self.next_row()?.is_some() {}
        if !self.more {
            self.current = Current::Finished;
            return Ok(None);
        }
        self.current = Current::Finished;
        self.current = self.read_result()?;
        Ok(self.kind())
    }

    /// Buffer the current result.
    #[allow(clippy::result_large_err)]
    pub fn collect_current(&mut self) -> Result<Option<QueryResult>, Error> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row()? {
            rows.push(row);
        }
        Ok(match &self.current {
            Current::Rows { info, warnings, .. } => Some(QueryResult::Rows(ResultSet {
                columns: Arc::clone(info),
                rows,
                warnings: *warnings,
            })),
            Current::Update(count) => Some(QueryResult::Update(*count)),
            Current::Finished => None,
        })
    }

    /// Buffer every remaining result.
    #[allow(clippy::result_large_err)]
    pub fn collect_all(mut self) -> Result<Vec<QueryResult>, Error> {
        let mut results = Vec::new();
        loop {
            if let Some(result) = self.collect_current()? {
                results.push(result);
            }
            if self.advance()?.is_none() {
                return Ok(results);
            }
        }
    }

    #[allow(clippy::result_large_err)]
    fn finish(&mut self) -> Result<(), Error> {
        while self.advance()?.is_some() {}
        Ok(())
    }
}

impl Drop for ResultStream<'_> {
    fn drop(&mut self) {
        if self.conn.is_broken() {
            return;
        }
        if let Err(e) = self.finish() {
            tracing::debug!(error = %e, "error while draining results");
        }
    }
}

fn decode_text_row(defs: &[ColumnDef], packet: &[u8]) -> Option<Vec<Value>> {
    let mut reader = PacketReader::new(packet);
    let mut values = Vec::with_capacity(defs.len());
    for def in defs {
        if reader.peek() == Some(0xFB) {
            reader.skip(1);
            values.push(Value::Null);
        } else {
            values.push(decode_text_value(def, reader.read_lenenc_bytes()?));
        }
    }
    Some(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldType;

    #[test]
    fn text_row_with_null() {
        let def = ColumnDef {
            schema: String::new(),
            table: String::new(),
            name: "n".to_string(),
            org_name: String::new(),
            charset: 33,
            column_length: 11,
            column_type: FieldType::LongLong,
            flags: 0,
            decimals: 0,
        };
        let defs = [def.clone(), def];
        let values = decode_text_row(&defs, b"\x015\xfb").unwrap();
        assert_eq!(values, vec![Value::BigInt(5), Value::Null]);
        assert!(decode_text_row(&defs, b"\x09short").is_none());
    }
}
