//! In-memory MySQL server used by the protocol tests.
//!
//! Each [`FakeLink`] is one client socket. Bytes written by the client are
//! framed, interpreted and answered immediately, so every read the client
//! performs finds its reply already buffered. A [`FakeCluster`] hands out
//! links by host name and records every connection attempt.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dolphin_core::Error;
use dolphin_core::error::{ConnectionError, ConnectionErrorKind};
use flate2::read::ZlibDecoder;
use dolphin_mysql::auth::scramble;
use dolphin_mysql::protocol::codec::encode_frames;
use dolphin_mysql::protocol::compress::{COMPRESSED_HEADER_SIZE, encode_envelope};
use dolphin_mysql::protocol::{PacketReader, PacketWriter, capabilities, server_status};
use dolphin_mysql::{Connector, HaMode, HostDescriptor, MySqlConfig, SslMode, Transport};

pub const USER: &str = "app";
pub const PASSWORD: &str = "secret";
pub const SERVER_VERSION: &str = "8.0.36";

const SEED: &[u8; 20] = b"abcdefghijklmnopqrst";
const SWITCH_SEED: [u8; 20] = [
    21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31, 32, 33, 34, 35, 36, 37, 38, 39, 40,
];

const TYPE_LONGLONG: u8 = 0x08;
const TYPE_VAR_STRING: u8 = 0xFD;

const SERVER_CAPABILITIES: u64 = capabilities::CLIENT_LONG_PASSWORD
    | capabilities::CLIENT_FOUND_ROWS
    | capabilities::CLIENT_CONNECT_WITH_DB
    | capabilities::CLIENT_PROTOCOL_41
    | capabilities::CLIENT_TRANSACTIONS
    | capabilities::CLIENT_SECURE_CONNECTION
    | capabilities::CLIENT_MULTI_STATEMENTS
    | capabilities::CLIENT_MULTI_RESULTS
    | capabilities::CLIENT_PS_MULTI_RESULTS
    | capabilities::CLIENT_PLUGIN_AUTH
    | capabilities::CLIENT_CONNECT_ATTRS
    | capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
    | capabilities::CLIENT_DEPRECATE_EOF;

/// What a server saw, shared by all of its links.
#[derive(Debug, Default)]
pub struct ServerLog {
    /// Every COM_QUERY statement, split on `;`
    pub queries: Vec<String>,
    /// SQL of every COM_STMT_PREPARE
    pub prepared: Vec<String>,
    /// Statement ids of every COM_STMT_CLOSE
    pub closed: Vec<u32>,
    /// (statement id, parameter index) of every COM_STMT_SEND_LONG_DATA
    pub long_data: Vec<(u32, u16)>,
    /// Every command byte received after authentication
    pub commands: Vec<u8>,
    pub databases: Vec<String>,
    pub resets: usize,
    pub connections: usize,
    /// (sequence, deflated) of every compressed packet the client sent
    pub envelopes: Vec<(u8, bool)>,
    /// Whether each compressed packet sent back was deflated
    pub replies_deflated: Vec<bool>,
}

#[derive(Debug)]
pub struct FakeServer {
    auth_switch: bool,
    compression: bool,
    down: AtomicBool,
    next_connection: AtomicU32,
    next_statement: AtomicU32,
    log: Mutex<ServerLog>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Self::build(false, false)
    }

    /// Answers the handshake response with an AuthSwitch to a fresh seed.
    pub fn with_auth_switch() -> Arc<Self> {
        Self::build(true, false)
    }

    /// Advertises CLIENT_COMPRESS and speaks the compressed protocol once
    /// a client negotiates it.
    pub fn with_compression() -> Arc<Self> {
        Self::build(false, true)
    }

    fn build(auth_switch: bool, compression: bool) -> Arc<Self> {
        Arc::new(Self {
            auth_switch,
            compression,
            down: AtomicBool::new(false),
            next_connection: AtomicU32::new(100),
            next_statement: AtomicU32::new(1),
            log: Mutex::new(ServerLog::default()),
        })
    }

    /// Drop every link and refuse new ones.
    pub fn kill(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn revive(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> MutexGuard<'_, ServerLog> {
        self.log.lock().unwrap()
    }

    pub fn command_count(&self) -> usize {
        self.log().commands.len()
    }

    pub fn queries(&self) -> Vec<String> {
        self.log().queries.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitResponse,
    AwaitSwitchReply,
    Command,
    Closed,
}

#[derive(Debug)]
struct FakeStatement {
    sql: String,
    params: usize,
    returns_rows: bool,
    long_data: HashSet<u16>,
}

/// One client connection to a [`FakeServer`].
#[derive(Debug)]
pub struct FakeLink {
    server: Arc<FakeServer>,
    phase: Phase,
    inbound: Vec<u8>,
    /// Plain frames waiting to be interpreted
    frames: Vec<u8>,
    outbound: VecDeque<u8>,
    sequence: u8,
    /// Client asked for CLIENT_COMPRESS and the server offers it
    negotiated_compression: bool,
    compressed: bool,
    envelope_sequence: u8,
    /// Reply frames collected for the next compressed packet
    pending: Vec<u8>,
    autocommit: bool,
    in_transaction: bool,
    savepoints: HashSet<String>,
    statements: HashMap<u32, FakeStatement>,
}

impl FakeLink {
    pub fn new(server: Arc<FakeServer>) -> Self {
        let connection_id = server.next_connection.fetch_add(1, Ordering::SeqCst);
        server.log().connections += 1;
        let mut link = Self {
            server,
            phase: Phase::AwaitResponse,
            inbound: Vec::new(),
            frames: Vec::new(),
            outbound: VecDeque::new(),
            sequence: 0,
            negotiated_compression: false,
            compressed: false,
            envelope_sequence: 0,
            pending: Vec::new(),
            autocommit: true,
            in_transaction: false,
            savepoints: HashSet::new(),
            statements: HashMap::new(),
        };
        let greeting = greeting(connection_id, link.capabilities());
        link.send(&greeting);
        link
    }

    fn capabilities(&self) -> u64 {
        if self.server.compression {
            SERVER_CAPABILITIES | capabilities::CLIENT_COMPRESS
        } else {
            SERVER_CAPABILITIES
        }
    }

    fn send(&mut self, payload: &[u8]) {
        let mut out = Vec::new();
        self.sequence = encode_frames(payload, self.sequence, &mut out);
        if self.compressed {
            self.pending.extend(out);
        } else {
            self.outbound.extend(out);
        }
    }

    /// Wrap the collected reply frames in one compressed packet.
    fn flush_envelope(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let body = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        encode_envelope(&body, self.envelope_sequence, &mut out).unwrap();
        self.envelope_sequence = self.envelope_sequence.wrapping_add(1);
        let deflated = out[4..COMPRESSED_HEADER_SIZE] != [0, 0, 0];
        self.server.log().replies_deflated.push(deflated);
        self.outbound.extend(out);
    }

    /// Move the bodies of complete compressed packets into `frames`.
    fn unwrap_envelopes(&mut self) -> io::Result<()> {
        while self.inbound.len() >= COMPRESSED_HEADER_SIZE {
            let stored = u24(&self.inbound[0..3]);
            let sequence = self.inbound[3];
            let uncompressed = u24(&self.inbound[4..7]);
            if self.inbound.len() < COMPRESSED_HEADER_SIZE + stored {
                break;
            }
            let body: Vec<u8> = self
                .inbound
                .drain(..COMPRESSED_HEADER_SIZE + stored)
                .skip(COMPRESSED_HEADER_SIZE)
                .collect();
            self.server.log().envelopes.push((sequence, uncompressed != 0));
            self.envelope_sequence = sequence.wrapping_add(1);
            if uncompressed == 0 {
                self.frames.extend(body);
            } else {
                let mut inflated = Vec::with_capacity(uncompressed);
                ZlibDecoder::new(body.as_slice()).read_to_end(&mut inflated)?;
                assert_eq!(inflated.len(), uncompressed, "declared length");
                self.frames.extend(inflated);
            }
        }
        Ok(())
    }

    fn status(&self, more: bool) -> u16 {
        let mut status = 0;
        if self.in_transaction {
            status |= server_status::SERVER_STATUS_IN_TRANS;
        }
        if self.autocommit {
            status |= server_status::SERVER_STATUS_AUTOCOMMIT;
        }
        if more {
            status |= server_status::SERVER_MORE_RESULTS_EXISTS;
        }
        status
    }

    fn ok_with(&mut self, marker: u8, affected: u64, more: bool) {
        let mut w = PacketWriter::new();
        w.write_u8(marker);
        w.write_lenenc_int(affected);
        w.write_lenenc_int(0);
        w.write_u16_le(self.status(more));
        w.write_u16_le(0);
        self.send(w.as_bytes());
    }

    fn ok(&mut self, affected: u64, more: bool) {
        self.ok_with(0x00, affected, more);
    }

    fn error(&mut self, code: u16, state: &str, message: &str) {
        let mut w = PacketWriter::new();
        w.write_u8(0xFF);
        w.write_u16_le(code);
        w.write_u8(b'#');
        w.write_bytes(state.as_bytes());
        w.write_bytes(message.as_bytes());
        self.send(w.as_bytes());
    }

    fn rows(&mut self, name: &str, values: &[&str], more: bool) {
        let mut header = PacketWriter::new();
        header.write_lenenc_int(1);
        self.send(header.as_bytes());
        self.send(&column(name, TYPE_LONGLONG));
        for value in values {
            let mut row = PacketWriter::new();
            row.write_lenenc_string(value);
            self.send(row.as_bytes());
        }
        self.ok_with(0xFE, 0, more);
    }

    fn handle(&mut self, payload: &[u8]) {
        match self.phase {
            Phase::AwaitResponse => self.handshake_response(payload),
            Phase::AwaitSwitchReply => self.finish_auth(payload, &SWITCH_SEED),
            Phase::Command => self.command(payload),
            Phase::Closed => {}
        }
    }

    fn handshake_response(&mut self, payload: &[u8]) {
        let mut r = PacketReader::new(payload);
        let caps = u64::from(r.read_u32_le().unwrap_or(0));
        self.negotiated_compression =
            self.server.compression && caps & capabilities::CLIENT_COMPRESS != 0;
        r.skip(4 + 1 + 23);
        let user = r.read_null_string();
        let auth = r.read_lenenc_bytes().unwrap_or_default().to_vec();
        if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
            let db = r.read_null_string();
            if !db.is_empty() {
                self.server.log().databases.push(db);
            }
        }
        if user != USER {
            self.error(1045, "28000", &format!("Access denied for user '{user}'"));
            self.phase = Phase::Closed;
            return;
        }
        if self.server.auth_switch {
            let mut w = PacketWriter::new();
            w.write_u8(0xFE);
            w.write_null_string("mysql_native_password");
            w.write_bytes(&SWITCH_SEED);
            w.write_u8(0);
            self.send(w.as_bytes());
            self.phase = Phase::AwaitSwitchReply;
            return;
        }
        self.finish_auth(&auth, SEED);
    }

    fn finish_auth(&mut self, token: &[u8], seed: &[u8]) {
        if token == scramble::native_password(PASSWORD, seed).as_slice() {
            self.ok(0, false);
            self.phase = Phase::Command;
            self.compressed = self.negotiated_compression;
        } else {
            self.error(1045, "28000", &format!("Access denied for user '{USER}'"));
            self.phase = Phase::Closed;
        }
    }

    fn command(&mut self, payload: &[u8]) {
        let Some((&command, body)) = payload.split_first() else {
            return;
        };
        self.server.log().commands.push(command);
        match command {
            0x01 => self.phase = Phase::Closed,
            0x02 => {
                let db = String::from_utf8_lossy(body).into_owned();
                self.server.log().databases.push(db);
                self.ok(0, false);
            }
            0x03 => self.query(&String::from_utf8_lossy(body)),
            0x0e | 0x1a => self.ok(0, false),
            0x16 => self.prepare(&String::from_utf8_lossy(body)),
            0x17 => self.execute(body),
            0x18 => {
                let mut r = PacketReader::new(body);
                let id = r.read_u32_le().unwrap_or(0);
                let index = r.read_u16_le().unwrap_or(0);
                self.server.log().long_data.push((id, index));
                if let Some(stmt) = self.statements.get_mut(&id) {
                    stmt.long_data.insert(index);
                }
            }
            0x19 => {
                let id = PacketReader::new(body).read_u32_le().unwrap_or(0);
                self.server.log().closed.push(id);
                self.statements.remove(&id);
            }
            0x1f => {
                self.server.log().resets += 1;
                self.autocommit = true;
                self.in_transaction = false;
                self.savepoints.clear();
                self.statements.clear();
                self.ok(0, false);
            }
            _ => self.error(1047, "08S01", "Unknown command"),
        }
    }

    fn query(&mut self, sql: &str) {
        let parts: Vec<String> = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        let last = parts.len().saturating_sub(1);
        for (i, part) in parts.iter().enumerate() {
            self.server.log().queries.push(part.clone());
            if !self.statement(part, i < last) {
                return;
            }
        }
    }

    /// Answer one statement. Returns false when it failed.
    fn statement(&mut self, sql: &str, more: bool) -> bool {
        let upper = sql.to_ascii_uppercase();
        if let Some(rest) = upper.strip_prefix("SELECT ") {
            if rest.trim().parse::<i64>().is_ok() {
                self.rows(rest.trim(), &[rest.trim()], more);
                return true;
            }
        }
        if upper == "SELECT BADROW" {
            // Length prefix claims five bytes, one follows
            self.send(&[0x01]);
            self.send(&column("badrow", TYPE_LONGLONG));
            self.send(&[0x05, b'a']);
            self.ok_with(0xFE, 0, more);
            return true;
        }
        if upper == "SHUTDOWN" {
            // Hang up without a reply
            self.phase = Phase::Closed;
            return false;
        }
        if upper.starts_with("FAIL") {
            self.error(1064, "42000", "You have an error in your SQL syntax");
            return false;
        }
        if upper == "START TRANSACTION" || upper == "BEGIN" {
            self.in_transaction = true;
        } else if upper == "COMMIT" || upper == "ROLLBACK" {
            self.in_transaction = false;
            self.savepoints.clear();
        } else if let Some(value) = upper.strip_prefix("SET AUTOCOMMIT=") {
            self.autocommit = value.trim() == "1";
        } else if let Some(name) = upper.strip_prefix("SAVEPOINT ") {
            self.savepoints.insert(name.trim().to_string());
        } else if let Some(name) = upper
            .strip_prefix("ROLLBACK TO SAVEPOINT ")
            .or_else(|| upper.strip_prefix("RELEASE SAVEPOINT "))
        {
            let name = name.trim().to_string();
            if !self.savepoints.contains(&name) {
                self.error(1305, "42000", &format!("SAVEPOINT {name} does not exist"));
                return false;
            }
            if upper.starts_with("RELEASE") {
                self.savepoints.remove(&name);
            }
        } else if upper.starts_with("INSERT") || upper.starts_with("UPDATE") || upper.starts_with("DELETE") {
            if !self.autocommit {
                self.in_transaction = true;
            }
            self.ok(1, more);
            return true;
        }
        self.ok(0, more);
        true
    }

    fn prepare(&mut self, sql: &str) {
        self.server.log().prepared.push(sql.to_string());
        if sql.to_ascii_uppercase().starts_with("SHOW") {
            self.error(
                1295,
                "HY000",
                "This command is not supported in the prepared statement protocol yet",
            );
            return;
        }
        let id = self.server.next_statement.fetch_add(1, Ordering::SeqCst);
        let params = sql.matches('?').count();
        let returns_rows = sql.to_ascii_uppercase().starts_with("SELECT");
        let columns = usize::from(returns_rows);

        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u32_le(id);
        w.write_u16_le(u16::try_from(columns).unwrap());
        w.write_u16_le(u16::try_from(params).unwrap());
        w.write_u8(0);
        w.write_u16_le(0);
        self.send(w.as_bytes());
        for _ in 0..params {
            self.send(&column("?", TYPE_VAR_STRING));
        }
        if returns_rows {
            self.send(&column("result", TYPE_LONGLONG));
        }
        self.statements.insert(
            id,
            FakeStatement {
                sql: sql.to_string(),
                params,
                returns_rows,
                long_data: HashSet::new(),
            },
        );
    }

    fn execute(&mut self, body: &[u8]) {
        let mut r = PacketReader::new(body);
        let id = r.read_u32_le().unwrap_or(0);
        let Some(stmt) = self.statements.get_mut(&id) else {
            self.error(1243, "HY000", "Unknown prepared statement handler");
            return;
        };
        r.skip(1 + 4);
        let mut values = Vec::new();
        if stmt.params > 0 {
            let nulls = r.read_bytes(stmt.params.div_ceil(8)).unwrap_or_default().to_vec();
            r.skip(1);
            let mut types = Vec::new();
            for _ in 0..stmt.params {
                types.push(r.read_u8().unwrap_or(0));
                r.skip(1);
            }
            for (i, ty) in types.iter().enumerate() {
                let index = u16::try_from(i).unwrap();
                if nulls[i / 8] & (1 << (i % 8)) != 0 || stmt.long_data.contains(&index) {
                    values.push(0);
                    continue;
                }
                let value = match ty {
                    0x01 => r.read_i8().map(i64::from),
                    0x02 => r.read_i16_le().map(i64::from),
                    0x03 => r.read_i32_le().map(i64::from),
                    0x08 => r.read_i64_le(),
                    _ => r
                        .read_lenenc_bytes()
                        .map(|b| String::from_utf8_lossy(b).parse().unwrap_or(0)),
                };
                values.push(value.unwrap_or(0));
            }
        }
        stmt.long_data.clear();
        let returns_rows = stmt.returns_rows;

        if returns_rows {
            let sum: i64 = values.iter().sum();
            let mut header = PacketWriter::new();
            header.write_lenenc_int(1);
            self.send(header.as_bytes());
            self.send(&column("result", TYPE_LONGLONG));
            let mut row = PacketWriter::new();
            row.write_u8(0x00);
            row.write_u8(0x00);
            row.write_bytes(&sum.to_le_bytes());
            self.send(row.as_bytes());
            self.ok_with(0xFE, 0, false);
        } else {
            if !self.autocommit {
                self.in_transaction = true;
            }
            self.ok(1, false);
        }
    }
}

impl Read for FakeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.server.is_down() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "server killed"));
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for FakeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.server.is_down() {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "server killed"));
        }
        self.inbound.extend_from_slice(buf);
        if self.compressed {
            self.unwrap_envelopes()?;
        } else {
            self.frames.append(&mut self.inbound);
        }
        while self.frames.len() >= 4 {
            let len = u24(&self.frames[0..3]);
            if self.frames.len() < 4 + len {
                break;
            }
            self.sequence = self.frames[3].wrapping_add(1);
            let payload: Vec<u8> = self.frames.drain(..4 + len).skip(4).collect();
            self.handle(&payload);
        }
        if self.compressed {
            self.flush_envelope();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for FakeLink {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.phase = Phase::Closed;
        Ok(())
    }
}

fn u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}

fn greeting(connection_id: u32, capabilities: u64) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_u8(10);
    w.write_null_string(SERVER_VERSION);
    w.write_u32_le(connection_id);
    w.write_bytes(&SEED[..8]);
    w.write_u8(0);
    w.write_u16_le((capabilities & 0xFFFF) as u16);
    w.write_u8(45);
    w.write_u16_le(server_status::SERVER_STATUS_AUTOCOMMIT);
    w.write_u16_le(((capabilities >> 16) & 0xFFFF) as u16);
    w.write_u8(21);
    w.write_zeros(10);
    w.write_bytes(&SEED[8..]);
    w.write_u8(0);
    w.write_null_string("mysql_native_password");
    w.into_bytes()
}

fn column(name: &str, field_type: u8) -> Vec<u8> {
    let mut w = PacketWriter::new();
    w.write_lenenc_string("def");
    w.write_lenenc_string("");
    w.write_lenenc_string("");
    w.write_lenenc_string("");
    w.write_lenenc_string(name);
    w.write_lenenc_string(name);
    w.write_lenenc_int(0x0c);
    w.write_u16_le(63);
    w.write_u32_le(20);
    w.write_u8(field_type);
    w.write_u16_le(0);
    w.write_u8(0);
    w.write_zeros(2);
    w.into_bytes()
}

/// Servers reachable by host name.
#[derive(Debug, Default)]
pub struct FakeCluster {
    servers: Mutex<HashMap<String, Arc<FakeServer>>>,
    attempts: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, host: &str, server: Arc<FakeServer>) -> HostDescriptor {
        self.servers.lock().unwrap().insert(host.to_string(), server);
        HostDescriptor::new(host, 3306)
    }

    /// Host names of every connection attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl Connector for FakeCluster {
    fn connect(
        &self,
        host: &HostDescriptor,
        _config: &MySqlConfig,
    ) -> Result<Box<dyn Transport>, Error> {
        self.attempts.lock().unwrap().push(host.host.clone());
        let server = self.servers.lock().unwrap().get(&host.host).cloned();
        match server {
            Some(server) if !server.is_down() => Ok(Box::new(FakeLink::new(server))),
            _ => Err(Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Refused,
                message: format!("connection refused by {host}"),
                source: None,
            })),
        }
    }
}

/// Configuration that authenticates against [`FakeServer`].
pub fn config(hosts: &[HostDescriptor]) -> MySqlConfig {
    MySqlConfig::new()
        .hosts(hosts.iter().cloned())
        .user(USER)
        .password(PASSWORD)
        .ssl_mode(SslMode::Disable)
        .connect_timeout(Duration::from_secs(1))
        .failover_pause(Duration::ZERO)
}

pub fn ha_config(hosts: &[HostDescriptor]) -> MySqlConfig {
    config(hosts).ha_mode(HaMode::Sequential)
}
