//! One physical connection to a MySQL or MariaDB server.
//!
//! [`MySqlConnection`] owns the packet codec, the session state and the
//! prepared statement cache. Commands are strictly sequential: every method
//! takes `&mut self`, and a [`ResultStream`] borrows the connection until
//! it is dropped.
//!
//! I/O failures, framing errors, timeouts and server errors classified as
//! connection loss mark the connection broken; every later command fails
//! fast and the failover layer replaces it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dolphin_core::error::{
    ConnectionError, ConnectionErrorKind, ProtocolError, TransactionError, TransactionErrorKind,
};
use dolphin_core::{
    BatchResult, Connection, Error, ErrorClass, IsolationLevel, QueryResult, Row, Savepoint,
    UpdateCount, Value,
};
use regex::Regex;

use crate::auth::AuthRegistry;
use crate::cache::StatementCache;
use crate::config::{HostDescriptor, MySqlConfig};
use crate::error_map::ErrorCategory;
use crate::handshake;
use crate::protocol::prepared::{
    parse_stmt_prepare_ok, stmt_bulk_execute_payload, stmt_close_payload, stmt_execute_payload,
    stmt_prepare_payload, stmt_reset_payload, stmt_send_long_data_payload,
};
use crate::protocol::{
    Command, OkPacket, PacketCodec, PacketReader, PacketType, PacketWriter, capabilities,
    server_status,
};
use crate::resultset::ResultStream;
use crate::session::{SessionSnapshot, SessionState, dirty, validate_savepoint_name};
use crate::statement::{Binding, PrepareOutcome, PreparedStatement, ServerStatement};
use crate::transport::{Connector, TcpConnector};
use crate::types::{ColumnDef, interpolate_params, param_type};

/// Long parameters are streamed in chunks of this size.
const LONG_DATA_CHUNK: usize = 1 << 20;

/// MySQL error code for an unknown savepoint.
const ER_SP_DOES_NOT_EXIST: u16 = 1305;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

fn next_epoch() -> u64 {
    NEXT_EPOCH.fetch_add(1, Ordering::Relaxed)
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

pub(crate) fn connection_lost(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Disconnected,
        message: message.into(),
        source: None,
    })
}

/// Errors after which the connection cannot be trusted.
fn is_fatal(err: &Error) -> bool {
    matches!(
        err.class(),
        ErrorClass::ProtocolFraming | ErrorClass::ConnectionLost | ErrorClass::Timeout
    )
}

/// Parsed server version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub raw: String,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub mariadb: bool,
}

fn version_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:5\.5\.5-)?(\d+)\.(\d+)\.(\d+)").ok())
        .as_ref()
}

impl ServerVersion {
    /// Parse a version like `8.0.36` or `5.5.5-10.11.6-MariaDB-log`.
    ///
    /// MariaDB servers replicating with old MySQL prefix their version
    /// with `5.5.5-`; the prefix is skipped.
    pub fn parse(raw: &str) -> Self {
        let numbers = version_regex().and_then(|re| re.captures(raw)).map(|caps| {
            let part = |i: usize| {
                caps.get(i)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0)
            };
            (part(1), part(2), part(3))
        });
        let (major, minor, patch) = numbers.unwrap_or((0, 0, 0));
        Self {
            raw: raw.to_string(),
            major,
            minor,
            patch,
            mariadb: raw.to_ascii_lowercase().contains("mariadb"),
        }
    }

    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) >= (major, minor, patch)
    }

    /// COM_RESET_CONNECTION: MariaDB 10.2.4+, MySQL 5.7.3+.
    pub fn supports_reset_connection(&self) -> bool {
        if self.mariadb {
            self.at_least(10, 2, 4)
        } else {
            self.at_least(5, 7, 3)
        }
    }

    /// Session variable holding the isolation level.
    fn isolation_variable(&self) -> &'static str {
        if !self.mariadb && self.at_least(5, 7, 20) {
            "transaction_isolation"
        } else {
            "tx_isolation"
        }
    }
}

/// Interrupts the running statement of a connection from another thread.
///
/// Cancelling opens a separate connection and sends `KILL QUERY`. It is
/// best effort: the statement may already have finished.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    connector: Arc<dyn Connector>,
    registry: Arc<AuthRegistry>,
    config: Arc<MySqlConfig>,
    host: HostDescriptor,
    connection_id: u32,
}

impl CancelHandle {
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    #[allow(clippy::result_large_err)]
    pub fn cancel(&self) -> Result<(), Error> {
        tracing::debug!(connection_id = self.connection_id, host = %self.host, "cancelling query");
        let mut side = MySqlConnection::connect_with(
            Arc::clone(&self.connector),
            Arc::clone(&self.registry),
            &self.host,
            Arc::clone(&self.config),
        )?;
        let result = side.execute_raw(&format!("KILL QUERY {}", self.connection_id));
        side.close();
        result.map(|_| ())
    }
}

/// A connection to a MySQL or MariaDB server.
pub struct MySqlConnection {
    codec: PacketCodec,
    config: Arc<MySqlConfig>,
    registry: Arc<AuthRegistry>,
    connector: Arc<dyn Connector>,
    host: HostDescriptor,
    /// Identifies this physical session; statement handles compare against it
    epoch: u64,
    connection_id: u32,
    version: ServerVersion,
    server_capabilities: u64,
    capabilities: u64,
    status_flags: u16,
    broken: bool,
    session: SessionState,
    statements: StatementCache,
    last_update: UpdateCount,
}

impl std::fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MySqlConnection")
            .field("host", &self.host)
            .field("connection_id", &self.connection_id)
            .field("server_version", &self.version.raw)
            .field("epoch", &self.epoch)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl MySqlConnection {
    /// Connect over TCP (or the configured local socket) to the first host.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self, Error> {
        let host = config.hosts.first().cloned().ok_or_else(|| {
            Error::Config(dolphin_core::ConfigError {
                message: "no hosts configured".to_string(),
                source: None,
            })
        })?;
        Self::connect_with(
            Arc::new(TcpConnector),
            Arc::new(AuthRegistry::with_builtins()),
            &host,
            Arc::new(config),
        )
    }

    /// Open a transport with `connector`, authenticate and initialize the
    /// session.
    #[tracing::instrument(level = "debug", skip(connector, registry, config), fields(host = %host))]
    #[allow(clippy::result_large_err)]
    pub fn connect_with(
        connector: Arc<dyn Connector>,
        registry: Arc<AuthRegistry>,
        host: &HostDescriptor,
        config: Arc<MySqlConfig>,
    ) -> Result<Self, Error> {
        let transport = connector.connect(host, &config)?;
        let mut codec = PacketCodec::new(transport);
        let hs = match handshake::perform(&mut codec, host, &config, &registry) {
            Ok(hs) => hs,
            Err(e) => {
                codec.shutdown();
                return Err(e);
            }
        };

        let initial = SessionSnapshot {
            autocommit: config.autocommit,
            database: config.database.clone(),
            isolation: config.isolation_level,
            read_only: false,
            network_timeout: config.socket_timeout,
        };
        let mut conn = Self {
            codec,
            statements: StatementCache::new(config.prep_stmt_cache_size),
            version: ServerVersion::parse(&hs.greeting.server_version),
            connection_id: hs.greeting.connection_id,
            server_capabilities: hs.greeting.capabilities,
            capabilities: hs.capabilities,
            status_flags: hs.status_flags,
            host: host.clone(),
            epoch: next_epoch(),
            broken: false,
            session: SessionState::new(initial),
            last_update: UpdateCount::default(),
            config,
            registry,
            connector,
        };
        if let Err(e) = conn.initialize() {
            conn.abort();
            return Err(e);
        }
        tracing::debug!(
            connection_id = conn.connection_id,
            server_version = %conn.version.raw,
            plugin = %hs.auth_plugin,
            secure = hs.secure,
            "connected"
        );
        Ok(conn)
    }

    /// Session variables, init SQL, autocommit and isolation defaults.
    #[allow(clippy::result_large_err)]
    fn initialize(&mut self) -> Result<(), Error> {
        let config = Arc::clone(&self.config);
        if !config.session_variables.is_empty() {
            let assignments: Vec<String> = config
                .session_variables
                .iter()
                .map(|(name, value)| format!("{name} = {value}"))
                .collect();
            self.simple(&format!("SET SESSION {}", assignments.join(", ")))?;
        }
        if let Some(sql) = &config.init_sql {
            self.simple(sql)?;
        }
        let server_autocommit = self.status_flags & server_status::SERVER_STATUS_AUTOCOMMIT != 0;
        if server_autocommit != config.autocommit {
            self.simple(autocommit_sql(config.autocommit))?;
        }
        if let Some(level) = config.isolation_level {
            self.simple(&isolation_sql(level))?;
        }
        Ok(())
    }

    pub fn host(&self) -> &HostDescriptor {
        &self.host
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn version(&self) -> &ServerVersion {
        &self.version
    }

    /// Capabilities in effect for this session.
    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    pub fn status_flags(&self) -> u16 {
        self.status_flags
    }

    /// Result of the last command that returned an OK packet.
    pub fn last_update(&self) -> UpdateCount {
        self.last_update
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn is_secure(&self) -> bool {
        self.codec.is_secure()
    }

    pub fn in_transaction(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_IN_TRANS != 0
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Keep generated savepoint names unique across a replaced session.
    pub(crate) fn continue_savepoints(&mut self, counter: u64) {
        self.session.continue_savepoints(counter);
    }

    pub fn session_snapshot(&self) -> SessionSnapshot {
        self.session.current().clone()
    }

    pub fn cached_statements(&self) -> usize {
        self.statements.len()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            connector: Arc::clone(&self.connector),
            registry: Arc::clone(&self.registry),
            config: Arc::clone(&self.config),
            host: self.host.clone(),
            connection_id: self.connection_id,
        }
    }

    fn no_backslash_escapes(&self) -> bool {
        self.status_flags & server_status::SERVER_STATUS_NO_BACKSLASH_ESCAPES != 0
    }

    pub(crate) fn deprecate_eof(&self) -> bool {
        self.capabilities & capabilities::CLIENT_DEPRECATE_EOF != 0
    }

    fn supports_bulk(&self) -> bool {
        self.config.use_bulk_stmts
            && self.capabilities & capabilities::MARIADB_CLIENT_STMT_BULK_OPERATIONS != 0
    }

    // -- wire helpers -------------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn guard(&self) -> Result<(), Error> {
        if self.broken {
            return Err(connection_lost(format!(
                "connection {} to {} is no longer usable",
                self.connection_id, self.host
            )));
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if is_fatal(e) && !self.broken {
                tracing::debug!(connection_id = self.connection_id, error = %e, "connection broken");
                self.broken = true;
            }
        }
        result
    }

    #[allow(clippy::result_large_err)]
    fn send_command(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.guard()?;
        let result = self.codec.write_command(payload);
        self.track(result)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.guard()?;
        let result = self.codec.write_packet(payload);
        self.track(result)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn read_packet(&mut self) -> Result<Vec<u8>, Error> {
        self.guard()?;
        let result = self.codec.read_packet();
        self.track(result)
    }

    /// A reply that cannot be parsed leaves the stream position unknown.
    pub(crate) fn malformed(&mut self, message: impl Into<String>) -> Error {
        let err = protocol_error(message);
        if !self.broken {
            tracing::debug!(connection_id = self.connection_id, error = %err, "connection broken");
            self.broken = true;
        }
        err
    }

    /// Convert an error packet, marking the connection broken when the
    /// error means the session is gone.
    pub(crate) fn server_error(&mut self, packet: &[u8], sql: Option<&str>) -> Error {
        let err = match PacketReader::new(packet).parse_err_packet() {
            Some(err) => self.config.error_map.to_error(&err, sql),
            None => protocol_error("invalid error packet"),
        };
        if is_fatal(&err) && !self.broken {
            tracing::debug!(connection_id = self.connection_id, error = %err, "connection broken");
            self.broken = true;
        }
        err
    }

    pub(crate) fn apply_ok(&mut self, ok: &OkPacket) {
        self.status_flags = ok.status_flags;
        self.last_update = UpdateCount {
            affected_rows: ok.affected_rows,
            last_insert_id: ok.last_insert_id,
            warnings: ok.warnings,
        };
    }

    pub(crate) fn apply_status(&mut self, status_flags: u16) {
        self.status_flags = status_flags;
    }

    /// Read an OK or error reply.
    #[allow(clippy::result_large_err)]
    fn read_ok(&mut self, sql: Option<&str>) -> Result<OkPacket, Error> {
        let packet = self.read_packet()?;
        match PacketType::of(&packet) {
            PacketType::Ok => {
                let ok = PacketReader::new(&packet)
                    .parse_ok_packet()
                    .ok_or_else(|| self.malformed("invalid OK packet"))?;
                self.apply_ok(&ok);
                Ok(ok)
            }
            PacketType::Error => Err(self.server_error(&packet, sql)),
            _ => Err(self.malformed(format!(
                "expected OK packet, got 0x{:02X}",
                packet.first().copied().unwrap_or(0)
            ))),
        }
    }

    // -- text protocol ------------------------------------------------------

    /// Send SQL text and stream its results.
    #[allow(clippy::result_large_err)]
    pub fn query_stream(&mut self, sql: &str) -> Result<ResultStream<'_>, Error> {
        let mut writer = PacketWriter::command(Command::Query);
        writer.write_bytes(sql.as_bytes());
        tracing::trace!(sql, "query");
        self.send_command(writer.as_bytes())?;
        ResultStream::start(self, Some(sql.to_string()), false, None)
    }

    /// Run SQL text and buffer every result.
    #[allow(clippy::result_large_err)]
    pub fn execute_raw(&mut self, sql: &str) -> Result<Vec<QueryResult>, Error> {
        self.query_stream(sql)?.collect_all()
    }

    /// Rows of the first result set produced by `sql`.
    #[allow(clippy::result_large_err)]
    pub fn query(&mut self, sql: &str) -> Result<Vec<Row>, Error> {
        Ok(self
            .execute_raw(sql)?
            .into_iter()
            .find_map(QueryResult::into_rows)
            .map(|rs| rs.rows)
            .unwrap_or_default())
    }

    /// Update count of the first result produced by `sql`.
    #[allow(clippy::result_large_err)]
    pub fn execute_update(&mut self, sql: &str) -> Result<UpdateCount, Error> {
        Ok(self
            .execute_raw(sql)?
            .iter()
            .find_map(QueryResult::update_count)
            .unwrap_or_default())
    }

    #[allow(clippy::result_large_err)]
    fn simple(&mut self, sql: &str) -> Result<(), Error> {
        self.execute_raw(sql).map(|_| ())
    }

    /// COM_PING.
    #[allow(clippy::result_large_err)]
    pub fn ping(&mut self) -> Result<(), Error> {
        self.send_command(&[Command::Ping as u8])?;
        self.read_ok(None).map(|_| ())
    }

    // -- prepared statements ------------------------------------------------

    #[allow(clippy::result_large_err)]
    fn read_column_defs(&mut self, count: u16) -> Result<Vec<ColumnDef>, Error> {
        let mut defs = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let packet = self.read_packet()?;
            let def = ColumnDef::parse(&packet)
                .ok_or_else(|| self.malformed("invalid column definition"))?;
            defs.push(def);
        }
        if count > 0 && !self.deprecate_eof() {
            self.read_packet()?;
        }
        Ok(defs)
    }

    /// COM_STMT_PREPARE. Statement forms the server cannot prepare come
    /// back as [`PrepareOutcome::Unsupported`] rather than an error.
    #[allow(clippy::result_large_err)]
    pub fn server_prepare(&mut self, sql: &str) -> Result<PrepareOutcome, Error> {
        self.send_command(&stmt_prepare_payload(sql))?;
        let first = self.read_packet()?;
        if PacketType::of(&first) == PacketType::Error {
            if let Some(err) = PacketReader::new(&first).parse_err_packet() {
                let category = self.config.error_map.classify(err.error_code, &err.sql_state);
                if category == ErrorCategory::Unsupported {
                    return Ok(PrepareOutcome::Unsupported(format!(
                        "{} ({})",
                        err.error_message, err.error_code
                    )));
                }
            }
            return Err(self.server_error(&first, Some(sql)));
        }

        let header = parse_stmt_prepare_ok(&first)
            .ok_or_else(|| self.malformed("invalid prepare response"))?;
        let params = self.read_column_defs(header.num_params)?;
        let columns = self.read_column_defs(header.num_columns)?;
        tracing::debug!(
            statement_id = header.statement_id,
            params = header.num_params,
            columns = header.num_columns,
            "prepared"
        );
        Ok(PrepareOutcome::Prepared(Arc::new(ServerStatement::new(
            header.statement_id,
            sql.to_string(),
            params,
            columns,
        ))))
    }

    /// Prepare `sql`, reusing a cached server statement when possible and
    /// falling back to client-side emulation when the server cannot
    /// prepare it.
    #[allow(clippy::result_large_err)]
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement, Error> {
        if !self.config.use_server_prepare {
            return Ok(PreparedStatement::emulated(self.epoch, sql));
        }
        if let Some(stmt) = self.statements.get(sql) {
            return Ok(PreparedStatement::server(self.epoch, stmt));
        }
        match self.server_prepare(sql)? {
            PrepareOutcome::Prepared(stmt) => {
                if let Some(evicted) = self.statements.insert(Arc::clone(&stmt)) {
                    self.close_server_statement(&evicted)?;
                }
                Ok(PreparedStatement::server(self.epoch, stmt))
            }
            PrepareOutcome::Unsupported(reason) => {
                tracing::warn!(sql, reason = %reason, "server cannot prepare statement; emulating");
                Ok(PreparedStatement::emulated(self.epoch, sql))
            }
        }
    }

    /// Send COM_STMT_CLOSE unless the statement was already released.
    #[allow(clippy::result_large_err)]
    fn close_server_statement(&mut self, stmt: &ServerStatement) -> Result<(), Error> {
        if stmt.release() {
            tracing::trace!(statement_id = stmt.statement_id, "closing statement");
            self.send_command(&stmt_close_payload(stmt.statement_id))?;
        }
        Ok(())
    }

    /// Close a handle. Later executions fail with a stale-statement error.
    ///
    /// A server statement still held by the cache stays open for other
    /// handles and is closed when evicted.
    #[allow(clippy::result_large_err)]
    pub fn close_statement(&mut self, stmt: &mut PreparedStatement) -> Result<(), Error> {
        if stmt.is_closed() {
            return Ok(());
        }
        stmt.mark_closed();
        if let Binding::Server(server) = &stmt.binding {
            if stmt.epoch == self.epoch && !self.statements.holds(server) {
                let server = Arc::clone(server);
                self.close_server_statement(&server)?;
            }
        }
        Ok(())
    }

    /// Discard long data and cursor state of a statement.
    #[allow(clippy::result_large_err)]
    pub(crate) fn reset_statement(&mut self, statement_id: u32) -> Result<(), Error> {
        self.send_command(&stmt_reset_payload(statement_id))?;
        self.read_ok(None).map(|_| ())
    }

    /// Re-prepare when the handle belongs to another physical connection
    /// or its server statement was evicted.
    #[allow(clippy::result_large_err)]
    fn refresh(&mut self, stmt: &mut PreparedStatement) -> Result<(), Error> {
        stmt.ensure_open()?;
        if !stmt.is_current(self.epoch) {
            tracing::warn!(sql = stmt.sql(), "statement no longer valid on this connection; re-preparing");
            let fresh = self.prepare(stmt.sql())?;
            stmt.rebind(fresh);
        }
        Ok(())
    }

    /// Stream parameters at or above the long-data threshold.
    #[allow(clippy::result_large_err)]
    fn send_long_data(&mut self, statement_id: u32, params: &[Value]) -> Result<Vec<bool>, Error> {
        let threshold = self.config.long_data_threshold;
        let mut sent = vec![false; params.len()];
        if threshold == 0 {
            return Ok(sent);
        }
        for (i, param) in params.iter().enumerate() {
            let bytes = match param {
                Value::Bytes(b) if b.len() >= threshold => b.as_slice(),
                Value::Text(s) if s.len() >= threshold => s.as_bytes(),
                _ => continue,
            };
            let index = u16::try_from(i).map_err(|_| {
                Error::Custom(format!("parameter index {i} out of range for long data"))
            })?;
            for chunk in bytes.chunks(LONG_DATA_CHUNK) {
                self.send_command(&stmt_send_long_data_payload(statement_id, index, chunk))?;
            }
            tracing::trace!(statement_id, index, len = bytes.len(), "sent long data");
            sent[i] = true;
        }
        Ok(sent)
    }

    /// Execute a prepared statement and stream its results.
    #[allow(clippy::result_large_err)]
    pub fn execute_stream(
        &mut self,
        stmt: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<ResultStream<'_>, Error> {
        self.refresh(stmt)?;
        stmt.check_param_count(params.len())?;
        match stmt.binding.clone() {
            Binding::Emulated => {
                let sql = interpolate_params(stmt.sql(), params, self.no_backslash_escapes())?;
                self.query_stream(&sql)
            }
            Binding::Server(server) => {
                let long_data = self.send_long_data(server.statement_id, params)?;
                self.send_command(&stmt_execute_payload(server.statement_id, params, &long_data))?;
                let reset = long_data.contains(&true).then_some(server.statement_id);
                ResultStream::start(self, Some(server.sql.clone()), true, reset)
            }
        }
    }

    /// Execute a prepared statement and buffer its first result.
    #[allow(clippy::result_large_err)]
    pub fn execute(
        &mut self,
        stmt: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<QueryResult, Error> {
        let mut stream = self.execute_stream(stmt, params)?;
        let first = stream.collect_current()?;
        drop(stream);
        Ok(first.unwrap_or(QueryResult::Update(UpdateCount::default())))
    }

    /// Execute a statement once per parameter row.
    ///
    /// Uses COM_STMT_BULK_EXECUTE when the server supports it and every
    /// row binds the same types; otherwise executes row by row.
    #[allow(clippy::result_large_err)]
    pub fn execute_batch(
        &mut self,
        stmt: &mut PreparedStatement,
        rows: &[Vec<Value>],
    ) -> Result<BatchResult, Error> {
        if rows.is_empty() {
            return Ok(BatchResult::default());
        }
        self.refresh(stmt)?;
        for row in rows {
            stmt.check_param_count(row.len())?;
        }

        if let Binding::Server(server) = stmt.binding.clone() {
            if self.supports_bulk() && server.param_count() > 0 && self.bulk_compatible(rows) {
                self.send_command(&stmt_bulk_execute_payload(server.statement_id, rows))?;
                let results =
                    ResultStream::start(self, Some(server.sql.clone()), true, None)?.collect_all()?;
                let total_affected = results
                    .iter()
                    .filter_map(QueryResult::update_count)
                    .map(|u| u.affected_rows)
                    .sum();
                tracing::debug!(rows = rows.len(), total_affected, "bulk execute");
                return Ok(BatchResult {
                    total_affected,
                    per_row: None,
                });
            }
        }

        let mut per_row = Vec::with_capacity(rows.len());
        for row in rows {
            let affected = self
                .execute(stmt, row)?
                .update_count()
                .map_or(0, |u| u.affected_rows);
            per_row.push(affected);
        }
        Ok(BatchResult {
            total_affected: per_row.iter().sum(),
            per_row: Some(per_row),
        })
    }

    /// Bulk rows need one type per column and no long data.
    fn bulk_compatible(&self, rows: &[Vec<Value>]) -> bool {
        let threshold = self.config.long_data_threshold;
        let first = &rows[0];
        rows.iter().all(|row| {
            row.iter().zip(first).all(|(value, head)| {
                let long = threshold > 0 && value.payload_len().is_some_and(|len| len >= threshold);
                let same_type = value.is_null() || head.is_null() || param_type(value) == param_type(head);
                !long && same_type && !head.is_null()
            })
        })
    }

    // -- transactions and session -------------------------------------------

    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self) -> Result<(), Error> {
        self.simple("START TRANSACTION")
    }

    /// Open a transaction when autocommit is off and none is active.
    #[allow(clippy::result_large_err)]
    pub fn begin_implicit_transaction_if_needed(&mut self) -> Result<(), Error> {
        if !self.session.current().autocommit && !self.in_transaction() {
            self.begin()?;
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self) -> Result<(), Error> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.simple("COMMIT")
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self) -> Result<(), Error> {
        if !self.in_transaction() {
            return Ok(());
        }
        self.simple("ROLLBACK")
    }

    /// Create a savepoint. Without a name, a unique one is generated.
    #[allow(clippy::result_large_err)]
    pub fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, Error> {
        let (name, sequence) = match name {
            Some(name) => {
                validate_savepoint_name(name)?;
                (name.to_string(), self.session.register_savepoint())
            }
            None => self.session.next_savepoint(),
        };
        self.simple(&format!("SAVEPOINT {name}"))?;
        Ok(Savepoint::new(name, sequence))
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        validate_savepoint_name(savepoint.name())?;
        let result = self.simple(&format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()));
        result.map_err(savepoint_error)
    }

    #[allow(clippy::result_large_err)]
    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        validate_savepoint_name(savepoint.name())?;
        let result = self.simple(&format!("RELEASE SAVEPOINT {}", savepoint.name()));
        result.map_err(savepoint_error)
    }

    #[allow(clippy::result_large_err)]
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error> {
        if self.session.current().autocommit == enabled {
            return Ok(());
        }
        self.simple(autocommit_sql(enabled))?;
        self.session.set_autocommit(enabled);
        Ok(())
    }

    /// COM_INIT_DB.
    #[allow(clippy::result_large_err)]
    pub fn set_database(&mut self, database: &str) -> Result<(), Error> {
        self.init_db(database)?;
        self.session.set_database(database);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn init_db(&mut self, database: &str) -> Result<(), Error> {
        let mut writer = PacketWriter::command(Command::InitDb);
        writer.write_bytes(database.as_bytes());
        self.send_command(writer.as_bytes())?;
        self.read_ok(None).map(|_| ())
    }

    #[allow(clippy::result_large_err)]
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<(), Error> {
        self.simple(&isolation_sql(level))?;
        self.session.set_isolation(level);
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), Error> {
        self.simple(read_only_sql(read_only))?;
        self.session.set_read_only(read_only);
        Ok(())
    }

    /// Bound every blocking read on this connection.
    #[allow(clippy::result_large_err)]
    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let result = self.codec.set_read_timeout(timeout);
        self.track(result)?;
        self.session.set_network_timeout(timeout);
        Ok(())
    }

    /// Bring this connection's session to `target`, touching only the
    /// aspects that differ.
    #[allow(clippy::result_large_err)]
    pub fn sync_session(&mut self, target: &SessionSnapshot) -> Result<(), Error> {
        let current = self.session.current().clone();
        if target.database != current.database {
            if let Some(db) = &target.database {
                self.set_database(db)?;
            }
        }
        if target.autocommit != current.autocommit {
            self.set_autocommit(target.autocommit)?;
        }
        if target.isolation != current.isolation {
            if let Some(level) = target.isolation {
                self.set_isolation_level(level)?;
            }
        }
        if target.read_only != current.read_only {
            self.set_read_only(target.read_only)?;
        }
        if target.network_timeout != current.network_timeout {
            self.set_network_timeout(target.network_timeout)?;
        }
        Ok(())
    }

    /// Restore the session the connection was created with.
    ///
    /// A session with no changes and no open transaction resets without
    /// any wire traffic.
    #[allow(clippy::result_large_err)]
    pub fn reset(&mut self) -> Result<(), Error> {
        let in_transaction = self.in_transaction();
        if !self.session.is_dirty() && !in_transaction {
            self.session.mark_restored();
            return Ok(());
        }
        if in_transaction {
            self.simple("ROLLBACK")?;
        }

        let initial = self.session.initial().clone();
        if self.config.use_reset_connection && self.version.supports_reset_connection() {
            self.send_command(&[Command::ResetConnection as u8])?;
            self.read_ok(None)?;
            // The server dropped every prepared statement with the session
            for stmt in self.statements.drain() {
                stmt.release();
            }
            self.epoch = next_epoch();
            self.initialize()?;
            if self.session.is_flagged(dirty::DATABASE) {
                if let Some(db) = &initial.database {
                    self.init_db(db)?;
                }
            }
        } else {
            if self.session.is_flagged(dirty::AUTOCOMMIT) {
                self.simple(autocommit_sql(initial.autocommit))?;
            }
            if self.session.is_flagged(dirty::DATABASE) {
                if let Some(db) = &initial.database {
                    self.init_db(db)?;
                }
            }
            if self.session.is_flagged(dirty::ISOLATION) {
                let sql = match initial.isolation {
                    Some(level) => isolation_sql(level),
                    None => {
                        let var = self.version.isolation_variable();
                        format!("SET @@SESSION.{var} = @@GLOBAL.{var}")
                    }
                };
                self.simple(&sql)?;
            }
            if self.session.is_flagged(dirty::READ_ONLY) {
                self.simple(read_only_sql(initial.read_only))?;
            }
        }
        if self.session.is_flagged(dirty::NETWORK_TIMEOUT) {
            let result = self.codec.set_read_timeout(initial.network_timeout);
            self.track(result)?;
        }

        self.session.mark_restored();
        tracing::debug!(connection_id = self.connection_id, "session reset");
        Ok(())
    }

    /// Ping bounded by `timeout`.
    pub fn is_valid(&mut self, timeout: Duration) -> bool {
        if self.broken {
            return false;
        }
        let restore = self.session.current().network_timeout;
        let bounded = timeout.max(Duration::from_millis(1));
        if self.codec.set_read_timeout(Some(bounded)).is_err() {
            return false;
        }
        let alive = self.ping().is_ok();
        if !self.broken {
            let _ = self.codec.set_read_timeout(restore);
        }
        alive
    }

    /// Drop the link without COM_QUIT.
    pub fn abort(&mut self) {
        self.broken = true;
        self.codec.shutdown();
    }

    /// Say goodbye and close the link.
    pub fn close(mut self) {
        if !self.broken {
            let _ = self.send_command(&[Command::Quit as u8]);
        }
        self.abort();
    }
}

fn autocommit_sql(enabled: bool) -> &'static str {
    if enabled {
        "SET autocommit=1"
    } else {
        "SET autocommit=0"
    }
}

fn isolation_sql(level: IsolationLevel) -> String {
    format!("SET SESSION TRANSACTION ISOLATION LEVEL {}", level.as_sql())
}

fn read_only_sql(read_only: bool) -> &'static str {
    if read_only {
        "SET SESSION TRANSACTION READ ONLY"
    } else {
        "SET SESSION TRANSACTION READ WRITE"
    }
}

fn savepoint_error(err: Error) -> Error {
    if err.server_code() == Some(ER_SP_DOES_NOT_EXIST) {
        return Error::Transaction(TransactionError {
            kind: TransactionErrorKind::SavepointNotFound,
            message: err.to_string(),
        });
    }
    err
}

impl Connection for MySqlConnection {
    type Statement = PreparedStatement;

    fn execute_raw(&mut self, sql: &str) -> dolphin_core::Result<Vec<QueryResult>> {
        MySqlConnection::execute_raw(self, sql)
    }

    fn prepare(&mut self, sql: &str) -> dolphin_core::Result<PreparedStatement> {
        MySqlConnection::prepare(self, sql)
    }

    fn execute(
        &mut self,
        stmt: &mut PreparedStatement,
        params: &[Value],
    ) -> dolphin_core::Result<QueryResult> {
        MySqlConnection::execute(self, stmt, params)
    }

    fn close_statement(&mut self, stmt: &mut PreparedStatement) -> dolphin_core::Result<()> {
        MySqlConnection::close_statement(self, stmt)
    }

    fn begin_implicit_transaction_if_needed(&mut self) -> dolphin_core::Result<()> {
        MySqlConnection::begin_implicit_transaction_if_needed(self)
    }

    fn commit(&mut self) -> dolphin_core::Result<()> {
        MySqlConnection::commit(self)
    }

    fn rollback(&mut self) -> dolphin_core::Result<()> {
        MySqlConnection::rollback(self)
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> dolphin_core::Result<Savepoint> {
        MySqlConnection::set_savepoint(self, name)
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> dolphin_core::Result<()> {
        MySqlConnection::rollback_to(self, savepoint)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> dolphin_core::Result<()> {
        MySqlConnection::release_savepoint(self, savepoint)
    }

    fn reset(&mut self) -> dolphin_core::Result<()> {
        MySqlConnection::reset(self)
    }

    fn is_valid(&mut self, timeout: Duration) -> bool {
        MySqlConnection::is_valid(self, timeout)
    }

    fn abort(&mut self) {
        MySqlConnection::abort(self);
    }

    fn server_version(&self) -> &str {
        &self.version.raw
    }

    fn server_capabilities(&self) -> u64 {
        self.server_capabilities
    }
}
