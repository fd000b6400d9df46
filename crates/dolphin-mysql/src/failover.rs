//! High-availability wrapper around [`MySqlConnection`].
//!
//! [`FailoverConnection`] holds at most one physical connection. When a
//! command breaks it and a high-availability mode is configured, the
//! controller reconnects to the next usable host, restores the session and,
//! inside a transaction, replays the statements logged so far before
//! retrying the failed command.
//!
//! ```text
//! Connected --link lost--> Degraded --> Reconnecting --ok--> Connected
//!                                            |
//!                                            +--budget spent--> ExhaustedFailed
//! ```
//!
//! `retries_all_down` bounds the total number of connection attempts of one
//! reconnect, across all hosts. Once exhausted the controller stays failed;
//! it never hands out the dead connection again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dolphin_core::error::{ConnectionError, ConnectionErrorKind, TransactionError, TransactionErrorKind};
use dolphin_core::{
    BatchResult, ConfigError, Connection, Error, IsolationLevel, QueryResult, Savepoint, Value,
};
use rand::seq::SliceRandom;

use crate::auth::AuthRegistry;
use crate::config::{HaMode, HostDescriptor, MySqlConfig};
use crate::connection::{MySqlConnection, connection_lost};
use crate::replay::{ReplayEntry, ReplayLog};
use crate::session::SessionSnapshot;
use crate::statement::PreparedStatement;
use crate::transport::{Connector, TcpConnector};

/// Lifecycle of a [`FailoverConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverState {
    Connected,
    /// The physical link failed; nothing has been attempted yet
    Degraded,
    Reconnecting,
    /// Every attempt of the budget failed. Terminal.
    ExhaustedFailed,
}

/// What a command means for an open transaction when the link fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpKind {
    Statement,
    Commit,
    Rollback,
}

fn exhausted(attempts: u32, last: Option<Error>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::FailoverExhausted,
        message: format!("no host accepted a connection after {attempts} attempts"),
        source: last.map(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
    })
}

fn transaction_error(kind: TransactionErrorKind, message: impl Into<String>) -> Error {
    Error::Transaction(TransactionError {
        kind,
        message: message.into(),
    })
}

/// A logical connection that survives the loss of its physical link.
pub struct FailoverConnection {
    config: Arc<MySqlConfig>,
    registry: Arc<AuthRegistry>,
    connector: Arc<dyn Connector>,
    current: Option<MySqlConnection>,
    state: FailoverState,
    /// Host -> end of its cooldown
    blacklist: HashMap<HostDescriptor, Instant>,
    replay: ReplayLog,
    /// Session to restore when no live connection can be asked
    session: Option<SessionSnapshot>,
    last_attempts: u32,
}

impl std::fmt::Debug for FailoverConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverConnection")
            .field("state", &self.state)
            .field("ha_mode", &self.config.ha_mode)
            .field("current", &self.current)
            .field("blacklisted", &self.blacklist.len())
            .field("replay_entries", &self.replay.len())
            .finish_non_exhaustive()
    }
}

impl FailoverConnection {
    /// Connect over TCP with the built-in authentication plugins.
    #[allow(clippy::result_large_err)]
    pub fn connect(config: MySqlConfig) -> Result<Self, Error> {
        Self::connect_with(
            Arc::new(TcpConnector),
            Arc::new(AuthRegistry::with_builtins()),
            config,
        )
    }

    /// Connect to the first usable host, spending at most
    /// `retries_all_down` attempts.
    #[allow(clippy::result_large_err)]
    pub fn connect_with(
        connector: Arc<dyn Connector>,
        registry: Arc<AuthRegistry>,
        config: MySqlConfig,
    ) -> Result<Self, Error> {
        if config.hosts.is_empty() {
            return Err(Error::Config(ConfigError {
                message: "no hosts configured".to_string(),
                source: None,
            }));
        }
        let replay = ReplayLog::new(config.transaction_replay_size);
        let mut conn = Self {
            config: Arc::new(config),
            registry,
            connector,
            current: None,
            state: FailoverState::Degraded,
            blacklist: HashMap::new(),
            replay,
            session: None,
            last_attempts: 0,
        };
        conn.reconnect()?;
        Ok(conn)
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn config(&self) -> &MySqlConfig {
        &self.config
    }

    /// The live physical connection, if any.
    pub fn current(&self) -> Option<&MySqlConnection> {
        self.current.as_ref()
    }

    pub fn replay_log(&self) -> &ReplayLog {
        &self.replay
    }

    /// Connection attempts spent by the most recent reconnect.
    pub fn last_attempts(&self) -> u32 {
        self.last_attempts
    }

    pub fn is_blacklisted(&self, host: &HostDescriptor) -> bool {
        self.blacklist
            .get(host)
            .is_some_and(|until| *until > Instant::now())
    }

    fn blacklist_host(&mut self, host: &HostDescriptor) {
        let until = Instant::now() + self.config.blacklist_cooldown;
        tracing::debug!(host = %host, cooldown = ?self.config.blacklist_cooldown, "blacklisting host");
        self.blacklist.insert(host.clone(), until);
    }

    fn read_only(&self) -> bool {
        self.current
            .as_ref()
            .map(|c| c.session().current().read_only)
            .or_else(|| self.session.as_ref().map(|s| s.read_only))
            .unwrap_or(false)
    }

    /// Hosts to try in one sweep, in order.
    ///
    /// Blacklisted hosts are skipped while their cooldown lasts. When every
    /// host is blacklisted they are all tried, earliest expiry first.
    fn sweep_order(&self) -> Vec<HostDescriptor> {
        let mut hosts = self.config.hosts.clone();
        match self.config.ha_mode {
            HaMode::None => hosts.truncate(1),
            HaMode::Sequential => {}
            HaMode::LoadBalance => hosts.shuffle(&mut rand::thread_rng()),
            HaMode::Replication => {
                let replicas_first = self.read_only();
                hosts.sort_by_key(|h| h.is_primary() == replicas_first);
            }
        }

        let now = Instant::now();
        let usable: Vec<HostDescriptor> = hosts
            .iter()
            .filter(|h| self.blacklist.get(*h).is_none_or(|until| *until <= now))
            .cloned()
            .collect();
        if !usable.is_empty() {
            return usable;
        }
        hosts.sort_by_key(|h| self.blacklist.get(h).copied());
        hosts
    }

    /// Open a new physical connection within the attempt budget.
    #[tracing::instrument(level = "debug", skip(self))]
    #[allow(clippy::result_large_err)]
    fn reconnect(&mut self) -> Result<(), Error> {
        self.state = FailoverState::Reconnecting;
        let budget = if self.config.ha_mode.is_enabled() {
            self.config.retries_all_down.max(1)
        } else {
            1
        };
        let mut attempts = 0;
        let mut last_error = None;

        'sweeps: loop {
            for host in self.sweep_order() {
                if attempts >= budget {
                    break 'sweeps;
                }
                attempts += 1;
                match MySqlConnection::connect_with(
                    Arc::clone(&self.connector),
                    Arc::clone(&self.registry),
                    &host,
                    Arc::clone(&self.config),
                ) {
                    Ok(conn) => {
                        tracing::info!(host = %host, attempts, "connected");
                        self.blacklist.remove(&host);
                        self.current = Some(conn);
                        self.state = FailoverState::Connected;
                        self.last_attempts = attempts;
                        return Ok(());
                    }
                    Err(e) => {
                        tracing::warn!(host = %host, attempt = attempts, error = %e, "connection attempt failed");
                        self.blacklist_host(&host);
                        last_error = Some(e);
                    }
                }
            }
            if attempts >= budget {
                break;
            }
            if !self.config.failover_pause.is_zero() {
                std::thread::sleep(self.config.failover_pause);
            }
        }

        tracing::error!(attempts, "all hosts are down");
        self.state = FailoverState::ExhaustedFailed;
        self.last_attempts = attempts;
        Err(exhausted(attempts, last_error))
    }

    #[allow(clippy::result_large_err)]
    fn ensure_usable(&self) -> Result<(), Error> {
        if self.state == FailoverState::ExhaustedFailed {
            return Err(exhausted(self.last_attempts, None));
        }
        Ok(())
    }

    /// Run `op` on the live connection, failing over when it breaks the
    /// link.
    #[allow(clippy::result_large_err)]
    fn run<T>(
        &mut self,
        kind: OpKind,
        entry: Option<ReplayEntry>,
        mut op: impl FnMut(&mut MySqlConnection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.ensure_usable()?;
        if self.current.is_none() {
            self.reconnect()?;
        }
        let Some(conn) = self.current.as_mut() else {
            return Err(connection_lost("no connection"));
        };

        let err = match op(conn) {
            Ok(value) => {
                self.replay.observe(conn.in_transaction(), entry);
                return Ok(value);
            }
            Err(e) => e,
        };
        if !conn.is_broken() {
            return Err(err);
        }
        let in_transaction = conn.in_transaction();
        let snapshot = conn.session_snapshot();
        let savepoints = conn.session().savepoint_counter();
        let host = conn.host().clone();
        self.state = FailoverState::Degraded;
        if !self.config.ha_mode.is_enabled() {
            return Err(err);
        }

        tracing::warn!(host = %host, in_transaction, error = %err, "connection lost; failing over");
        if let Some(mut dead) = self.current.take() {
            dead.abort();
        }
        self.blacklist_host(&host);
        self.session = Some(snapshot.clone());
        self.reconnect()?;
        let Some(conn) = self.current.as_mut() else {
            return Err(connection_lost("no connection after failover"));
        };
        conn.sync_session(&snapshot)?;
        conn.continue_savepoints(savepoints);

        if in_transaction {
            match kind {
                OpKind::Rollback => {
                    self.replay.clear();
                    return op(conn);
                }
                OpKind::Commit => {
                    self.replay.clear();
                    return Err(connection_lost(format!(
                        "connection lost during COMMIT; outcome unknown: {err}"
                    )));
                }
                OpKind::Statement => {}
            }
            if !self.config.transaction_replay {
                self.replay.clear();
                return Err(transaction_error(
                    TransactionErrorKind::Lost,
                    format!("connection lost inside a transaction: {err}"),
                ));
            }
            if self.replay.overflowed() {
                self.replay.clear();
                return Err(transaction_error(
                    TransactionErrorKind::ReplayOverflow,
                    "transaction exceeded the replay log capacity and cannot be replayed",
                ));
            }
            let entries = self.replay.entries().to_vec();
            tracing::info!(statements = entries.len(), "replaying transaction");
            if let Err(e) = replay_entries(conn, &entries) {
                self.replay.clear();
                return Err(transaction_error(
                    TransactionErrorKind::ReplayFailed,
                    format!("transaction replay failed: {e}"),
                ));
            }
        }

        let value = op(conn)?;
        self.replay.observe(conn.in_transaction(), entry);
        Ok(value)
    }

    #[allow(clippy::result_large_err)]
    pub fn execute_raw(&mut self, sql: &str) -> Result<Vec<QueryResult>, Error> {
        self.run(OpKind::Statement, Some(ReplayEntry::Sql(sql.to_string())), |c| {
            c.execute_raw(sql)
        })
    }

    #[allow(clippy::result_large_err)]
    pub fn prepare(&mut self, sql: &str) -> Result<PreparedStatement, Error> {
        self.run(OpKind::Statement, None, |c| c.prepare(sql))
    }

    /// Execute a handle. Handles prepared on a connection that has since
    /// been replaced are re-prepared on the current one.
    #[allow(clippy::result_large_err)]
    pub fn execute(
        &mut self,
        stmt: &mut PreparedStatement,
        params: &[Value],
    ) -> Result<QueryResult, Error> {
        let entry = ReplayEntry::Prepared {
            sql: stmt.sql().to_string(),
            params: params.to_vec(),
        };
        self.run(OpKind::Statement, Some(entry), |c| c.execute(stmt, params))
    }

    #[allow(clippy::result_large_err)]
    pub fn execute_batch(
        &mut self,
        stmt: &mut PreparedStatement,
        rows: &[Vec<Value>],
    ) -> Result<BatchResult, Error> {
        let result = self.run(OpKind::Statement, None, |c| c.execute_batch(stmt, rows))?;
        if let Some(conn) = self.current.as_ref() {
            let in_transaction = conn.in_transaction();
            for row in rows {
                self.replay.observe(
                    in_transaction,
                    Some(ReplayEntry::Prepared {
                        sql: stmt.sql().to_string(),
                        params: row.clone(),
                    }),
                );
            }
        }
        Ok(result)
    }

    #[allow(clippy::result_large_err)]
    pub fn close_statement(&mut self, stmt: &mut PreparedStatement) -> Result<(), Error> {
        match self.current.as_mut() {
            Some(conn) if !conn.is_broken() => conn.close_statement(stmt),
            // The server statement died with its connection
            _ => {
                if !stmt.is_closed() {
                    stmt.mark_closed();
                }
                Ok(())
            }
        }
    }

    #[allow(clippy::result_large_err)]
    pub fn begin(&mut self) -> Result<(), Error> {
        self.run(
            OpKind::Statement,
            Some(ReplayEntry::Sql("START TRANSACTION".to_string())),
            MySqlConnection::begin,
        )
    }

    #[allow(clippy::result_large_err)]
    pub fn begin_implicit_transaction_if_needed(&mut self) -> Result<(), Error> {
        let began = self.run(OpKind::Statement, None, |c| {
            let pending = !c.session().current().autocommit && !c.in_transaction();
            c.begin_implicit_transaction_if_needed().map(|()| pending)
        })?;
        if began {
            if let Some(conn) = self.current.as_ref() {
                self.replay.observe(
                    conn.in_transaction(),
                    Some(ReplayEntry::Sql("START TRANSACTION".to_string())),
                );
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub fn commit(&mut self) -> Result<(), Error> {
        self.run(OpKind::Commit, None, MySqlConnection::commit)
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback(&mut self) -> Result<(), Error> {
        self.run(OpKind::Rollback, None, MySqlConnection::rollback)
    }

    #[allow(clippy::result_large_err)]
    pub fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint, Error> {
        let savepoint = self.run(OpKind::Statement, None, |c| c.set_savepoint(name))?;
        if let Some(conn) = self.current.as_ref() {
            self.replay.observe(
                conn.in_transaction(),
                Some(ReplayEntry::Sql(format!("SAVEPOINT {}", savepoint.name()))),
            );
        }
        Ok(savepoint)
    }

    #[allow(clippy::result_large_err)]
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        let entry = ReplayEntry::Sql(format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()));
        self.run(OpKind::Statement, Some(entry), |c| c.rollback_to(savepoint))
    }

    #[allow(clippy::result_large_err)]
    pub fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<(), Error> {
        let entry = ReplayEntry::Sql(format!("RELEASE SAVEPOINT {}", savepoint.name()));
        self.run(OpKind::Statement, Some(entry), |c| c.release_savepoint(savepoint))
    }

    #[allow(clippy::result_large_err)]
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<(), Error> {
        self.run(OpKind::Statement, None, |c| c.set_autocommit(enabled))
    }

    #[allow(clippy::result_large_err)]
    pub fn set_database(&mut self, database: &str) -> Result<(), Error> {
        self.run(OpKind::Statement, None, |c| c.set_database(database))
    }

    #[allow(clippy::result_large_err)]
    pub fn set_isolation_level(&mut self, level: IsolationLevel) -> Result<(), Error> {
        self.run(OpKind::Statement, None, |c| c.set_isolation_level(level))
    }

    #[allow(clippy::result_large_err)]
    pub fn set_read_only(&mut self, read_only: bool) -> Result<(), Error> {
        self.run(OpKind::Statement, None, |c| c.set_read_only(read_only))
    }

    #[allow(clippy::result_large_err)]
    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        self.run(OpKind::Statement, None, |c| c.set_network_timeout(timeout))
    }

    #[allow(clippy::result_large_err)]
    pub fn reset(&mut self) -> Result<(), Error> {
        self.run(OpKind::Rollback, None, MySqlConnection::reset)?;
        self.replay.clear();
        self.session = None;
        Ok(())
    }

    pub fn is_valid(&mut self, timeout: Duration) -> bool {
        self.current.as_mut().is_some_and(|c| c.is_valid(timeout))
    }

    pub fn abort(&mut self) {
        if let Some(conn) = self.current.as_mut() {
            conn.abort();
        }
    }

    /// Close the live connection, if any.
    pub fn close(mut self) {
        if let Some(conn) = self.current.take() {
            conn.close();
        }
    }
}

/// Re-run logged statements in order on a fresh connection.
#[allow(clippy::result_large_err)]
fn replay_entries(conn: &mut MySqlConnection, entries: &[ReplayEntry]) -> Result<(), Error> {
    for entry in entries {
        tracing::debug!(sql = entry.sql(), "replaying");
        match entry {
            ReplayEntry::Sql(sql) => {
                conn.execute_raw(sql)?;
            }
            ReplayEntry::Prepared { sql, params } => {
                let mut stmt = conn.prepare(sql)?;
                conn.execute(&mut stmt, params)?;
                conn.close_statement(&mut stmt)?;
            }
        }
    }
    Ok(())
}

impl Connection for FailoverConnection {
    type Statement = PreparedStatement;

    fn execute_raw(&mut self, sql: &str) -> dolphin_core::Result<Vec<QueryResult>> {
        FailoverConnection::execute_raw(self, sql)
    }

    fn prepare(&mut self, sql: &str) -> dolphin_core::Result<PreparedStatement> {
        FailoverConnection::prepare(self, sql)
    }

    fn execute(
        &mut self,
        stmt: &mut PreparedStatement,
        params: &[Value],
    ) -> dolphin_core::Result<QueryResult> {
        FailoverConnection::execute(self, stmt, params)
    }

    fn close_statement(&mut self, stmt: &mut PreparedStatement) -> dolphin_core::Result<()> {
        FailoverConnection::close_statement(self, stmt)
    }

    fn begin_implicit_transaction_if_needed(&mut self) -> dolphin_core::Result<()> {
        FailoverConnection::begin_implicit_transaction_if_needed(self)
    }

    fn commit(&mut self) -> dolphin_core::Result<()> {
        FailoverConnection::commit(self)
    }

    fn rollback(&mut self) -> dolphin_core::Result<()> {
        FailoverConnection::rollback(self)
    }

    fn set_savepoint(&mut self, name: Option<&str>) -> dolphin_core::Result<Savepoint> {
        FailoverConnection::set_savepoint(self, name)
    }

    fn rollback_to(&mut self, savepoint: &Savepoint) -> dolphin_core::Result<()> {
        FailoverConnection::rollback_to(self, savepoint)
    }

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> dolphin_core::Result<()> {
        FailoverConnection::release_savepoint(self, savepoint)
    }

    fn reset(&mut self) -> dolphin_core::Result<()> {
        FailoverConnection::reset(self)
    }

    fn is_valid(&mut self, timeout: Duration) -> bool {
        FailoverConnection::is_valid(self, timeout)
    }

    fn abort(&mut self) {
        FailoverConnection::abort(self);
    }

    fn server_version(&self) -> &str {
        self.current
            .as_ref()
            .map_or("", |c| c.version().raw.as_str())
    }

    fn server_capabilities(&self) -> u64 {
        self.current
            .as_ref()
            .map_or(0, <MySqlConnection as Connection>::server_capabilities)
    }
}
