//! The surface a driver connection exposes to pool and metadata layers.
//!
//! - [`Connection`] - blocking command interface for one logical session
//! - [`IsolationLevel`] - SQL transaction isolation levels
//! - [`Savepoint`] - a named marker inside an open transaction

use std::time::Duration;

use crate::error::Result;
use crate::result::QueryResult;
use crate::value::Value;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationLevel {
    /// Dirty reads, non-repeatable reads and phantoms are possible.
    ReadUncommitted,
    /// Only committed changes are visible.
    ReadCommitted,
    /// Consistent snapshot for the whole transaction. Server default for InnoDB.
    #[default]
    RepeatableRead,
    /// Transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    /// Parse the server's spelling (`REPEATABLE-READ`) or the SQL spelling.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().replace('-', " ").as_str() {
            "READ UNCOMMITTED" => Some(IsolationLevel::ReadUncommitted),
            "READ COMMITTED" => Some(IsolationLevel::ReadCommitted),
            "REPEATABLE READ" => Some(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

/// A server-side savepoint created by the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    name: String,
    sequence: u64,
}

impl Savepoint {
    pub fn new(name: impl Into<String>, sequence: u64) -> Self {
        Self {
            name: name.into(),
            sequence,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Position in the session's creation order.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Blocking command interface for one logical database session.
///
/// Exactly one command is in flight at a time; `&mut self` on every
/// command method makes that a compile-time property.
pub trait Connection {
    /// Prepared statement handle type.
    type Statement;

    /// Execute SQL text and collect every result it produced.
    fn execute_raw(&mut self, sql: &str) -> Result<Vec<QueryResult>>;

    /// Prepare a statement for repeated execution.
    fn prepare(&mut self, sql: &str) -> Result<Self::Statement>;

    /// Execute a prepared statement with bound parameters.
    fn execute(&mut self, stmt: &mut Self::Statement, params: &[Value]) -> Result<QueryResult>;

    /// Close a statement. Later executions of the same handle fail as stale.
    fn close_statement(&mut self, stmt: &mut Self::Statement) -> Result<()>;

    /// Open a transaction when autocommit is off and none is active.
    fn begin_implicit_transaction_if_needed(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Create a savepoint, generating a unique name when none is given.
    fn set_savepoint(&mut self, name: Option<&str>) -> Result<Savepoint>;

    fn rollback_to(&mut self, savepoint: &Savepoint) -> Result<()>;

    fn release_savepoint(&mut self, savepoint: &Savepoint) -> Result<()>;

    /// Restore the session state the connection was created with.
    fn reset(&mut self) -> Result<()>;

    /// Round-trip check bounded by `timeout`.
    fn is_valid(&mut self, timeout: Duration) -> bool;

    /// Drop the physical link without a goodbye.
    fn abort(&mut self);

    fn server_version(&self) -> &str;

    fn server_capabilities(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_parses_server_spelling() {
        assert_eq!(
            IsolationLevel::parse("REPEATABLE-READ"),
            Some(IsolationLevel::RepeatableRead)
        );
        assert_eq!(
            IsolationLevel::parse("read committed"),
            Some(IsolationLevel::ReadCommitted)
        );
        assert_eq!(IsolationLevel::parse("chaos"), None);
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
    }
}
