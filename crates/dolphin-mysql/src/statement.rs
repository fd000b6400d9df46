//! Prepared statement handles.
//!
//! A [`ServerStatement`] is the server-side object created by
//! COM_STMT_PREPARE. It is shared between the statement cache and every
//! [`PreparedStatement`] handle for the same SQL, and it is released
//! (COM_STMT_CLOSE) at most once.
//!
//! A handle remembers the epoch of the connection that prepared it.
//! Executing it on a different physical connection, or after its server
//! statement was evicted, re-prepares transparently. Only an explicit
//! close makes the handle stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dolphin_core::error::{StatementError, StatementErrorKind};
use dolphin_core::Error;

use crate::types::{ColumnDef, count_placeholders};

/// Server-side prepared statement.
#[derive(Debug)]
pub struct ServerStatement {
    pub statement_id: u32,
    pub sql: String,
    pub params: Vec<ColumnDef>,
    pub columns: Arc<[ColumnDef]>,
    released: AtomicBool,
}

impl ServerStatement {
    pub fn new(statement_id: u32, sql: String, params: Vec<ColumnDef>, columns: Vec<ColumnDef>) -> Self {
        Self {
            statement_id,
            sql,
            params,
            columns: columns.into(),
            released: AtomicBool::new(false),
        }
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Mark the server statement gone. Returns true for the first caller
    /// only; that caller owns sending COM_STMT_CLOSE.
    pub fn release(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

/// Result of COM_STMT_PREPARE.
#[derive(Debug)]
pub enum PrepareOutcome {
    Prepared(Arc<ServerStatement>),
    /// The server cannot prepare this statement form; carries its reason
    Unsupported(String),
}

#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Server(Arc<ServerStatement>),
    /// Parameters are substituted into the SQL text
    Emulated,
}

/// Caller-facing prepared statement handle.
#[derive(Debug, Clone)]
pub struct PreparedStatement {
    sql: String,
    param_count: usize,
    pub(crate) epoch: u64,
    pub(crate) binding: Binding,
    closed: bool,
}

impl PreparedStatement {
    pub(crate) fn server(epoch: u64, stmt: Arc<ServerStatement>) -> Self {
        Self {
            sql: stmt.sql.clone(),
            param_count: stmt.param_count(),
            epoch,
            binding: Binding::Server(stmt),
            closed: false,
        }
    }

    pub(crate) fn emulated(epoch: u64, sql: &str) -> Self {
        Self {
            sql: sql.to_string(),
            param_count: count_placeholders(sql),
            epoch,
            binding: Binding::Emulated,
            closed: false,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Server statement id, if prepared server-side.
    pub fn statement_id(&self) -> Option<u32> {
        match &self.binding {
            Binding::Server(stmt) => Some(stmt.statement_id),
            Binding::Emulated => None,
        }
    }

    pub fn is_server_prepared(&self) -> bool {
        matches!(self.binding, Binding::Server(_))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether the handle can be executed as-is on the connection with
    /// `epoch`, without re-preparing.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch
            && match &self.binding {
                Binding::Server(stmt) => !stmt.is_released(),
                Binding::Emulated => true,
            }
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn rebind(&mut self, other: PreparedStatement) {
        self.param_count = other.param_count;
        self.epoch = other.epoch;
        self.binding = other.binding;
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn ensure_open(&self) -> Result<(), Error> {
        if self.closed {
            return Err(Error::Statement(StatementError {
                kind: StatementErrorKind::Stale,
                sql: self.sql.clone(),
                message: "prepared statement was closed".to_string(),
            }));
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn check_param_count(&self, given: usize) -> Result<(), Error> {
        if given != self.param_count {
            return Err(Error::Statement(StatementError {
                kind: StatementErrorKind::ParameterCount,
                sql: self.sql.clone(),
                message: format!(
                    "statement expects {} parameters, got {}",
                    self.param_count, given
                ),
            }));
        }
        Ok(())
    }
}
