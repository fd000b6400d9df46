//! Buffered results of executed commands.

use std::sync::Arc;

use crate::row::{ColumnInfo, Row};

/// Completion of a command that produced no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateCount {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
}

/// A fully materialized result set.
#[derive(Debug, Clone, Default)]
pub struct ResultSet {
    pub columns: Arc<ColumnInfo>,
    pub rows: Vec<Row>,
    /// Warning count reported by the terminating packet
    pub warnings: u16,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&crate::Value> {
        self.rows.first().and_then(|row| row.get(0))
    }
}

/// One result of a command: rows or an update count.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Rows(ResultSet),
    Update(UpdateCount),
}

impl QueryResult {
    pub fn rows(&self) -> Option<&ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Update(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<ResultSet> {
        match self {
            QueryResult::Rows(rs) => Some(rs),
            QueryResult::Update(_) => None,
        }
    }

    pub fn update_count(&self) -> Option<UpdateCount> {
        match self {
            QueryResult::Update(u) => Some(*u),
            QueryResult::Rows(_) => None,
        }
    }
}

/// Outcome of a batch execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// Sum of affected rows across all parameter rows
    pub total_affected: u64,
    /// Per-row counts when the server reported them individually
    pub per_row: Option<Vec<u64>>,
}
