//! Transaction replay log.
//!
//! While the server reports an open transaction, every successful
//! statement is appended. The log empties when the transaction ends. If a
//! transaction produces more statements than the capacity allows, the
//! entries are dropped and the log stays overflowed until the transaction
//! ends, so a failover can never replay part of it.

use dolphin_core::Value;

/// One statement to re-execute.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEntry {
    /// Text protocol statement
    Sql(String),
    /// Prepared statement with its bound parameters
    Prepared { sql: String, params: Vec<Value> },
}

impl ReplayEntry {
    pub fn sql(&self) -> &str {
        match self {
            ReplayEntry::Sql(sql) | ReplayEntry::Prepared { sql, .. } => sql,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReplayLog {
    capacity: usize,
    entries: Vec<ReplayEntry>,
    overflowed: bool,
}

impl ReplayLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::new(),
            overflowed: false,
        }
    }

    /// Account for a statement that just succeeded.
    ///
    /// `in_transaction` is the server status after the statement.
    pub fn observe(&mut self, in_transaction: bool, entry: Option<ReplayEntry>) {
        if !in_transaction {
            self.clear();
            return;
        }
        let Some(entry) = entry else { return };
        if self.overflowed {
            return;
        }
        if self.entries.len() >= self.capacity {
            tracing::warn!(
                capacity = self.capacity,
                "transaction replay log overflowed; this transaction cannot be replayed"
            );
            self.entries.clear();
            self.overflowed = true;
            return;
        }
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[ReplayEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.overflowed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sql(s: &str) -> Option<ReplayEntry> {
        Some(ReplayEntry::Sql(s.to_string()))
    }

    #[test]
    fn records_only_inside_transactions() {
        let mut log = ReplayLog::new(8);
        log.observe(false, sql("SELECT 1"));
        assert!(log.is_empty());

        log.observe(true, sql("START TRANSACTION"));
        log.observe(true, sql("INSERT INTO t VALUES (1)"));
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].sql(), "INSERT INTO t VALUES (1)");

        log.observe(false, None);
        assert!(log.is_empty());
    }

    #[test]
    fn overflow_sticks_until_transaction_ends() {
        let mut log = ReplayLog::new(2);
        log.observe(true, sql("a"));
        log.observe(true, sql("b"));
        log.observe(true, sql("c"));
        assert!(log.overflowed());
        assert!(log.is_empty());

        log.observe(true, sql("d"));
        assert!(log.overflowed());
        assert!(log.is_empty());

        log.observe(false, sql("COMMIT"));
        assert!(!log.overflowed());
        log.observe(true, sql("e"));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn entries_keep_execution_order() {
        let mut log = ReplayLog::new(4);
        for s in ["x", "y", "z"] {
            log.observe(true, sql(s));
        }
        let order: Vec<&str> = log.entries().iter().map(ReplayEntry::sql).collect();
        assert_eq!(order, ["x", "y", "z"]);
    }
}
