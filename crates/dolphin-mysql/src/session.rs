//! Client-side view of the server session.
//!
//! Every aspect a caller can change (autocommit, current database,
//! isolation level, read-only mode, network timeout) is tracked together
//! with a dirty flag. `reset` restores only flagged aspects, so a clean
//! session resets without touching the wire.

use std::time::Duration;

use dolphin_core::error::{TransactionError, TransactionErrorKind};
use dolphin_core::{Error, IsolationLevel};

/// Dirty flags, one bit per aspect.
pub mod dirty {
    pub const AUTOCOMMIT: u8 = 1;
    pub const DATABASE: u8 = 1 << 1;
    pub const ISOLATION: u8 = 1 << 2;
    pub const READ_ONLY: u8 = 1 << 3;
    pub const NETWORK_TIMEOUT: u8 = 1 << 4;
}

/// Values of every tracked aspect at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub autocommit: bool,
    pub database: Option<String>,
    /// `None` means the server default
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub network_timeout: Option<Duration>,
}

/// Current and initial session values plus the savepoint counter.
#[derive(Debug, Clone)]
pub struct SessionState {
    initial: SessionSnapshot,
    current: SessionSnapshot,
    flags: u8,
    savepoint_counter: u64,
}

impl SessionState {
    pub fn new(initial: SessionSnapshot) -> Self {
        Self {
            current: initial.clone(),
            initial,
            flags: 0,
            savepoint_counter: 0,
        }
    }

    pub fn initial(&self) -> &SessionSnapshot {
        &self.initial
    }

    pub fn current(&self) -> &SessionSnapshot {
        &self.current
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_dirty(&self) -> bool {
        self.flags != 0
    }

    pub fn is_flagged(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_autocommit(&mut self, enabled: bool) {
        self.current.autocommit = enabled;
        self.flags |= dirty::AUTOCOMMIT;
    }

    pub fn set_database(&mut self, database: &str) {
        self.current.database = Some(database.to_string());
        self.flags |= dirty::DATABASE;
    }

    pub fn set_isolation(&mut self, level: IsolationLevel) {
        self.current.isolation = Some(level);
        self.flags |= dirty::ISOLATION;
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.current.read_only = read_only;
        self.flags |= dirty::READ_ONLY;
    }

    pub fn set_network_timeout(&mut self, timeout: Option<Duration>) {
        self.current.network_timeout = timeout;
        self.flags |= dirty::NETWORK_TIMEOUT;
    }

    /// Forget changes after they were undone on the server.
    pub fn mark_restored(&mut self) {
        self.current = self.initial.clone();
        self.flags = 0;
        self.savepoint_counter = 0;
    }

    /// Next generated savepoint name and its sequence number.
    pub fn next_savepoint(&mut self) -> (String, u64) {
        self.savepoint_counter += 1;
        (
            format!("dolphin_sp_{}", self.savepoint_counter),
            self.savepoint_counter,
        )
    }

    /// Sequence number for a caller-named savepoint.
    pub fn register_savepoint(&mut self) -> u64 {
        self.savepoint_counter += 1;
        self.savepoint_counter
    }

    pub fn savepoint_counter(&self) -> u64 {
        self.savepoint_counter
    }

    /// Resume numbering after `counter`; never moves the counter back.
    pub fn continue_savepoints(&mut self, counter: u64) {
        self.savepoint_counter = self.savepoint_counter.max(counter);
    }
}

/// Savepoint names are sent unquoted, so only identifier characters pass.
#[allow(clippy::result_large_err)]
pub fn validate_savepoint_name(name: &str) -> Result<(), Error> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(())
    } else {
        Err(Error::Transaction(TransactionError {
            kind: TransactionErrorKind::SavepointNotFound,
            message: format!("invalid savepoint name '{name}'"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn initial() -> SessionSnapshot {
        SessionSnapshot {
            autocommit: true,
            database: Some("app".to_string()),
            isolation: None,
            read_only: false,
            network_timeout: None,
        }
    }

    #[test]
    fn setters_flag_aspects() {
        let mut state = SessionState::new(initial());
        assert!(!state.is_dirty());

        state.set_autocommit(false);
        state.set_database("other");
        assert!(state.is_flagged(dirty::AUTOCOMMIT));
        assert!(state.is_flagged(dirty::DATABASE));
        assert!(!state.is_flagged(dirty::ISOLATION));
        assert_eq!(state.current().database.as_deref(), Some("other"));

        state.mark_restored();
        assert!(!state.is_dirty());
        assert_eq!(state.current(), state.initial());
    }

    #[test]
    fn generated_savepoints_are_unique() {
        let mut state = SessionState::new(initial());
        let (a, seq_a) = state.next_savepoint();
        let seq_b = state.register_savepoint();
        let (c, seq_c) = state.next_savepoint();
        assert_ne!(a, c);
        assert!(seq_a < seq_b && seq_b < seq_c);

        state.mark_restored();
        assert_eq!(state.savepoint_counter(), 0);
    }

    #[test]
    fn savepoint_numbering_continues_from_a_previous_session() {
        let mut state = SessionState::new(initial());
        state.continue_savepoints(4);
        assert_eq!(state.next_savepoint().0, "dolphin_sp_5");
        state.continue_savepoints(2);
        assert_eq!(state.next_savepoint().0, "dolphin_sp_6");
    }

    #[test]
    fn savepoint_names_are_identifiers() {
        assert!(validate_savepoint_name("before_update").is_ok());
        assert!(validate_savepoint_name("sp$1").is_ok());
        assert!(validate_savepoint_name("").is_err());
        assert!(validate_savepoint_name("1sp").is_err());
        let err = validate_savepoint_name("x; DROP TABLE t").unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::Usage);
    }
}
