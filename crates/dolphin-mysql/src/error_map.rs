//! Server error classification.
//!
//! Server errors are classified first by vendor code, then by SQLSTATE
//! class (the first two characters). The table is plain data: it ships
//! with built-in defaults and can be extended or replaced from JSON.

use std::collections::HashMap;

use dolphin_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use dolphin_core::Error;
use serde::{Deserialize, Serialize};

use crate::protocol::ErrPacket;

/// Category a server error falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Constraint,
    NotFound,
    Permission,
    DataTruncation,
    Deadlock,
    Serialization,
    Timeout,
    Cancelled,
    Unsupported,
    /// The server is closing the session; the link must be treated as gone
    ConnectionLost,
    Database,
}

impl ErrorCategory {
    /// Query error kind for categories that leave the connection usable.
    pub fn query_kind(self) -> Option<QueryErrorKind> {
        Some(match self {
            ErrorCategory::Syntax => QueryErrorKind::Syntax,
            ErrorCategory::Constraint => QueryErrorKind::Constraint,
            ErrorCategory::NotFound => QueryErrorKind::NotFound,
            ErrorCategory::Permission => QueryErrorKind::Permission,
            ErrorCategory::DataTruncation => QueryErrorKind::DataTruncation,
            ErrorCategory::Deadlock => QueryErrorKind::Deadlock,
            ErrorCategory::Serialization => QueryErrorKind::Serialization,
            ErrorCategory::Timeout => QueryErrorKind::Timeout,
            ErrorCategory::Cancelled => QueryErrorKind::Cancelled,
            ErrorCategory::Unsupported => QueryErrorKind::Unsupported,
            ErrorCategory::Database => QueryErrorKind::Database,
            ErrorCategory::ConnectionLost => return None,
        })
    }
}

/// Vendor code and SQLSTATE class lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMap {
    #[serde(default)]
    pub codes: HashMap<u16, ErrorCategory>,
    /// Keyed by the two-character SQLSTATE class
    #[serde(default)]
    pub sqlstate_classes: HashMap<String, ErrorCategory>,
}

const BUILTIN_CODES: &[(u16, ErrorCategory)] = &[
    (1022, ErrorCategory::Constraint),
    (1048, ErrorCategory::Constraint),
    (1062, ErrorCategory::Constraint),
    (1169, ErrorCategory::Constraint),
    (1216, ErrorCategory::Constraint),
    (1217, ErrorCategory::Constraint),
    (1451, ErrorCategory::Constraint),
    (1452, ErrorCategory::Constraint),
    (1557, ErrorCategory::Constraint),
    (3819, ErrorCategory::Constraint),
    (1064, ErrorCategory::Syntax),
    (1149, ErrorCategory::Syntax),
    (1049, ErrorCategory::NotFound),
    (1051, ErrorCategory::NotFound),
    (1054, ErrorCategory::NotFound),
    (1146, ErrorCategory::NotFound),
    (1243, ErrorCategory::NotFound),
    (1044, ErrorCategory::Permission),
    (1045, ErrorCategory::Permission),
    (1142, ErrorCategory::Permission),
    (1143, ErrorCategory::Permission),
    (1227, ErrorCategory::Permission),
    (1264, ErrorCategory::DataTruncation),
    (1265, ErrorCategory::DataTruncation),
    (1406, ErrorCategory::DataTruncation),
    (1213, ErrorCategory::Deadlock),
    (1205, ErrorCategory::Timeout),
    (3024, ErrorCategory::Timeout),
    (1969, ErrorCategory::Timeout),
    (1317, ErrorCategory::Cancelled),
    (1295, ErrorCategory::Unsupported),
    (1235, ErrorCategory::Unsupported),
    (1047, ErrorCategory::Unsupported),
    (1053, ErrorCategory::ConnectionLost),
    (1077, ErrorCategory::ConnectionLost),
    (1078, ErrorCategory::ConnectionLost),
    (1079, ErrorCategory::ConnectionLost),
    (1080, ErrorCategory::ConnectionLost),
    (1927, ErrorCategory::ConnectionLost),
    (2006, ErrorCategory::ConnectionLost),
    (2013, ErrorCategory::ConnectionLost),
    (4031, ErrorCategory::ConnectionLost),
];

const BUILTIN_CLASSES: &[(&str, ErrorCategory)] = &[
    ("08", ErrorCategory::ConnectionLost),
    ("0A", ErrorCategory::Unsupported),
    ("22", ErrorCategory::DataTruncation),
    ("23", ErrorCategory::Constraint),
    ("28", ErrorCategory::Permission),
    ("40", ErrorCategory::Serialization),
    ("42", ErrorCategory::Syntax),
    ("70", ErrorCategory::Cancelled),
    ("HY", ErrorCategory::Database),
];

impl Default for ErrorMap {
    fn default() -> Self {
        Self {
            codes: BUILTIN_CODES.iter().copied().collect(),
            sqlstate_classes: BUILTIN_CLASSES
                .iter()
                .map(|(class, category)| ((*class).to_string(), *category))
                .collect(),
        }
    }
}

impl ErrorMap {
    /// A map with no entries; everything classifies as [`ErrorCategory::Database`].
    pub fn empty() -> Self {
        Self {
            codes: HashMap::new(),
            sqlstate_classes: HashMap::new(),
        }
    }

    /// Parse a map from JSON, e.g.
    /// `{"codes": {"1062": "constraint"}, "sqlstate_classes": {"23": "constraint"}}`.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Overlay `other` on top of `self`; entries in `other` win.
    #[must_use]
    pub fn merge(mut self, other: ErrorMap) -> Self {
        self.codes.extend(other.codes);
        self.sqlstate_classes.extend(other.sqlstate_classes);
        self
    }

    /// Classify a server error.
    pub fn classify(&self, code: u16, sqlstate: &str) -> ErrorCategory {
        if let Some(category) = self.codes.get(&code) {
            return *category;
        }
        sqlstate
            .get(..2)
            .and_then(|class| self.sqlstate_classes.get(class))
            .copied()
            .unwrap_or(ErrorCategory::Database)
    }

    /// Build the caller-facing error for an error packet.
    pub fn to_error(&self, err: &ErrPacket, sql: Option<&str>) -> Error {
        let category = self.classify(err.error_code, &err.sql_state);
        match category.query_kind() {
            Some(kind) => Error::Query(QueryError {
                kind,
                sql: sql.map(str::to_string),
                code: Some(err.error_code),
                sqlstate: (!err.sql_state.is_empty()).then(|| err.sql_state.clone()),
                message: err.error_message.clone(),
                source: None,
            }),
            None => Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: format!(
                    "server closed the session: {} ({})",
                    err.error_message, err.error_code
                ),
                source: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(code: u16, state: &str) -> ErrPacket {
        ErrPacket {
            error_code: code,
            sql_state: state.to_string(),
            error_message: "boom".to_string(),
        }
    }

    #[test]
    fn code_wins_over_sqlstate_class() {
        let map = ErrorMap::default();
        assert_eq!(map.classify(1213, "40001"), ErrorCategory::Deadlock);
        assert_eq!(map.classify(9999, "40001"), ErrorCategory::Serialization);
        assert_eq!(map.classify(9999, "23505"), ErrorCategory::Constraint);
        assert_eq!(map.classify(9999, ""), ErrorCategory::Database);
    }

    #[test]
    fn json_overlay() {
        let overlay = ErrorMap::from_json(
            r#"{"codes": {"1064": "unsupported"}, "sqlstate_classes": {"XA": "deadlock"}}"#,
        )
        .unwrap();
        let map = ErrorMap::default().merge(overlay);
        assert_eq!(map.classify(1064, "42000"), ErrorCategory::Unsupported);
        assert_eq!(map.classify(1, "XA100"), ErrorCategory::Deadlock);
        assert_eq!(map.classify(1062, "23000"), ErrorCategory::Constraint);
    }

    #[test]
    fn missing_sections_default_to_empty() {
        let map = ErrorMap::from_json(r#"{"codes": {"1": "timeout"}}"#).unwrap();
        assert!(map.sqlstate_classes.is_empty());
        assert_eq!(map.classify(1, ""), ErrorCategory::Timeout);
    }

    #[test]
    fn shutdown_errors_become_connection_loss() {
        let err = ErrorMap::default().to_error(&packet(1053, "08S01"), None);
        assert!(err.is_connection_lost());

        let err = ErrorMap::default().to_error(&packet(1062, "23000"), Some("INSERT 1"));
        assert_eq!(err.server_code(), Some(1062));
        assert_eq!(err.sql(), Some("INSERT 1"));
        assert_eq!(err.sqlstate(), Some("23000"));
    }
}
