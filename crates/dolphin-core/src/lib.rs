//! Core types and traits for Dolphin.
//!
//! Driver-neutral building blocks shared by the wire-protocol crate and the
//! layers built on top of it:
//!
//! - [`Value`] and [`Row`] for parameters and results
//! - [`QueryResult`], [`ResultSet`] and [`UpdateCount`] for buffered results
//! - [`Connection`] the command surface offered to pool and metadata layers
//! - [`Error`] with a stable [`ErrorClass`]

pub mod connection;
pub mod error;
pub mod result;
pub mod row;
pub mod temporal;
pub mod value;

pub use connection::{Connection, IsolationLevel, Savepoint};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, ErrorClass, ProtocolError,
    QueryError, QueryErrorKind, Result, StatementError, StatementErrorKind, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use result::{BatchResult, QueryResult, ResultSet, UpdateCount};
pub use row::{ColumnInfo, Row};
pub use value::Value;
