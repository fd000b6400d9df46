//! MySQL/MariaDB wire protocol client for Dolphin.
//!
//! This crate speaks the client/server protocol directly over a blocking
//! transport. It provides:
//!
//! - Packet framing with sequence checks and the compressed envelope
//! - Authentication plugins, AuthSwitch and optional TLS
//! - Text, binary, bulk and long-data statement execution
//! - A per-connection LRU of server prepared statements
//! - Session state tracking and cheap resets
//! - Failover across hosts with transaction replay
//!
//! # Protocol Overview
//!
//! Every packet carries a 3-byte payload length and a 1-byte sequence
//! number. Payloads of 16MB or more are split across frames. Each command
//! restarts the sequence at zero.
//!
//! # Example
//!
//! ```rust,ignore
//! use dolphin_mysql::{MySqlConfig, MySqlConnection};
//! use dolphin_core::Value;
//!
//! let config = MySqlConfig::new()
//!     .host("localhost")
//!     .port(3306)
//!     .user("root")
//!     .database("shop");
//!
//! let mut conn = MySqlConnection::connect(config)?;
//! let mut stmt = conn.prepare("SELECT ? + ?")?;
//! let result = conn.execute(&mut stmt, &[Value::Int(2), Value::Int(3)])?;
//! ```

pub mod auth;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error_map;
pub mod failover;
pub mod handshake;
pub mod protocol;
pub mod replay;
pub mod resultset;
pub mod session;
pub mod statement;
pub mod tls;
pub mod transport;
pub mod types;

pub use auth::{AuthPlugin, AuthRegistry};
pub use config::{HaMode, HostDescriptor, HostRole, MySqlConfig, SslMode, TlsConfig};
pub use connection::{CancelHandle, MySqlConnection, ServerVersion};
pub use error_map::{ErrorCategory, ErrorMap};
pub use failover::{FailoverConnection, FailoverState};
pub use resultset::{ResultKind, ResultStream};
pub use session::SessionSnapshot;
pub use statement::{PrepareOutcome, PreparedStatement};
pub use transport::{Connector, TcpConnector, Transport};
