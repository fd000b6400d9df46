//! Connection configuration.
//!
//! [`MySqlConfig`] is the resolved, validated configuration the core
//! consumes: the host list, credentials, TLS requirements, timeouts,
//! statement cache sizing, high-availability policy and session defaults.
//! It is built either with consuming builder methods or from textual
//! `name=value` options through the declarative table in [`options`].

pub mod options;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use dolphin_core::IsolationLevel;
use serde::{Deserialize, Serialize};

use crate::error_map::ErrorMap;
use crate::protocol::{capabilities, charset};

/// SSL mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    /// Do not use SSL
    #[default]
    Disable,
    /// Use SSL if the server offers it
    Preferred,
    /// Require SSL without certificate verification
    Required,
    /// Require SSL and verify the server certificate
    VerifyCa,
    /// Require SSL and verify the certificate matches the hostname
    VerifyIdentity,
}

impl SslMode {
    /// Check if SSL should be attempted.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Check if SSL is required.
    pub const fn is_required(self) -> bool {
        matches!(
            self,
            SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity
        )
    }
}

impl FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "disable" | "disabled" | "false" => Ok(SslMode::Disable),
            "preferred" | "prefer" => Ok(SslMode::Preferred),
            "required" | "require" | "true" | "trust" => Ok(SslMode::Required),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-identity" | "verify-full" => Ok(SslMode::VerifyIdentity),
            other => Err(format!("unknown ssl mode '{other}'")),
        }
    }
}

/// TLS material and verification options.
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA certificate bundle (PEM)
    pub ca_cert_path: Option<PathBuf>,
    /// Client certificate for mutual TLS (PEM)
    pub client_cert_path: Option<PathBuf>,
    /// Client private key for mutual TLS (PEM)
    pub client_key_path: Option<PathBuf>,
    /// Accept any server certificate
    pub danger_skip_verify: bool,
    /// SNI / verification name overriding the host name
    pub server_name: Option<String>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ca_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_cert_path = Some(path.into());
        self
    }

    pub fn client_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_cert_path = Some(path.into());
        self
    }

    pub fn client_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.client_key_path = Some(path.into());
        self
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.danger_skip_verify = skip;
        self
    }

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }
}

/// Role of a host in a replicated topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostRole {
    #[default]
    Primary,
    Replica,
}

/// One candidate server endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostDescriptor {
    pub host: String,
    pub port: u16,
    pub role: HostRole,
    /// Overrides [`MySqlConfig::ssl_mode`] for this host
    pub ssl_mode: Option<SslMode>,
}

impl HostDescriptor {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            role: HostRole::Primary,
            ssl_mode: None,
        }
    }

    pub fn replica(mut self) -> Self {
        self.role = HostRole::Replica;
        self
    }

    pub fn with_ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = Some(mode);
        self
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == HostRole::Primary
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.socket_addr())
    }
}

impl FromStr for HostDescriptor {
    type Err = String;

    /// `host`, `host:port` or `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty host".to_string());
        }
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| format!("unterminated IPv6 literal in '{s}'"))?;
            (host, tail.strip_prefix(':'))
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) if !host.contains(':') => (host, Some(port)),
                _ => (s, None),
            }
        };
        let port = match port {
            Some(p) => p.parse().map_err(|_| format!("invalid port in '{s}'"))?,
            None => 3306,
        };
        Ok(HostDescriptor::new(host, port))
    }
}

/// High-availability topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    /// Single host, connection loss is terminal
    #[default]
    None,
    /// Hosts are tried in configuration order
    Sequential,
    /// Hosts are tried in a random order per sweep
    LoadBalance,
    /// Primaries first; replicas first for read-only sessions
    Replication,
}

impl HaMode {
    pub fn is_enabled(self) -> bool {
        self != HaMode::None
    }
}

impl FromStr for HaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "none" | "" => Ok(HaMode::None),
            "sequential" | "failover" => Ok(HaMode::Sequential),
            "load-balance" | "loadbalance" => Ok(HaMode::LoadBalance),
            "replication" => Ok(HaMode::Replication),
            other => Err(format!("unknown high-availability mode '{other}'")),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct MySqlConfig {
    /// Ordered host list
    pub hosts: Vec<HostDescriptor>,
    /// Unix socket path used instead of TCP for every host
    pub local_socket: Option<PathBuf>,
    pub user: String,
    pub password: Option<String>,
    /// Database selected at connect time
    pub database: Option<String>,
    /// Character set code sent in the handshake
    pub charset: u8,
    pub connect_timeout: Duration,
    /// Blocking read/write limit for every network operation
    pub socket_timeout: Option<Duration>,
    pub ssl_mode: SslMode,
    pub tls: TlsConfig,
    /// Negotiate CLIENT_COMPRESS
    pub compression: bool,
    /// Extra connection attributes sent with CLIENT_CONNECT_ATTRS
    pub attributes: HashMap<String, String>,
    pub max_packet_size: u32,
    /// Prepared statement LRU capacity; 0 disables caching
    pub prep_stmt_cache_size: usize,
    /// Use COM_STMT_PREPARE; when false statements are emulated client-side
    pub use_server_prepare: bool,
    /// Byte parameters at or above this size go out as COM_STMT_SEND_LONG_DATA
    pub long_data_threshold: usize,
    /// Use COM_STMT_BULK_EXECUTE for batches when the server supports it
    pub use_bulk_stmts: bool,
    pub ha_mode: HaMode,
    /// Total connection attempts allowed for one (re)connect
    pub retries_all_down: u32,
    /// Pause between full sweeps of the host list
    pub failover_pause: Duration,
    /// How long a failed host is skipped
    pub blacklist_cooldown: Duration,
    pub transaction_replay: bool,
    /// Maximum statements kept for transaction replay
    pub transaction_replay_size: usize,
    /// Applied with one `SET SESSION` after connecting
    pub session_variables: Vec<(String, String)>,
    /// Executed after session variables on every new connection
    pub init_sql: Option<String>,
    /// Prefer COM_RESET_CONNECTION in [`reset`](crate::MySqlConnection::reset)
    pub use_reset_connection: bool,
    /// Allow fetching the server RSA key for sha256/caching_sha2 over plain TCP
    pub allow_public_key_retrieval: bool,
    pub server_rsa_public_key_file: Option<PathBuf>,
    /// Permit mysql_clear_password on unencrypted channels
    pub allow_cleartext_password: bool,
    /// Plugins the server may select; `None` allows all registered plugins
    pub restricted_auth: Option<Vec<String>>,
    /// Autocommit state of a fresh session
    pub autocommit: bool,
    /// Isolation level of a fresh session; `None` keeps the server default
    pub isolation_level: Option<IsolationLevel>,
    /// Server error classification table
    pub error_map: Arc<ErrorMap>,
}

impl Default for MySqlConfig {
    fn default() -> Self {
        Self {
            hosts: vec![HostDescriptor::new("localhost", 3306)],
            local_socket: None,
            user: String::new(),
            password: None,
            database: None,
            charset: charset::DEFAULT_CHARSET,
            connect_timeout: Duration::from_secs(30),
            socket_timeout: None,
            ssl_mode: SslMode::default(),
            tls: TlsConfig::default(),
            compression: false,
            attributes: HashMap::new(),
            max_packet_size: 16 * 1024 * 1024,
            prep_stmt_cache_size: 250,
            use_server_prepare: true,
            long_data_threshold: 1024 * 1024,
            use_bulk_stmts: true,
            ha_mode: HaMode::None,
            retries_all_down: 120,
            failover_pause: Duration::from_millis(250),
            blacklist_cooldown: Duration::from_secs(60),
            transaction_replay: false,
            transaction_replay_size: 64,
            session_variables: Vec::new(),
            init_sql: None,
            use_reset_connection: true,
            allow_public_key_retrieval: false,
            server_rsa_public_key_file: None,
            allow_cleartext_password: false,
            restricted_auth: None,
            autocommit: true,
            isolation_level: None,
            error_map: Arc::new(ErrorMap::default()),
        }
    }
}

impl MySqlConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a single primary host, replacing the host list.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        let port = self.hosts.first().map_or(3306, |h| h.port);
        self.hosts = vec![HostDescriptor::new(host, port)];
        self
    }

    /// Set the port of every configured host.
    pub fn port(mut self, port: u16) -> Self {
        for host in &mut self.hosts {
            host.port = port;
        }
        self
    }

    /// Replace the host list.
    pub fn hosts(mut self, hosts: impl IntoIterator<Item = HostDescriptor>) -> Self {
        self.hosts = hosts.into_iter().collect();
        self
    }

    pub fn add_host(mut self, host: HostDescriptor) -> Self {
        self.hosts.push(host);
        self
    }

    pub fn local_socket(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_socket = Some(path.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn charset(mut self, charset: u8) -> Self {
        self.charset = charset;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    pub fn tls_config(mut self, tls: TlsConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn compression(mut self, enabled: bool) -> Self {
        self.compression = enabled;
        self
    }

    /// Set a connection attribute.
    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn max_packet_size(mut self, size: u32) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn prep_stmt_cache_size(mut self, size: usize) -> Self {
        self.prep_stmt_cache_size = size;
        self
    }

    pub fn use_server_prepare(mut self, enabled: bool) -> Self {
        self.use_server_prepare = enabled;
        self
    }

    pub fn long_data_threshold(mut self, bytes: usize) -> Self {
        self.long_data_threshold = bytes;
        self
    }

    pub fn use_bulk_stmts(mut self, enabled: bool) -> Self {
        self.use_bulk_stmts = enabled;
        self
    }

    pub fn ha_mode(mut self, mode: HaMode) -> Self {
        self.ha_mode = mode;
        self
    }

    pub fn retries_all_down(mut self, attempts: u32) -> Self {
        self.retries_all_down = attempts;
        self
    }

    pub fn failover_pause(mut self, pause: Duration) -> Self {
        self.failover_pause = pause;
        self
    }

    pub fn blacklist_cooldown(mut self, cooldown: Duration) -> Self {
        self.blacklist_cooldown = cooldown;
        self
    }

    pub fn transaction_replay(mut self, enabled: bool) -> Self {
        self.transaction_replay = enabled;
        self
    }

    pub fn transaction_replay_size(mut self, size: usize) -> Self {
        self.transaction_replay_size = size;
        self
    }

    pub fn session_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.session_variables.push((name.into(), value.into()));
        self
    }

    pub fn init_sql(mut self, sql: impl Into<String>) -> Self {
        self.init_sql = Some(sql.into());
        self
    }

    pub fn use_reset_connection(mut self, enabled: bool) -> Self {
        self.use_reset_connection = enabled;
        self
    }

    pub fn allow_public_key_retrieval(mut self, allow: bool) -> Self {
        self.allow_public_key_retrieval = allow;
        self
    }

    pub fn server_rsa_public_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_rsa_public_key_file = Some(path.into());
        self
    }

    pub fn allow_cleartext_password(mut self, allow: bool) -> Self {
        self.allow_cleartext_password = allow;
        self
    }

    pub fn restricted_auth<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restricted_auth = Some(plugins.into_iter().map(Into::into).collect());
        self
    }

    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = enabled;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn error_map(mut self, map: ErrorMap) -> Self {
        self.error_map = Arc::new(map);
        self
    }

    /// SSL mode in effect for `host`.
    pub fn ssl_mode_for(&self, host: &HostDescriptor) -> SslMode {
        host.ssl_mode.unwrap_or(self.ssl_mode)
    }

    /// Capabilities the client asks for before intersecting with the server's.
    pub fn client_capabilities(&self, ssl_mode: SslMode) -> u64 {
        let mut caps = capabilities::DEFAULT_CLIENT_FLAGS;
        if self.database.is_some() {
            caps |= capabilities::CLIENT_CONNECT_WITH_DB;
        }
        if self.compression {
            caps |= capabilities::CLIENT_COMPRESS;
        }
        if ssl_mode.should_try_ssl() {
            caps |= capabilities::CLIENT_SSL;
        }
        caps
    }

    /// Whether `plugin` may be used under `restricted_auth`.
    pub fn plugin_allowed(&self, plugin: &str) -> bool {
        self.restricted_auth
            .as_ref()
            .is_none_or(|allowed| allowed.iter().any(|p| p.eq_ignore_ascii_case(plugin)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = MySqlConfig::new()
            .host("db.example.com")
            .port(3307)
            .user("myuser")
            .password("secret")
            .database("testdb")
            .connect_timeout(Duration::from_secs(10))
            .ssl_mode(SslMode::Required)
            .compression(true)
            .attribute("app_name", "myapp");

        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].socket_addr(), "db.example.com:3307");
        assert_eq!(config.user, "myuser");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.database, Some("testdb".to_string()));
        assert_eq!(config.ssl_mode, SslMode::Required);
        assert_eq!(config.attributes.get("app_name"), Some(&"myapp".to_string()));
    }

    #[test]
    fn test_client_capabilities() {
        let config = MySqlConfig::new().database("app").compression(true);
        let caps = config.client_capabilities(SslMode::Disable);
        assert!(caps & capabilities::CLIENT_CONNECT_WITH_DB != 0);
        assert!(caps & capabilities::CLIENT_COMPRESS != 0);
        assert!(caps & capabilities::CLIENT_SSL == 0);
        assert!(config.client_capabilities(SslMode::Preferred) & capabilities::CLIENT_SSL != 0);
    }

    #[test]
    fn test_ssl_mode_properties() {
        assert!(!SslMode::Disable.should_try_ssl());
        assert!(SslMode::Preferred.should_try_ssl());
        assert!(!SslMode::Preferred.is_required());
        assert!(SslMode::VerifyIdentity.is_required());
        assert_eq!("verify_ca".parse::<SslMode>(), Ok(SslMode::VerifyCa));
    }

    #[test]
    fn test_host_descriptor_parsing() {
        let h: HostDescriptor = "db1:3307".parse().unwrap();
        assert_eq!((h.host.as_str(), h.port), ("db1", 3307));
        let h: HostDescriptor = "db2".parse().unwrap();
        assert_eq!(h.port, 3306);
        let h: HostDescriptor = "[::1]:3310".parse().unwrap();
        assert_eq!(h.host, "::1");
        assert_eq!(h.socket_addr(), "[::1]:3310");
        assert!("db:notaport".parse::<HostDescriptor>().is_err());
    }

    #[test]
    fn test_host_ssl_override() {
        let config = MySqlConfig::new().ssl_mode(SslMode::Required);
        let plain = HostDescriptor::new("a", 3306);
        let local = HostDescriptor::new("b", 3306).with_ssl_mode(SslMode::Disable);
        assert_eq!(config.ssl_mode_for(&plain), SslMode::Required);
        assert_eq!(config.ssl_mode_for(&local), SslMode::Disable);
    }

    #[test]
    fn test_restricted_auth() {
        let config = MySqlConfig::new().restricted_auth(["caching_sha2_password"]);
        assert!(config.plugin_allowed("caching_sha2_password"));
        assert!(!config.plugin_allowed("mysql_clear_password"));
        assert!(MySqlConfig::new().plugin_allowed("anything"));
    }
}
