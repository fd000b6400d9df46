//! Declarative option table.
//!
//! Each textual option maps to one setter on [`MySqlConfig`]. Names are
//! matched case-insensitively; durations are given in milliseconds.

use std::path::PathBuf;
use std::time::Duration;

use dolphin_core::error::ConfigError;
use dolphin_core::{Error, IsolationLevel};

use super::{HaMode, HostDescriptor, HostRole, MySqlConfig, SslMode};

type Setter = fn(&mut MySqlConfig, &str) -> Result<(), String>;

/// One textual configuration option.
#[derive(Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    /// Default rendered as text, for documentation and listings
    pub default: &'static str,
    pub apply: Setter,
}

impl std::fmt::Debug for OptionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptionSpec")
            .field("name", &self.name)
            .field("default", &self.default)
            .finish_non_exhaustive()
    }
}

fn parse_bool(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str) -> Result<T, String> {
    value
        .trim()
        .parse()
        .map_err(|_| format!("expected a number, got '{}'", value.trim()))
}

fn parse_millis(value: &str) -> Result<Duration, String> {
    parse_num::<u64>(value).map(Duration::from_millis)
}

fn optional(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// `h1[:port],h2[:port]`; in replication mode hosts after the first are replicas.
fn set_hosts(c: &mut MySqlConfig, value: &str) -> Result<(), String> {
    let hosts = value
        .split(',')
        .map(str::parse::<HostDescriptor>)
        .collect::<Result<Vec<_>, _>>()?;
    if hosts.is_empty() {
        return Err("host list is empty".to_string());
    }
    c.hosts = hosts;
    assign_replication_roles(c);
    Ok(())
}

fn assign_replication_roles(c: &mut MySqlConfig) {
    let replication = c.ha_mode == HaMode::Replication;
    for (i, host) in c.hosts.iter_mut().enumerate() {
        host.role = if replication && i > 0 {
            HostRole::Replica
        } else {
            HostRole::Primary
        };
    }
}

fn set_session_variables(c: &mut MySqlConfig, value: &str) -> Result<(), String> {
    let mut vars = Vec::new();
    for pair in value.split(',').filter(|p| !p.trim().is_empty()) {
        let (name, val) = pair
            .split_once('=')
            .ok_or_else(|| format!("session variable '{pair}' is not name=value"))?;
        vars.push((name.trim().to_string(), val.trim().to_string()));
    }
    c.session_variables = vars;
    Ok(())
}

/// Every recognised option.
pub static OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "hosts",
        default: "localhost:3306",
        apply: set_hosts,
    },
    OptionSpec {
        name: "localSocket",
        default: "",
        apply: |c, v| {
            c.local_socket = optional(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionSpec {
        name: "user",
        default: "",
        apply: |c, v| {
            c.user = v.to_string();
            Ok(())
        },
    },
    OptionSpec {
        name: "password",
        default: "",
        apply: |c, v| {
            c.password = Some(v.to_string());
            Ok(())
        },
    },
    OptionSpec {
        name: "database",
        default: "",
        apply: |c, v| {
            c.database = optional(v);
            Ok(())
        },
    },
    OptionSpec {
        name: "charset",
        default: "224",
        apply: |c, v| {
            c.charset = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "connectTimeout",
        default: "30000",
        apply: |c, v| {
            c.connect_timeout = parse_millis(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "socketTimeout",
        default: "0",
        apply: |c, v| {
            let timeout = parse_millis(v)?;
            c.socket_timeout = (!timeout.is_zero()).then_some(timeout);
            Ok(())
        },
    },
    OptionSpec {
        name: "sslMode",
        default: "disable",
        apply: |c, v| {
            c.ssl_mode = v.parse::<SslMode>()?;
            Ok(())
        },
    },
    OptionSpec {
        name: "serverSslCert",
        default: "",
        apply: |c, v| {
            c.tls.ca_cert_path = optional(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionSpec {
        name: "clientCert",
        default: "",
        apply: |c, v| {
            c.tls.client_cert_path = optional(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionSpec {
        name: "clientKey",
        default: "",
        apply: |c, v| {
            c.tls.client_key_path = optional(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionSpec {
        name: "useCompression",
        default: "false",
        apply: |c, v| {
            c.compression = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "maxAllowedPacket",
        default: "16777216",
        apply: |c, v| {
            c.max_packet_size = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "prepStmtCacheSize",
        default: "250",
        apply: |c, v| {
            c.prep_stmt_cache_size = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "useServerPrepStmts",
        default: "true",
        apply: |c, v| {
            c.use_server_prepare = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "longDataThreshold",
        default: "1048576",
        apply: |c, v| {
            c.long_data_threshold = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "useBulkStmts",
        default: "true",
        apply: |c, v| {
            c.use_bulk_stmts = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "haMode",
        default: "none",
        apply: |c, v| {
            c.ha_mode = v.parse::<HaMode>()?;
            assign_replication_roles(c);
            Ok(())
        },
    },
    OptionSpec {
        name: "retriesAllDown",
        default: "120",
        apply: |c, v| {
            c.retries_all_down = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "failoverPause",
        default: "250",
        apply: |c, v| {
            c.failover_pause = parse_millis(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "deniedListTimeout",
        default: "60000",
        apply: |c, v| {
            c.blacklist_cooldown = parse_millis(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "transactionReplay",
        default: "false",
        apply: |c, v| {
            c.transaction_replay = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "transactionReplaySize",
        default: "64",
        apply: |c, v| {
            c.transaction_replay_size = parse_num(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "sessionVariables",
        default: "",
        apply: set_session_variables,
    },
    OptionSpec {
        name: "initSql",
        default: "",
        apply: |c, v| {
            c.init_sql = optional(v);
            Ok(())
        },
    },
    OptionSpec {
        name: "useResetConnection",
        default: "true",
        apply: |c, v| {
            c.use_reset_connection = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "allowPublicKeyRetrieval",
        default: "false",
        apply: |c, v| {
            c.allow_public_key_retrieval = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "serverRsaPublicKeyFile",
        default: "",
        apply: |c, v| {
            c.server_rsa_public_key_file = optional(v).map(PathBuf::from);
            Ok(())
        },
    },
    OptionSpec {
        name: "allowCleartextPassword",
        default: "false",
        apply: |c, v| {
            c.allow_cleartext_password = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "restrictedAuth",
        default: "",
        apply: |c, v| {
            c.restricted_auth = optional(v).map(|list| {
                list.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            });
            Ok(())
        },
    },
    OptionSpec {
        name: "autocommit",
        default: "true",
        apply: |c, v| {
            c.autocommit = parse_bool(v)?;
            Ok(())
        },
    },
    OptionSpec {
        name: "transactionIsolation",
        default: "",
        apply: |c, v| {
            c.isolation_level = match optional(v) {
                Some(level) => Some(
                    IsolationLevel::parse(&level)
                        .ok_or_else(|| format!("unknown isolation level '{level}'"))?,
                ),
                None => None,
            };
            Ok(())
        },
    },
];

/// Look up an option by name, ignoring case.
pub fn find(name: &str) -> Option<&'static OptionSpec> {
    OPTIONS.iter().find(|o| o.name.eq_ignore_ascii_case(name))
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}

impl MySqlConfig {
    /// Apply one textual option.
    #[allow(clippy::result_large_err)]
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<(), Error> {
        let opt = find(name).ok_or_else(|| config_error(format!("unknown option '{name}'")))?;
        (opt.apply)(self, value)
            .map_err(|reason| config_error(format!("invalid value for '{}': {reason}", opt.name)))
    }

    /// Build a configuration from `(name, value)` pairs applied over the defaults.
    #[allow(clippy::result_large_err)]
    pub fn from_options<'a, I>(options: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut config = MySqlConfig::default();
        let mut hosts = None;
        for (name, value) in options {
            // Host roles depend on haMode, which may come later.
            if name.eq_ignore_ascii_case("hosts") {
                hosts = Some(value);
                continue;
            }
            config.apply_option(name, value)?;
        }
        if let Some(hosts) = hosts {
            config.apply_option("hosts", hosts)?;
        }
        Ok(config)
    }
}
