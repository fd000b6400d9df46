//! Connection phase: greeting, capability negotiation, TLS and authentication.
//!
//! ```text
//! AwaitGreeting -> NegotiateCapabilities -> [TlsUpgrade] -> PluginChallenge
//!     -> PluginResponse -> [AdditionalAuthRound]* -> Authenticated | Rejected
//! ```
//!
//! An AuthSwitch request moves back to `PluginChallenge` with the new
//! plugin and seed; the greeting is never read twice.

#![allow(clippy::cast_possible_truncation)]

use std::time::Duration;

use dolphin_core::Error;
use dolphin_core::error::ProtocolError;

use crate::auth::{AuthContext, AuthRegistry, AuthSession, AuthStep, auth_error, plugins};
use crate::config::{HostDescriptor, MySqlConfig};
use crate::protocol::{
    PacketCodec, PacketReader, PacketType, PacketWriter, capabilities, charset,
};
use crate::tls;

/// Handshake progress, for logging and error context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    AwaitGreeting,
    NegotiateCapabilities,
    TlsUpgrade,
    PluginChallenge,
    PluginResponse,
    AdditionalAuthRound,
    Authenticated,
    Rejected,
}

/// Initial handshake packet (protocol version 10).
#[derive(Debug, Clone)]
pub struct ServerGreeting {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    /// Scramble without the trailing NUL
    pub seed: Vec<u8>,
    /// Standard flags in the low 32 bits, MariaDB extended flags above
    pub capabilities: u64,
    pub charset: u8,
    pub status_flags: u16,
    pub auth_plugin: String,
}

impl ServerGreeting {
    /// MariaDB servers clear CLIENT_MYSQL and send extended capabilities.
    pub fn is_mariadb(&self) -> bool {
        self.capabilities & capabilities::CLIENT_MYSQL == 0
    }
}

/// What the connection phase established.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub greeting: ServerGreeting,
    /// Negotiated capabilities (client wishes intersected with the server's)
    pub capabilities: u64,
    pub status_flags: u16,
    pub auth_plugin: String,
    pub secure: bool,
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::Protocol(ProtocolError {
        message: message.into(),
        raw_data: None,
        source: None,
    })
}

/// Parse the server greeting.
#[allow(clippy::result_large_err)]
pub fn parse_greeting(payload: &[u8]) -> Result<ServerGreeting, Error> {
    if PacketType::of(payload) == PacketType::Error {
        let err = PacketReader::new(payload)
            .parse_err_packet()
            .ok_or_else(|| protocol_error("invalid error packet in place of greeting"))?;
        return Err(auth_error(format!(
            "server refused the connection: {} ({})",
            err.error_message, err.error_code
        )));
    }

    let mut reader = PacketReader::new(payload);
    let protocol_version = reader
        .read_u8()
        .ok_or_else(|| protocol_error("missing protocol version"))?;
    if protocol_version != 10 {
        return Err(protocol_error(format!(
            "unsupported protocol version: {protocol_version}"
        )));
    }

    let server_version = reader.read_null_string();
    let connection_id = reader
        .read_u32_le()
        .ok_or_else(|| protocol_error("missing connection id"))?;
    let seed_1 = reader
        .read_bytes(8)
        .ok_or_else(|| protocol_error("missing auth data"))?;
    reader.skip(1);

    let caps_lower = reader
        .read_u16_le()
        .ok_or_else(|| protocol_error("missing capability flags"))?;
    let charset = reader.read_u8().unwrap_or(charset::DEFAULT_CHARSET);
    let status_flags = reader.read_u16_le().unwrap_or(0);
    let caps_upper = reader.read_u16_le().unwrap_or(0);
    let mut capabilities = u64::from(caps_lower) | (u64::from(caps_upper) << 16);

    let seed_len = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        usize::from(reader.read_u8().unwrap_or(0))
    } else {
        reader.skip(1);
        0
    };

    // Reserved: 6 filler bytes, then MariaDB extended capabilities or 4 zeros
    reader.skip(6);
    let extended = reader.read_u32_le().unwrap_or(0);
    if capabilities & capabilities::CLIENT_MYSQL == 0 {
        capabilities |= u64::from(extended) << 32;
    }

    let mut seed = seed_1.to_vec();
    if capabilities & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        let len_2 = seed_len.saturating_sub(8).max(13);
        let part = reader
            .read_bytes(len_2)
            .unwrap_or_else(|| reader.read_rest());
        let part = part.strip_suffix(&[0]).unwrap_or(part);
        seed.extend_from_slice(part);
    }

    let auth_plugin = if capabilities & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        reader.read_null_string()
    } else {
        String::new()
    };
    let auth_plugin = if auth_plugin.is_empty() {
        plugins::MYSQL_NATIVE_PASSWORD.to_string()
    } else {
        auth_plugin
    };

    Ok(ServerGreeting {
        protocol_version,
        server_version,
        connection_id,
        seed,
        capabilities,
        charset,
        status_flags,
        auth_plugin,
    })
}

/// Fixed prefix shared by the SSL request and the handshake response.
fn write_client_header(writer: &mut PacketWriter, caps: u64, config: &MySqlConfig, mariadb: bool) {
    writer.write_u32_le(caps as u32);
    writer.write_u32_le(config.max_packet_size);
    writer.write_u8(config.charset);
    writer.write_zeros(19);
    if mariadb {
        writer.write_u32_le((caps >> 32) as u32);
    } else {
        writer.write_zeros(4);
    }
}

fn connect_attributes(config: &MySqlConfig) -> Vec<u8> {
    let mut attrs = PacketWriter::new();
    attrs.write_lenenc_string("_client_name");
    attrs.write_lenenc_string(env!("CARGO_PKG_NAME"));
    attrs.write_lenenc_string("_client_version");
    attrs.write_lenenc_string(env!("CARGO_PKG_VERSION"));
    let mut user: Vec<_> = config.attributes.iter().collect();
    user.sort();
    for (key, value) in user {
        attrs.write_lenenc_string(key);
        attrs.write_lenenc_string(value);
    }
    attrs.into_bytes()
}

/// Build HandshakeResponse41.
pub fn handshake_response(
    greeting: &ServerGreeting,
    caps: u64,
    config: &MySqlConfig,
    plugin: &str,
    auth_response: &[u8],
) -> Vec<u8> {
    let mut writer = PacketWriter::with_capacity(128);
    write_client_header(&mut writer, caps, config, greeting.is_mariadb());
    writer.write_null_string(&config.user);

    if caps & capabilities::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA != 0 {
        writer.write_lenenc_bytes(auth_response);
    } else if caps & capabilities::CLIENT_SECURE_CONNECTION != 0 {
        writer.write_u8(auth_response.len() as u8);
        writer.write_bytes(auth_response);
    } else {
        writer.write_bytes(auth_response);
        writer.write_u8(0);
    }

    if caps & capabilities::CLIENT_CONNECT_WITH_DB != 0 {
        writer.write_null_string(config.database.as_deref().unwrap_or(""));
    }
    if caps & capabilities::CLIENT_PLUGIN_AUTH != 0 {
        writer.write_null_string(plugin);
    }
    if caps & capabilities::CLIENT_CONNECT_ATTRS != 0 {
        writer.write_lenenc_bytes(&connect_attributes(config));
    }
    writer.into_bytes()
}

/// Drives the connection phase over a fresh codec.
struct Authenticator<'a> {
    codec: &'a mut PacketCodec,
    config: &'a MySqlConfig,
    registry: &'a AuthRegistry,
    state: AuthState,
}

impl Authenticator<'_> {
    fn enter(&mut self, next: AuthState) {
        tracing::trace!(from = ?self.state, to = ?next, "auth state");
        self.state = next;
    }

    fn context(&self, seed: Vec<u8>, server_public_key: Option<&Vec<u8>>) -> AuthContext {
        AuthContext {
            user: self.config.user.clone(),
            password: self.config.password.clone().unwrap_or_default(),
            seed,
            secure: self.codec.is_secure(),
            allow_cleartext_password: self.config.allow_cleartext_password,
            allow_public_key_retrieval: self.config.allow_public_key_retrieval,
            server_public_key: server_public_key.cloned(),
        }
    }

    #[allow(clippy::result_large_err)]
    fn start_plugin(&self, name: &str, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        if !self.config.plugin_allowed(name) {
            return Err(auth_error(format!(
                "authentication plugin '{name}' is not in restrictedAuth"
            )));
        }
        let plugin = self
            .registry
            .get(name)
            .ok_or_else(|| auth_error(format!("authentication plugin '{name}' is not available")))?;
        plugin.start(ctx)
    }

    #[allow(clippy::result_large_err)]
    fn run(&mut self, host: &HostDescriptor) -> Result<Handshake, Error> {
        self.enter(AuthState::AwaitGreeting);
        let greeting = parse_greeting(&self.codec.read_packet()?)?;
        tracing::debug!(
            host = %host,
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            plugin = %greeting.auth_plugin,
            "greeting received"
        );

        self.enter(AuthState::NegotiateCapabilities);
        let ssl_mode = self.config.ssl_mode_for(host);
        tls::validate_tls_config(ssl_mode, &self.config.tls)?;
        let use_tls = tls::negotiate(ssl_mode, greeting.capabilities)?;
        let mut caps = self.config.client_capabilities(ssl_mode) & greeting.capabilities;
        if !use_tls {
            caps &= !capabilities::CLIENT_SSL;
        }

        if use_tls {
            self.enter(AuthState::TlsUpgrade);
            let mut request = PacketWriter::with_capacity(32);
            write_client_header(&mut request, caps, self.config, greeting.is_mariadb());
            self.codec.write_packet(request.as_bytes())?;
            let server_name = self
                .config
                .tls
                .server_name
                .clone()
                .unwrap_or_else(|| host.host.clone());
            self.codec.upgrade_tls(&self.config.tls, &server_name, ssl_mode)?;
            tracing::debug!(host = %host, "TLS established");
        }

        let server_public_key = match &self.config.server_rsa_public_key_file {
            Some(path) => Some(std::fs::read(path).map_err(|e| {
                auth_error(format!(
                    "cannot read server RSA public key {}: {e}",
                    path.display()
                ))
            })?),
            None => None,
        };

        self.enter(AuthState::PluginChallenge);
        let mut plugin = if self.registry.contains(&greeting.auth_plugin) {
            greeting.auth_plugin.clone()
        } else {
            // The server will switch us to what it wants
            plugins::MYSQL_NATIVE_PASSWORD.to_string()
        };
        tracing::debug!(plugin = %plugin, "authenticating");
        let ctx = self.context(greeting.seed.clone(), server_public_key.as_ref());
        let mut session = self.start_plugin(&plugin, &ctx)?;
        let initial = session.initial_response()?;

        self.enter(AuthState::PluginResponse);
        let response = handshake_response(&greeting, caps, self.config, &plugin, &initial);
        self.codec.write_packet(&response)?;

        loop {
            let packet = self.codec.read_packet()?;
            match packet.first().copied() {
                Some(0x00) => {
                    let ok = PacketReader::new(&packet)
                        .parse_ok_packet()
                        .ok_or_else(|| protocol_error("invalid OK packet after authentication"))?;
                    self.enter(AuthState::Authenticated);
                    if caps & capabilities::CLIENT_COMPRESS != 0 {
                        self.codec.enable_compression();
                    }
                    return Ok(Handshake {
                        greeting,
                        capabilities: caps,
                        status_flags: ok.status_flags,
                        auth_plugin: plugin,
                        secure: self.codec.is_secure(),
                    });
                }
                Some(0xFF) => {
                    self.enter(AuthState::Rejected);
                    let err = PacketReader::new(&packet)
                        .parse_err_packet()
                        .ok_or_else(|| protocol_error("invalid error packet"))?;
                    return Err(auth_error(format!(
                        "Authentication failed: {} ({})",
                        err.error_message, err.error_code
                    )));
                }
                Some(0xFE) => {
                    let mut reader = PacketReader::new(&packet[1..]);
                    let requested = reader.read_null_string();
                    let seed = reader.read_rest();
                    let seed = seed.strip_suffix(&[0]).unwrap_or(seed).to_vec();
                    tracing::debug!(from = %plugin, to = %requested, "auth switch");

                    self.enter(AuthState::PluginChallenge);
                    let ctx = self.context(seed, server_public_key.as_ref());
                    session = self.start_plugin(&requested, &ctx)?;
                    plugin = requested;
                    let reply = session.initial_response()?;
                    self.enter(AuthState::PluginResponse);
                    self.codec.write_packet(&reply)?;
                }
                Some(0x01) => {
                    self.enter(AuthState::AdditionalAuthRound);
                    match session.more_data(&packet[1..])? {
                        AuthStep::Respond(bytes) => self.codec.write_packet(&bytes)?,
                        AuthStep::Wait => {}
                    }
                }
                other => {
                    return Err(protocol_error(format!(
                        "unexpected packet during authentication: {other:02X?}"
                    )));
                }
            }
        }
    }
}

/// Run the connection phase on `codec`. On success the codec is ready for
/// commands (compressed if negotiated) and reads are bounded by the socket
/// timeout.
#[tracing::instrument(level = "debug", skip(codec, config, registry), fields(host = %host))]
#[allow(clippy::result_large_err)]
pub fn perform(
    codec: &mut PacketCodec,
    host: &HostDescriptor,
    config: &MySqlConfig,
    registry: &AuthRegistry,
) -> Result<Handshake, Error> {
    codec.reset_sequence();
    codec.set_read_timeout(Some(non_zero(config.connect_timeout)))?;
    let handshake = Authenticator {
        codec,
        config,
        registry,
        state: AuthState::AwaitGreeting,
    }
    .run(host)?;
    codec.set_read_timeout(config.socket_timeout)?;
    Ok(handshake)
}

fn non_zero(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        Duration::from_secs(30)
    } else {
        timeout
    }
}
