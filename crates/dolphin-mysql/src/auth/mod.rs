//! Authentication plugins.
//!
//! The server names a plugin in its greeting and may switch to another
//! with an AuthSwitch request. Each plugin turns a seed into an initial
//! response and then answers any AuthMoreData packets until the server
//! sends OK or ERR. Plugins are looked up by name in an [`AuthRegistry`];
//! callers may register their own (for example [`gssapi::GssapiPlugin`]).

pub mod gssapi;
pub mod scramble;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dolphin_core::Error;
use dolphin_core::error::{ConnectionError, ConnectionErrorKind, ProtocolError};

/// Well-known plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const SHA256_PASSWORD: &str = "sha256_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const AUTH_GSSAPI_CLIENT: &str = "auth_gssapi_client";
}

/// caching_sha2_password status bytes in AuthMoreData.
pub mod caching_sha2 {
    pub const REQUEST_PUBLIC_KEY: u8 = 0x02;
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Everything a plugin may need to answer the server.
#[derive(Clone)]
pub struct AuthContext {
    pub user: String,
    pub password: String,
    /// Seed from the greeting or the latest AuthSwitch
    pub seed: Vec<u8>,
    /// TLS or a local socket
    pub secure: bool,
    pub allow_cleartext_password: bool,
    pub allow_public_key_retrieval: bool,
    /// PEM key configured on the client side
    pub server_public_key: Option<Vec<u8>>,
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("user", &self.user)
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}

/// What to do with an AuthMoreData packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send these bytes in the next packet of the exchange
    Respond(Vec<u8>),
    /// Nothing to send; read the server's next packet
    Wait,
}

/// One in-progress authentication exchange.
pub trait AuthSession: Send {
    /// Bytes for the handshake response or AuthSwitch reply.
    #[allow(clippy::result_large_err)]
    fn initial_response(&mut self) -> Result<Vec<u8>, Error>;

    /// Handle an AuthMoreData payload (without its 0x01 marker).
    #[allow(clippy::result_large_err)]
    fn more_data(&mut self, data: &[u8]) -> Result<AuthStep, Error>;
}

/// A named authentication method.
pub trait AuthPlugin: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    #[allow(clippy::result_large_err)]
    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error>;
}

/// Plugins available to the handshake, keyed by name.
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    plugins: HashMap<String, Arc<dyn AuthPlugin>>,
}

impl AuthRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Native, caching SHA-2, SHA-256 and cleartext plugins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(NativePassword));
        registry.register(Arc::new(CachingSha2Password));
        registry.register(Arc::new(Sha256Password));
        registry.register(Arc::new(ClearPassword));
        registry
    }

    /// Add or replace a plugin.
    pub fn register(&mut self, plugin: Arc<dyn AuthPlugin>) {
        self.plugins.insert(plugin.name().to_string(), plugin);
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn AuthPlugin>> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }
}

pub(crate) fn auth_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Authentication,
        message: message.into(),
        source: None,
    })
}

fn unexpected_more_data(plugin: &str) -> Error {
    Error::Protocol(ProtocolError {
        message: format!("unexpected AuthMoreData for {plugin}"),
        raw_data: None,
        source: None,
    })
}

#[allow(clippy::result_large_err)]
fn rsa_response(ctx: &AuthContext, key: &[u8]) -> Result<Vec<u8>, Error> {
    scramble::rsa_encrypt_password(&ctx.password, &ctx.seed, key).map_err(auth_error)
}

#[derive(Debug)]
struct NativePassword;

struct NativeSession {
    response: Vec<u8>,
}

impl AuthPlugin for NativePassword {
    fn name(&self) -> &str {
        plugins::MYSQL_NATIVE_PASSWORD
    }

    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        Ok(Box::new(NativeSession {
            response: scramble::native_password(&ctx.password, &ctx.seed),
        }))
    }
}

impl AuthSession for NativeSession {
    fn initial_response(&mut self) -> Result<Vec<u8>, Error> {
        Ok(std::mem::take(&mut self.response))
    }

    fn more_data(&mut self, _data: &[u8]) -> Result<AuthStep, Error> {
        Err(unexpected_more_data(plugins::MYSQL_NATIVE_PASSWORD))
    }
}

#[derive(Debug)]
struct CachingSha2Password;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sha2State {
    Scrambled,
    FullAuthSent,
    AwaitingKey,
}

struct CachingSha2Session {
    ctx: AuthContext,
    state: Sha2State,
}

impl AuthPlugin for CachingSha2Password {
    fn name(&self) -> &str {
        plugins::CACHING_SHA2_PASSWORD
    }

    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        Ok(Box::new(CachingSha2Session {
            ctx: ctx.clone(),
            state: Sha2State::Scrambled,
        }))
    }
}

impl AuthSession for CachingSha2Session {
    fn initial_response(&mut self) -> Result<Vec<u8>, Error> {
        Ok(scramble::caching_sha2_password(
            &self.ctx.password,
            &self.ctx.seed,
        ))
    }

    fn more_data(&mut self, data: &[u8]) -> Result<AuthStep, Error> {
        match (self.state, data) {
            (Sha2State::Scrambled, [caching_sha2::FAST_AUTH_SUCCESS]) => {
                tracing::debug!("caching_sha2_password fast auth succeeded");
                Ok(AuthStep::Wait)
            }
            (Sha2State::Scrambled, [caching_sha2::PERFORM_FULL_AUTH]) => {
                self.state = Sha2State::FullAuthSent;
                if self.ctx.secure {
                    return Ok(AuthStep::Respond(scramble::cleartext(&self.ctx.password)));
                }
                if let Some(key) = &self.ctx.server_public_key {
                    return rsa_response(&self.ctx, key).map(AuthStep::Respond);
                }
                if self.ctx.allow_public_key_retrieval {
                    self.state = Sha2State::AwaitingKey;
                    return Ok(AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY]));
                }
                Err(auth_error(
                    "caching_sha2_password full authentication needs TLS, a server RSA public \
                     key file, or allowPublicKeyRetrieval",
                ))
            }
            (Sha2State::AwaitingKey, key) => {
                self.state = Sha2State::FullAuthSent;
                rsa_response(&self.ctx, key).map(AuthStep::Respond)
            }
            _ => Err(unexpected_more_data(plugins::CACHING_SHA2_PASSWORD)),
        }
    }
}

#[derive(Debug)]
struct Sha256Password;

struct Sha256Session {
    ctx: AuthContext,
    awaiting_key: bool,
}

impl AuthPlugin for Sha256Password {
    fn name(&self) -> &str {
        plugins::SHA256_PASSWORD
    }

    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        Ok(Box::new(Sha256Session {
            ctx: ctx.clone(),
            awaiting_key: false,
        }))
    }
}

impl AuthSession for Sha256Session {
    fn initial_response(&mut self) -> Result<Vec<u8>, Error> {
        if self.ctx.password.is_empty() {
            return Ok(vec![0]);
        }
        if self.ctx.secure {
            return Ok(scramble::cleartext(&self.ctx.password));
        }
        if let Some(key) = &self.ctx.server_public_key {
            return rsa_response(&self.ctx, key);
        }
        if self.ctx.allow_public_key_retrieval {
            self.awaiting_key = true;
            return Ok(vec![0x01]);
        }
        Err(auth_error(
            "sha256_password needs TLS, a server RSA public key file, or allowPublicKeyRetrieval",
        ))
    }

    fn more_data(&mut self, data: &[u8]) -> Result<AuthStep, Error> {
        if !self.awaiting_key {
            return Err(unexpected_more_data(plugins::SHA256_PASSWORD));
        }
        self.awaiting_key = false;
        rsa_response(&self.ctx, data).map(AuthStep::Respond)
    }
}

#[derive(Debug)]
struct ClearPassword;

struct ClearSession {
    response: Vec<u8>,
}

impl AuthPlugin for ClearPassword {
    fn name(&self) -> &str {
        plugins::MYSQL_CLEAR_PASSWORD
    }

    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        if !ctx.secure && !ctx.allow_cleartext_password {
            return Err(auth_error(
                "mysql_clear_password refused on an unencrypted connection \
                 (enable TLS or allowCleartextPassword)",
            ));
        }
        Ok(Box::new(ClearSession {
            response: scramble::cleartext(&ctx.password),
        }))
    }
}

impl AuthSession for ClearSession {
    fn initial_response(&mut self) -> Result<Vec<u8>, Error> {
        Ok(std::mem::take(&mut self.response))
    }

    fn more_data(&mut self, _data: &[u8]) -> Result<AuthStep, Error> {
        Err(unexpected_more_data(plugins::MYSQL_CLEAR_PASSWORD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(secure: bool) -> AuthContext {
        AuthContext {
            user: "app".to_string(),
            password: "secret".to_string(),
            seed: (1..=20).collect(),
            secure,
            allow_cleartext_password: false,
            allow_public_key_retrieval: false,
            server_public_key: None,
        }
    }

    fn start(name: &str, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        AuthRegistry::with_builtins().get(name).unwrap().start(ctx)
    }

    #[test]
    fn builtins_are_registered() {
        let registry = AuthRegistry::with_builtins();
        for name in [
            plugins::MYSQL_NATIVE_PASSWORD,
            plugins::CACHING_SHA2_PASSWORD,
            plugins::SHA256_PASSWORD,
            plugins::MYSQL_CLEAR_PASSWORD,
        ] {
            assert!(registry.contains(name), "{name}");
        }
        assert!(!registry.contains(plugins::AUTH_GSSAPI_CLIENT));
    }

    #[test]
    fn caching_sha2_fast_path_waits_for_ok() {
        let mut session = start(plugins::CACHING_SHA2_PASSWORD, &ctx(false)).unwrap();
        assert_eq!(session.initial_response().unwrap().len(), 32);
        assert_eq!(
            session.more_data(&[caching_sha2::FAST_AUTH_SUCCESS]).unwrap(),
            AuthStep::Wait
        );
    }

    #[test]
    fn caching_sha2_full_auth_over_tls_sends_password() {
        let mut session = start(plugins::CACHING_SHA2_PASSWORD, &ctx(true)).unwrap();
        session.initial_response().unwrap();
        assert_eq!(
            session.more_data(&[caching_sha2::PERFORM_FULL_AUTH]).unwrap(),
            AuthStep::Respond(b"secret\0".to_vec())
        );
    }

    #[test]
    fn caching_sha2_full_auth_requests_key_when_allowed() {
        let mut plain = ctx(false);
        let mut session = start(plugins::CACHING_SHA2_PASSWORD, &plain).unwrap();
        session.initial_response().unwrap();
        let err = session
            .more_data(&[caching_sha2::PERFORM_FULL_AUTH])
            .unwrap_err();
        assert_eq!(err.class(), dolphin_core::ErrorClass::AuthenticationRejected);

        plain.allow_public_key_retrieval = true;
        let mut session = start(plugins::CACHING_SHA2_PASSWORD, &plain).unwrap();
        session.initial_response().unwrap();
        assert_eq!(
            session.more_data(&[caching_sha2::PERFORM_FULL_AUTH]).unwrap(),
            AuthStep::Respond(vec![caching_sha2::REQUEST_PUBLIC_KEY])
        );
    }

    #[test]
    fn cleartext_needs_secure_channel_or_opt_in() {
        assert!(start(plugins::MYSQL_CLEAR_PASSWORD, &ctx(false)).is_err());
        let mut session = start(plugins::MYSQL_CLEAR_PASSWORD, &ctx(true)).unwrap();
        assert_eq!(session.initial_response().unwrap(), b"secret\0");

        let mut opted_in = ctx(false);
        opted_in.allow_cleartext_password = true;
        assert!(start(plugins::MYSQL_CLEAR_PASSWORD, &opted_in).is_ok());
    }

    #[test]
    fn sha256_over_tls_sends_password() {
        let mut session = start(plugins::SHA256_PASSWORD, &ctx(true)).unwrap();
        assert_eq!(session.initial_response().unwrap(), b"secret\0");
        assert!(session.more_data(b"x").is_err());
    }
}
