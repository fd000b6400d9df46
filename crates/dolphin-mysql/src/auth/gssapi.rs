//! `auth_gssapi_client` support.
//!
//! The server's seed names the service principal and the accepted
//! mechanisms, each NUL-terminated. The token exchange itself belongs to a
//! platform security library, so it is delegated to a [`GssapiProvider`]
//! supplied by the caller; no password is ever sent.

use std::fmt;
use std::sync::Arc;

use dolphin_core::Error;

use super::{AuthContext, AuthPlugin, AuthSession, AuthStep, auth_error, plugins};

/// Initiates security contexts.
pub trait GssapiProvider: Send + Sync + fmt::Debug {
    /// Start a context for `service_principal`.
    #[allow(clippy::result_large_err)]
    fn initiate(
        &self,
        service_principal: &str,
        mechanisms: &str,
    ) -> Result<Box<dyn GssapiExchange>, Error>;
}

/// One security context in progress.
pub trait GssapiExchange: Send {
    /// Produce the next token. `input` is empty for the first call.
    #[allow(clippy::result_large_err)]
    fn step(&mut self, input: &[u8]) -> Result<Vec<u8>, Error>;
}

/// Registers under `auth_gssapi_client`.
#[derive(Debug, Clone)]
pub struct GssapiPlugin {
    provider: Arc<dyn GssapiProvider>,
}

impl GssapiPlugin {
    pub fn new(provider: Arc<dyn GssapiProvider>) -> Self {
        Self { provider }
    }
}

/// Split the server seed into principal and mechanism list.
pub fn parse_seed(seed: &[u8]) -> (String, String) {
    let mut parts = seed.split(|&b| b == 0);
    let spn = parts.next().unwrap_or_default();
    let mechanisms = parts.next().unwrap_or_default();
    (
        String::from_utf8_lossy(spn).into_owned(),
        String::from_utf8_lossy(mechanisms).into_owned(),
    )
}

impl AuthPlugin for GssapiPlugin {
    fn name(&self) -> &str {
        plugins::AUTH_GSSAPI_CLIENT
    }

    fn start(&self, ctx: &AuthContext) -> Result<Box<dyn AuthSession>, Error> {
        let (spn, mechanisms) = parse_seed(&ctx.seed);
        if spn.is_empty() {
            return Err(auth_error("auth_gssapi_client: server sent no principal"));
        }
        tracing::debug!(spn = %spn, mechanisms = %mechanisms, "starting GSSAPI exchange");
        Ok(Box::new(GssapiSession {
            exchange: self.provider.initiate(&spn, &mechanisms)?,
        }))
    }
}

struct GssapiSession {
    exchange: Box<dyn GssapiExchange>,
}

impl AuthSession for GssapiSession {
    fn initial_response(&mut self) -> Result<Vec<u8>, Error> {
        self.exchange.step(&[])
    }

    fn more_data(&mut self, data: &[u8]) -> Result<AuthStep, Error> {
        let token = self.exchange.step(data)?;
        if token.is_empty() {
            Ok(AuthStep::Wait)
        } else {
            Ok(AuthStep::Respond(token))
        }
    }
}
