//! TLS transport.
//!
//! After the greeting the client sends a short SSL request, performs the
//! TLS handshake on the raw socket, and continues the authentication
//! exchange over the encrypted stream with the packet sequence intact.
//!
//! Certificate checks follow the SSL mode:
//! - `preferred` / `required`: encrypt only, unless a CA file is configured
//! - `verify-ca` / `verify-identity`: verify the chain and the server name
//!   against the configured CA, or the webpki root set

use dolphin_core::Error;
use dolphin_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{SslMode, TlsConfig};
use crate::protocol::capabilities;

#[cfg(feature = "tls")]
use std::io::{Read, Write};
#[cfg(feature = "tls")]
use std::sync::Arc;

/// Decide whether to encrypt given the mode and the server's capabilities.
#[allow(clippy::result_large_err)]
pub fn negotiate(ssl_mode: SslMode, server_caps: u64) -> Result<bool, Error> {
    let server_supports = server_caps & capabilities::CLIENT_SSL != 0;
    match ssl_mode {
        SslMode::Disable => Ok(false),
        SslMode::Preferred => Ok(server_supports && cfg!(feature = "tls")),
        SslMode::Required | SslMode::VerifyCa | SslMode::VerifyIdentity => {
            if server_supports {
                Ok(true)
            } else {
                Err(tls_error("SSL required but server does not support it"))
            }
        }
    }
}

/// Reject configurations that cannot work before any bytes are sent.
#[allow(clippy::result_large_err)]
pub fn validate_tls_config(ssl_mode: SslMode, tls_config: &TlsConfig) -> Result<(), Error> {
    if tls_config.client_cert_path.is_some() != tls_config.client_key_path.is_some() {
        return Err(tls_error(
            "client certificate and client key must be configured together",
        ));
    }
    if ssl_mode.is_required() && !cfg!(feature = "tls") {
        return Err(tls_error(
            "SSL is required but this build has no TLS support (enable the `tls` feature)",
        ));
    }
    Ok(())
}

pub(crate) fn tls_error(message: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Ssl,
        message: message.into(),
        source: None,
    })
}

/// A transport wrapped in a rustls client session.
#[cfg(feature = "tls")]
pub struct TlsStream<S: Read + Write> {
    conn: rustls::ClientConnection,
    stream: S,
}

#[cfg(feature = "tls")]
impl<S: Read + Write> std::fmt::Debug for TlsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsStream")
            .field("protocol_version", &self.conn.protocol_version())
            .field("is_handshaking", &self.conn.is_handshaking())
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> TlsStream<S> {
    /// Run the TLS handshake over `stream`.
    #[allow(clippy::result_large_err)]
    pub fn new(
        mut stream: S,
        tls_config: &TlsConfig,
        server_name: &str,
        ssl_mode: SslMode,
    ) -> Result<Self, Error> {
        validate_tls_config(ssl_mode, tls_config)?;
        let config = build_client_config(tls_config, ssl_mode)?;

        let sni_name = tls_config.server_name.as_deref().unwrap_or(server_name);
        let server_name = sni_name
            .to_string()
            .try_into()
            .map_err(|e| tls_error(format!("invalid server name '{sni_name}': {e}")))?;

        let mut conn = rustls::ClientConnection::new(Arc::new(config), server_name)
            .map_err(|e| tls_error(format!("failed to create TLS session: {e}")))?;

        while conn.is_handshaking() {
            while conn.wants_write() {
                conn.write_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake write failed: {e}")))?;
            }
            if conn.wants_read() {
                let n = conn
                    .read_tls(&mut stream)
                    .map_err(|e| tls_error(format!("TLS handshake read failed: {e}")))?;
                if n == 0 {
                    return Err(tls_error("server closed the connection during TLS handshake"));
                }
                conn.process_new_packets()
                    .map_err(|e| tls_error(format!("TLS handshake failed: {e}")))?;
            }
        }

        tracing::debug!(
            version = ?conn.protocol_version(),
            cipher = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
            "TLS established"
        );
        Ok(TlsStream { conn, stream })
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Read for TlsStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match self.conn.reader().read(buf) {
                Ok(n) if n > 0 => return Ok(n),
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            if !self.conn.wants_read() {
                return Ok(0);
            }
            if self.conn.read_tls(&mut self.stream)? == 0 {
                return Ok(0);
            }
            self.conn
                .process_new_packets()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        }
    }
}

#[cfg(feature = "tls")]
impl<S: Read + Write> Write for TlsStream<S> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.conn.writer().write(buf)?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.conn.writer().flush()?;
        while self.conn.wants_write() {
            self.conn.write_tls(&mut self.stream)?;
        }
        self.stream.flush()
    }
}

#[cfg(feature = "tls")]
impl<S: crate::transport::Transport> crate::transport::Transport for TlsStream<S> {
    fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> std::io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        self.conn.send_close_notify();
        // Best effort: the peer may already be gone.
        let _ = self.flush();
        self.stream.shutdown()
    }

    fn is_secure(&self) -> bool {
        true
    }
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_client_config(
    tls_config: &TlsConfig,
    ssl_mode: SslMode,
) -> Result<rustls::ClientConfig, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disable => Err(tls_error("TLS requested with ssl mode 'disable'")),
        _ if tls_config.danger_skip_verify => build_no_verify_config(&provider),
        SslMode::Preferred | SslMode::Required => match &tls_config.ca_cert_path {
            Some(ca_path) => build_custom_ca_config(&provider, tls_config, ca_path),
            None => build_no_verify_config(&provider),
        },
        SslMode::VerifyCa | SslMode::VerifyIdentity => match &tls_config.ca_cert_path {
            Some(ca_path) => build_custom_ca_config(&provider, tls_config, ca_path),
            None => build_webpki_config(&provider, tls_config),
        },
    }
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> Result<rustls::ClientConfig, Error> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct AcceptAnyCertificate(Arc<rustls::crypto::CryptoProvider>);

    impl ServerCertVerifier for AcceptAnyCertificate {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider.clone())))
        .with_no_client_auth();

    Ok(config)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn build_custom_ca_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
    tls_config: &TlsConfig,
    ca_path: &std::path::Path,
) -> Result<rustls::ClientConfig, Error> {
    let certs = load_certs(ca_path, "CA certificate")?;

    let mut root_store = rustls::RootCertStore::empty();
    for cert in certs {
        root_store
            .add(cert)
            .map_err(|e| tls_error(format!("failed to add CA certificate: {e}")))?;
    }

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store);

    add_client_auth(builder, tls_config)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn load_certs(
    path: &std::path::Path,
    what: &str,
) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, Error> {
    let file = std::fs::File::open(path)
        .map_err(|e| tls_error(format!("failed to open {what} '{}': {e}", path.display())))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in {what} '{}'",
            path.display()
        )));
    }
    Ok(certs)
}

#[cfg(feature = "tls")]
#[allow(clippy::result_large_err)]
fn add_client_auth(
    builder: rustls::ConfigBuilder<rustls::ClientConfig, rustls::client::WantsClientCert>,
    tls_config: &TlsConfig,
) -> Result<rustls::ClientConfig, Error> {
    let (Some(cert_path), Some(key_path)) =
        (&tls_config.client_cert_path, &tls_config.client_key_path)
    else {
        return Ok(builder.with_no_client_auth());
    };

    let certs = load_certs(cert_path, "client certificate")?;
    let key_file = std::fs::File::open(key_path).map_err(|e| {
        tls_error(format!(
            "failed to open client key '{}': {e}",
            key_path.display()
        ))
    })?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .map_err(|e| tls_error(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| tls_error(format!("no private key found in '{}'", key_path.display())))?;

    builder
        .with_client_auth_cert(certs, key)
        .map_err(|e| tls_error(format!("failed to configure client certificate: {e}")))
}
