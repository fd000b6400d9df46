//! Byte transports under the packet codec.
//!
//! A [`Transport`] is a blocking, bidirectional byte stream. TCP and Unix
//! sockets implement it directly, TLS wraps another transport, and tests
//! substitute an in-memory server. A [`Connector`] opens a transport to
//! one host and is how failover obtains fresh connections.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use dolphin_core::Error;
use dolphin_core::error::{ConnectionError, ConnectionErrorKind};

use crate::config::{HostDescriptor, MySqlConfig, SslMode, TlsConfig};

/// A blocking byte stream to a server.
pub trait Transport: Read + Write + Send + fmt::Debug {
    /// Bound every blocking read; `None` waits forever.
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;

    /// Close both directions. Pending reads fail afterwards.
    fn shutdown(&mut self) -> io::Result<()>;

    /// Whether bytes are encrypted on the wire.
    fn is_secure(&self) -> bool {
        false
    }

    /// Wrap this transport in TLS and complete the TLS handshake.
    #[allow(clippy::result_large_err)]
    fn upgrade_tls(
        self: Box<Self>,
        tls: &TlsConfig,
        server_name: &str,
        mode: SslMode,
    ) -> Result<Box<dyn Transport>, Error> {
        let _ = (tls, server_name, mode);
        Err(crate::tls::tls_error("this transport cannot be upgraded to TLS"))
    }
}

impl Transport for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    #[cfg(feature = "tls")]
    fn upgrade_tls(
        self: Box<Self>,
        tls: &TlsConfig,
        server_name: &str,
        mode: SslMode,
    ) -> Result<Box<dyn Transport>, Error> {
        let stream = crate::tls::TlsStream::new(*self, tls, server_name, mode)?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
impl Transport for std::os::unix::net::UnixStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    /// Local sockets never leave the host.
    fn is_secure(&self) -> bool {
        true
    }
}

/// Placeholder left behind while a transport is being replaced.
#[derive(Debug)]
pub(crate) struct Detached;

impl Read for Detached {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "transport detached"))
    }
}

impl Write for Detached {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::NotConnected, "transport detached"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for Detached {
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn shutdown(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Opens transports to hosts.
pub trait Connector: Send + Sync + fmt::Debug {
    #[allow(clippy::result_large_err)]
    fn connect(&self, host: &HostDescriptor, config: &MySqlConfig)
    -> Result<Box<dyn Transport>, Error>;
}

/// Connects over TCP, or over `config.local_socket` when one is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(
        &self,
        host: &HostDescriptor,
        config: &MySqlConfig,
    ) -> Result<Box<dyn Transport>, Error> {
        if let Some(path) = &config.local_socket {
            return connect_local(path, config);
        }

        let stream = connect_tcp(host, config.connect_timeout)?;
        stream.set_read_timeout(config.socket_timeout)?;
        stream.set_write_timeout(config.socket_timeout)?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
#[allow(clippy::result_large_err)]
fn connect_local(
    path: &std::path::Path,
    config: &MySqlConfig,
) -> Result<Box<dyn Transport>, Error> {
    let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| {
        connect_error(
            e.kind(),
            format!("failed to connect to socket {}: {e}", path.display()),
            e,
        )
    })?;
    stream.set_read_timeout(config.socket_timeout)?;
    stream.set_write_timeout(config.socket_timeout)?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
#[allow(clippy::result_large_err)]
fn connect_local(
    path: &std::path::Path,
    _config: &MySqlConfig,
) -> Result<Box<dyn Transport>, Error> {
    Err(Error::Config(dolphin_core::ConfigError {
        message: format!(
            "local socket {} is not supported on this platform",
            path.display()
        ),
        source: None,
    }))
}

#[allow(clippy::result_large_err)]
fn connect_tcp(host: &HostDescriptor, timeout: Duration) -> Result<TcpStream, Error> {
    let addr = host.socket_addr();
    let addrs: Vec<_> = addr
        .to_socket_addrs()
        .map_err(|e| {
            Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::DnsResolution,
                message: format!("failed to resolve {addr}: {e}"),
                source: Some(Box::new(e)),
            })
        })?
        .collect();

    let mut last_err = None;
    for socket_addr in addrs {
        match TcpStream::connect_timeout(&socket_addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                tracing::debug!(host = %addr, resolved = %socket_addr, "TCP connection established");
                return Ok(stream);
            }
            Err(e) => last_err = Some(e),
        }
    }

    Err(match last_err {
        Some(e) => connect_error(e.kind(), format!("failed to connect to {addr}: {e}"), e),
        None => Error::Connection(ConnectionError {
            kind: ConnectionErrorKind::DnsResolution,
            message: format!("{addr} resolved to no addresses"),
            source: None,
        }),
    })
}

fn connect_error(kind: io::ErrorKind, message: String, source: io::Error) -> Error {
    let kind = if kind == io::ErrorKind::ConnectionRefused {
        ConnectionErrorKind::Refused
    } else {
        ConnectionErrorKind::Connect
    };
    Error::Connection(ConnectionError {
        kind,
        message,
        source: Some(Box::new(source)),
    })
}
