//! Remote Gopher server connection and request framing.

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

use bytes::{BufMut, Bytes, BytesMut};
use mio::net::TcpStream;

use crate::config::RemoteConfig;

/// Terminator of a Gopher selector line.
pub const SELECTOR_END: &[u8; 2] = b"\r\n";

/// Why no remote connection could be opened.
#[derive(Debug)]
pub enum ConnectError {
    /// The remote name could not be resolved at all.
    Resolve(io::Error),
    /// The name resolved to no addresses.
    NoAddresses,
    /// Every address refused or failed; holds the last error.
    Unreachable(io::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Resolve(e) => write!(f, "failed to resolve remote: {e}"),
            ConnectError::NoAddresses => write!(f, "remote resolved to no addresses"),
            ConnectError::Unreachable(e) => write!(f, "failed to connect to remote: {e}"),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnectError::Resolve(e) | ConnectError::Unreachable(e) => Some(e),
            ConnectError::NoAddresses => None,
        }
    }
}

/// The Gopher server every request is relayed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    host: String,
    port: u16,
}

impl Upstream {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn from_config(config: &RemoteConfig) -> Self {
        Self::new(config.host.clone(), config.port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn resolve(&self) -> io::Result<Vec<SocketAddr>> {
        Ok((self.host.as_str(), self.port).to_socket_addrs()?.collect())
    }

    /// Resolve and connect, trying each address in turn.
    ///
    /// Blocks the calling thread for the lookup and the TCP handshake. The
    /// returned stream is non-blocking.
    pub fn connect(&self) -> Result<TcpStream, ConnectError> {
        let addrs = self.resolve().map_err(ConnectError::Resolve)?;
        let mut last_error = None;

        for addr in addrs {
            match std::net::TcpStream::connect(addr) {
                Ok(stream) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(ConnectError::Unreachable)?;
                    tracing::trace!(remote = %addr, "Connected to remote");
                    return Ok(TcpStream::from_std(stream));
                }
                Err(e) => {
                    tracing::debug!(
                        remote = %addr,
                        error = %e,
                        "Remote address refused connection"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or(ConnectError::NoAddresses, ConnectError::Unreachable))
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Frame a selector as a Gopher request: the raw selector bytes and `\r\n`.
pub fn selector_request(selector: &[u8]) -> Bytes {
    let mut request = BytesMut::with_capacity(selector.len() + SELECTOR_END.len());
    request.put_slice(selector);
    request.put_slice(SELECTOR_END);
    request.freeze()
}
