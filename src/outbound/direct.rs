//! Direct outbound connection implementation.
//!
//! Connects straight to the target over the local network and, for TLS
//! targets, runs the handshake on the new socket.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::error::{ClientError, ConnectErrorKind, Result};
use crate::tls::TrustContext;
use crate::types::ConnectionTarget;

use super::{Dialer, StdTcpConn, TcpConn, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};

/// Options for creating a Direct outbound.
#[derive(Debug, Clone, Default)]
pub struct DirectOptions {
    /// Connection timeout
    pub connect_timeout: Option<Duration>,
    /// Idle timeout for every read (and write) on the opened socket
    pub read_timeout: Option<Duration>,
    /// Bind IPv4 address for outgoing connections
    pub bind_ip4: Option<Ipv4Addr>,
    /// Bind IPv6 address for outgoing connections
    pub bind_ip6: Option<Ipv6Addr>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

/// Direct outbound that connects straight to the target.
///
/// Resolved addresses are tried in order until one accepts the connection.
#[derive(Clone, Debug)]
pub struct Direct {
    trust: TrustContext,
    connect_timeout: Duration,
    read_timeout: Duration,
    bind_ip4: Option<Ipv4Addr>,
    bind_ip6: Option<Ipv6Addr>,
    nodelay: bool,
}

impl Direct {
    /// Create a new Direct outbound with default settings.
    pub fn new(trust: TrustContext) -> Self {
        Self {
            trust,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            bind_ip4: None,
            bind_ip6: None,
            nodelay: false,
        }
    }

    /// Create a new Direct outbound with the given options.
    pub fn with_options(trust: TrustContext, opts: DirectOptions) -> Result<Self> {
        let connect_timeout = opts.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let read_timeout = opts.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT);
        if connect_timeout.is_zero() || read_timeout.is_zero() {
            return Err(ClientError::ConfigError(
                "connect and read timeouts must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            trust,
            connect_timeout,
            read_timeout,
            bind_ip4: opts.bind_ip4,
            bind_ip6: opts.bind_ip6,
            nodelay: opts.nodelay,
        })
    }

    /// Set connection timeout. Callers validate that it is non-zero.
    pub(crate) fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set idle read timeout. Callers validate that it is non-zero.
    pub(crate) fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Resolve a host to the addresses to try, in resolver order.
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![SocketAddr::new(ip, port)]);
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| {
                ClientError::connect(
                    ConnectErrorKind::Resolve,
                    format!("Failed to resolve {}", host),
                    e,
                )
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ClientError::Connect {
                kind: ConnectErrorKind::Resolve,
                message: format!("No address found for {}", host),
                source: None,
            });
        }
        Ok(addrs)
    }

    /// Get the bind IP for the given target IP.
    fn get_bind_ip(&self, target: &IpAddr) -> Option<IpAddr> {
        match target {
            IpAddr::V4(_) => self.bind_ip4.map(IpAddr::V4),
            IpAddr::V6(_) => self.bind_ip6.map(IpAddr::V6),
        }
    }

    /// Dial TCP to a specific socket address.
    fn dial_tcp_ip(&self, socket_addr: SocketAddr) -> Result<TcpStream> {
        let connect_err = |e| {
            ClientError::connect(
                ConnectErrorKind::Socket,
                format!("Failed to connect to {}", socket_addr),
                e,
            )
        };

        let Some(bind_ip) = self.get_bind_ip(&socket_addr.ip()) else {
            return TcpStream::connect_timeout(&socket_addr, self.connect_timeout)
                .map_err(connect_err);
        };

        let domain = socket2::Domain::for_address(socket_addr);
        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| {
                    ClientError::connect(ConnectErrorKind::Socket, "Failed to create socket", e)
                })?;
        socket
            .bind(&SocketAddr::new(bind_ip, 0).into())
            .map_err(|e| {
                ClientError::connect(
                    ConnectErrorKind::Socket,
                    format!("Failed to bind {}", bind_ip),
                    e,
                )
            })?;
        socket
            .connect_timeout(&socket_addr.into(), self.connect_timeout)
            .map_err(connect_err)?;
        Ok(TcpStream::from(socket))
    }

    /// Open a plain TCP connection with timeouts applied.
    pub(crate) fn connect_plain(&self, host: &str, port: u16) -> Result<Box<dyn TcpConn>> {
        let mut last_err = None;
        for socket_addr in self.resolve(host, port)? {
            log::debug!("connecting to {} ({})", host, socket_addr);
            match self.dial_tcp_ip(socket_addr) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.read_timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.read_timeout)))
                        .and_then(|_| stream.set_nodelay(self.nodelay))
                        .map_err(|e| {
                            ClientError::connect(
                                ConnectErrorKind::Socket,
                                "Failed to configure socket",
                                e,
                            )
                        })?;
                    return Ok(Box::new(StdTcpConn::new(stream)));
                }
                Err(e) => last_err = Some(e),
            }
        }
        // resolve() never returns an empty list
        Err(last_err.unwrap_or_else(|| ClientError::Connect {
            kind: ConnectErrorKind::Socket,
            message: format!("No address to connect to for {}", host),
            source: None,
        }))
    }

    pub(crate) fn trust(&self) -> &TrustContext {
        &self.trust
    }
}

impl Dialer for Direct {
    fn dial(&self, target: &ConnectionTarget) -> Result<Box<dyn TcpConn>> {
        let conn = self.connect_plain(&target.host, target.port)?;
        if target.use_tls {
            return self.trust.upgrade(&target.host, conn);
        }
        Ok(conn)
    }
}
