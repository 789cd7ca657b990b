//! Outbound connection implementations.
//!
//! This module provides the dialers that produce an open byte stream for a
//! request:
//! - `Direct`: TCP connection straight to the target, optionally upgraded to TLS
//! - `HttpProxy`: tunnel through an HTTP proxy using the CONNECT method
//!
//! Dialers hold configuration only. Every `dial` call opens and returns a
//! fresh connection that the caller owns, so one dialer may be shared by
//! any number of threads.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::Result;
use crate::types::ConnectionTarget;

mod direct;
mod http;

pub use direct::{Direct, DirectOptions};
pub use http::{BypassFn, HttpProxy, ProxyConfig, DEFAULT_PROXY_PORT};

/// Default connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default idle read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound connection interface.
pub trait Dialer: Send + Sync {
    /// Open a new connection to the target, ready for the request to be written.
    fn dial(&self, target: &ConnectionTarget) -> Result<Box<dyn TcpConn>>;
}

/// TCP connection interface.
pub trait TcpConn: Read + Write + Send {
    /// Get the local address
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Get the peer address
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Set read timeout
    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Set write timeout
    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    /// Shutdown the connection
    fn shutdown(&mut self, how: Shutdown) -> io::Result<()>;
}

/// Standard TcpStream wrapper implementing TcpConn
pub struct StdTcpConn {
    inner: TcpStream,
}

impl StdTcpConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }
}

impl Read for StdTcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for StdTcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl TcpConn for StdTcpConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.inner.set_write_timeout(dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}
