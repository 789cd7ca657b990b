//! HTTP proxy outbound implementation.
//!
//! Connects to targets through an HTTP proxy using the CONNECT method, then
//! upgrades the tunnel to TLS when the target asks for it.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use percent_encoding::percent_decode_str;

use crate::error::{ClientError, Result};
use crate::response::parse_status_line;
use crate::types::ConnectionTarget;

use super::{Dialer, Direct, TcpConn};

/// Port used when a proxy URL does not name one.
pub const DEFAULT_PROXY_PORT: u16 = 8080;

/// Upper bound on the proxy's CONNECT response header block.
const MAX_HANDSHAKE_BYTES: usize = 64 * 1024;

/// Decides whether a target host skips the proxy.
pub type BypassFn = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Forward proxy settings.
///
/// Holds no connection state, so a single value can be shared by every
/// request and thread that goes through the same proxy.
#[derive(Clone)]
pub struct ProxyConfig {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    bypass: Option<BypassFn>,
}

impl ProxyConfig {
    /// Create a new proxy config for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
            bypass: None,
        }
    }

    /// Create a proxy config from URL.
    ///
    /// URL format: `http://[user:pass@]host[:port]`
    pub fn from_url(url: &str) -> Result<Self> {
        let url = url.trim();

        let rest = if let Some(rest) = url.strip_prefix("http://") {
            rest
        } else if url.starts_with("https://") {
            return Err(ClientError::ConfigError(
                "HTTPS proxy not supported (use http:// instead)".to_string(),
            ));
        } else {
            return Err(ClientError::InvalidUrl(format!(
                "Unsupported scheme for HTTP proxy: {}",
                url
            )));
        };
        let rest = rest.trim_end_matches('/');

        // Parse auth and host
        let (auth, host_port) = match rest.rfind('@') {
            Some(at_pos) => (Some(&rest[..at_pos]), &rest[at_pos + 1..]),
            None => (None, rest),
        };
        let (host, port) = split_host_port(host_port)?;

        let mut config = Self::new(host, port);
        if let Some(auth) = auth {
            let (user, password) = auth.split_once(':').unwrap_or((auth, ""));
            config = config.with_auth(
                percent_decode_str(user).decode_utf8_lossy(),
                percent_decode_str(password).decode_utf8_lossy(),
            );
        }
        Ok(config)
    }

    /// Set basic authentication.
    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the predicate that lets hosts skip the proxy.
    pub fn with_bypass<F>(mut self, bypass: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.bypass = Some(Arc::new(bypass));
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Whether requests to `host` should connect directly.
    pub fn should_bypass(&self, host: &str) -> bool {
        self.bypass.as_ref().is_some_and(|f| f(host))
    }

    /// `Proxy-Authorization` value, when a user is configured.
    pub fn basic_auth(&self) -> Option<String> {
        let user = self.user.as_deref().filter(|u| !u.is_empty())?;
        let credentials = format!("{}:{}", user, self.password.as_deref().unwrap_or(""));
        Some(format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(credentials)
        ))
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("bypass", &self.bypass.is_some())
            .finish()
    }
}

/// Split `host[:port]`, accepting bracketed IPv6 literals.
fn split_host_port(host_port: &str) -> Result<(String, u16)> {
    let parse_port = |p: &str| {
        p.parse::<u16>()
            .map_err(|_| ClientError::InvalidUrl(format!("Invalid proxy port: {}", p)))
    };

    let (host, port) = if let Some(rest) = host_port.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| ClientError::InvalidUrl(format!("Invalid proxy host: {}", host_port)))?;
        match after.strip_prefix(':') {
            Some(port) => (host, parse_port(port)?),
            None if after.is_empty() => (host, DEFAULT_PROXY_PORT),
            None => {
                return Err(ClientError::InvalidUrl(format!(
                    "Invalid proxy host: {}",
                    host_port
                )))
            }
        }
    } else {
        match host_port.split_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (host_port, DEFAULT_PROXY_PORT),
        }
    };

    if host.is_empty() {
        return Err(ClientError::InvalidUrl("Proxy URL has no host".to_string()));
    }
    Ok((host.to_string(), port))
}

/// HTTP proxy outbound.
///
/// Opens a plain TCP connection to the proxy, asks it to CONNECT to the
/// target, and hands back the tunnel. TLS to the target is negotiated
/// end-to-end through the tunnel with the target's own trust context.
#[derive(Clone, Debug)]
pub struct HttpProxy {
    config: ProxyConfig,
    direct: Direct,
}

impl HttpProxy {
    /// Create a new proxy outbound. `direct` supplies the timeouts and the
    /// trust context used for the target.
    pub fn new(config: ProxyConfig, direct: Direct) -> Self {
        Self { config, direct }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn connect_request(&self, target: &ConnectionTarget) -> String {
        let authority = target.authority();
        let mut request = format!(
            "CONNECT {} HTTP/1.1\r\n\
             Host: {}\r\n",
            authority, authority
        );
        if let Some(auth) = self.config.basic_auth() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
        }
        request.push_str("Connection: close\r\n\r\n");
        request
    }

    /// Run the CONNECT handshake over an open proxy connection.
    fn handshake(
        &self,
        mut conn: Box<dyn TcpConn>,
        target: &ConnectionTarget,
    ) -> Result<Box<dyn TcpConn>> {
        let request = self.connect_request(target);
        conn.write_all(request.as_bytes())
            .and_then(|_| conn.flush())
            .map_err(|e| ClientError::io("Failed to send CONNECT request", e))?;

        let mut reader = BufReader::new(conn);
        let status_line = read_handshake_head(&mut reader)?;
        let status = parse_status_line(&status_line)?;
        log::debug!(
            "proxy {}:{} answered CONNECT {} with {} {}",
            self.config.host,
            self.config.port,
            target.authority(),
            status.code,
            status.reason
        );

        if status.code != 200 {
            let mut conn = reader.into_inner();
            conn.shutdown(Shutdown::Both).ok();
            return Err(ClientError::ProxyTunnel {
                code: status.code,
                reason: status.reason,
            });
        }

        // Bytes the proxy sent past the header block belong to the tunnel.
        let buffered = reader.buffer().to_vec();
        let conn = reader.into_inner();
        if buffered.is_empty() {
            return Ok(conn);
        }
        Ok(Box::new(BufferedTcpConn::new(conn, buffered)))
    }
}

/// Read the proxy's response head up to and including the blank line that
/// ends it, returning the status line. Blank lines before the status line
/// are skipped.
fn read_handshake_head<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut status_line: Option<String> = None;
    let mut consumed = 0usize;

    loop {
        let mut line = Vec::new();
        let n = reader
            .read_until(b'\n', &mut line)
            .map_err(|e| ClientError::io("Failed to read CONNECT response", e))?;
        if n == 0 {
            return Err(ClientError::ProtocolParse(
                "Proxy closed the connection during CONNECT handshake".to_string(),
            ));
        }
        consumed += n;
        if consumed > MAX_HANDSHAKE_BYTES {
            return Err(ClientError::ProtocolParse(
                "CONNECT response header block too large".to_string(),
            ));
        }

        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim();
        if let Some(status) = &status_line {
            if trimmed.is_empty() {
                return Ok(status.clone());
            }
        } else if !trimmed.is_empty() {
            status_line = Some(trimmed.to_string());
        }
    }
}

impl Dialer for HttpProxy {
    fn dial(&self, target: &ConnectionTarget) -> Result<Box<dyn TcpConn>> {
        let conn = self
            .direct
            .connect_plain(&self.config.host, self.config.port)?;
        let tunnel = self.handshake(conn, target)?;

        if target.use_tls {
            return self.direct.trust().upgrade(&target.host, tunnel);
        }
        Ok(tunnel)
    }
}

/// TCP connection with buffered data from the CONNECT response.
struct BufferedTcpConn {
    inner: Box<dyn TcpConn>,
    buffer: Vec<u8>,
    buffer_pos: usize,
}

impl BufferedTcpConn {
    fn new(inner: Box<dyn TcpConn>, buffer: Vec<u8>) -> Self {
        Self {
            inner,
            buffer,
            buffer_pos: 0,
        }
    }
}

impl Read for BufferedTcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // First read from buffer
        if self.buffer_pos < self.buffer.len() {
            let remaining = &self.buffer[self.buffer_pos..];
            let to_copy = remaining.len().min(buf.len());
            buf[..to_copy].copy_from_slice(&remaining[..to_copy]);
            self.buffer_pos += to_copy;
            return Ok(to_copy);
        }
        // Then read from stream
        self.inner.read(buf)
    }
}

impl Write for BufferedTcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl TcpConn for BufferedTcpConn {
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
