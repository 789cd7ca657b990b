use std::fmt::Display;
use std::io;

use thiserror::Error;

/// Classifies connect errors for programmatic matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    /// Host name could not be resolved
    Resolve,
    /// Socket could not be created, bound or connected
    Socket,
    /// TLS handshake failed
    Tls,
}

/// HTTP client error types
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connect error: {message}")]
    Connect {
        kind: ConnectErrorKind,
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("Proxy tunnel error: {code} {reason}")]
    ProxyTunnel { code: u16, reason: String },

    #[error("Protocol parse error: {0}")]
    ProtocolParse(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Config error: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Blocking sockets report an expired read timeout as `WouldBlock` on Unix
/// and `TimedOut` on Windows.
pub(crate) fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock)
}

impl ClientError {
    /// Wrap an I/O error raised while opening a connection.
    pub(crate) fn connect(kind: ConnectErrorKind, context: impl Display, e: io::Error) -> Self {
        if is_timeout(&e) {
            return ClientError::Timeout(format!("{}: {}", context, e));
        }
        ClientError::Connect {
            kind,
            message: format!("{}: {}", context, e),
            source: Some(e),
        }
    }

    /// Wrap an I/O error raised on an already open connection.
    pub(crate) fn io(context: impl Display, e: io::Error) -> Self {
        if is_timeout(&e) {
            return ClientError::Timeout(format!("{}: {}", context, e));
        }
        ClientError::Io {
            message: format!("{}: {}", context, e),
            source: e,
        }
    }

    /// OS-level error code behind a connect or I/O failure, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ClientError::Connect {
                source: Some(e), ..
            } => e.raw_os_error(),
            ClientError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this error is a connect or read deadline being exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}
