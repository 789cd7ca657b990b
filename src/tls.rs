//! TLS trust configuration and connection upgrade.
//!
//! A [`TrustContext`] wraps an immutable rustls `ClientConfig`. It is built
//! once, shared behind an `Arc`, and used to upgrade any open [`TcpConn`]
//! (a direct socket or an established CONNECT tunnel) to TLS.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore, StreamOwned};

use crate::error::{ClientError, ConnectErrorKind, Result};
use crate::outbound::TcpConn;

/// Settings consulted when no explicit trust context is supplied.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM bundle of trusted CA certificates
    pub ca_path: Option<PathBuf>,
    /// Passphrase associated with the CA bundle
    pub ca_passphrase: Option<String>,
}

impl TlsOptions {
    /// Options pointing at a CA bundle.
    pub fn with_ca_path(path: impl Into<PathBuf>) -> Self {
        Self {
            ca_path: Some(path.into()),
            ca_passphrase: None,
        }
    }

    /// Set the CA bundle passphrase.
    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.ca_passphrase = Some(passphrase.into());
        self
    }
}

/// Where the trust anchors of a context came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustSource {
    /// Certificates loaded from a configured CA bundle
    CaFile(PathBuf),
    /// The operating system's certificate store
    Native,
    /// Mozilla roots compiled into the binary
    Bundled,
    /// A caller-supplied rustls configuration
    Custom,
}

// Loading the native store walks the filesystem, so it happens once per process.
static PLATFORM_ROOTS: Lazy<(Arc<RootCertStore>, TrustSource)> = Lazy::new(|| {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            log::debug!(
                "loaded {} native root certificates ({} ignored)",
                added,
                ignored
            );
        }
        Err(e) => log::debug!("native root certificates unavailable: {}", e),
    }
    if roots.is_empty() {
        log::debug!("falling back to bundled root certificates");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return (Arc::new(roots), TrustSource::Bundled);
    }
    (Arc::new(roots), TrustSource::Native)
});

/// Immutable TLS client configuration shared by every connection it opens.
#[derive(Clone)]
pub struct TrustContext {
    config: Arc<ClientConfig>,
    source: TrustSource,
}

impl TrustContext {
    /// Build the default context from options.
    ///
    /// When `ca_path` names an existing file its certificates become the only
    /// trust anchors; otherwise the platform store is used. Peer and hostname
    /// verification are always enabled.
    pub fn from_options(opts: &TlsOptions) -> Result<Self> {
        if let Some(path) = opts.ca_path.as_deref().filter(|p| p.is_file()) {
            if opts.ca_passphrase.is_some() {
                log::debug!("CA passphrase set; PEM trust anchors are not encrypted, ignoring");
            }
            return Self::from_ca_file(path);
        }
        Ok(Self::platform_default())
    }

    /// Context trusting the platform's root certificates.
    pub fn platform_default() -> Self {
        let (roots, source) = &*PLATFORM_ROOTS;
        Self::with_roots(roots.as_ref().clone(), source.clone())
    }

    /// Context trusting exactly the certificates in a PEM bundle.
    pub fn from_ca_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            ClientError::ConfigError(format!("Failed to open CA file {}: {}", path.display(), e))
        })?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(file))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| {
                ClientError::ConfigError(format!(
                    "Failed to read CA file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let mut roots = RootCertStore::empty();
        let (added, _) = roots.add_parsable_certificates(certs);
        if added == 0 {
            return Err(ClientError::ConfigError(format!(
                "No certificates found in CA file {}",
                path.display()
            )));
        }
        log::debug!("loaded {} CA certificates from {}", added, path.display());
        Ok(Self::with_roots(roots, TrustSource::CaFile(path.to_path_buf())))
    }

    /// Wrap a caller-built rustls configuration.
    pub fn from_client_config(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            source: TrustSource::Custom,
        }
    }

    fn with_roots(roots: RootCertStore, source: TrustSource) -> Self {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
            source,
        }
    }

    /// Where this context's trust anchors came from.
    pub fn source(&self) -> &TrustSource {
        &self.source
    }

    /// Run a TLS handshake for `host` over an open connection.
    ///
    /// The handshake completes before this returns, so certificate and
    /// protocol failures surface here as connect errors.
    pub fn upgrade(&self, host: &str, mut sock: Box<dyn TcpConn>) -> Result<Box<dyn TcpConn>> {
        let name = ServerName::try_from(host)
            .map_err(|e| ClientError::ConfigError(format!("Invalid TLS server name {}: {}", host, e)))?
            .to_owned();
        let mut conn = ClientConnection::new(self.config.clone(), name).map_err(|e| {
            ClientError::Connect {
                kind: ConnectErrorKind::Tls,
                message: format!("Failed to start TLS session: {}", e),
                source: None,
            }
        })?;

        while conn.is_handshaking() {
            conn.complete_io(&mut sock).map_err(|e| {
                ClientError::connect(
                    ConnectErrorKind::Tls,
                    format!("TLS handshake with {} failed", host),
                    e,
                )
            })?;
        }
        log::debug!("TLS established with {}", host);

        Ok(Box::new(TlsConn {
            stream: StreamOwned::new(conn, sock),
        }))
    }
}

impl fmt::Debug for TrustContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustContext")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// TLS session layered over another connection.
struct TlsConn {
    stream: StreamOwned<ClientConnection, Box<dyn TcpConn>>,
}

impl Read for TlsConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for TlsConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

impl TcpConn for TlsConn {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.sock.local_addr()
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.sock.peer_addr()
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_read_timeout(dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        self.stream.sock.set_write_timeout(dur)
    }

    fn shutdown(&mut self, how: Shutdown) -> io::Result<()> {
        if matches!(how, Shutdown::Write | Shutdown::Both) {
            self.stream.conn.send_close_notify();
            // Best effort; the peer may already be gone.
            let _ = self.stream.conn.complete_io(&mut self.stream.sock);
        }
        self.stream.sock.shutdown(how)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_without_ca_path() {
        let ctx = TrustContext::from_options(&TlsOptions::default()).unwrap();
        assert!(matches!(
            ctx.source(),
            TrustSource::Native | TrustSource::Bundled
        ));
    }

    #[test]
    fn test_missing_ca_path_falls_back_to_platform() {
        let opts = TlsOptions::with_ca_path("/nonexistent/http-client-r/ca.pem")
            .with_passphrase("secret");
        let ctx = TrustContext::from_options(&opts).unwrap();
        assert_ne!(
            ctx.source(),
            &TrustSource::CaFile(PathBuf::from("/nonexistent/http-client-r/ca.pem"))
        );
    }

    #[test]
    fn test_ca_file_without_certificates_is_rejected() {
        let mut path = std::env::temp_dir();
        path.push(format!("http-client-r-empty-ca-{}.pem", std::process::id()));
        std::fs::write(&path, "not a certificate\n").unwrap();

        let result = TrustContext::from_options(&TlsOptions::with_ca_path(&path));
        std::fs::remove_file(&path).ok();

        match result {
            Err(ClientError::ConfigError(msg)) => {
                assert!(msg.contains("No certificates"), "got: {}", msg)
            }
            other => panic!("expected ConfigError, got {:?}", other),
        }
    }

    #[test]
    fn test_debug_hides_config() {
        let ctx = TrustContext::platform_default();
        let debug = format!("{:?}", ctx);
        assert!(debug.starts_with("TrustContext"));
    }
}
