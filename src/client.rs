//! The request pipeline: pick a dialer, write the request, parse the
//! response, close the connection.

use std::net::{Ipv4Addr, Ipv6Addr, Shutdown};
use std::time::Duration;

use crate::error::Result;
use crate::outbound::{
    Dialer, Direct, DirectOptions, HttpProxy, ProxyConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_READ_TIMEOUT,
};
use crate::request::{ProxySetting, Request};
use crate::response::{Response, ResponseParser};
use crate::tls::{TlsOptions, TrustContext};

/// Options for creating an [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Idle timeout for each read on the connection
    pub read_timeout: Duration,
    /// Where to load trust anchors from when `trust` is not set
    pub tls: TlsOptions,
    /// Prebuilt trust context, used as is
    pub trust: Option<TrustContext>,
    /// Forward proxy for every request that does not override it
    pub proxy: Option<ProxyConfig>,
    /// Bind IPv4 address for outgoing connections
    pub bind_ip4: Option<Ipv4Addr>,
    /// Bind IPv6 address for outgoing connections
    pub bind_ip6: Option<Ipv6Addr>,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            tls: TlsOptions::default(),
            trust: None,
            proxy: None,
            bind_ip4: None,
            bind_ip6: None,
            nodelay: true,
        }
    }
}

impl ClientOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_trust(mut self, trust: TrustContext) -> Self {
        self.trust = Some(trust);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }
}

/// Blocking HTTP/1.1 client.
///
/// Holds configuration only. Each call opens its own connection and closes
/// it before returning, so a client can be cloned or shared across threads
/// freely.
#[derive(Debug, Clone)]
pub struct HttpClient {
    direct: Direct,
    proxy: Option<ProxyConfig>,
}

impl HttpClient {
    /// Create a client, loading trust anchors unless a context is given.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let trust = match options.trust {
            Some(trust) => trust,
            None => TrustContext::from_options(&options.tls)?,
        };
        let direct = Direct::with_options(
            trust,
            DirectOptions {
                connect_timeout: Some(options.connect_timeout),
                read_timeout: Some(options.read_timeout),
                bind_ip4: options.bind_ip4,
                bind_ip6: options.bind_ip6,
                nodelay: options.nodelay,
            },
        )?;
        Ok(Self {
            direct,
            proxy: options.proxy,
        })
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.proxy.as_ref()
    }

    pub fn trust(&self) -> &TrustContext {
        self.direct.trust()
    }

    /// The dialer `request` would be sent through.
    ///
    /// A proxy set on the request wins over the client's. The proxy is
    /// skipped when its bypass predicate accepts the target host.
    pub fn dialer_for(&self, request: &Request) -> Box<dyn Dialer> {
        let mut direct = self.direct.clone();
        if let Some(timeout) = request.connect_timeout() {
            direct = direct.with_connect_timeout(timeout);
        }
        if let Some(timeout) = request.read_timeout() {
            direct = direct.with_read_timeout(timeout);
        }

        let proxy = match request.proxy_setting() {
            ProxySetting::Inherit => self.proxy.as_ref(),
            ProxySetting::Use(proxy) => Some(proxy),
            ProxySetting::Disabled => None,
        };
        match proxy {
            Some(proxy) if proxy.should_bypass(&request.target().host) => {
                log::debug!("bypassing proxy for {}", request.target().host);
                Box::new(direct)
            }
            Some(proxy) => Box::new(HttpProxy::new(proxy.clone(), direct)),
            None => Box::new(direct),
        }
    }

    /// Send `request` and read the whole response.
    pub fn execute(&self, request: &Request) -> Result<Response> {
        let mut conn = self.dialer_for(request).dial(request.target())?;
        log::debug!(
            "{} {} to {}",
            request.method(),
            request.request_target(),
            request.target()
        );

        let result = request
            .write_to(&mut conn)
            .and_then(|_| ResponseParser::for_method(request.method()).parse(&mut conn));
        if let Err(e) = conn.shutdown(Shutdown::Both) {
            log::debug!("shutdown of connection to {} failed: {}", request.target(), e);
        }
        result
    }

    /// Send `request` without waiting for a response.
    pub fn dispatch(&self, request: &Request) -> Result<()> {
        let mut conn = self.dialer_for(request).dial(request.target())?;
        log::debug!(
            "dispatching {} {} to {}",
            request.method(),
            request.request_target(),
            request.target()
        );

        let result = request.write_to(&mut conn);
        if let Err(e) = conn.shutdown(Shutdown::Both) {
            log::debug!("shutdown of connection to {} failed: {}", request.target(), e);
        }
        result
    }
}
