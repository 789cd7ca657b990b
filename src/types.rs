use std::fmt;
use std::net::Ipv6Addr;
use std::str::FromStr;

use crate::error::ClientError;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    Options,
    #[default]
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
    Patch,
}

impl Method {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Options => "OPTIONS",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Patch => "PATCH",
        }
    }

    /// Whether a request entity is written for this method.
    /// GET and HEAD never carry a body on the wire.
    pub fn sends_body(&self) -> bool {
        !matches!(self, Method::Get | Method::Head)
    }
}

impl FromStr for Method {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPTIONS" => Ok(Method::Options),
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "TRACE" => Ok(Method::Trace),
            "PATCH" => Ok(Method::Patch),
            other => Err(ClientError::ConfigError(format!(
                "Unsupported method: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a connection is opened to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Hostname or IP address (IPv6 without brackets)
    pub host: String,
    /// Port number
    pub port: u16,
    /// Upgrade the connection to TLS after connecting
    pub use_tls: bool,
}

impl ConnectionTarget {
    /// Create a new ConnectionTarget
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls,
        }
    }

    /// Port implied by the scheme when none is given.
    pub fn default_port(&self) -> u16 {
        if self.use_tls {
            443
        } else {
            80
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    /// Value for the `Host` header. The port is left out when it is the
    /// scheme's default.
    pub fn host_header(&self) -> String {
        if self.port == self.default_port() {
            self.bracketed_host()
        } else {
            self.authority()
        }
    }

    fn bracketed_host(&self) -> String {
        if self.host.parse::<Ipv6Addr>().is_ok() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.use_tls { "https" } else { "http" };
        write!(f, "{}://{}", scheme, self.authority())
    }
}

/// Ordered header multimap with case-insensitive logical keys.
///
/// Setting a key that already exists (ignoring case) replaces the entry in
/// place and adopts the casing of the latest call, so a name never appears
/// twice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Create an empty HeaderMap
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, overwriting any entry with the same logical name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.entries[idx] = (name, value),
            None => self.entries.push((name, value)),
        }
    }

    /// Add a value to a header, joining with `", "` when it is already set.
    pub fn append(&mut self, name: impl Into<String>, value: &str) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => {
                let existing = &mut self.entries[idx].1;
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => self.entries.push((name, value.to_string())),
        }
    }

    /// Look up a header value. Absent headers return `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name).map(|idx| self.entries[idx].1.as_str())
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut String> {
        self.position(name).map(move |idx| &mut self.entries[idx].1)
    }

    /// Check whether a header is set
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove a header, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.position(name).map(|idx| self.entries.remove(idx).1)
    }

    /// Iterate over `(name, value)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}
