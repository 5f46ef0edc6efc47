use std::fmt;

use serde::{Deserialize, Serialize};
use url::{Host, Url};

use crate::error::NetError;

/// Caller-assigned request identity, unique within one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One GET request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub url: String,
    /// First body byte wanted; non-zero values are sent as a `Range` header.
    #[serde(default)]
    pub offset: u64,
}

impl Request {
    pub fn new(id: u64, url: impl Into<String>) -> Self {
        Self {
            id: RequestId(id),
            url: url.into(),
            offset: 0,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Enqueued,
    Streaming,
    Finished,
}

/// Where a URL points: the socket address parts and the request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub url: Url,
    /// Host name or literal address, without IPv6 brackets.
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Target {
    pub fn parse(url: &str) -> Result<Self, NetError> {
        let url = Url::parse(url).map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))?;
        let tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(NetError::UnsupportedScheme(other.to_string())),
        };
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(NetError::InvalidUrl(format!("{url}: missing host"))),
        };
        let port = url
            .port_or_known_default()
            .ok_or_else(|| NetError::InvalidUrl(format!("{url}: missing port")))?;
        Ok(Self {
            url,
            host,
            port,
            tls,
        })
    }

    /// Value of the `Host` header: the port is only spelled out when it is
    /// not the scheme default.
    pub fn host_header(&self) -> String {
        let host = self.url.host_str().unwrap_or(&self.host);
        match self.url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    /// Path plus query, as written on the request line.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{}", self.url.path(), query),
            None => self.url.path().to_string(),
        }
    }

    /// Resolves a `Location` value against this URL.
    pub fn join(&self, location: &str) -> Result<String, NetError> {
        self.url
            .join(location)
            .map(String::from)
            .map_err(|e| NetError::InvalidUrl(format!("{location}: {e}")))
    }
}
