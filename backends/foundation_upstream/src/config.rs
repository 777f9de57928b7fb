//! Fake upstream configuration.

use core::time::Duration;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
#[cfg(feature = "ssl-rustls")]
use std::sync::Arc;

/// Default timeout handed to `wait_for_*` calls by tests that have no reason to
/// pick their own.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time the constructor waits for the event loop thread to come up.
pub const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which codec a [`crate::upstream::FakeHttpConnection`] wraps its connection
/// with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpType {
    /// One request/response exchange at a time per connection.
    Http1,
    /// Multiplexed streams over one connection.
    Http2,
}

/// Address family used for loopback TCP binds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpVersion {
    #[default]
    V4,
    V6,
}

impl IpVersion {
    #[must_use]
    pub const fn loopback(self) -> IpAddr {
        match self {
            Self::V4 => IpAddr::V4(Ipv4Addr::LOCALHOST),
            Self::V6 => IpAddr::V6(Ipv6Addr::LOCALHOST),
        }
    }
}

/// Where a listener is bound, or where a client connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenEndpoint {
    Tcp(SocketAddr),
    #[cfg(unix)]
    Unix(PathBuf),
}

impl ListenEndpoint {
    /// Loopback TCP endpoint for the given address family. Port 0 picks an
    /// ephemeral port at bind time.
    #[must_use]
    pub const fn loopback(port: u16, version: IpVersion) -> Self {
        Self::Tcp(SocketAddr::new(version.loopback(), port))
    }

    #[must_use]
    pub fn ip(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }

    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.ip().map(|addr| addr.port())
    }
}

impl fmt::Display for ListenEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "{addr}"),
            #[cfg(unix)]
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Configuration for a [`crate::upstream::FakeUpstream`].
#[derive(Clone)]
pub struct UpstreamConfig {
    /// Endpoint the listener binds to
    endpoint: ListenEndpoint,
    /// Codec used for connections claimed as HTTP
    http_type: HttpType,
    /// Server TLS context, when connections should be accepted over TLS
    #[cfg(feature = "ssl-rustls")]
    tls: Option<Arc<rustls::ServerConfig>>,
    /// How long construction waits for the event loop to come up
    init_timeout: Duration,
}

impl UpstreamConfig {
    /// Creates a configuration bound to loopback TCP.
    ///
    /// Defaults:
    /// - `http_type`: `Http1`
    /// - `tls`: None (plaintext)
    /// - `init_timeout`: [`DEFAULT_INIT_TIMEOUT`]
    #[must_use]
    pub const fn tcp(port: u16, version: IpVersion) -> Self {
        Self::new(ListenEndpoint::loopback(port, version))
    }

    /// Creates a configuration bound to a Unix domain socket path.
    #[cfg(unix)]
    #[must_use]
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::new(ListenEndpoint::Unix(path.into()))
    }

    #[must_use]
    pub const fn new(endpoint: ListenEndpoint) -> Self {
        Self {
            endpoint,
            http_type: HttpType::Http1,
            #[cfg(feature = "ssl-rustls")]
            tls: None,
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    /// Sets the codec used for HTTP connections.
    #[must_use]
    pub fn http_type(mut self, http_type: HttpType) -> Self {
        self.http_type = http_type;
        self
    }

    /// Accepts connections over TLS with the given server context.
    #[cfg(feature = "ssl-rustls")]
    #[must_use]
    pub fn tls(mut self, tls: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Sets how long construction waits for the event loop thread.
    #[must_use]
    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn get_endpoint(&self) -> &ListenEndpoint {
        &self.endpoint
    }

    #[must_use]
    pub const fn get_http_type(&self) -> HttpType {
        self.http_type
    }

    #[cfg(feature = "ssl-rustls")]
    #[must_use]
    pub fn get_tls(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.tls.clone()
    }

    #[must_use]
    pub const fn get_init_timeout(&self) -> Duration {
        self.init_timeout
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self::tcp(0, IpVersion::V4)
    }
}

impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("UpstreamConfig");
        debug
            .field("endpoint", &self.endpoint)
            .field("http_type", &self.http_type)
            .field("init_timeout", &self.init_timeout);
        #[cfg(feature = "ssl-rustls")]
        debug.field("tls", &self.tls.is_some());
        debug.finish()
    }
}
