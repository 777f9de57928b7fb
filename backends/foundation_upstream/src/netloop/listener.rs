use std::fmt;
use std::io;
#[cfg(feature = "ssl-rustls")]
use std::sync::Arc;

use mio::event::Source;
use mio::net::TcpListener;
#[cfg(unix)]
use mio::net::UnixListener;
use mio::{Interest, Registry, Token};

use super::connection::Connection;
use super::transport::{Socket, Transport};
use crate::config::ListenEndpoint;

/// Installs the per-connection filter chain on every accepted connection.
///
/// Returning `false` rejects the connection, which is then closed.
pub trait FilterChainFactory: Send {
    fn create_filter_chain(&mut self, connection: &mut Connection) -> bool;
}

enum ListenSocket {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

/// A bound, non-blocking listening socket.
pub struct Listener {
    socket: ListenSocket,
    endpoint: ListenEndpoint,
    #[cfg(feature = "ssl-rustls")]
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Binds to `endpoint`. For TCP the returned listener reports the real
    /// port chosen when `endpoint` asked for port 0.
    ///
    /// # Errors
    ///
    /// Any error from the bind syscalls.
    pub fn bind(endpoint: &ListenEndpoint) -> io::Result<Self> {
        let (socket, endpoint) = match endpoint {
            ListenEndpoint::Tcp(addr) => {
                let listener = std::net::TcpListener::bind(addr)?;
                listener.set_nonblocking(true)?;
                let local = listener.local_addr()?;
                (
                    ListenSocket::Tcp(TcpListener::from_std(listener)),
                    ListenEndpoint::Tcp(local),
                )
            }
            #[cfg(unix)]
            ListenEndpoint::Unix(path) => (
                ListenSocket::Unix(UnixListener::bind(path)?),
                ListenEndpoint::Unix(path.clone()),
            ),
        };

        tracing::debug!("listener bound on {endpoint}");
        Ok(Self {
            socket,
            endpoint,
            #[cfg(feature = "ssl-rustls")]
            tls: None,
        })
    }

    /// Wraps every accepted connection in a TLS server session.
    #[cfg(feature = "ssl-rustls")]
    #[must_use]
    pub fn with_tls(mut self, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        self.tls = tls;
        self
    }

    #[must_use]
    pub fn local_endpoint(&self) -> &ListenEndpoint {
        &self.endpoint
    }

    /// Accepts one pending connection, `None` once the backlog is drained.
    pub(crate) fn accept(&self) -> io::Result<Option<Socket>> {
        let accepted = match &self.socket {
            ListenSocket::Tcp(listener) => listener.accept().map(|(stream, _)| Socket::Tcp(stream)),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => {
                listener.accept().map(|(stream, _)| Socket::Unix(stream))
            }
        };

        match accepted {
            Ok(socket) => Ok(Some(socket)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub(crate) fn transport_for(&self, socket: Socket) -> io::Result<Transport> {
        #[cfg(feature = "ssl-rustls")]
        if let Some(tls) = &self.tls {
            let session = rustls::ServerConnection::new(Arc::clone(tls)).map_err(io::Error::other)?;
            return Ok(Transport::tls(socket, session));
        }

        Ok(Transport::Plain(socket))
    }
}

impl Source for Listener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match &mut self.socket {
            ListenSocket::Tcp(listener) => listener.register(registry, token, interests),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => listener.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match &mut self.socket {
            ListenSocket::Tcp(listener) => listener.reregister(registry, token, interests),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => listener.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match &mut self.socket {
            ListenSocket::Tcp(listener) => listener.deregister(registry),
            #[cfg(unix)]
            ListenSocket::Unix(listener) => listener.deregister(registry),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let ListenEndpoint::Unix(path) = &self.endpoint {
            if let Err(err) = std::fs::remove_file(path) {
                tracing::debug!("could not unlink {}: {err}", path.display());
            }
        }
    }
}
