// Byte transports a connection reads from and writes to: plain sockets, or a
// rustls server session layered on one.

use std::io::{self, Read, Write};
use std::net::Shutdown;

use mio::event::Source;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Interest, Registry, Token};

/// Size of the stack buffer each read syscall fills.
const READ_CHUNK: usize = 16 * 1024;

/// A connected, non-blocking stream socket.
#[derive(Debug)]
pub enum Socket {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Socket {
    pub(crate) fn shutdown(&self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Self::Unix(stream) => stream.shutdown(Shutdown::Both),
        }
    }

    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            Self::Tcp(stream) => stream.take_error(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.take_error(),
        }
    }

    /// Whether a non-blocking connect has completed.
    pub(crate) fn is_connected(&self) -> io::Result<bool> {
        let peer = match self {
            Self::Tcp(stream) => stream.peer_addr().map(|_| ()),
            #[cfg(unix)]
            Self::Unix(stream) => stream.peer_addr().map(|_| ()),
        };

        match peer {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) => Err(err),
        }
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Self::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Self::Unix(stream) => stream.flush(),
        }
    }
}

impl Source for Socket {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.register(registry, token, interests),
            #[cfg(unix)]
            Self::Unix(stream) => stream.register(registry, token, interests),
        }
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.reregister(registry, token, interests),
            #[cfg(unix)]
            Self::Unix(stream) => stream.reregister(registry, token, interests),
        }
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        match self {
            Self::Tcp(stream) => stream.deregister(registry),
            #[cfg(unix)]
            Self::Unix(stream) => stream.deregister(registry),
        }
    }
}

/// What a single readiness-driven read produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadOutcome {
    /// Plaintext bytes appended to the caller's buffer.
    pub bytes: usize,
    /// The peer will send nothing more.
    pub end_of_stream: bool,
}

/// The byte pipe underneath a [`super::Connection`].
pub enum Transport {
    Plain(Socket),
    #[cfg(feature = "ssl-rustls")]
    Tls(Box<TlsTransport>),
}

pub struct TlsTransport {
    socket: Socket,
    session: rustls::ServerConnection,
}

impl Transport {
    #[cfg(feature = "ssl-rustls")]
    pub(crate) fn tls(socket: Socket, session: rustls::ServerConnection) -> Self {
        Self::Tls(Box::new(TlsTransport { socket, session }))
    }

    pub(crate) fn socket(&self) -> &Socket {
        match self {
            Self::Plain(socket) => socket,
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(tls) => &tls.socket,
        }
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        match self {
            Self::Plain(socket) => socket,
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(tls) => &mut tls.socket,
        }
    }

    /// Reads everything currently available, appending plaintext to `buffer`.
    ///
    /// Readiness is edge triggered, so this keeps reading until the socket
    /// reports `WouldBlock` or the peer closes.
    pub(crate) fn read_into(&mut self, buffer: &mut Vec<u8>) -> io::Result<ReadOutcome> {
        match self {
            Self::Plain(socket) => read_plain(socket, buffer),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(tls) => tls.read_into(buffer),
        }
    }

    /// Writes as much of `buffer` as the socket accepts, draining what went
    /// out. Whatever remains is retried on the next writable event.
    pub(crate) fn write_from(&mut self, buffer: &mut Vec<u8>) -> io::Result<()> {
        match self {
            Self::Plain(socket) => write_plain(socket, buffer),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(tls) => tls.write_from(buffer),
        }
    }

    /// Whether bytes are still waiting to reach the socket.
    pub(crate) fn has_pending_output(&self, buffer: &[u8]) -> bool {
        match self {
            Self::Plain(_) => !buffer.is_empty(),
            #[cfg(feature = "ssl-rustls")]
            Self::Tls(tls) => !buffer.is_empty() || tls.session.wants_write(),
        }
    }

    pub(crate) fn shutdown(&mut self) {
        #[cfg(feature = "ssl-rustls")]
        if let Self::Tls(tls) = self {
            tls.session.send_close_notify();
            let _ = tls.flush_tls();
        }

        if let Err(err) = self.socket().shutdown() {
            tracing::debug!("socket shutdown failed: {err}");
        }
    }
}

fn read_plain(socket: &mut Socket, buffer: &mut Vec<u8>) -> io::Result<ReadOutcome> {
    let mut chunk = [0_u8; READ_CHUNK];
    let mut outcome = ReadOutcome::default();

    loop {
        match socket.read(&mut chunk) {
            Ok(0) => {
                outcome.end_of_stream = true;
                return Ok(outcome);
            }
            Ok(read) => {
                buffer.extend_from_slice(&chunk[..read]);
                outcome.bytes += read;
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(outcome),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn write_plain(socket: &mut Socket, buffer: &mut Vec<u8>) -> io::Result<()> {
    while !buffer.is_empty() {
        match socket.write(buffer) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(written) => {
                buffer.drain(..written);
            }
            // a client socket whose connect is still in flight
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
                ) =>
            {
                return Ok(());
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(feature = "ssl-rustls")]
impl TlsTransport {
    fn read_into(&mut self, buffer: &mut Vec<u8>) -> io::Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();

        loop {
            let mut drained = false;
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => outcome.end_of_stream = true,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => drained = true,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }

            let state = match self.session.process_new_packets() {
                Ok(state) => state,
                Err(err) => {
                    // best effort: let the peer see the alert
                    let _ = self.flush_tls();
                    return Err(io::Error::new(io::ErrorKind::InvalidData, err));
                }
            };

            let available = state.plaintext_bytes_to_read();
            if available > 0 {
                let start = buffer.len();
                buffer.resize(start + available, 0);
                self.session.reader().read_exact(&mut buffer[start..])?;
                outcome.bytes += available;
            }

            if state.peer_has_closed() {
                outcome.end_of_stream = true;
            }

            if drained || outcome.end_of_stream {
                break;
            }
        }

        // handshake records produced while processing
        self.flush_tls()?;
        Ok(outcome)
    }

    fn write_from(&mut self, buffer: &mut Vec<u8>) -> io::Result<()> {
        if !buffer.is_empty() {
            self.session.writer().write_all(buffer)?;
            buffer.clear();
        }
        self.flush_tls()
    }

    fn flush_tls(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected
                    ) =>
                {
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }
}
