use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use concurrent_queue::ConcurrentQueue;
use mio::net::TcpStream;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;

use super::connection::{CloseType, Connection, ConnectionHandle, ConnectionId, ConnectionState};
use super::listener::{FilterChainFactory, Listener};
use super::transport::{Socket, Transport};
use crate::config::ListenEndpoint;

/// Work posted to a dispatcher from any thread.
pub type Task = Box<dyn FnOnce(&mut Dispatcher) + Send>;

const WAKER_TOKEN: Token = Token(usize::MAX);
const LISTENER_TOKEN_OFFSET: usize = 1 << 30;
const EVENTS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunType {
    /// Turn until [`Dispatcher::exit`] is called from a task.
    Block,
    /// Handle whatever is ready right now, then return.
    NonBlock,
}

struct ListenerEntry {
    listener: Listener,
    factory: Box<dyn FilterChainFactory>,
}

/// Single-threaded event loop over mio.
///
/// The dispatcher owns every listener and connection registered with it, and
/// only the thread running it may touch them. Other threads interact through a
/// [`DispatcherHandle`], whose posted tasks run on the loop thread in the order
/// they were posted.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    registry: Arc<Registry>,
    handle: DispatcherHandle,
    connections: Slab<Connection>,
    listeners: Slab<ListenerEntry>,
    exit_requested: bool,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("connections", &self.connections.len())
            .field("listeners", &self.listeners.len())
            .field("exit_requested", &self.exit_requested)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// # Errors
    ///
    /// Fails when the OS poller or its waker cannot be created.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let registry = Arc::new(poll.registry().try_clone()?);

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registry,
            handle: DispatcherHandle {
                tasks: Arc::new(ConcurrentQueue::unbounded()),
                waker: Arc::new(waker),
            },
            connections: Slab::new(),
            listeners: Slab::new(),
            exit_requested: false,
        })
    }

    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Runs the loop.
    ///
    /// # Errors
    ///
    /// Returns the poller's error if polling fails.
    pub fn run(&mut self, run_type: RunType) -> io::Result<()> {
        match run_type {
            RunType::NonBlock => {
                self.run_posted_tasks();
                self.turn(Some(Duration::ZERO))
            }
            RunType::Block => {
                loop {
                    self.run_posted_tasks();
                    if self.exit_requested {
                        break;
                    }
                    self.turn(None)?;
                }
                self.exit_requested = false;
                Ok(())
            }
        }
    }

    /// Makes a blocking [`Self::run`] return after the current turn.
    pub fn exit(&mut self) {
        self.exit_requested = true;
    }

    /// Registers a bound listener. Every accepted connection is handed to
    /// `factory` before any of its bytes are read.
    ///
    /// # Errors
    ///
    /// Fails when the listener cannot be registered with the poller.
    pub fn add_listener(
        &mut self,
        mut listener: Listener,
        factory: Box<dyn FilterChainFactory>,
    ) -> io::Result<usize> {
        let entry = self.listeners.vacant_entry();
        let key = entry.key();
        self.registry.register(
            &mut listener,
            Token(key + LISTENER_TOKEN_OFFSET),
            Interest::READABLE,
        )?;

        tracing::debug!("listening on {}", listener.local_endpoint());
        entry.insert(ListenerEntry { listener, factory });
        Ok(key)
    }

    /// Opens a client connection. It raises `Connected` once the connect
    /// completes, and anything written before then is sent afterwards.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be created or registered.
    pub fn connect(&mut self, endpoint: &ListenEndpoint) -> io::Result<ConnectionHandle> {
        let socket = match endpoint {
            ListenEndpoint::Tcp(addr) => Socket::Tcp(TcpStream::connect(*addr)?),
            #[cfg(unix)]
            ListenEndpoint::Unix(path) => Socket::Unix(UnixStream::connect(path)?),
        };

        let id = self.insert_connection(Transport::Plain(socket), ConnectionState::Connecting)?;
        tracing::debug!("connection {id} connecting to {endpoint}");
        Ok(ConnectionHandle::new(id, self.handle.clone()))
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Connections that are still open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.connections
            .iter()
            .filter(|(_, connection)| connection.is_open())
            .count()
    }

    /// Stops accepting and closes every connection without flushing.
    pub fn shutdown(&mut self) {
        for mut entry in self.listeners.drain() {
            if let Err(err) = self.registry.deregister(&mut entry.listener) {
                tracing::debug!("listener deregister failed: {err}");
            }
        }

        let ids: Vec<ConnectionId> = self.connections.iter().map(|(id, _)| id).collect();
        for id in ids {
            if let Some(connection) = self.connections.get_mut(id) {
                connection.close(CloseType::NoFlush);
            }
        }
    }

    fn insert_connection(
        &mut self,
        mut transport: Transport,
        state: ConnectionState,
    ) -> io::Result<ConnectionId> {
        let entry = self.connections.vacant_entry();
        let id = entry.key();
        self.registry.register(
            transport.socket_mut(),
            Token(id),
            Interest::READABLE | Interest::WRITABLE,
        )?;

        entry.insert(Connection::new(
            id,
            transport,
            Arc::clone(&self.registry),
            self.handle.clone(),
            state,
        ));
        Ok(id)
    }

    fn turn(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(err) => return Err(err),
        }

        // collected first, handlers need &mut self
        let ready: Vec<_> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER_TOKEN)
            .map(|event| {
                (
                    event.token().0,
                    event.is_readable() || event.is_read_closed() || event.is_error(),
                    event.is_writable(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token >= LISTENER_TOKEN_OFFSET {
                self.accept_pending(token - LISTENER_TOKEN_OFFSET);
                continue;
            }

            let Some(connection) = self.connections.get_mut(token) else {
                continue;
            };
            if writable {
                connection.on_writable();
            }
            if readable {
                connection.on_readable();
            }
        }

        self.run_posted_tasks();
        Ok(())
    }

    fn accept_pending(&mut self, key: usize) {
        loop {
            let Some(entry) = self.listeners.get(key) else {
                return;
            };

            let socket = match entry.listener.accept() {
                Ok(Some(socket)) => socket,
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!("accept on {} failed: {err}", entry.listener.local_endpoint());
                    return;
                }
            };

            let transport = match entry.listener.transport_for(socket) {
                Ok(transport) => transport,
                Err(err) => {
                    tracing::warn!("could not set up accepted connection: {err}");
                    continue;
                }
            };

            let id = match self.insert_connection(transport, ConnectionState::Open) {
                Ok(id) => id,
                Err(err) => {
                    tracing::warn!("could not register accepted connection: {err}");
                    continue;
                }
            };
            tracing::debug!("accepted connection {id}");

            let (Some(entry), Some(connection)) =
                (self.listeners.get_mut(key), self.connections.get_mut(id))
            else {
                return;
            };

            if !entry.factory.create_filter_chain(connection) {
                tracing::debug!("filter chain rejected connection {id}");
                connection.close(CloseType::NoFlush);
                continue;
            }

            // bytes may already be waiting and edge triggers will not repeat
            connection.on_readable();
        }
    }

    fn run_posted_tasks(&mut self) {
        // only what is queued now, tasks posted by these wait for the next turn
        let pending = self.handle.tasks.len();
        for _ in 0..pending {
            match self.handle.tasks.pop() {
                Ok(task) => task(self),
                Err(_) => break,
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.handle.tasks.close();
    }
}

/// Thread-safe way to run work on a [`Dispatcher`]'s thread.
#[derive(Clone)]
pub struct DispatcherHandle {
    tasks: Arc<ConcurrentQueue<Task>>,
    waker: Arc<Waker>,
}

impl fmt::Debug for DispatcherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("pending", &self.tasks.len())
            .field("closed", &self.tasks.is_closed())
            .finish()
    }
}

impl DispatcherHandle {
    /// Queues `task` for the loop thread and wakes it. Tasks posted after the
    /// dispatcher is gone are dropped.
    pub fn post(&self, task: impl FnOnce(&mut Dispatcher) + Send + 'static) {
        if self.tasks.push(Box::new(task)).is_err() {
            tracing::debug!("dispatcher is gone, dropping posted task");
            return;
        }

        if let Err(err) = self.waker.wake() {
            tracing::warn!("failed to wake dispatcher: {err}");
        }
    }

    /// Asks a blocking [`Dispatcher::run`] to return.
    pub fn exit(&self) {
        self.post(Dispatcher::exit);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tasks.is_closed()
    }
}
