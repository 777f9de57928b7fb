use std::fmt;
use std::io;
use std::mem;
use std::sync::Arc;

use mio::{Interest, Registry, Token};

use super::dispatcher::{Dispatcher, DispatcherHandle};
use super::transport::{Socket, Transport};

/// Slab key of a connection inside its [`Dispatcher`].
pub type ConnectionId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    /// The peer closed, or the socket failed.
    RemoteClose,
    /// This side closed the connection.
    LocalClose,
    /// A client connection finished connecting.
    Connected,
}

impl ConnectionEvent {
    #[must_use]
    pub const fn is_close(self) -> bool {
        matches!(self, Self::RemoteClose | Self::LocalClose)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Write out what is already buffered, then close.
    FlushWrite,
    /// Close immediately, discarding buffered output.
    NoFlush,
}

/// Whether a read filter lets the bytes continue down the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    /// Local close requested, waiting for buffered output to drain.
    Closing,
    Closed(ConnectionEvent),
}

/// Observer of connection lifecycle events.
pub trait ConnectionCallbacks: Send {
    fn on_event(&mut self, event: ConnectionEvent);
}

/// Stage of the inbound byte pipeline.
///
/// A filter consumes what it understands by draining `data`. Whatever is left
/// stays buffered on the connection and is offered again on the next read.
pub trait ReadFilter: Send {
    fn on_data(&mut self, connection: &mut Connection, data: &mut Vec<u8>) -> FilterStatus;

    fn on_event(&mut self, _event: ConnectionEvent) {}
}

/// A socket owned by the event loop thread.
///
/// Every method must be called on the loop thread. Other threads reach a
/// connection through its [`ConnectionHandle`].
///
/// Once closed, a connection stays in the dispatcher as a tombstone: callbacks
/// or filters registered afterwards are still told about the close, so a
/// registration that races a disconnect never misses it.
pub struct Connection {
    id: ConnectionId,
    transport: Option<Transport>,
    registry: Arc<Registry>,
    dispatcher: DispatcherHandle,
    state: ConnectionState,
    callbacks: Vec<Box<dyn ConnectionCallbacks>>,
    read_filters: Vec<Box<dyn ReadFilter>>,
    dispatching: bool,
    redispatch: bool,
    deferred_filter_event: Option<ConnectionEvent>,
    read_buffer: Vec<u8>,
    write_buffer: Vec<u8>,
    read_disable_count: u32,
    read_pending: bool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("read_disable_count", &self.read_disable_count)
            .field("buffered_in", &self.read_buffer.len())
            .field("buffered_out", &self.write_buffer.len())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        transport: Transport,
        registry: Arc<Registry>,
        dispatcher: DispatcherHandle,
        state: ConnectionState,
    ) -> Self {
        Self {
            id,
            transport: Some(transport),
            registry,
            dispatcher,
            state,
            callbacks: Vec::new(),
            read_filters: Vec::new(),
            dispatching: false,
            redispatch: false,
            deferred_filter_event: None,
            read_buffer: Vec::new(),
            write_buffer: Vec::new(),
            read_disable_count: 0,
            read_pending: false,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Thread-safe handle addressing this connection.
    #[must_use]
    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle::new(self.id, self.dispatcher.clone())
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Open | ConnectionState::Connecting
        )
    }

    #[must_use]
    pub fn is_read_disabled(&self) -> bool {
        self.read_disable_count > 0
    }

    /// Bytes received that no filter has consumed yet.
    #[must_use]
    pub fn buffered_input(&self) -> &[u8] {
        &self.read_buffer
    }

    /// Registers a lifecycle observer. On a closed connection the close event
    /// is delivered immediately and the callbacks are dropped.
    pub fn add_connection_callbacks(&mut self, mut callbacks: Box<dyn ConnectionCallbacks>) {
        if let ConnectionState::Closed(event) = self.state {
            callbacks.on_event(event);
            return;
        }
        self.callbacks.push(callbacks);
    }

    /// Appends a read filter. Bytes already buffered are offered to the chain
    /// straight away, and on a closed connection the filter then sees the
    /// close event.
    pub fn add_read_filter(&mut self, filter: Box<dyn ReadFilter>) {
        self.read_filters.push(filter);

        if !self.read_buffer.is_empty() {
            self.dispatch_read_filters();
        }

        if let ConnectionState::Closed(event) = self.state {
            for filter in &mut self.read_filters {
                filter.on_event(event);
            }
            self.read_filters.clear();
        }
    }

    /// Queues bytes for the peer and writes as much as the socket accepts.
    pub fn write(&mut self, data: &[u8]) {
        if !self.is_open() {
            tracing::debug!(
                "dropping {} byte write on connection {} in state {:?}",
                data.len(),
                self.id,
                self.state
            );
            return;
        }

        self.write_buffer.extend_from_slice(data);
        self.flush_write();
    }

    pub fn close(&mut self, close_type: CloseType) {
        match self.state {
            ConnectionState::Closed(_) => {}
            ConnectionState::Closing if close_type == CloseType::FlushWrite => {}
            _ => {
                let pending = self
                    .transport
                    .as_ref()
                    .is_some_and(|transport| transport.has_pending_output(&self.write_buffer));

                if close_type == CloseType::FlushWrite && pending {
                    tracing::debug!("connection {} closing after flush", self.id);
                    self.state = ConnectionState::Closing;
                    self.flush_write();
                } else {
                    self.close_socket(ConnectionEvent::LocalClose);
                }
            }
        }
    }

    /// Stops (`true`) or resumes (`false`) reading from the socket.
    ///
    /// Calls nest: reading resumes once every disable has been matched by an
    /// enable. Bytes that arrived while disabled are read on resume.
    pub fn read_disable(&mut self, disable: bool) {
        if matches!(self.state, ConnectionState::Closed(_)) {
            return;
        }

        if disable {
            self.read_disable_count += 1;
            if self.read_disable_count == 1 {
                self.reregister(Interest::WRITABLE);
            }
            return;
        }

        if self.read_disable_count == 0 {
            tracing::warn!("connection {}: read enabled while not disabled", self.id);
            return;
        }

        self.read_disable_count -= 1;
        if self.read_disable_count == 0 {
            self.reregister(Interest::READABLE | Interest::WRITABLE);
            if mem::take(&mut self.read_pending) {
                self.on_readable();
            }
        }
    }

    pub(crate) fn on_readable(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Closed(_) | ConnectionState::Connecting
        ) {
            return;
        }

        if self.read_disable_count > 0 {
            self.read_pending = true;
            return;
        }

        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        match transport.read_into(&mut self.read_buffer) {
            Ok(outcome) => {
                if outcome.bytes > 0 {
                    tracing::trace!("connection {} read {} bytes", self.id, outcome.bytes);
                    if self.dispatching {
                        self.redispatch = true;
                    } else {
                        self.dispatch_read_filters();
                    }
                }

                if outcome.end_of_stream {
                    tracing::debug!("connection {} closed by peer", self.id);
                    self.close_socket(ConnectionEvent::RemoteClose);
                    return;
                }
            }
            Err(err) => {
                tracing::debug!("connection {} read failed: {err}", self.id);
                self.close_socket(ConnectionEvent::RemoteClose);
                return;
            }
        }

        // TLS may owe the peer handshake records
        self.flush_write();
    }

    pub(crate) fn on_writable(&mut self) {
        if self.state == ConnectionState::Connecting {
            let Some(transport) = self.transport.as_ref() else {
                return;
            };

            match connect_status(transport.socket()) {
                Ok(true) => {
                    tracing::debug!("connection {} connected", self.id);
                    self.state = ConnectionState::Open;
                    self.raise_event(ConnectionEvent::Connected);
                }
                Ok(false) => return,
                Err(err) => {
                    tracing::debug!("connection {} failed to connect: {err}", self.id);
                    self.close_socket(ConnectionEvent::RemoteClose);
                    return;
                }
            }
        }

        self.flush_write();
    }

    fn flush_write(&mut self) {
        if self.state == ConnectionState::Connecting {
            return;
        }

        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if let Err(err) = transport.write_from(&mut self.write_buffer) {
            tracing::debug!("connection {} write failed: {err}", self.id);
            self.close_socket(ConnectionEvent::RemoteClose);
            return;
        }

        if self.state == ConnectionState::Closing
            && !transport.has_pending_output(&self.write_buffer)
        {
            self.close_socket(ConnectionEvent::LocalClose);
        }
    }

    fn reregister(&mut self, interest: Interest) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };

        if let Err(err) =
            self.registry
                .reregister(transport.socket_mut(), Token(self.id), interest)
        {
            tracing::warn!("connection {}: reregister failed: {err}", self.id);
        }
    }

    fn dispatch_read_filters(&mut self) {
        if self.dispatching {
            self.redispatch = true;
            return;
        }

        loop {
            let mut filters = mem::take(&mut self.read_filters);
            let mut data = mem::take(&mut self.read_buffer);

            self.dispatching = true;
            self.redispatch = false;
            for filter in &mut filters {
                if filter.on_data(self, &mut data) == FilterStatus::StopIteration {
                    break;
                }
            }
            self.dispatching = false;

            // bytes read while the chain ran queue behind the leftovers
            data.append(&mut self.read_buffer);
            self.read_buffer = data;
            filters.append(&mut self.read_filters);
            self.read_filters = filters;

            if let Some(event) = self.deferred_filter_event.take() {
                self.notify_filters(event);
                return;
            }

            if !self.redispatch || self.read_buffer.is_empty() || self.read_filters.is_empty() {
                return;
            }
        }
    }

    fn notify_filters(&mut self, event: ConnectionEvent) {
        for filter in &mut self.read_filters {
            filter.on_event(event);
        }
        if event.is_close() {
            self.read_filters.clear();
        }
    }

    fn close_socket(&mut self, event: ConnectionEvent) {
        if matches!(self.state, ConnectionState::Closed(_)) {
            return;
        }

        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = self.registry.deregister(transport.socket_mut()) {
                tracing::debug!("connection {}: deregister failed: {err}", self.id);
            }
            transport.shutdown();
        }

        tracing::debug!("connection {} closed: {event:?}", self.id);
        self.state = ConnectionState::Closed(event);
        self.write_buffer.clear();
        self.raise_event(event);
    }

    fn raise_event(&mut self, event: ConnectionEvent) {
        let mut callbacks = mem::take(&mut self.callbacks);
        for callback in &mut callbacks {
            callback.on_event(event);
        }
        callbacks.append(&mut self.callbacks);
        if !event.is_close() {
            self.callbacks = callbacks;
        }

        if self.dispatching {
            self.deferred_filter_event = Some(event);
        } else {
            self.notify_filters(event);
        }
    }
}

fn connect_status(socket: &Socket) -> io::Result<bool> {
    if let Some(err) = socket.take_error()? {
        return Err(err);
    }
    socket.is_connected()
}

/// Cross-thread address of a [`Connection`].
///
/// Every operation is posted to the owning event loop and runs there in post
/// order. Operations on a connection that no longer exists are dropped.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    dispatcher: DispatcherHandle,
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl ConnectionHandle {
    pub(crate) fn new(id: ConnectionId, dispatcher: DispatcherHandle) -> Self {
        Self { id, dispatcher }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    #[must_use]
    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Runs `task` against the connection on its event loop.
    pub fn post(&self, task: impl FnOnce(&mut Connection) + Send + 'static) {
        let id = self.id;
        self.dispatcher.post(move |dispatcher: &mut Dispatcher| {
            match dispatcher.connection_mut(id) {
                Some(connection) => task(connection),
                None => tracing::debug!("connection {id} is gone, dropping posted task"),
            }
        });
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) {
        let data = data.into();
        self.post(move |connection| connection.write(&data));
    }

    pub fn close(&self, close_type: CloseType) {
        self.post(move |connection| connection.close(close_type));
    }

    pub fn read_disable(&self, disable: bool) {
        self.post(move |connection| connection.read_disable(disable));
    }
}
