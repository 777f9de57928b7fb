use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::errors::fatal;
use crate::netloop::{Connection, ConnectionCallbacks, ConnectionEvent, ConnectionHandle};
use crate::synca::WaitableState;

/// FIFO of accepted connections no test has claimed yet.
pub type AcceptQueue = WaitableState<VecDeque<QueuedConnection>>;

/// An accepted connection waiting in the upstream's queue.
///
/// Until a test claims it the connection must stay up: a close seen while
/// unclaimed means a connection was dropped that no test ever looked at, and
/// that is always a harness failure.
#[derive(Debug)]
pub struct QueuedConnection {
    connection: ConnectionHandle,
    parented: Arc<AtomicBool>,
}

impl QueuedConnection {
    /// Wraps a just-accepted connection. Runs on the event loop thread.
    ///
    /// The close check reads the parented flag under the queue's lock, the
    /// same lock claiming happens under, so a claim and a disconnect can never
    /// interleave.
    pub(crate) fn new(connection: &mut Connection, queue: &Arc<AcceptQueue>) -> Self {
        let parented = Arc::new(AtomicBool::new(false));
        connection.add_connection_callbacks(Box::new(UnclaimedGuard {
            id: connection.id(),
            parented: Arc::clone(&parented),
            queue: Arc::clone(queue),
        }));

        Self {
            connection: connection.handle(),
            parented,
        }
    }

    /// Hands disconnect handling over to whoever claimed the connection.
    pub fn mark_parented(&self) {
        self.parented.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_parented(&self) -> bool {
        self.parented.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }
}

struct UnclaimedGuard {
    id: usize,
    parented: Arc<AtomicBool>,
    queue: Arc<AcceptQueue>,
}

impl ConnectionCallbacks for UnclaimedGuard {
    fn on_event(&mut self, event: ConnectionEvent) {
        if !event.is_close() {
            return;
        }

        let claimed = self
            .queue
            .read(|_| self.parented.load(Ordering::Acquire));
        if !claimed {
            fatal(&format!(
                "connection {} closed ({event:?}) before any test claimed it",
                self.id
            ));
        }
    }
}
