use std::sync::Arc;
use std::time::Duration;

use super::queued::QueuedConnection;
use crate::errors::{UpstreamError, UpstreamResult};
use crate::netloop::{CloseType, ConnectionCallbacks, ConnectionEvent, ConnectionHandle};
use crate::synca::WaitableState;

/// Lifecycle shared by every claimed connection: close, read-disable and
/// waiting for the peer to go away.
#[derive(Debug)]
pub struct FakeConnectionBase {
    queued: QueuedConnection,
    disconnected: Arc<WaitableState<bool>>,
}

struct DisconnectTracker(Arc<WaitableState<bool>>);

impl ConnectionCallbacks for DisconnectTracker {
    fn on_event(&mut self, event: ConnectionEvent) {
        if event.is_close() {
            self.0.update(|disconnected| *disconnected = true);
        }
    }
}

impl FakeConnectionBase {
    /// Claims a queued connection.
    ///
    /// The disconnect listener can only be attached on the loop thread, so the
    /// registration is posted there. A close that lands before the post runs is
    /// still delivered to the listener.
    #[must_use]
    pub fn new(queued: QueuedConnection) -> Self {
        queued.mark_parented();

        let disconnected = Arc::new(WaitableState::new(false));
        let tracker = DisconnectTracker(Arc::clone(&disconnected));
        queued
            .connection()
            .post(move |connection| connection.add_connection_callbacks(Box::new(tracker)));

        Self {
            queued,
            disconnected,
        }
    }

    #[must_use]
    pub fn connection(&self) -> &ConnectionHandle {
        self.queued.connection()
    }

    /// Closes the connection once already queued writes have gone out.
    pub fn close(&self) {
        self.connection().close(CloseType::FlushWrite);
    }

    pub fn read_disable(&self, disable: bool) {
        self.connection().read_disable(disable);
    }

    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if the connection is still up after
    /// `timeout`.
    pub fn wait_for_disconnect(&self, timeout: Duration) -> UpstreamResult<()> {
        if self.disconnected.wait_until(timeout, |disconnected| *disconnected) {
            Ok(())
        } else {
            Err(UpstreamError::timeout("disconnect", timeout))
        }
    }

    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.read(|disconnected| *disconnected)
    }
}

/// Behaviour common to [`super::FakeHttpConnection`] and
/// [`super::FakeRawConnection`].
pub trait FakeConnection {
    fn base(&self) -> &FakeConnectionBase;

    fn connection(&self) -> &ConnectionHandle {
        self.base().connection()
    }

    fn close(&self) {
        self.base().close();
    }

    fn read_disable(&self, disable: bool) {
        self.base().read_disable(disable);
    }

    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if the peer has not disconnected in time.
    fn wait_for_disconnect(&self, timeout: Duration) -> UpstreamResult<()> {
        self.base().wait_for_disconnect(timeout)
    }

    fn is_disconnected(&self) -> bool {
        self.base().is_disconnected()
    }
}
