use std::sync::Arc;
use std::time::Duration;

use super::base::{FakeConnection, FakeConnectionBase};
use crate::errors::{UpstreamError, UpstreamResult};
use crate::netloop::{Connection, FilterStatus, ReadFilter};
use crate::synca::WaitableState;

struct RawReadFilter(Arc<WaitableState<Vec<u8>>>);

impl ReadFilter for RawReadFilter {
    fn on_data(&mut self, _connection: &mut Connection, data: &mut Vec<u8>) -> FilterStatus {
        self.0.update(|received| received.append(data));
        FilterStatus::StopIteration
    }
}

/// A claimed connection whose bytes are collected as-is.
#[derive(Debug)]
pub struct FakeRawConnection {
    base: FakeConnectionBase,
    data: Arc<WaitableState<Vec<u8>>>,
}

impl FakeRawConnection {
    #[must_use]
    pub fn new(base: FakeConnectionBase) -> Self {
        let data = Arc::new(WaitableState::new(Vec::new()));
        let filter = RawReadFilter(Arc::clone(&data));
        base.connection()
            .post(move |connection| connection.add_read_filter(Box::new(filter)));

        Self { base, data }
    }

    /// Waits until at least `num_bytes` bytes have been received.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if fewer bytes arrived in time.
    pub fn wait_for_data(&self, num_bytes: usize, timeout: Duration) -> UpstreamResult<()> {
        if self
            .data
            .wait_until(timeout, |received| received.len() >= num_bytes)
        {
            Ok(())
        } else {
            Err(UpstreamError::timeout("raw data", timeout))
        }
    }

    /// Queues `data` for the peer on the connection's event loop.
    pub fn write(&self, data: impl Into<Vec<u8>>) {
        self.base.connection().write(data);
    }

    /// Everything received so far.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read(Vec::clone)
    }
}

impl FakeConnection for FakeRawConnection {
    fn base(&self) -> &FakeConnectionBase {
        &self.base
    }
}
