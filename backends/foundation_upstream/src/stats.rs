//! Counter store scoped to one fake upstream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{UpstreamError, UpstreamResult};
use crate::synca::WaitableState;

/// Connections accepted by the listener.
pub const CX_ACCEPTED: &str = "upstream.cx_accepted";
/// Connections claimed by a test as HTTP connections.
pub const CX_CLAIMED_HTTP: &str = "upstream.cx_claimed_http";
/// Connections claimed by a test as raw connections.
pub const CX_CLAIMED_RAW: &str = "upstream.cx_claimed_raw";
/// Streams opened by a codec.
pub const STREAMS_OPENED: &str = "codec.streams_opened";
/// Codec dispatch failures, each of which closed its connection.
pub const DISPATCH_ERROR: &str = "codec.dispatch_error";

/// Named counters isolated to a single fake upstream, so parallel tests never
/// see each other's numbers.
///
/// Cloning shares the underlying store.
#[derive(Debug, Clone)]
pub struct IsolatedStats {
    counters: Arc<WaitableState<BTreeMap<String, u64>>>,
}

impl Default for IsolatedStats {
    fn default() -> Self {
        Self {
            counters: Arc::new(WaitableState::new(BTreeMap::new())),
        }
    }
}

impl IsolatedStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments the named counter by one.
    pub fn inc(&self, name: &str) {
        self.add(name, 1);
    }

    /// Adds `amount` to the named counter and wakes counter waiters.
    pub fn add(&self, name: &str, amount: u64) {
        self.counters.update(|counters| {
            *counters.entry(name.to_string()).or_insert(0) += amount;
        });
    }

    /// Returns the current value of the named counter, 0 if never written.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read(|counters| counters.get(name).copied().unwrap_or(0))
    }

    /// Waits until the named counter reaches at least `value`.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if the counter stayed below `value`.
    pub fn wait_for_counter(&self, name: &str, value: u64, timeout: Duration) -> UpstreamResult<()> {
        let reached = self.counters.wait_until(timeout, |counters| {
            counters.get(name).copied().unwrap_or(0) >= value
        });
        if reached {
            Ok(())
        } else {
            Err(UpstreamError::timeout("counter", timeout))
        }
    }

    /// Snapshot of every counter written so far.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.read(BTreeMap::clone)
    }
}
