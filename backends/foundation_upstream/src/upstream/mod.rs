//! Test-facing side of the fake upstream.

mod base;
mod http;
mod queued;
mod raw;
mod server;
mod stream;

pub use base::{FakeConnection, FakeConnectionBase};
pub use http::FakeHttpConnection;
pub use queued::{AcceptQueue, QueuedConnection};
pub use raw::FakeRawConnection;
pub use server::FakeUpstream;
pub use stream::{FakeStream, FakeStreamDecoder, StreamState};

use crate::netloop::{Dispatcher, RunType};

/// Gives a test-owned client dispatcher one non-blocking turn.
pub(crate) fn pump(client: &mut Dispatcher) {
    if let Err(err) = client.run(RunType::NonBlock) {
        tracing::warn!("client dispatcher turn failed: {err}");
    }
}
