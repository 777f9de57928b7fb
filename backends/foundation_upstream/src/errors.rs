use derive_more::From;

use std::{io, time::Duration};

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// Failures a test thread can observe from the fake upstream.
///
/// Timeouts are ordinary results the calling test reacts to. Harness invariant
/// violations never show up here, they go through [`fatal`].
#[derive(Debug)]
pub enum UpstreamError {
    /// A `wait_for_*` call gave up before its predicate held.
    Timeout {
        waiting_for: &'static str,
        timeout: Duration,
    },

    /// The event loop thread did not report readiness in time.
    InitializationTimeout,

    /// The event loop thread could not be started.
    LoopThreadSpawn,

    Bind(io::Error),

    IO(io::Error),

    #[cfg(feature = "ssl-rustls")]
    Tls(rustls::Error),
}

impl UpstreamError {
    #[must_use]
    pub fn timeout(waiting_for: &'static str, timeout: Duration) -> Self {
        Self::Timeout {
            waiting_for,
            timeout,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<io::Error> for UpstreamError {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(feature = "ssl-rustls")]
impl From<rustls::Error> for UpstreamError {
    fn from(value: rustls::Error) -> Self {
        Self::Tls(value)
    }
}

impl std::error::Error for UpstreamError {}

impl core::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

pub type CodecResult<T> = std::result::Result<T, CodecError>;

/// Errors raised while a codec dispatches inbound bytes.
///
/// Every variant is fatal to the connection it was raised on.
#[derive(From, Debug, PartialEq, Eq)]
pub enum CodecError {
    /// The peer violated the protocol in a way the codec cannot recover from.
    #[from]
    Protocol(String),

    /// An HTTP/2 frame exceeded the advertised maximum frame size.
    FrameSize { length: usize, max: usize },

    /// The peer did not open with the HTTP/2 connection preface.
    BadPreface,

    /// An HPACK header block could not be decoded.
    HeaderBlock(String),

    /// A WINDOW_UPDATE or SETTINGS change pushed a flow control window past
    /// 2^31 - 1.
    FlowControl,

    /// A request head exceeded the header limits.
    HeadersTooLarge,

    /// Malformed chunked transfer encoding.
    InvalidChunkSize,

    Http1(httparse::Error),
}

impl CodecError {
    #[must_use]
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol(reason.into())
    }
}

impl From<httparse::Error> for CodecError {
    fn from(value: httparse::Error) -> Self {
        match value {
            httparse::Error::TooManyHeaders => Self::HeadersTooLarge,
            other => Self::Http1(other),
        }
    }
}

impl From<httparse::InvalidChunkSize> for CodecError {
    fn from(_: httparse::InvalidChunkSize) -> Self {
        Self::InvalidChunkSize
    }
}

impl std::error::Error for CodecError {}

impl core::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Aborts on a harness invariant violation.
///
/// These indicate the test or the harness itself is broken, never that the
/// system under test misbehaved, so they are not reported through a `Result`.
/// On the event loop thread the panic unwinds the loop, and
/// [`crate::upstream::FakeUpstream`] re-raises it on the owning test thread when
/// it is dropped.
#[track_caller]
pub fn fatal(message: &str) -> ! {
    tracing::error!("fake upstream invariant violated: {message}");
    panic!("fake upstream invariant violated: {message}");
}
