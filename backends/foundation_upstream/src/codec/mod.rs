//! Sans-io HTTP server codecs.
//!
//! A codec never touches a socket. Inbound bytes go in through
//! [`ServerCodec::dispatch`] and come back out as [`CodecEvent`]s, while encode
//! calls queue wire bytes the caller collects with
//! [`ServerCodec::take_pending_send`] and writes to its connection.

mod flow;
mod headers;
mod http1;
pub mod http2;

pub use headers::HeaderMap;
pub use http1::Http1ServerCodec;
pub use http2::Http2ServerCodec;

use crate::config::HttpType;
use crate::errors::CodecResult;

/// Identifier of one request/response exchange on a connection.
pub type StreamId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamResetReason {
    /// This side reset the stream.
    LocalReset,
    /// This side refused the stream before processing it.
    LocalRefusedStreamReset,
    /// The peer reset the stream.
    RemoteReset,
    /// The peer refused the stream.
    RemoteRefusedStreamReset,
    /// The connection went away with the stream still open.
    ConnectionTermination,
}

/// Everything a codec reports about inbound traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    NewStream(StreamId),
    Headers {
        stream_id: StreamId,
        headers: HeaderMap,
        end_stream: bool,
    },
    Data {
        stream_id: StreamId,
        data: Vec<u8>,
        end_stream: bool,
    },
    /// Trailers always end the stream.
    Trailers {
        stream_id: StreamId,
        trailers: HeaderMap,
    },
    Reset {
        stream_id: StreamId,
        reason: StreamResetReason,
    },
    /// Both directions of the stream have ended. Nothing more is reported
    /// for it.
    StreamComplete(StreamId),
    GoAway,
}

/// Receives the decoded request side of one stream.
pub trait StreamDecoder: Send {
    fn decode_headers(&mut self, headers: HeaderMap, end_stream: bool);
    fn decode_data(&mut self, data: Vec<u8>, end_stream: bool);
    fn decode_trailers(&mut self, trailers: HeaderMap);
    fn on_reset_stream(&mut self, reason: StreamResetReason);
}

/// Sends the response side of one stream.
pub trait StreamEncoder: Send {
    fn encode_headers(&mut self, headers: HeaderMap, end_stream: bool);
    fn encode_data(&mut self, data: Vec<u8>, end_stream: bool);
    fn encode_trailers(&mut self, trailers: HeaderMap);
    fn reset_stream(&mut self, reason: StreamResetReason);
}

/// Server side of one HTTP connection.
pub trait ServerCodec: Send {
    fn protocol(&self) -> HttpType;

    /// Feeds inbound bytes. Partial input is buffered until more arrives.
    ///
    /// # Errors
    ///
    /// Any protocol violation. The connection cannot be used afterwards.
    fn dispatch(&mut self, data: &[u8]) -> CodecResult<()>;

    /// Next event produced by dispatching or encoding, in order.
    fn poll_event(&mut self) -> Option<CodecEvent>;

    fn encode_headers(&mut self, stream_id: StreamId, headers: &HeaderMap, end_stream: bool);

    fn encode_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool);

    fn encode_trailers(&mut self, stream_id: StreamId, trailers: &HeaderMap);

    /// Resets the stream. Reported back as a local [`CodecEvent::Reset`].
    fn encode_reset_stream(&mut self, stream_id: StreamId, reason: StreamResetReason);

    /// Wire bytes queued since the last call.
    fn take_pending_send(&mut self) -> Vec<u8>;

    /// Whether the connection must be closed once pending bytes are written.
    fn wants_close(&self) -> bool;

    /// Reports every stream still open as reset by connection termination.
    fn on_connection_close(&mut self);
}

/// Creates the server codec for `http_type`.
#[must_use]
pub fn create_codec(http_type: HttpType) -> Box<dyn ServerCodec> {
    match http_type {
        HttpType::Http1 => Box::new(Http1ServerCodec::new()),
        HttpType::Http2 => Box::new(Http2ServerCodec::new()),
    }
}

/// Open/closed bookkeeping for one stream, shared by both codecs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct StreamProgress {
    pub remote_done: bool,
    pub local_done: bool,
}

impl StreamProgress {
    pub(crate) fn is_complete(self) -> bool {
        self.remote_done && self.local_done
    }
}
