use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use super::base::{FakeConnection, FakeConnectionBase};
use super::pump;
use super::stream::{FakeStream, FakeStreamDecoder};
use crate::codec::{
    create_codec, CodecEvent, HeaderMap, ServerCodec, StreamDecoder, StreamEncoder, StreamId,
    StreamResetReason,
};
use crate::config::HttpType;
use crate::errors::{fatal, UpstreamError, UpstreamResult};
use crate::netloop::{
    CloseType, Connection, ConnectionEvent, ConnectionHandle, Dispatcher, FilterStatus, ReadFilter,
};
use crate::stats::{IsolatedStats, DISPATCH_ERROR, STREAMS_OPENED};
use crate::synca::WaitableState;

type StreamQueue = WaitableState<VecDeque<FakeStream>>;

/// Codec state for one connection. Only ever locked on the event loop thread.
struct CodecSession {
    codec: Box<dyn ServerCodec>,
    decoders: HashMap<StreamId, FakeStreamDecoder>,
    new_streams: Arc<StreamQueue>,
    connection: ConnectionHandle,
    stats: IsolatedStats,
    this: Weak<Mutex<CodecSession>>,
}

/// Output of a session turn, applied to the connection after the session lock
/// is released so connection events can re-enter the session.
struct Flush {
    bytes: Vec<u8>,
    close: bool,
}

impl Flush {
    fn apply(self, connection: &mut Connection) {
        if !self.bytes.is_empty() {
            connection.write(&self.bytes);
        }
        if self.close {
            connection.close(CloseType::FlushWrite);
        }
    }
}

fn lock(session: &Mutex<CodecSession>) -> MutexGuard<'_, CodecSession> {
    match session.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CodecSession {
    fn new(
        codec: Box<dyn ServerCodec>,
        connection: ConnectionHandle,
        new_streams: Arc<StreamQueue>,
        stats: IsolatedStats,
    ) -> Arc<Mutex<Self>> {
        Arc::new_cyclic(|this| {
            Mutex::new(Self {
                codec,
                decoders: HashMap::new(),
                new_streams,
                connection,
                stats,
                this: this.clone(),
            })
        })
    }

    fn process_events(&mut self) {
        while let Some(event) = self.codec.poll_event() {
            match event {
                CodecEvent::NewStream(stream_id) => self.open_stream(stream_id),
                CodecEvent::Headers {
                    stream_id,
                    headers,
                    end_stream,
                } => {
                    if let Some(decoder) = self.decoders.get_mut(&stream_id) {
                        decoder.decode_headers(headers, end_stream);
                    }
                }
                CodecEvent::Data {
                    stream_id,
                    data,
                    end_stream,
                } => {
                    if let Some(decoder) = self.decoders.get_mut(&stream_id) {
                        decoder.decode_data(data, end_stream);
                    }
                }
                CodecEvent::Trailers {
                    stream_id,
                    trailers,
                } => {
                    if let Some(decoder) = self.decoders.get_mut(&stream_id) {
                        decoder.decode_trailers(trailers);
                    }
                }
                CodecEvent::Reset { stream_id, reason } => {
                    if let Some(mut decoder) = self.decoders.remove(&stream_id) {
                        decoder.on_reset_stream(reason);
                    }
                }
                CodecEvent::StreamComplete(stream_id) => {
                    self.decoders.remove(&stream_id);
                }
                CodecEvent::GoAway => {
                    fatal("GOAWAY received, fake upstreams do not handle go-away");
                }
            }
        }
    }

    fn open_stream(&mut self, stream_id: StreamId) {
        let encoder = PostedStreamEncoder {
            stream_id,
            session: self.this.clone(),
            connection: self.connection.clone(),
        };
        let (stream, decoder) = FakeStream::new(stream_id, Box::new(encoder));

        tracing::debug!(
            "connection {}: new stream {stream_id}",
            self.connection.id()
        );
        self.stats.inc(STREAMS_OPENED);
        self.decoders.insert(stream_id, decoder);
        self.new_streams
            .update(|streams| streams.push_back(stream));
    }

    fn flush(&mut self) -> Flush {
        let bytes = self.codec.take_pending_send();
        self.process_events();
        Flush {
            bytes,
            close: self.codec.wants_close(),
        }
    }
}

/// Response side of a stream. Each call is posted to the connection's event
/// loop, so calls from one test thread reach the wire in order.
struct PostedStreamEncoder {
    stream_id: StreamId,
    session: Weak<Mutex<CodecSession>>,
    connection: ConnectionHandle,
}

impl PostedStreamEncoder {
    fn post(&self, encode: impl FnOnce(&mut dyn ServerCodec, StreamId) + Send + 'static) {
        let stream_id = self.stream_id;
        let session = self.session.clone();

        self.connection.post(move |connection| {
            let Some(session) = session.upgrade() else {
                tracing::debug!("stream {stream_id}: codec is gone, dropping encode");
                return;
            };

            let flush = {
                let mut session = lock(&session);
                encode(session.codec.as_mut(), stream_id);
                session.flush()
            };
            flush.apply(connection);
        });
    }
}

impl StreamEncoder for PostedStreamEncoder {
    fn encode_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        self.post(move |codec, stream_id| codec.encode_headers(stream_id, &headers, end_stream));
    }

    fn encode_data(&mut self, data: Vec<u8>, end_stream: bool) {
        self.post(move |codec, stream_id| codec.encode_data(stream_id, &data, end_stream));
    }

    fn encode_trailers(&mut self, trailers: HeaderMap) {
        self.post(move |codec, stream_id| codec.encode_trailers(stream_id, &trailers));
    }

    fn reset_stream(&mut self, reason: StreamResetReason) {
        self.post(move |codec, stream_id| codec.encode_reset_stream(stream_id, reason));
    }
}

/// Feeds every inbound byte to the codec. Dispatch errors close the
/// connection.
struct CodecReadFilter {
    session: Arc<Mutex<CodecSession>>,
}

impl ReadFilter for CodecReadFilter {
    fn on_data(&mut self, connection: &mut Connection, data: &mut Vec<u8>) -> FilterStatus {
        let bytes = mem::take(data);

        let (flush, failed) = {
            let mut session = lock(&self.session);
            match session.codec.dispatch(&bytes) {
                Ok(()) => (session.flush(), false),
                Err(err) => {
                    session.stats.inc(DISPATCH_ERROR);
                    tracing::warn!(
                        "connection {}: codec dispatch failed: {err}",
                        connection.id()
                    );
                    (session.flush(), true)
                }
            }
        };

        if failed {
            connection.close(CloseType::NoFlush);
        } else {
            flush.apply(connection);
        }
        FilterStatus::StopIteration
    }

    fn on_event(&mut self, event: ConnectionEvent) {
        if event.is_close() {
            let mut session = lock(&self.session);
            session.codec.on_connection_close();
            session.process_events();
        }
    }
}

/// A claimed connection speaking HTTP through a server codec.
#[derive(Debug)]
pub struct FakeHttpConnection {
    base: FakeConnectionBase,
    http_type: HttpType,
    new_streams: Arc<StreamQueue>,
}

impl FakeHttpConnection {
    /// Wraps a claimed connection and installs the codec on its event loop.
    #[must_use]
    pub fn new(base: FakeConnectionBase, stats: IsolatedStats, http_type: HttpType) -> Self {
        let new_streams = Arc::new(WaitableState::new(VecDeque::new()));
        let handle = base.connection().clone();
        let streams = Arc::clone(&new_streams);

        base.connection().post(move |connection| {
            let session = CodecSession::new(create_codec(http_type), handle, streams, stats);

            // the server preface goes out before anything else
            let preface = lock(&session).flush();
            preface.apply(connection);

            connection.add_read_filter(Box::new(CodecReadFilter { session }));
        });

        Self {
            base,
            http_type,
            new_streams,
        }
    }

    #[must_use]
    pub fn http_type(&self) -> HttpType {
        self.http_type
    }

    /// Takes the oldest stream the peer opened, waiting for one if needed and
    /// turning `client` meanwhile.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if no stream opened in time.
    pub fn wait_for_new_stream(
        &self,
        client: &mut Dispatcher,
        timeout: Duration,
    ) -> UpstreamResult<FakeStream> {
        self.new_streams
            .wait_pumping_then(
                timeout,
                || pump(client),
                |streams| !streams.is_empty(),
                VecDeque::pop_front,
            )
            .flatten()
            .ok_or_else(|| UpstreamError::timeout("new stream", timeout))
    }
}

impl FakeConnection for FakeHttpConnection {
    fn base(&self) -> &FakeConnectionBase {
        &self.base
    }
}
