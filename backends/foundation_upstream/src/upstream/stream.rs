use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::pump;
use crate::codec::{HeaderMap, StreamDecoder, StreamEncoder, StreamId, StreamResetReason};
use crate::errors::{fatal, UpstreamError, UpstreamResult};
use crate::netloop::Dispatcher;
use crate::synca::WaitableState;

/// Byte used to fill bodies requested by size.
const FILLER: u8 = b'a';

/// Request side of a stream as decoded so far.
#[derive(Debug, Default)]
pub struct StreamState {
    headers: Option<HeaderMap>,
    trailers: Option<HeaderMap>,
    body: Vec<u8>,
    end_stream: bool,
    reset_reason: Option<StreamResetReason>,
}

/// Feeds decoded request events into a [`FakeStream`]'s shared state. Lives
/// on the event loop thread.
#[derive(Debug)]
pub struct FakeStreamDecoder {
    state: Arc<WaitableState<StreamState>>,
}

impl StreamDecoder for FakeStreamDecoder {
    // a conforming codec delivers headers at most once per stream
    fn decode_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        self.state.update(|state| {
            state.headers = Some(headers);
            state.end_stream |= end_stream;
        });
    }

    fn decode_data(&mut self, data: Vec<u8>, end_stream: bool) {
        self.state.update(|state| {
            state.body.extend_from_slice(&data);
            state.end_stream |= end_stream;
        });
    }

    fn decode_trailers(&mut self, trailers: HeaderMap) {
        self.state.update(|state| {
            state.trailers = Some(trailers);
            state.end_stream = true;
        });
    }

    fn on_reset_stream(&mut self, reason: StreamResetReason) {
        tracing::debug!("stream reset: {reason:?}");
        self.state.update(|state| state.reset_reason = Some(reason));
    }
}

/// One request/response exchange on a [`super::FakeHttpConnection`].
///
/// The event loop fills in the request as it is decoded while the test thread
/// waits on it, then scripts the response through the `encode_*` methods.
/// Encoding after the response ended or after a reset is a harness error.
pub struct FakeStream {
    stream_id: StreamId,
    state: Arc<WaitableState<StreamState>>,
    encoder: Box<dyn StreamEncoder>,
    local_complete: bool,
    local_reset: bool,
}

impl fmt::Debug for FakeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeStream")
            .field("stream_id", &self.stream_id)
            .field("local_complete", &self.local_complete)
            .field("local_reset", &self.local_reset)
            .finish_non_exhaustive()
    }
}

impl FakeStream {
    /// Creates the test-facing stream and the decoder the loop feeds it with.
    #[must_use]
    pub fn new(stream_id: StreamId, encoder: Box<dyn StreamEncoder>) -> (Self, FakeStreamDecoder) {
        let state = Arc::new(WaitableState::new(StreamState::default()));
        let decoder = FakeStreamDecoder {
            state: Arc::clone(&state),
        };

        (
            Self {
                stream_id,
                state,
                encoder,
                local_complete: false,
                local_reset: false,
            },
            decoder,
        )
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Sends the response head. `headers` must carry a numeric `:status`.
    pub fn encode_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        self.check_encodable("headers");
        if headers.status().is_none() {
            fatal(&format!(
                "stream {}: response headers need a numeric :status",
                self.stream_id
            ));
        }
        self.local_complete = end_stream;
        self.encoder.encode_headers(headers, end_stream);
    }

    /// Sends `size` bytes of filler body.
    pub fn encode_data(&mut self, size: usize, end_stream: bool) {
        self.encode_data_bytes(vec![FILLER; size], end_stream);
    }

    pub fn encode_data_bytes(&mut self, data: impl Into<Vec<u8>>, end_stream: bool) {
        self.check_encodable("data");
        self.local_complete = end_stream;
        self.encoder.encode_data(data.into(), end_stream);
    }

    /// Sends trailers, which end the response.
    pub fn encode_trailers(&mut self, trailers: HeaderMap) {
        self.check_encodable("trailers");
        self.local_complete = true;
        self.encoder.encode_trailers(trailers);
    }

    pub fn encode_reset_stream(&mut self) {
        self.check_encodable("a reset");
        self.local_reset = true;
        self.encoder.reset_stream(StreamResetReason::LocalReset);
    }

    fn check_encodable(&self, what: &str) {
        if self.local_reset {
            fatal(&format!(
                "stream {}: encoding {what} after the stream was reset",
                self.stream_id
            ));
        }
        if self.local_complete {
            fatal(&format!(
                "stream {}: encoding {what} after end of stream",
                self.stream_id
            ));
        }
    }

    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if no request headers arrived in time.
    pub fn wait_for_headers_complete(&self, timeout: Duration) -> UpstreamResult<()> {
        if self
            .state
            .wait_until(timeout, |state| state.headers.is_some())
        {
            Ok(())
        } else {
            Err(UpstreamError::timeout("request headers", timeout))
        }
    }

    /// Waits until at least `body_length` body bytes have arrived, turning
    /// `client` meanwhile.
    ///
    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if fewer bytes arrived in time.
    pub fn wait_for_data(
        &self,
        client: &mut Dispatcher,
        body_length: usize,
        timeout: Duration,
    ) -> UpstreamResult<()> {
        if self.state.wait_pumping(
            timeout,
            || pump(client),
            |state| state.body.len() >= body_length,
        ) {
            Ok(())
        } else {
            Err(UpstreamError::timeout("request body", timeout))
        }
    }

    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if the request did not end in time.
    pub fn wait_for_end_stream(&self, client: &mut Dispatcher, timeout: Duration) -> UpstreamResult<()> {
        if self
            .state
            .wait_pumping(timeout, || pump(client), |state| state.end_stream)
        {
            Ok(())
        } else {
            Err(UpstreamError::timeout("end of stream", timeout))
        }
    }

    /// # Errors
    ///
    /// [`UpstreamError::Timeout`] if the stream was not reset in time.
    pub fn wait_for_reset(&self, timeout: Duration) -> UpstreamResult<()> {
        if self
            .state
            .wait_until(timeout, |state| state.reset_reason.is_some())
        {
            Ok(())
        } else {
            Err(UpstreamError::timeout("stream reset", timeout))
        }
    }

    #[must_use]
    pub fn headers(&self) -> Option<HeaderMap> {
        self.state.read(|state| state.headers.clone())
    }

    #[must_use]
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.state.read(|state| state.trailers.clone())
    }

    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        self.state.read(|state| state.body.clone())
    }

    #[must_use]
    pub fn body_length(&self) -> usize {
        self.state.read(|state| state.body.len())
    }

    /// Whether the whole request has been received.
    #[must_use]
    pub fn complete(&self) -> bool {
        self.state.read(|state| state.end_stream)
    }

    #[must_use]
    pub fn reset_reason(&self) -> Option<StreamResetReason> {
        self.state.read(|state| state.reset_reason)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Encoded {
        Headers(HeaderMap, bool),
        Data(Vec<u8>, bool),
        Trailers(HeaderMap),
        Reset(StreamResetReason),
    }

    struct Recording(Arc<Mutex<Vec<Encoded>>>);

    impl StreamEncoder for Recording {
        fn encode_headers(&mut self, headers: HeaderMap, end_stream: bool) {
            self.0.lock().unwrap().push(Encoded::Headers(headers, end_stream));
        }

        fn encode_data(&mut self, data: Vec<u8>, end_stream: bool) {
            self.0.lock().unwrap().push(Encoded::Data(data, end_stream));
        }

        fn encode_trailers(&mut self, trailers: HeaderMap) {
            self.0.lock().unwrap().push(Encoded::Trailers(trailers));
        }

        fn reset_stream(&mut self, reason: StreamResetReason) {
            self.0.lock().unwrap().push(Encoded::Reset(reason));
        }
    }

    fn recorded_stream() -> (FakeStream, FakeStreamDecoder, Arc<Mutex<Vec<Encoded>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (stream, decoder) = FakeStream::new(1, Box::new(Recording(Arc::clone(&log))));
        (stream, decoder, log)
    }

    #[test]
    fn data_wait_is_at_least_and_monotonic() {
        let (stream, mut decoder, _) = recorded_stream();
        let mut client = Dispatcher::new().expect("should create dispatcher");

        let feeder = thread::spawn(move || {
            decoder.decode_headers(HeaderMap::from_pairs([(":method", "POST")]), false);
            decoder.decode_data(b"01234".to_vec(), false);
            decoder.decode_data(b"56789".to_vec(), true);
        });

        stream
            .wait_for_data(&mut client, 7, Duration::from_secs(5))
            .expect("seven bytes arrive");
        feeder.join().expect("should safely join");

        stream
            .wait_for_data(&mut client, 3, Duration::ZERO)
            .expect("smaller wait already satisfied");
        stream
            .wait_for_end_stream(&mut client, Duration::ZERO)
            .expect("request ended");
        assert_eq!(stream.body(), b"0123456789");
        assert!(stream.complete());
    }

    #[test]
    fn waits_time_out_without_input() {
        let (stream, _decoder, _) = recorded_stream();
        let mut client = Dispatcher::new().expect("should create dispatcher");

        let err = stream
            .wait_for_data(&mut client, 1, Duration::from_millis(20))
            .expect_err("nothing arrives");
        assert!(err.is_timeout());
        assert!(stream
            .wait_for_headers_complete(Duration::from_millis(5))
            .is_err());
    }

    #[test]
    fn trailers_end_the_request() {
        let (stream, mut decoder, _) = recorded_stream();
        decoder.decode_headers(HeaderMap::from_pairs([(":method", "POST")]), false);
        decoder.decode_trailers(HeaderMap::from_pairs([("grpc-status", "0")]));

        assert!(stream.complete());
        assert_eq!(
            stream.trailers().and_then(|t| t.get("grpc-status").map(str::to_owned)),
            Some("0".to_owned())
        );
    }

    #[test]
    fn reset_is_observable() {
        let (stream, mut decoder, _) = recorded_stream();
        decoder.on_reset_stream(StreamResetReason::RemoteReset);

        stream
            .wait_for_reset(Duration::ZERO)
            .expect("reset already seen");
        assert_eq!(stream.reset_reason(), Some(StreamResetReason::RemoteReset));
    }

    #[test]
    fn encode_calls_reach_the_encoder_in_order() {
        let (mut stream, _decoder, log) = recorded_stream();
        stream.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
        stream.encode_data(3, false);
        stream.encode_trailers(HeaderMap::from_pairs([("x-done", "1")]));

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                Encoded::Headers(HeaderMap::from_pairs([(":status", "200")]), false),
                Encoded::Data(b"aaa".to_vec(), false),
                Encoded::Trailers(HeaderMap::from_pairs([("x-done", "1")])),
            ]
        );
    }

    #[test]
    #[should_panic(expected = "after end of stream")]
    fn encoding_after_end_of_stream_is_fatal() {
        let (mut stream, _decoder, _) = recorded_stream();
        stream.encode_headers(HeaderMap::from_pairs([(":status", "204")]), true);
        stream.encode_data(1, true);
    }

    #[test]
    #[should_panic(expected = "need a numeric :status")]
    fn response_headers_without_status_are_fatal() {
        let (mut stream, _decoder, log) = recorded_stream();
        let headers = HeaderMap::from_pairs([("content-type", "text/plain")]);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            stream.encode_headers(headers, true);
        }));
        assert!(log.lock().unwrap().is_empty());
        if let Err(panic) = result {
            std::panic::resume_unwind(panic);
        }
    }

    #[test]
    #[should_panic(expected = "after the stream was reset")]
    fn encoding_after_reset_is_fatal() {
        let (mut stream, _decoder, log) = recorded_stream();
        stream.encode_reset_stream();
        assert_eq!(
            *log.lock().unwrap(),
            vec![Encoded::Reset(StreamResetReason::LocalReset)]
        );
        stream.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
    }
}
