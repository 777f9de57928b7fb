//! HTTP/2 fake upstream driven by a prior-knowledge frame client.

mod common;

use std::thread;
use std::time::{Duration, Instant};

use foundation_upstream::codec::http2::{
    encode_frame, ERROR_NO_ERROR, FLAG_END_HEADERS, FLAG_END_STREAM, FRAME_DATA, FRAME_HEADERS,
    FRAME_RST_STREAM,
};
use foundation_upstream::codec::{HeaderMap, StreamResetReason};
use foundation_upstream::config::DEFAULT_WAIT_TIMEOUT;
use foundation_upstream::netloop::Dispatcher;
use foundation_upstream::stats::{DISPATCH_ERROR, STREAMS_OPENED};
use foundation_upstream::{FakeConnection, FakeUpstream, HttpType, IpVersion};
use ntest::timeout;
use tracing_test::traced_test;

use common::H2Client;

const ERROR_CANCEL: u32 = 0x8;

fn upstream() -> FakeUpstream {
    FakeUpstream::bind_tcp(0, HttpType::Http2, IpVersion::V4).expect("bind upstream")
}

/// WHY: The HTTP/2 path must serve the same scripted exchange as HTTP/1.
/// WHAT: Request headers and body surface on the stream; the response comes
/// back as one HEADERS frame and one DATA frame ending the stream.
#[test]
#[traced_test]
#[timeout(30000)]
fn serves_scripted_response_over_http2() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());

    h2.send_request(1, "/upload", false);
    h2.send_data(1, b"0123456789", true);

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    assert_eq!(connection.http_type(), HttpType::Http2);

    let mut stream = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("new stream");
    stream
        .wait_for_data(&mut client, 10, DEFAULT_WAIT_TIMEOUT)
        .expect("request body");
    stream
        .wait_for_end_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("end of request");
    assert_eq!(stream.stream_id(), 1);
    assert_eq!(
        stream.headers().and_then(|headers| headers.get(":path").map(String::from)),
        Some("/upload".to_string())
    );

    stream.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
    stream.encode_data(5, true);

    let headers = h2.read_stream_frame();
    assert_eq!(headers.header.stream_id, 1);
    assert!(!headers.has_flag(FLAG_END_STREAM));
    assert!(h2
        .decode_headers(&headers)
        .contains(&(":status".to_string(), "200".to_string())));

    let data = h2.read_stream_frame();
    assert_eq!(data.header.frame_type, FRAME_DATA);
    assert_eq!(data.header.stream_id, 1);
    assert!(data.has_flag(FLAG_END_STREAM));
    assert_eq!(data.payload, b"aaaaa");
}

/// WHY: Multiplexed streams must be handed out in the order the peer opened
/// them, and be answerable in any order.
/// WHAT: Streams 1 and 3 come out FIFO; answering 3 first puts its frames on
/// the wire first.
#[test]
#[traced_test]
#[timeout(30000)]
fn multiplexed_streams_are_fifo_and_independent() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());

    h2.send_request(1, "/one", true);
    h2.send_request(3, "/three", true);

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    let mut first = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("first stream");
    let mut second = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("second stream");
    assert_eq!(first.stream_id(), 1);
    assert_eq!(second.stream_id(), 3);

    second
        .wait_for_end_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("second request ended");
    second.encode_headers(HeaderMap::from_pairs([(":status", "204")]), true);

    let frame = h2.read_stream_frame();
    assert_eq!(frame.header.frame_type, FRAME_HEADERS);
    assert_eq!(frame.header.stream_id, 3);
    assert!(frame.has_flag(FLAG_END_STREAM));
    h2.decode_headers(&frame);

    first
        .wait_for_end_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("first request ended");
    first.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
    first.encode_data_bytes(b"done".to_vec(), false);
    first.encode_trailers(HeaderMap::from_pairs([("grpc-status", "0")]));

    let headers = h2.read_stream_frame();
    assert_eq!(headers.header.stream_id, 1);
    h2.decode_headers(&headers);

    let data = h2.read_stream_frame();
    assert_eq!(data.payload, b"done");
    assert!(!data.has_flag(FLAG_END_STREAM));

    let trailers = h2.read_stream_frame();
    assert_eq!(trailers.header.frame_type, FRAME_HEADERS);
    assert!(trailers.has_flag(FLAG_END_STREAM));
    assert!(h2
        .decode_headers(&trailers)
        .contains(&("grpc-status".to_string(), "0".to_string())));

    assert_eq!(upstream.stats().counter(STREAMS_OPENED), 2);
}

/// WHY: Tests use a local reset to check how clients handle abandoned streams.
/// WHAT: Resetting before any headers sends `RST_STREAM` instead of a response.
#[test]
#[traced_test]
#[timeout(30000)]
fn local_reset_reaches_client_as_rst_stream() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());
    h2.send_request(1, "/", true);

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    let mut stream = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("new stream");

    stream.encode_reset_stream();

    let frame = h2.read_stream_frame();
    assert_eq!(frame.header.frame_type, FRAME_RST_STREAM);
    assert_eq!(frame.header.stream_id, 1);
    assert_eq!(frame.payload, ERROR_NO_ERROR.to_be_bytes());
}

/// WHY: Client-side cancellation has to be observable from the test.
/// WHAT: A peer `RST_STREAM` resets the fake stream as a remote reset while
/// the connection stays up for further streams.
#[test]
#[traced_test]
#[timeout(30000)]
fn remote_reset_is_observed_by_stream() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());
    h2.send_request(1, "/", false);

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    let stream = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("new stream");

    h2.send_reset(1, ERROR_CANCEL);

    stream
        .wait_for_reset(DEFAULT_WAIT_TIMEOUT)
        .expect("stream reset");
    assert_eq!(stream.reset_reason(), Some(StreamResetReason::RemoteReset));

    h2.send_request(3, "/after-reset", true);
    let next = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("stream after reset");
    assert_eq!(next.stream_id(), 3);
}

/// WHY: A response bigger than the peer's window must not overrun it, or
/// real HTTP/2 clients tear the connection down.
/// WHAT: A 100,000 byte body stops after the default 65,535 byte window and
/// finishes once the client sends WINDOW_UPDATEs.
#[test]
#[traced_test]
#[timeout(30000)]
fn large_body_waits_for_window_updates() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());
    h2.send_request(1, "/download", true);

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    let mut stream = connection
        .wait_for_new_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("new stream");
    stream
        .wait_for_end_stream(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("end of request");

    stream.encode_headers(HeaderMap::from_pairs([(":status", "200")]), false);
    stream.encode_data(100_000, true);

    let headers = h2.read_stream_frame();
    assert_eq!(headers.header.frame_type, FRAME_HEADERS);
    h2.decode_headers(&headers);

    let mut received = 0;
    while received < 65_535 {
        let data = h2.read_stream_frame();
        assert_eq!(data.header.frame_type, FRAME_DATA);
        assert!(!data.has_flag(FLAG_END_STREAM));
        received += data.payload.len();
    }
    assert_eq!(received, 65_535);

    h2.send_window_update(0, 40_000);
    h2.send_window_update(1, 40_000);
    loop {
        let data = h2.read_stream_frame();
        assert_eq!(data.header.frame_type, FRAME_DATA);
        received += data.payload.len();
        if data.has_flag(FLAG_END_STREAM) {
            break;
        }
    }
    assert_eq!(received, 100_000);
}

/// WHY: A peer sending a corrupt header block must not take down the loop
/// thread that serves every other connection.
/// WHAT: The header block is rejected, the connection closes and the dispatch
/// error is counted.
#[test]
#[traced_test]
#[timeout(30000)]
fn malformed_header_block_closes_connection() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());

    let connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");

    let mut frame = Vec::new();
    encode_frame(&mut frame, FRAME_HEADERS, FLAG_END_HEADERS, 1, &[0x3f]);
    h2.send(&frame);

    connection
        .wait_for_disconnect(DEFAULT_WAIT_TIMEOUT)
        .expect("connection closed");
    upstream
        .stats()
        .wait_for_counter(DISPATCH_ERROR, 1, DEFAULT_WAIT_TIMEOUT)
        .expect("dispatch error counted");
    assert_eq!(upstream.stats().counter(DISPATCH_ERROR), 1);
    assert!(upstream.is_running());
}

/// WHY: Fake upstreams do not implement graceful shutdown, so a client that
/// sends GOAWAY has to fail the test loudly.
/// WHAT: The loop thread stops and dropping the upstream re-raises its panic.
#[test]
#[should_panic(expected = "GOAWAY")]
fn go_away_fails_the_test() {
    let upstream = upstream();
    let mut client = Dispatcher::new().expect("client dispatcher");
    let mut h2 = H2Client::connect(upstream.local_address());

    let _connection = upstream
        .wait_for_http_connection(&mut client, DEFAULT_WAIT_TIMEOUT)
        .expect("http connection");
    h2.send_go_away(0);

    let deadline = Instant::now() + DEFAULT_WAIT_TIMEOUT;
    while upstream.is_running() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!upstream.is_running(), "loop thread should have failed");

    drop(upstream);
}
