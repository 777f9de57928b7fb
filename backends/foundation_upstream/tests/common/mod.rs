//! Blocking clients shared by the integration tests.
//!
//! The clients run on the test thread over plain `std::net` sockets with a
//! read timeout, so a server that never answers fails the test instead of
//! hanging it.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use foundation_upstream::codec::http2::{
    decode_frame_header, encode_frame, FrameHeader, CONNECTION_PREFACE, FLAG_END_HEADERS,
    FLAG_END_STREAM, FRAME_DATA, FRAME_HEADERS, FRAME_HEADER_LEN, FRAME_PING,
    FRAME_GOAWAY, FRAME_RST_STREAM, FRAME_SETTINGS, FRAME_WINDOW_UPDATE,
};
use foundation_upstream::ListenEndpoint;

pub const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn tcp_addr(endpoint: &ListenEndpoint) -> SocketAddr {
    endpoint.ip().expect("upstream should be bound to tcp")
}

pub fn connect(endpoint: &ListenEndpoint) -> TcpStream {
    let stream = TcpStream::connect(tcp_addr(endpoint)).expect("connect to upstream");
    stream
        .set_read_timeout(Some(CLIENT_READ_TIMEOUT))
        .expect("set read timeout");
    stream.set_nodelay(true).expect("set nodelay");
    stream
}

/// Reads until `done` holds for everything read so far, or panics on EOF.
pub fn read_until(stream: &mut impl Read, mut done: impl FnMut(&[u8]) -> bool) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0_u8; 4096];
    while !done(&received) {
        let read = stream.read(&mut chunk).expect("read from upstream");
        assert!(
            read > 0,
            "upstream closed early, got {:?}",
            String::from_utf8_lossy(&received)
        );
        received.extend_from_slice(&chunk[..read]);
    }
    received
}

/// Reads until the peer closes. Read errors after a reset count as a close.
pub fn read_to_close(stream: &mut impl Read) -> Vec<u8> {
    let mut received = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return received,
            Ok(read) => received.extend_from_slice(&chunk[..read]),
        }
    }
}

/// True once `received` holds a complete chunked HTTP/1 response.
pub fn chunked_response_done(received: &[u8]) -> bool {
    received.ends_with(b"0\r\n\r\n")
}

#[derive(Debug)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn has_flag(&self, flag: u8) -> bool {
        self.header.flags & flag != 0
    }
}

/// Minimal prior-knowledge HTTP/2 client.
pub struct H2Client {
    stream: TcpStream,
    encoder: fluke_hpack::Encoder<'static>,
    decoder: fluke_hpack::Decoder<'static>,
    buffer: Vec<u8>,
}

impl H2Client {
    /// Connects and sends the preface plus an empty SETTINGS frame.
    pub fn connect(endpoint: &ListenEndpoint) -> Self {
        let mut client = Self {
            stream: connect(endpoint),
            encoder: fluke_hpack::Encoder::new(),
            decoder: fluke_hpack::Decoder::new(),
            buffer: Vec::new(),
        };

        let mut out = CONNECTION_PREFACE.to_vec();
        encode_frame(&mut out, FRAME_SETTINGS, 0, 0, &[]);
        client.send(&out);
        client
    }

    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write to upstream");
    }

    pub fn send_request(&mut self, stream_id: u32, path: &str, end_stream: bool) {
        let headers: [(&[u8], &[u8]); 4] = [
            (b":method", b"POST"),
            (b":scheme", b"http"),
            (b":authority", b"upstream.test"),
            (b":path", path.as_bytes()),
        ];
        let block = self.encoder.encode(headers);

        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_HEADERS, flags, stream_id, &block);
        self.send(&out);
    }

    pub fn send_data(&mut self, stream_id: u32, data: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_DATA, flags, stream_id, data);
        self.send(&out);
    }

    pub fn send_reset(&mut self, stream_id: u32, error_code: u32) {
        let mut out = Vec::new();
        encode_frame(
            &mut out,
            FRAME_RST_STREAM,
            0,
            stream_id,
            &error_code.to_be_bytes(),
        );
        self.send(&out);
    }

    pub fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        let mut out = Vec::new();
        encode_frame(
            &mut out,
            FRAME_WINDOW_UPDATE,
            0,
            stream_id,
            &increment.to_be_bytes(),
        );
        self.send(&out);
    }

    /// Sends GOAWAY with NO_ERROR naming `last_stream_id`.
    pub fn send_go_away(&mut self, last_stream_id: u32) {
        let mut payload = last_stream_id.to_be_bytes().to_vec();
        payload.extend_from_slice(&0_u32.to_be_bytes());
        let mut out = Vec::new();
        encode_frame(&mut out, FRAME_GOAWAY, 0, 0, &payload);
        self.send(&out);
    }

    pub fn read_frame(&mut self) -> Frame {
        loop {
            if let Some(header) = decode_frame_header(&self.buffer) {
                let total = FRAME_HEADER_LEN + header.length;
                if self.buffer.len() >= total {
                    let payload = self.buffer[FRAME_HEADER_LEN..total].to_vec();
                    self.buffer.drain(..total);
                    return Frame { header, payload };
                }
            }

            let mut chunk = [0_u8; 4096];
            let read = self.stream.read(&mut chunk).expect("read from upstream");
            assert!(read > 0, "upstream closed the http2 connection");
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }

    /// Next HEADERS, DATA or `RST_STREAM` frame, skipping connection
    /// management frames.
    pub fn read_stream_frame(&mut self) -> Frame {
        loop {
            let frame = self.read_frame();
            match frame.header.frame_type {
                FRAME_SETTINGS | FRAME_PING | FRAME_WINDOW_UPDATE => {}
                _ if frame.header.stream_id == 0 => {}
                _ => return frame,
            }
        }
    }

    pub fn decode_headers(&mut self, frame: &Frame) -> Vec<(String, String)> {
        assert_eq!(frame.header.frame_type, FRAME_HEADERS);
        self.decoder
            .decode(&frame.payload)
            .expect("valid hpack block")
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect()
    }
}
