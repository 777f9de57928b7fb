//! HTTP/2 server codec (RFC 9113).
//!
//! Frames share a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```
//!
//! Inbound flow control is replenished as soon as DATA arrives, so a peer is
//! never stalled by a test that reads slowly. Outbound DATA respects the
//! peer's connection and stream windows: whatever does not fit is queued per
//! stream, together with any trailers, until a WINDOW_UPDATE or a larger
//! SETTINGS_INITIAL_WINDOW_SIZE makes room.

use std::collections::{BTreeMap, VecDeque};

use super::flow::{SendWindow, DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
use super::{
    CodecEvent, HeaderMap, ServerCodec, StreamId, StreamProgress, StreamResetReason,
};
use crate::config::HttpType;
use crate::errors::{CodecError, CodecResult};

/// Connection preface every client opens with.
pub const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

pub const ERROR_NO_ERROR: u32 = 0x0;
pub const ERROR_REFUSED_STREAM: u32 = 0x7;

/// Appends a 9-byte frame header.
pub fn encode_frame_header(
    buf: &mut Vec<u8>,
    payload_len: usize,
    frame_type: u8,
    flags: u8,
    stream_id: StreamId,
) {
    let length = u32::try_from(payload_len).unwrap_or(u32::MAX).to_be_bytes();
    buf.extend_from_slice(&length[1..]);
    buf.push(frame_type);
    buf.push(flags);
    buf.extend_from_slice(&(stream_id & 0x7fff_ffff).to_be_bytes());
}

/// Appends a whole frame.
pub fn encode_frame(
    buf: &mut Vec<u8>,
    frame_type: u8,
    flags: u8,
    stream_id: StreamId,
    payload: &[u8],
) {
    encode_frame_header(buf, payload.len(), frame_type, flags, stream_id);
    buf.extend_from_slice(payload);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: usize,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: StreamId,
}

/// Decodes a frame header from the start of `buf`, `None` if too short.
#[must_use]
pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }

    Some(FrameHeader {
        length: (usize::from(buf[0]) << 16) | (usize::from(buf[1]) << 8) | usize::from(buf[2]),
        frame_type: buf[3],
        flags: buf[4],
        stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
    })
}

fn strip_padding(payload: &[u8], flags: u8) -> CodecResult<&[u8]> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }

    let Some((&pad, rest)) = payload.split_first() else {
        return Err(CodecError::protocol("padded frame without pad length"));
    };
    let pad = usize::from(pad);
    if pad > rest.len() {
        return Err(CodecError::protocol("padding exceeds frame payload"));
    }
    Ok(&rest[..rest.len() - pad])
}

struct PartialHeaders {
    stream_id: StreamId,
    end_stream: bool,
    block: Vec<u8>,
}

/// Response side of a stream whose DATA is waiting on flow control.
#[derive(Debug)]
struct Outbound {
    window: SendWindow,
    queued: Vec<u8>,
    end_stream: bool,
    trailers: Option<HeaderMap>,
}

impl Outbound {
    fn new(window: SendWindow) -> Self {
        Self {
            window,
            queued: Vec::new(),
            end_stream: false,
            trailers: None,
        }
    }
}

/// Server side of an HTTP/2 connection.
pub struct Http2ServerCodec {
    buffer: Vec<u8>,
    preface_seen: bool,
    decoder: fluke_hpack::Decoder<'static>,
    encoder: fluke_hpack::Encoder<'static>,
    peer_max_frame_size: usize,
    initial_window: i64,
    conn_window: SendWindow,
    outbound: BTreeMap<StreamId, Outbound>,
    continuation: Option<PartialHeaders>,
    streams: BTreeMap<StreamId, StreamProgress>,
    last_stream_id: StreamId,
    events: VecDeque<CodecEvent>,
    pending: Vec<u8>,
}

impl std::fmt::Debug for Http2ServerCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2ServerCodec")
            .field("preface_seen", &self.preface_seen)
            .field("peer_max_frame_size", &self.peer_max_frame_size)
            .field("conn_window", &self.conn_window)
            .field("queued_streams", &self.outbound.len())
            .field("open_streams", &self.streams.len())
            .field("last_stream_id", &self.last_stream_id)
            .finish_non_exhaustive()
    }
}

impl Default for Http2ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Http2ServerCodec {
    /// Creates the codec with the server SETTINGS frame already queued.
    #[must_use]
    pub fn new() -> Self {
        let mut pending = Vec::new();
        encode_frame(&mut pending, FRAME_SETTINGS, 0, 0, &[]);

        Self {
            buffer: Vec::new(),
            preface_seen: false,
            decoder: fluke_hpack::Decoder::new(),
            encoder: fluke_hpack::Encoder::new(),
            peer_max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            initial_window: DEFAULT_WINDOW_SIZE,
            conn_window: SendWindow::default(),
            outbound: BTreeMap::new(),
            continuation: None,
            streams: BTreeMap::new(),
            last_stream_id: 0,
            events: VecDeque::new(),
            pending,
        }
    }

    fn check_preface(&mut self) -> CodecResult<bool> {
        let seen = self.buffer.len().min(CONNECTION_PREFACE.len());
        if self.buffer[..seen] != CONNECTION_PREFACE[..seen] {
            return Err(CodecError::BadPreface);
        }
        if seen < CONNECTION_PREFACE.len() {
            return Ok(false);
        }

        self.buffer.drain(..CONNECTION_PREFACE.len());
        self.preface_seen = true;
        Ok(true)
    }

    fn handle_frame(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        if let Some(partial) = &self.continuation {
            if header.frame_type != FRAME_CONTINUATION || header.stream_id != partial.stream_id {
                return Err(CodecError::protocol("header block interrupted"));
            }
        }

        match header.frame_type {
            FRAME_DATA => self.on_data(header, payload),
            FRAME_HEADERS => self.on_headers(header, payload),
            FRAME_CONTINUATION => self.on_continuation(header, payload),
            FRAME_RST_STREAM => self.on_rst_stream(header, payload),
            FRAME_SETTINGS => self.on_settings(header, payload),
            FRAME_PING => self.on_ping(header, payload),
            FRAME_WINDOW_UPDATE => self.on_window_update(header, payload),
            FRAME_GOAWAY => {
                tracing::debug!("peer sent GOAWAY");
                self.events.push_back(CodecEvent::GoAway);
                Ok(())
            }
            FRAME_PUSH_PROMISE => Err(CodecError::protocol("client sent PUSH_PROMISE")),
            // PRIORITY and unknown extension frames
            _ => Ok(()),
        }
    }

    fn on_data(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        if header.stream_id == 0 {
            return Err(CodecError::protocol("DATA on stream 0"));
        }
        let data = strip_padding(payload, header.flags)?;
        let end_stream = header.flags & FLAG_END_STREAM != 0;

        if !payload.is_empty() {
            let increment = u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes();
            encode_frame(&mut self.pending, FRAME_WINDOW_UPDATE, 0, 0, &increment);
            if !end_stream {
                encode_frame(
                    &mut self.pending,
                    FRAME_WINDOW_UPDATE,
                    0,
                    header.stream_id,
                    &increment,
                );
            }
        }

        let Some(progress) = self.streams.get_mut(&header.stream_id) else {
            tracing::trace!("DATA for closed stream {}", header.stream_id);
            return Ok(());
        };
        if progress.remote_done {
            return Err(CodecError::protocol("DATA after END_STREAM"));
        }

        self.events.push_back(CodecEvent::Data {
            stream_id: header.stream_id,
            data: data.to_vec(),
            end_stream,
        });
        if end_stream {
            self.remote_done(header.stream_id);
        }
        Ok(())
    }

    fn on_headers(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        if header.stream_id == 0 {
            return Err(CodecError::protocol("HEADERS on stream 0"));
        }

        let mut fragment = strip_padding(payload, header.flags)?;
        if header.flags & FLAG_PRIORITY != 0 {
            if fragment.len() < 5 {
                return Err(CodecError::protocol("HEADERS priority block truncated"));
            }
            fragment = &fragment[5..];
        }

        let partial = PartialHeaders {
            stream_id: header.stream_id,
            end_stream: header.flags & FLAG_END_STREAM != 0,
            block: fragment.to_vec(),
        };

        if header.flags & FLAG_END_HEADERS != 0 {
            self.finish_headers(partial)
        } else {
            self.continuation = Some(partial);
            Ok(())
        }
    }

    fn on_continuation(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        let Some(mut partial) = self.continuation.take() else {
            return Err(CodecError::protocol("unexpected CONTINUATION"));
        };
        partial.block.extend_from_slice(payload);

        if header.flags & FLAG_END_HEADERS != 0 {
            self.finish_headers(partial)
        } else {
            self.continuation = Some(partial);
            Ok(())
        }
    }

    fn finish_headers(&mut self, partial: PartialHeaders) -> CodecResult<()> {
        let decoded = self
            .decoder
            .decode(&partial.block)
            .map_err(|err| CodecError::HeaderBlock(format!("{err:?}")))?;
        let headers: HeaderMap = decoded
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8_lossy(&name).into_owned(),
                    String::from_utf8_lossy(&value).into_owned(),
                )
            })
            .collect();

        let stream_id = partial.stream_id;
        if self.streams.contains_key(&stream_id) {
            if !partial.end_stream {
                return Err(CodecError::protocol("trailers without END_STREAM"));
            }
            self.events.push_back(CodecEvent::Trailers {
                stream_id,
                trailers: headers,
            });
            self.remote_done(stream_id);
            return Ok(());
        }

        if stream_id % 2 == 0 || stream_id <= self.last_stream_id {
            return Err(CodecError::protocol(format!(
                "stream id {stream_id} is not a new client stream"
            )));
        }

        self.last_stream_id = stream_id;
        self.streams.insert(stream_id, StreamProgress::default());
        self.events.push_back(CodecEvent::NewStream(stream_id));
        self.events.push_back(CodecEvent::Headers {
            stream_id,
            headers,
            end_stream: partial.end_stream,
        });
        if partial.end_stream {
            self.remote_done(stream_id);
        }
        Ok(())
    }

    fn on_rst_stream(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        let Ok(code) = <[u8; 4]>::try_from(payload) else {
            return Err(CodecError::FrameSize {
                length: payload.len(),
                max: 4,
            });
        };

        self.outbound.remove(&header.stream_id);
        if self.streams.remove(&header.stream_id).is_some() {
            let reason = if u32::from_be_bytes(code) == ERROR_REFUSED_STREAM {
                StreamResetReason::RemoteRefusedStreamReset
            } else {
                StreamResetReason::RemoteReset
            };
            self.events.push_back(CodecEvent::Reset {
                stream_id: header.stream_id,
                reason,
            });
        }
        Ok(())
    }

    fn on_settings(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        if header.flags & FLAG_ACK != 0 {
            return Ok(());
        }
        if payload.len() % 6 != 0 {
            return Err(CodecError::protocol("SETTINGS payload not a multiple of 6"));
        }

        for entry in payload.chunks_exact(6) {
            let id = u16::from_be_bytes([entry[0], entry[1]]);
            let value = u32::from_be_bytes([entry[2], entry[3], entry[4], entry[5]]);
            match id {
                SETTINGS_INITIAL_WINDOW_SIZE => self.set_initial_window(i64::from(value))?,
                SETTINGS_MAX_FRAME_SIZE => {
                    self.peer_max_frame_size =
                        usize::try_from(value).unwrap_or(DEFAULT_MAX_FRAME_SIZE);
                }
                _ => {}
            }
        }

        encode_frame(&mut self.pending, FRAME_SETTINGS, FLAG_ACK, 0, &[]);
        self.flush_all();
        Ok(())
    }

    /// Moves every stream window by the change in the initial size, which
    /// can leave some of them negative.
    fn set_initial_window(&mut self, value: i64) -> CodecResult<()> {
        if value > MAX_WINDOW_SIZE {
            return Err(CodecError::FlowControl);
        }
        let delta = value - self.initial_window;
        self.initial_window = value;
        for outbound in self.outbound.values_mut() {
            outbound.window.adjust(delta)?;
        }
        Ok(())
    }

    fn on_window_update(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        let Ok(raw) = <[u8; 4]>::try_from(payload) else {
            return Err(CodecError::FrameSize {
                length: payload.len(),
                max: 4,
            });
        };
        let increment = u32::from_be_bytes(raw) & 0x7fff_ffff;
        if increment == 0 {
            return Err(CodecError::protocol("WINDOW_UPDATE with zero increment"));
        }

        if header.stream_id == 0 {
            self.conn_window.increase(increment)?;
            self.flush_all();
            return Ok(());
        }

        match self.outbound.get_mut(&header.stream_id) {
            Some(outbound) => outbound.window.increase(increment)?,
            None if self.streams.contains_key(&header.stream_id) => {
                let mut window = SendWindow::new(self.initial_window);
                window.increase(increment)?;
                self.outbound
                    .insert(header.stream_id, Outbound::new(window));
            }
            None => {
                tracing::trace!("WINDOW_UPDATE for closed stream {}", header.stream_id);
                return Ok(());
            }
        }
        self.flush_stream(header.stream_id);
        Ok(())
    }

    fn on_ping(&mut self, header: FrameHeader, payload: &[u8]) -> CodecResult<()> {
        if payload.len() != 8 {
            return Err(CodecError::FrameSize {
                length: payload.len(),
                max: 8,
            });
        }
        if header.flags & FLAG_ACK == 0 {
            encode_frame(&mut self.pending, FRAME_PING, FLAG_ACK, 0, payload);
        }
        Ok(())
    }

    fn remote_done(&mut self, stream_id: StreamId) {
        if let Some(progress) = self.streams.get_mut(&stream_id) {
            progress.remote_done = true;
        }
        self.retire(stream_id);
    }

    /// Called once END_STREAM has actually been written, not when it was
    /// queued behind a closed window.
    fn local_done(&mut self, stream_id: StreamId) {
        if let Some(progress) = self.streams.get_mut(&stream_id) {
            progress.local_done = true;
        }
        self.retire(stream_id);
    }

    fn retire(&mut self, stream_id: StreamId) {
        if self
            .streams
            .get(&stream_id)
            .is_some_and(|progress| progress.is_complete())
        {
            self.streams.remove(&stream_id);
            self.events.push_back(CodecEvent::StreamComplete(stream_id));
        }
    }

    fn outbound_entry(&mut self, stream_id: StreamId) -> &mut Outbound {
        let initial = self.initial_window;
        self.outbound
            .entry(stream_id)
            .or_insert_with(|| Outbound::new(SendWindow::new(initial)))
    }

    /// Writes as much of the stream's queue as both windows allow, then its
    /// trailers or END_STREAM once the queue is empty.
    fn flush_stream(&mut self, stream_id: StreamId) {
        let Some(mut outbound) = self.outbound.remove(&stream_id) else {
            return;
        };
        let max = self.peer_max_frame_size.max(1);

        while !outbound.queued.is_empty() {
            let size = outbound
                .queued
                .len()
                .min(max)
                .min(outbound.window.available())
                .min(self.conn_window.available());
            if size == 0 {
                tracing::trace!(
                    "stream {stream_id}: {} bytes blocked on flow control",
                    outbound.queued.len()
                );
                self.outbound.insert(stream_id, outbound);
                return;
            }

            let last =
                size == outbound.queued.len() && outbound.end_stream && outbound.trailers.is_none();
            let flags = if last { FLAG_END_STREAM } else { 0 };
            encode_frame(
                &mut self.pending,
                FRAME_DATA,
                flags,
                stream_id,
                &outbound.queued[..size],
            );
            outbound.queued.drain(..size);
            outbound.window.consume(size);
            self.conn_window.consume(size);

            if last {
                self.local_done(stream_id);
                return;
            }
        }

        if let Some(trailers) = outbound.trailers.take() {
            self.write_header_block(stream_id, &trailers, true);
            self.local_done(stream_id);
        } else if outbound.end_stream {
            encode_frame(&mut self.pending, FRAME_DATA, FLAG_END_STREAM, stream_id, &[]);
            self.local_done(stream_id);
        } else {
            self.outbound.insert(stream_id, outbound);
        }
    }

    fn flush_all(&mut self) {
        let waiting: Vec<StreamId> = self.outbound.keys().copied().collect();
        for stream_id in waiting {
            self.flush_stream(stream_id);
        }
    }

    fn write_header_block(&mut self, stream_id: StreamId, headers: &HeaderMap, end_stream: bool) {
        let lowered: Vec<(Vec<u8>, Vec<u8>)> = headers
            .iter()
            .filter(|(name, _)| name.starts_with(':'))
            .chain(headers.iter().filter(|(name, _)| !name.starts_with(':')))
            .map(|(name, value)| (name.to_ascii_lowercase().into_bytes(), value.as_bytes().to_vec()))
            .collect();
        let block = self.encoder.encode(
            lowered
                .iter()
                .map(|(name, value)| (name.as_slice(), value.as_slice())),
        );

        let max = self.peer_max_frame_size.max(1);
        let mut fragments = block.chunks(max).peekable();
        let first = fragments.next().unwrap_or(&[]);
        let mut flags = if end_stream { FLAG_END_STREAM } else { 0 };
        if fragments.peek().is_none() {
            flags |= FLAG_END_HEADERS;
        }
        encode_frame(&mut self.pending, FRAME_HEADERS, flags, stream_id, first);

        while let Some(fragment) = fragments.next() {
            let flags = if fragments.peek().is_none() {
                FLAG_END_HEADERS
            } else {
                0
            };
            encode_frame(&mut self.pending, FRAME_CONTINUATION, flags, stream_id, fragment);
        }
    }
}

impl ServerCodec for Http2ServerCodec {
    fn protocol(&self) -> HttpType {
        HttpType::Http2
    }

    fn dispatch(&mut self, data: &[u8]) -> CodecResult<()> {
        self.buffer.extend_from_slice(data);

        if !self.preface_seen && !self.check_preface()? {
            return Ok(());
        }

        while let Some(header) = decode_frame_header(&self.buffer) {
            if header.length > DEFAULT_MAX_FRAME_SIZE {
                return Err(CodecError::FrameSize {
                    length: header.length,
                    max: DEFAULT_MAX_FRAME_SIZE,
                });
            }

            let frame_len = FRAME_HEADER_LEN + header.length;
            if self.buffer.len() < frame_len {
                break;
            }

            let payload = self.buffer[FRAME_HEADER_LEN..frame_len].to_vec();
            self.buffer.drain(..frame_len);
            self.handle_frame(header, &payload)?;
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<CodecEvent> {
        self.events.pop_front()
    }

    fn encode_headers(&mut self, stream_id: StreamId, headers: &HeaderMap, end_stream: bool) {
        self.write_header_block(stream_id, headers, end_stream);
        if end_stream {
            self.local_done(stream_id);
        }
    }

    fn encode_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        let outbound = self.outbound_entry(stream_id);
        outbound.queued.extend_from_slice(data);
        outbound.end_stream |= end_stream;
        self.flush_stream(stream_id);
    }

    fn encode_trailers(&mut self, stream_id: StreamId, trailers: &HeaderMap) {
        self.outbound_entry(stream_id).trailers = Some(trailers.clone());
        self.flush_stream(stream_id);
    }

    fn encode_reset_stream(&mut self, stream_id: StreamId, reason: StreamResetReason) {
        let code = if reason == StreamResetReason::LocalRefusedStreamReset {
            ERROR_REFUSED_STREAM
        } else {
            ERROR_NO_ERROR
        };
        encode_frame(
            &mut self.pending,
            FRAME_RST_STREAM,
            0,
            stream_id,
            &code.to_be_bytes(),
        );

        self.streams.remove(&stream_id);
        self.outbound.remove(&stream_id);
        self.events
            .push_back(CodecEvent::Reset { stream_id, reason });
    }

    fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    fn wants_close(&self) -> bool {
        false
    }

    fn on_connection_close(&mut self) {
        self.outbound.clear();
        for (stream_id, _) in std::mem::take(&mut self.streams) {
            self.events.push_back(CodecEvent::Reset {
                stream_id,
                reason: StreamResetReason::ConnectionTermination,
            });
        }
    }
}
