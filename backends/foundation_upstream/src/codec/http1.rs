// HTTP/1.1 server codec: request heads through httparse, bodies framed by
// content-length or chunked encoding, responses serialized by hand.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use super::{
    CodecEvent, HeaderMap, ServerCodec, StreamId, StreamProgress, StreamResetReason,
};
use crate::config::HttpType;
use crate::errors::{CodecError, CodecResult};

/// Most headers accepted in one request head or trailer block.
const MAX_HEADERS: usize = 64;

/// Largest partial request head buffered before giving up.
const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestState {
    Head,
    Length { stream_id: StreamId, remaining: u64 },
    Chunked { stream_id: StreamId, state: ChunkState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    Length,
    Chunked,
}

#[derive(Debug, Default)]
struct Exchange {
    progress: StreamProgress,
    framing: Option<ResponseFraming>,
}

struct RequestHead {
    consumed: usize,
    headers: HeaderMap,
    content_length: Option<u64>,
    chunked: bool,
    keep_alive: bool,
}

/// Server side of an HTTP/1.1 connection.
///
/// Requests on a keep-alive connection become streams 1, 2, 3, ... in arrival
/// order. HTTP/1 has no way to reset a single exchange, so a reset closes the
/// whole connection.
#[derive(Debug)]
pub struct Http1ServerCodec {
    buffer: Vec<u8>,
    state: RequestState,
    next_stream_id: StreamId,
    exchanges: BTreeMap<StreamId, Exchange>,
    events: VecDeque<CodecEvent>,
    pending: Vec<u8>,
    close_after_response: bool,
    wants_close: bool,
}

impl Default for Http1ServerCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Http1ServerCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            state: RequestState::Head,
            next_stream_id: 1,
            exchanges: BTreeMap::new(),
            events: VecDeque::new(),
            pending: Vec::new(),
            close_after_response: false,
            wants_close: false,
        }
    }

    fn step(&mut self) -> CodecResult<bool> {
        match self.state {
            RequestState::Head => self.read_head(),
            RequestState::Length {
                stream_id,
                remaining,
            } => Ok(self.read_length_body(stream_id, remaining)),
            RequestState::Chunked { stream_id, state } => self.read_chunked(stream_id, state),
        }
    }

    fn read_head(&mut self) -> CodecResult<bool> {
        if self.buffer.is_empty() {
            return Ok(false);
        }

        let Some(head) = parse_request_head(&self.buffer)? else {
            if self.buffer.len() > MAX_HEAD_BYTES {
                return Err(CodecError::HeadersTooLarge);
            }
            return Ok(false);
        };
        self.buffer.drain(..head.consumed);

        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        if !head.keep_alive {
            self.close_after_response = true;
        }

        let body = if head.chunked {
            Some(RequestState::Chunked {
                stream_id,
                state: ChunkState::Size,
            })
        } else {
            match head.content_length {
                None | Some(0) => None,
                Some(remaining) => Some(RequestState::Length {
                    stream_id,
                    remaining,
                }),
            }
        };

        tracing::trace!("http1 request {stream_id}: {:?}", head.headers.get(":path"));
        self.exchanges.insert(stream_id, Exchange::default());
        self.events.push_back(CodecEvent::NewStream(stream_id));
        self.events.push_back(CodecEvent::Headers {
            stream_id,
            headers: head.headers,
            end_stream: body.is_none(),
        });

        match body {
            Some(state) => self.state = state,
            None => self.finish_request(stream_id),
        }
        Ok(true)
    }

    fn read_length_body(&mut self, stream_id: StreamId, remaining: u64) -> bool {
        let take = usize::try_from(remaining)
            .unwrap_or(usize::MAX)
            .min(self.buffer.len());
        if take == 0 {
            return false;
        }

        let data: Vec<u8> = self.buffer.drain(..take).collect();
        let remaining = remaining - take as u64;
        let end_stream = remaining == 0;
        self.events.push_back(CodecEvent::Data {
            stream_id,
            data,
            end_stream,
        });

        if end_stream {
            self.finish_request(stream_id);
        } else {
            self.state = RequestState::Length {
                stream_id,
                remaining,
            };
        }
        true
    }

    fn read_chunked(&mut self, stream_id: StreamId, state: ChunkState) -> CodecResult<bool> {
        match state {
            ChunkState::Size => match httparse::parse_chunk_size(&self.buffer)? {
                httparse::Status::Partial => Ok(false),
                httparse::Status::Complete((consumed, size)) => {
                    self.buffer.drain(..consumed);
                    let next = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                    self.state = RequestState::Chunked {
                        stream_id,
                        state: next,
                    };
                    Ok(true)
                }
            },
            ChunkState::Data(remaining) => {
                let take = usize::try_from(remaining)
                    .unwrap_or(usize::MAX)
                    .min(self.buffer.len());
                if take == 0 {
                    return Ok(false);
                }

                let data: Vec<u8> = self.buffer.drain(..take).collect();
                let remaining = remaining - take as u64;
                self.events.push_back(CodecEvent::Data {
                    stream_id,
                    data,
                    end_stream: false,
                });
                self.state = RequestState::Chunked {
                    stream_id,
                    state: if remaining == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(remaining)
                    },
                };
                Ok(true)
            }
            ChunkState::DataEnd => {
                if self.buffer.len() < 2 {
                    return Ok(false);
                }
                if &self.buffer[..2] != b"\r\n" {
                    return Err(CodecError::InvalidChunkSize);
                }
                self.buffer.drain(..2);
                self.state = RequestState::Chunked {
                    stream_id,
                    state: ChunkState::Size,
                };
                Ok(true)
            }
            ChunkState::Trailers => {
                let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let (consumed, trailers) = match httparse::parse_headers(&self.buffer, &mut raw)? {
                    httparse::Status::Partial => return Ok(false),
                    httparse::Status::Complete((consumed, parsed)) => {
                        (consumed, collect_headers(parsed))
                    }
                };
                self.buffer.drain(..consumed);

                if trailers.is_empty() {
                    self.events.push_back(CodecEvent::Data {
                        stream_id,
                        data: Vec::new(),
                        end_stream: true,
                    });
                } else {
                    self.events.push_back(CodecEvent::Trailers {
                        stream_id,
                        trailers,
                    });
                }
                self.finish_request(stream_id);
                Ok(true)
            }
        }
    }

    fn finish_request(&mut self, stream_id: StreamId) {
        self.state = RequestState::Head;
        if let Some(exchange) = self.exchanges.get_mut(&stream_id) {
            exchange.progress.remote_done = true;
        }
        self.retire(stream_id);
    }

    fn finish_response(&mut self, stream_id: StreamId) {
        if let Some(exchange) = self.exchanges.get_mut(&stream_id) {
            exchange.progress.local_done = true;
        }
        if self.close_after_response {
            self.wants_close = true;
        }
        self.retire(stream_id);
    }

    fn retire(&mut self, stream_id: StreamId) {
        if self
            .exchanges
            .get(&stream_id)
            .is_some_and(|exchange| exchange.progress.is_complete())
        {
            self.exchanges.remove(&stream_id);
            self.events.push_back(CodecEvent::StreamComplete(stream_id));
        }
    }

    fn framing(&self, stream_id: StreamId) -> Option<ResponseFraming> {
        self.exchanges
            .get(&stream_id)
            .and_then(|exchange| exchange.framing)
    }
}

impl ServerCodec for Http1ServerCodec {
    fn protocol(&self) -> HttpType {
        HttpType::Http1
    }

    fn dispatch(&mut self, data: &[u8]) -> CodecResult<()> {
        self.buffer.extend_from_slice(data);
        while self.step()? {}
        Ok(())
    }

    fn poll_event(&mut self) -> Option<CodecEvent> {
        self.events.pop_front()
    }

    fn encode_headers(&mut self, stream_id: StreamId, headers: &HeaderMap, end_stream: bool) {
        let Some(status) = headers.status() else {
            tracing::error!("stream {stream_id}: response headers without a numeric :status");
            self.encode_reset_stream(stream_id, StreamResetReason::LocalReset);
            return;
        };
        let reason = http::StatusCode::from_u16(status)
            .ok()
            .and_then(|code| code.canonical_reason())
            .unwrap_or("");

        let mut head = String::new();
        let _ = write!(head, "HTTP/1.1 {status} {reason}\r\n");
        for (name, value) in headers.iter().filter(|(name, _)| !name.starts_with(':')) {
            let _ = write!(head, "{name}: {value}\r\n");
        }

        let chunked_requested = headers
            .get_all("transfer-encoding")
            .any(|value| value.to_ascii_lowercase().contains("chunked"));
        let framing = if end_stream {
            if !bodyless_status(status)
                && !headers.contains("content-length")
                && !chunked_requested
            {
                head.push_str("content-length: 0\r\n");
            }
            None
        } else if headers.contains("content-length") {
            Some(ResponseFraming::Length)
        } else {
            if !chunked_requested {
                head.push_str("transfer-encoding: chunked\r\n");
            }
            Some(ResponseFraming::Chunked)
        };
        head.push_str("\r\n");
        self.pending.extend_from_slice(head.as_bytes());

        if let Some(exchange) = self.exchanges.get_mut(&stream_id) {
            exchange.framing = framing;
        }
        if end_stream {
            self.finish_response(stream_id);
        }
    }

    fn encode_data(&mut self, stream_id: StreamId, data: &[u8], end_stream: bool) {
        match self.framing(stream_id) {
            Some(ResponseFraming::Chunked) => {
                if !data.is_empty() {
                    self.pending
                        .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    self.pending.extend_from_slice(data);
                    self.pending.extend_from_slice(b"\r\n");
                }
                if end_stream {
                    self.pending.extend_from_slice(b"0\r\n\r\n");
                }
            }
            _ => self.pending.extend_from_slice(data),
        }

        if end_stream {
            self.finish_response(stream_id);
        }
    }

    fn encode_trailers(&mut self, stream_id: StreamId, trailers: &HeaderMap) {
        if self.framing(stream_id) == Some(ResponseFraming::Chunked) {
            let mut block = String::from("0\r\n");
            for (name, value) in trailers.iter() {
                let _ = write!(block, "{name}: {value}\r\n");
            }
            block.push_str("\r\n");
            self.pending.extend_from_slice(block.as_bytes());
        } else {
            tracing::debug!("stream {stream_id}: trailers need a chunked response, dropping them");
        }
        self.finish_response(stream_id);
    }

    fn encode_reset_stream(&mut self, stream_id: StreamId, reason: StreamResetReason) {
        tracing::debug!("http1 stream {stream_id} reset ({reason:?}), closing connection");
        self.exchanges.remove(&stream_id);
        self.wants_close = true;
        self.events
            .push_back(CodecEvent::Reset { stream_id, reason });
    }

    fn take_pending_send(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    fn wants_close(&self) -> bool {
        self.wants_close
    }

    fn on_connection_close(&mut self) {
        for (stream_id, _) in std::mem::take(&mut self.exchanges) {
            self.events.push_back(CodecEvent::Reset {
                stream_id,
                reason: StreamResetReason::ConnectionTermination,
            });
        }
    }
}

fn parse_request_head(buffer: &[u8]) -> CodecResult<Option<RequestHead>> {
    let mut raw = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut raw);

    let consumed = match request.parse(buffer)? {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(consumed) => consumed,
    };

    let mut headers = HeaderMap::new();
    headers.append(":method", request.method.unwrap_or_default());
    headers.append(":path", request.path.unwrap_or_default());

    let mut content_length = None;
    let mut chunked = false;
    // HTTP/1.0 closes unless asked not to
    let mut keep_alive = request.version != Some(0);

    for header in request.headers.iter() {
        let name = header.name.to_ascii_lowercase();
        let value = String::from_utf8_lossy(header.value).into_owned();

        match name.as_str() {
            "content-length" => {
                let length = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| CodecError::protocol(format!("bad content-length {value:?}")))?;
                content_length = Some(length);
            }
            "transfer-encoding" => {
                chunked |= value.to_ascii_lowercase().contains("chunked");
            }
            "connection" => {
                let value = value.to_ascii_lowercase();
                if value.contains("close") {
                    keep_alive = false;
                } else if value.contains("keep-alive") {
                    keep_alive = true;
                }
            }
            _ => {}
        }
        headers.append(name, value);
    }

    Ok(Some(RequestHead {
        consumed,
        headers,
        content_length,
        chunked,
        keep_alive,
    }))
}

/// Statuses whose responses never carry a body, nor a `content-length` for one.
fn bodyless_status(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> HeaderMap {
    parsed
        .iter()
        .map(|header| {
            (
                header.name.to_ascii_lowercase(),
                String::from_utf8_lossy(header.value).into_owned(),
            )
        })
        .collect()
}
