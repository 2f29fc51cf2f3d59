//! HTTP/1.1 decoding for inbound requests and origin responses
//!
//! The decoder owns the stream and a single read buffer. Heads are parsed
//! with `httparse` under a hard size cap; bodies are handed out as framed
//! chunks through a [`BodySource`], one terminal chunk marking the end.
//! The same decoder instance carries a keep-alive connection across
//! requests, and can first consume a PROXY preamble off the front.

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use httparse::Status;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::constants::buffer;
use crate::error::ProxyError;
use crate::filter::BodySource;
use crate::ingress::proxy_protocol::{self, Detection, ProxyHeader};
use crate::message::{BodyChunk, Headers};

/// Parsed request line and headers
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    /// Path plus query string, exactly as sent
    pub target: String,
    pub minor_version: u8,
    pub headers: Headers,
}

impl RequestHead {
    #[must_use]
    pub fn protocol(&self) -> &'static str {
        if self.minor_version == 0 {
            "HTTP/1.0"
        } else {
            "HTTP/1.1"
        }
    }

    /// Whether the connection may carry another request after this one
    #[must_use]
    pub fn keep_alive(&self) -> bool {
        keep_alive(self.minor_version, &self.headers)
    }
}

/// Parsed status line and headers of an origin response
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub minor_version: u8,
    pub headers: Headers,
}

fn keep_alive(minor_version: u8, headers: &Headers) -> bool {
    let connection = headers.first("connection").unwrap_or("");
    let mut tokens = connection.split(',').map(str::trim);
    if minor_version == 0 {
        tokens.any(|t| t.eq_ignore_ascii_case("keep-alive"))
    } else {
        !tokens.any(|t| t.eq_ignore_ascii_case("close"))
    }
}

/// How a message body is framed on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows the head
    None,
    /// Exactly this many bytes follow
    ContentLength(u64),
    /// `Transfer-Encoding: chunked` framing
    Chunked,
    /// Body runs until the peer closes (responses without framing)
    ReadToClose,
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .all("transfer-encoding")
        .iter()
        .any(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn parse_content_length(value: &str) -> Result<u64, ProxyError> {
    value.trim().parse().map_err(|_| ProxyError::HttpParse {
        reason: format!("invalid Content-Length '{value}'"),
    })
}

/// Framing of a request body, from its headers
pub fn request_framing(headers: &Headers) -> Result<BodyFraming, ProxyError> {
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match headers.first("content-length") {
        Some(value) => {
            let length = parse_content_length(value)?;
            Ok(if length == 0 {
                BodyFraming::None
            } else {
                BodyFraming::ContentLength(length)
            })
        }
        None => Ok(BodyFraming::None),
    }
}

/// Framing of a response body, from the request method and status
pub fn response_framing(
    method: &str,
    status: u16,
    headers: &Headers,
) -> Result<BodyFraming, ProxyError> {
    if method.eq_ignore_ascii_case("HEAD")
        || status == 204
        || status == 304
        || (100..200).contains(&status)
    {
        return Ok(BodyFraming::None);
    }
    if is_chunked(headers) {
        return Ok(BodyFraming::Chunked);
    }
    match headers.first("content-length") {
        Some(value) => {
            let length = parse_content_length(value)?;
            Ok(if length == 0 {
                BodyFraming::None
            } else {
                BodyFraming::ContentLength(length)
            })
        }
        None => Ok(BodyFraming::ReadToClose),
    }
}

/// Buffered HTTP/1.1 decoder over one stream
#[derive(Debug)]
pub struct HttpDecoder<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S: AsyncRead + Unpin + Send> HttpDecoder<S> {
    #[must_use]
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(buffer::READ_CHUNK),
        }
    }

    /// Bytes read but not yet consumed
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    async fn fill(&mut self) -> Result<usize, ProxyError> {
        let read = self.stream.read_buf(&mut self.buffer).await?;
        Ok(read)
    }

    /// Consume an optional PROXY preamble from the front of the stream
    ///
    /// The presence decision is made on the first read: bytes that do not
    /// open with a magic prefix flow through untouched. Once detected, the
    /// decoder waits for the complete preamble.
    pub async fn read_proxy_preamble(&mut self) -> Result<Option<ProxyHeader>, ProxyError> {
        if self.buffer.is_empty() && self.fill().await? == 0 {
            return Ok(None);
        }
        if proxy_protocol::detect(&self.buffer) == Detection::Absent {
            return Ok(None);
        }
        loop {
            match proxy_protocol::parse_preamble(&self.buffer)? {
                Some((header, consumed)) => {
                    self.buffer.advance(consumed);
                    return Ok(Some(header));
                }
                None => {
                    if self.fill().await? == 0 {
                        return Err(ProxyError::ProxyProtocolDecode {
                            reason: "connection closed inside preamble".to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Read one request head
    ///
    /// `Ok(None)` means the peer closed cleanly between requests.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>, ProxyError> {
        loop {
            let parsed = {
                let mut storage = [httparse::EMPTY_HEADER; buffer::MAX_HEADERS];
                let mut request = httparse::Request::new(&mut storage);
                match request.parse(&self.buffer) {
                    Ok(Status::Complete(head_len)) => {
                        let head = RequestHead {
                            method: required(request.method, "method")?.to_string(),
                            target: required(request.path, "target")?.to_string(),
                            minor_version: required(request.version, "version")?,
                            headers: copy_headers(request.headers)?,
                        };
                        Some((head, head_len))
                    }
                    Ok(Status::Partial) => None,
                    Err(e) => {
                        return Err(ProxyError::HttpParse {
                            reason: e.to_string(),
                        })
                    }
                }
            };

            if let Some((head, consumed)) = parsed {
                self.buffer.advance(consumed);
                return Ok(Some(head));
            }
            if self.buffer.len() > buffer::HEAD_MAX {
                return Err(ProxyError::HeadTooLarge {
                    limit: buffer::HEAD_MAX,
                });
            }
            if self.fill().await? == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::HttpParse {
                    reason: "connection closed mid-head".to_string(),
                });
            }
        }
    }

    /// Read one response head
    pub async fn read_response_head(&mut self) -> Result<ResponseHead, ProxyError> {
        loop {
            let parsed = {
                let mut storage = [httparse::EMPTY_HEADER; buffer::MAX_HEADERS];
                let mut response = httparse::Response::new(&mut storage);
                match response.parse(&self.buffer) {
                    Ok(Status::Complete(head_len)) => {
                        let head = ResponseHead {
                            status: required(response.code, "status")?,
                            minor_version: required(response.version, "version")?,
                            headers: copy_headers(response.headers)?,
                        };
                        Some((head, head_len))
                    }
                    Ok(Status::Partial) => None,
                    Err(e) => {
                        return Err(ProxyError::HttpParse {
                            reason: e.to_string(),
                        })
                    }
                }
            };

            if let Some((head, consumed)) = parsed {
                self.buffer.advance(consumed);
                return Ok(head);
            }
            if self.buffer.len() > buffer::HEAD_MAX {
                return Err(ProxyError::HeadTooLarge {
                    limit: buffer::HEAD_MAX,
                });
            }
            if self.fill().await? == 0 {
                return Err(ProxyError::HttpParse {
                    reason: "connection closed mid-head".to_string(),
                });
            }
        }
    }

    /// Body reader for the message whose head was just consumed
    pub fn body_reader(&mut self, framing: BodyFraming) -> BodyReader<'_, S> {
        BodyReader {
            decoder: self,
            state: BodyState::from_framing(framing),
            counter: None,
        }
    }

    /// Consume the decoder into an owned body source
    ///
    /// Used where the body must outlive the call that parsed the head, such
    /// as handing a streaming origin response across a filter boundary.
    #[must_use]
    pub fn into_body_source(self, framing: BodyFraming) -> OwnedBodyReader<S> {
        OwnedBodyReader {
            decoder: self,
            state: BodyState::from_framing(framing),
            counter: None,
        }
    }
}

fn required<T>(value: Option<T>, what: &str) -> Result<T, ProxyError> {
    value.ok_or_else(|| ProxyError::HttpParse {
        reason: format!("head missing {what}"),
    })
}

fn copy_headers(parsed: &[httparse::Header<'_>]) -> Result<Headers, ProxyError> {
    let mut headers = Headers::with_capacity(parsed.len());
    for header in parsed {
        let value = std::str::from_utf8(header.value).map_err(|_| ProxyError::HttpParse {
            reason: format!("non-UTF-8 value for header '{}'", header.name),
        })?;
        headers.add(header.name, value);
    }
    Ok(headers)
}

#[derive(Debug, Clone, Copy)]
enum BodyState {
    Done,
    Sized { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkDataEnd,
    Trailers,
    ReadToClose,
}

impl BodyState {
    fn from_framing(framing: BodyFraming) -> Self {
        match framing {
            BodyFraming::None => Self::Done,
            BodyFraming::ContentLength(n) => Self::Sized { remaining: n },
            BodyFraming::Chunked => Self::ChunkSize,
            BodyFraming::ReadToClose => Self::ReadToClose,
        }
    }
}

/// Streams one message body out of the decoder as framed chunks
pub struct BodyReader<'a, S> {
    decoder: &'a mut HttpDecoder<S>,
    state: BodyState,
    counter: Option<Arc<AtomicU64>>,
}

impl<S> BodyReader<'_, S> {
    /// Count every delivered payload byte into `counter`
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.counter = Some(counter);
        self
    }
}

fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ProxyError> {
    let text = std::str::from_utf8(line).map_err(|_| ProxyError::HttpParse {
        reason: "non-ASCII chunk size line".to_string(),
    })?;
    let size_part = text.split(';').next().unwrap_or(text).trim();
    u64::from_str_radix(size_part, 16).map_err(|_| ProxyError::HttpParse {
        reason: format!("invalid chunk size '{size_part}'"),
    })
}

fn closed_mid_body() -> ProxyError {
    ProxyError::IoError(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed mid-body",
    ))
}

/// Single step of the body framing state machine, shared by both readers
async fn next_framed_chunk<S: AsyncRead + Unpin + Send>(
    decoder: &mut HttpDecoder<S>,
    state: &mut BodyState,
) -> Result<Option<BodyChunk>, ProxyError> {
    loop {
        match *state {
            BodyState::Done => return Ok(None),

            BodyState::Sized { remaining } => {
                if decoder.buffer.is_empty() && decoder.fill().await? == 0 {
                    return Err(closed_mid_body());
                }
                let take = decoder.buffer.len().min(remaining as usize);
                let data = decoder.buffer.split_to(take).freeze();
                let left = remaining - take as u64;
                if left == 0 {
                    *state = BodyState::Done;
                    return Ok(Some(BodyChunk::last(data)));
                }
                *state = BodyState::Sized { remaining: left };
                return Ok(Some(BodyChunk::new(data)));
            }

            BodyState::ChunkSize => {
                let Some(line_end) = find_crlf(&decoder.buffer) else {
                    if decoder.buffer.len() > buffer::READ_CHUNK {
                        return Err(ProxyError::HttpParse {
                            reason: "chunk size line too long".to_string(),
                        });
                    }
                    if decoder.fill().await? == 0 {
                        return Err(closed_mid_body());
                    }
                    continue;
                };
                let size = parse_chunk_size(&decoder.buffer[..line_end])?;
                decoder.buffer.advance(line_end + 2);
                *state = if size == 0 {
                    BodyState::Trailers
                } else {
                    BodyState::ChunkData { remaining: size }
                };
            }

            BodyState::ChunkData { remaining } => {
                if decoder.buffer.is_empty() && decoder.fill().await? == 0 {
                    return Err(closed_mid_body());
                }
                let take = decoder.buffer.len().min(remaining as usize);
                let data = decoder.buffer.split_to(take).freeze();
                let left = remaining - take as u64;
                *state = if left == 0 {
                    BodyState::ChunkDataEnd
                } else {
                    BodyState::ChunkData { remaining: left }
                };
                return Ok(Some(BodyChunk::new(data)));
            }

            BodyState::ChunkDataEnd => {
                while decoder.buffer.len() < 2 {
                    if decoder.fill().await? == 0 {
                        return Err(closed_mid_body());
                    }
                }
                if &decoder.buffer[..2] != b"\r\n" {
                    return Err(ProxyError::HttpParse {
                        reason: "missing CRLF after chunk data".to_string(),
                    });
                }
                decoder.buffer.advance(2);
                *state = BodyState::ChunkSize;
            }

            BodyState::Trailers => {
                let Some(line_end) = find_crlf(&decoder.buffer) else {
                    if decoder.buffer.len() > buffer::HEAD_MAX {
                        return Err(ProxyError::HeadTooLarge {
                            limit: buffer::HEAD_MAX,
                        });
                    }
                    if decoder.fill().await? == 0 {
                        return Err(closed_mid_body());
                    }
                    continue;
                };
                // Trailer headers are dropped; only the blank line matters
                let blank = line_end == 0;
                decoder.buffer.advance(line_end + 2);
                if blank {
                    *state = BodyState::Done;
                    return Ok(Some(BodyChunk::empty_last()));
                }
            }

            BodyState::ReadToClose => {
                if decoder.buffer.is_empty() && decoder.fill().await? == 0 {
                    *state = BodyState::Done;
                    return Ok(Some(BodyChunk::empty_last()));
                }
                let len = decoder.buffer.len();
                let data = decoder.buffer.split_to(len).freeze();
                return Ok(Some(BodyChunk::new(data)));
            }
        }
    }
}

fn count_delivered(chunk: Option<&BodyChunk>, counter: Option<&Arc<AtomicU64>>) {
    if let (Some(chunk), Some(counter)) = (chunk, counter) {
        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
    }
}

#[async_trait]
impl<S: AsyncRead + Unpin + Send> BodySource for BodyReader<'_, S> {
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError> {
        let chunk = next_framed_chunk(&mut *self.decoder, &mut self.state).await?;
        count_delivered(chunk.as_ref(), self.counter.as_ref());
        Ok(chunk)
    }
}

/// Owning variant of [`BodyReader`] for bodies that outlive the head parse
pub struct OwnedBodyReader<S> {
    decoder: HttpDecoder<S>,
    state: BodyState,
    counter: Option<Arc<AtomicU64>>,
}

impl<S> OwnedBodyReader<S> {
    /// Count every delivered payload byte into `counter`
    #[must_use]
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.counter = Some(counter);
        self
    }
}

#[async_trait]
impl<S: AsyncRead + Unpin + Send> BodySource for OwnedBodyReader<S> {
    async fn next_chunk(&mut self) -> Result<Option<BodyChunk>, ProxyError> {
        let chunk = next_framed_chunk(&mut self.decoder, &mut self.state).await?;
        count_delivered(chunk.as_ref(), self.counter.as_ref());
        Ok(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(source: &mut (dyn BodySource + '_)) -> Vec<BodyChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            let done = chunk.is_last();
            chunks.push(chunk);
            if done {
                break;
            }
        }
        chunks
    }

    #[tokio::test]
    async fn test_simple_get_head() {
        let raw: &[u8] = b"GET /api/items?q=1 HTTP/1.1\r\nHost: api.example.com\r\nAccept: */*\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);

        let head = decoder.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/api/items?q=1");
        assert_eq!(head.minor_version, 1);
        assert_eq!(head.protocol(), "HTTP/1.1");
        assert_eq!(head.headers.first("host"), Some("api.example.com"));
        assert!(head.keep_alive());
        assert_eq!(request_framing(&head.headers).unwrap(), BodyFraming::None);
    }

    #[tokio::test]
    async fn test_clean_close_between_requests() {
        let raw: &[u8] = b"";
        let mut decoder = HttpDecoder::new(raw);
        assert!(decoder.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mid_head_close_is_an_error() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: x";
        let mut decoder = HttpDecoder::new(raw);
        assert!(matches!(
            decoder.read_request_head().await,
            Err(ProxyError::HttpParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Fill: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(buffer::HEAD_MAX + 1024));
        let mut decoder = HttpDecoder::new(&raw[..]);
        assert!(matches!(
            decoder.read_request_head().await,
            Err(ProxyError::HeadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_malformed_head_rejected() {
        let raw: &[u8] = b"NOT A REQUEST\rAT ALL\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);
        assert!(matches!(
            decoder.read_request_head().await,
            Err(ProxyError::HttpParse { .. })
        ));
    }

    #[tokio::test]
    async fn test_content_length_body() {
        let raw: &[u8] = b"POST /upload HTTP/1.1\r\nContent-Length: 11\r\n\r\nhello world";
        let mut decoder = HttpDecoder::new(raw);
        let head = decoder.read_request_head().await.unwrap().unwrap();
        let framing = request_framing(&head.headers).unwrap();
        assert_eq!(framing, BodyFraming::ContentLength(11));

        let counter = Arc::new(AtomicU64::new(0));
        let mut reader = decoder.body_reader(framing).with_counter(Arc::clone(&counter));
        let chunks = drain(&mut reader).await;

        let total: usize = chunks.iter().map(BodyChunk::len).sum();
        assert_eq!(total, 11);
        assert!(chunks.last().unwrap().is_last());
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn test_zero_content_length_is_no_body() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "0");
        assert_eq!(request_framing(&headers).unwrap(), BodyFraming::None);
    }

    #[tokio::test]
    async fn test_bad_content_length_rejected() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "11; DROP");
        assert!(request_framing(&headers).is_err());
    }

    #[tokio::test]
    async fn test_chunked_body_decode() {
        let raw: &[u8] =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);
        let head = decoder.read_request_head().await.unwrap().unwrap();
        let framing = request_framing(&head.headers).unwrap();
        assert_eq!(framing, BodyFraming::Chunked);

        let mut reader = decoder.body_reader(framing);
        let chunks = drain(&mut reader).await;

        let body: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.data().iter().copied())
            .collect();
        assert_eq!(body, b"Wikipedia");
        assert!(chunks.last().unwrap().is_last());
        assert!(chunks.last().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunked_with_extension_and_trailer() {
        let raw: &[u8] =
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhello\r\n0\r\nX-Trailer: t\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);
        let head = decoder.read_request_head().await.unwrap().unwrap();
        let mut reader = decoder.body_reader(request_framing(&head.headers).unwrap());
        let chunks = drain(&mut reader).await;

        let body: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.data().iter().copied())
            .collect();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_bad_chunk_size_rejected() {
        let raw: &[u8] = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let mut decoder = HttpDecoder::new(raw);
        let head = decoder.read_request_head().await.unwrap().unwrap();
        let mut reader = decoder.body_reader(request_framing(&head.headers).unwrap());
        assert!(reader.next_chunk().await.is_err());
    }

    #[tokio::test]
    async fn test_response_head_and_sized_body() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nServer: origin\r\n\r\nok";
        let mut decoder = HttpDecoder::new(raw);

        let head = decoder.read_response_head().await.unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.headers.first("server"), Some("origin"));

        let framing = response_framing("GET", head.status, &head.headers).unwrap();
        assert_eq!(framing, BodyFraming::ContentLength(2));
    }

    #[tokio::test]
    async fn test_response_framing_rules() {
        let plain = Headers::new();
        assert_eq!(
            response_framing("GET", 204, &plain).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            response_framing("HEAD", 200, &plain).unwrap(),
            BodyFraming::None
        );
        assert_eq!(
            response_framing("GET", 200, &plain).unwrap(),
            BodyFraming::ReadToClose
        );
    }

    #[tokio::test]
    async fn test_read_to_close_body() {
        let raw: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nstreamed until eof";
        let mut decoder = HttpDecoder::new(raw);
        let head = decoder.read_response_head().await.unwrap();
        let framing = response_framing("GET", head.status, &head.headers).unwrap();

        let mut reader = decoder.body_reader(framing);
        let chunks = drain(&mut reader).await;
        let body: Vec<u8> = chunks
            .iter()
            .flat_map(|c| c.data().iter().copied())
            .collect();
        assert_eq!(body, b"streamed until eof");
        assert!(chunks.last().unwrap().is_last());
    }

    #[tokio::test]
    async fn test_owned_reader_outlives_head_parse() {
        fn streamed_body(raw: &'static [u8]) -> Box<dyn BodySource + Send> {
            let decoder = HttpDecoder::new(raw);
            Box::new(decoder.into_body_source(BodyFraming::Chunked))
        }

        let mut source = streamed_body(b"3\r\nabc\r\n3\r\ndef\r\n0\r\n\r\n");
        let mut body = Vec::new();
        while let Some(chunk) = source.next_chunk().await.unwrap() {
            body.extend_from_slice(chunk.data());
            if chunk.is_last() {
                break;
            }
        }
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn test_proxy_preamble_then_request() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&proxy_protocol::V2_SIGNATURE);
        raw.push(0x21);
        raw.push(0x11);
        raw.extend_from_slice(&12u16.to_be_bytes());
        raw.extend_from_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        raw.extend_from_slice(&51000u16.to_be_bytes());
        raw.extend_from_slice(&443u16.to_be_bytes());
        raw.extend_from_slice(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let mut decoder = HttpDecoder::new(&raw[..]);
        let preamble = decoder.read_proxy_preamble().await.unwrap().unwrap();
        let addresses = *preamble.addresses().unwrap();
        assert_eq!(addresses.source, "10.0.0.1:51000".parse().unwrap());

        // The preamble is gone; the head parses normally behind it
        let head = decoder.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.headers.first("host"), Some("x"));
    }

    #[tokio::test]
    async fn test_no_preamble_leaves_bytes_alone() {
        let raw: &[u8] = b"GET / HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);
        assert!(decoder.read_proxy_preamble().await.unwrap().is_none());
        let head = decoder.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.method, "GET");
    }

    #[tokio::test]
    async fn test_keep_alive_rules() {
        let mut close = Headers::new();
        close.add("Connection", "close");
        assert!(!keep_alive(1, &close));
        assert!(keep_alive(1, &Headers::new()));
        assert!(!keep_alive(0, &Headers::new()));

        let mut ka = Headers::new();
        ka.add("Connection", "keep-alive");
        assert!(keep_alive(0, &ka));
    }

    #[tokio::test]
    async fn test_two_requests_on_one_connection() {
        let raw: &[u8] =
            b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";
        let mut decoder = HttpDecoder::new(raw);

        let first = decoder.read_request_head().await.unwrap().unwrap();
        assert_eq!(first.target, "/a");
        let second = decoder.read_request_head().await.unwrap().unwrap();
        assert_eq!(second.target, "/b");
        assert!(decoder.read_request_head().await.unwrap().is_none());
    }
}
