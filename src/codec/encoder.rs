//! HTTP/1.1 encoding for client responses and origin requests

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;
use crate::message::{BodyChunk, Headers, HttpMessage, HttpResponseMessage};

/// Standard reason phrase for a status code
#[must_use]
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        412 => "Precondition Failed",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a teapot",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

/// Align a response's framing headers with how its body will be written
///
/// A fully buffered body is sent with an exact `Content-Length`; a body
/// still streaming is switched to chunked transfer. Returns whether the
/// body writes should use chunked framing.
pub fn prepare_response_framing(response: &mut HttpResponseMessage) -> bool {
    if !response.has_body() {
        response.headers_mut().remove("transfer-encoding");
        if response.headers().first("content-length").is_none() {
            response.headers_mut().set("Content-Length", "0");
        }
        return false;
    }
    if response.has_complete_body() {
        let length = response.body_length();
        response.headers_mut().remove("transfer-encoding");
        response
            .headers_mut()
            .set("Content-Length", length.to_string());
        false
    } else {
        response.headers_mut().remove("content-length");
        response
            .headers_mut()
            .set("Transfer-Encoding", "chunked");
        true
    }
}

/// Buffered HTTP/1.1 encoder over one stream
#[derive(Debug)]
pub struct HttpEncoder<W> {
    stream: W,
}

impl<W: AsyncWrite + Unpin + Send> HttpEncoder<W> {
    #[must_use]
    pub fn new(stream: W) -> Self {
        Self { stream }
    }

    /// Write a status line and headers
    pub async fn write_response_head(
        &mut self,
        status: u16,
        headers: &Headers,
    ) -> Result<(), ProxyError> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
        for header in headers.iter() {
            head.push_str(header.name());
            head.push_str(": ");
            head.push_str(header.value());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes()).await?;
        Ok(())
    }

    /// Write a request line and headers
    pub async fn write_request_head(
        &mut self,
        method: &str,
        path_and_query: &str,
        headers: &Headers,
    ) -> Result<(), ProxyError> {
        let mut head = format!("{method} {path_and_query} HTTP/1.1\r\n");
        for header in headers.iter() {
            head.push_str(header.name());
            head.push_str(": ");
            head.push_str(header.value());
            head.push_str("\r\n");
        }
        head.push_str("\r\n");
        self.stream.write_all(head.as_bytes()).await?;
        Ok(())
    }

    /// Write one body chunk with the chosen framing
    ///
    /// With chunked framing the terminal chunk also emits the final
    /// `0\r\n\r\n`; empty non-terminal chunks are dropped because an
    /// empty chunk on the wire would end the body early.
    pub async fn write_chunk(&mut self, chunk: &BodyChunk, chunked: bool) -> Result<(), ProxyError> {
        if chunked {
            if !chunk.is_empty() {
                let size_line = format!("{:x}\r\n", chunk.len());
                self.stream.write_all(size_line.as_bytes()).await?;
                self.stream.write_all(chunk.data()).await?;
                self.stream.write_all(b"\r\n").await?;
            }
            if chunk.is_last() {
                self.stream.write_all(b"0\r\n\r\n").await?;
            }
        } else if !chunk.is_empty() {
            self.stream.write_all(chunk.data()).await?;
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), ProxyError> {
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), ProxyError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
