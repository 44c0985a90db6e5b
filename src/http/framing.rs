use std::future::Future;
use std::io::Write;
use std::time::Duration;

use flate2::write::GzDecoder;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream};

use super::{Depth, Headers, HttpStatus, RequestBody, ResponseHandler};
use crate::SvnError;
use crate::transport::BoxedStream;

const MAX_LINE: usize = 64 * 1024;
const MAX_HEADERS: usize = 256;
const CHUNK_SIZE: usize = 32 * 1024;

/// How a response body is delimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

impl BodyFraming {
    pub(crate) fn for_response(method: &str, status: &HttpStatus) -> Result<Self, SvnError> {
        if method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status.code)
            || status.code == 204
            || status.code == 304
        {
            return Ok(BodyFraming::Empty);
        }
        if status.headers.has_token("Transfer-Encoding", "chunked") {
            return Ok(BodyFraming::Chunked);
        }
        match status.headers.get("Content-Length") {
            Some(len) => len
                .trim()
                .parse()
                .map(BodyFraming::Length)
                .map_err(|_| SvnError::Protocol(format!("invalid Content-Length '{len}'"))),
            None => Ok(BodyFraming::UntilClose),
        }
    }
}

/// Undoes `Content-Encoding` before bytes reach the handler.
enum ContentDecoder {
    Identity,
    Gzip(GzDecoder<Vec<u8>>),
}

impl ContentDecoder {
    fn for_headers(headers: &Headers) -> Self {
        if headers.has_token("Content-Encoding", "gzip") || headers.has_token("Content-Encoding", "x-gzip") {
            ContentDecoder::Gzip(GzDecoder::new(Vec::new()))
        } else {
            ContentDecoder::Identity
        }
    }

    fn feed(&mut self, bytes: &[u8], handler: &mut dyn ResponseHandler) -> Result<(), SvnError> {
        match self {
            ContentDecoder::Identity => handler.body(bytes),
            ContentDecoder::Gzip(decoder) => {
                decoder.write_all(bytes).map_err(gzip_error)?;
                let out = decoder.get_mut();
                if !out.is_empty() {
                    handler.body(out)?;
                    out.clear();
                }
                Ok(())
            }
        }
    }

    fn finish(self, handler: &mut dyn ResponseHandler) -> Result<(), SvnError> {
        match self {
            ContentDecoder::Identity => Ok(()),
            ContentDecoder::Gzip(decoder) => {
                let rest = decoder.finish().map_err(gzip_error)?;
                if rest.is_empty() { Ok(()) } else { handler.body(&rest) }
            }
        }
    }
}

fn gzip_error(err: std::io::Error) -> SvnError {
    SvnError::Protocol(format!("invalid gzip body: {err}"))
}

async fn timed<T>(
    limit: Duration,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, SvnError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(SvnError::Io),
        Err(_) => Err(SvnError::timed_out("read")),
    }
}

fn unexpected_eof() -> SvnError {
    SvnError::Protocol("unexpected EOF".to_string())
}

/// The fields of a request head.
pub(crate) struct RequestHead<'a> {
    pub(crate) method: &'a str,
    pub(crate) target: &'a str,
    pub(crate) host: &'a str,
    pub(crate) user_agent: &'a str,
    pub(crate) depth: Option<Depth>,
    pub(crate) label: Option<&'a str>,
    pub(crate) headers: &'a [(String, String)],
    pub(crate) authorization: Option<&'a str>,
}

impl RequestHead<'_> {
    pub(crate) fn render(&self, body: &RequestBody) -> String {
        let mut head = format!("{} {} HTTP/1.1\r\n", self.method, self.target);
        head.push_str(&format!("Host: {}\r\n", self.host));
        head.push_str(&format!("User-Agent: {}\r\n", self.user_agent));
        head.push_str("Keep-Alive: \r\n");
        head.push_str("Connection: TE, Keep-Alive\r\n");
        head.push_str("TE: trailers\r\n");
        match body {
            RequestBody::Empty => head.push_str("Content-Length: 0\r\n"),
            RequestBody::Bytes(bytes) => head.push_str(&format!("Content-Length: {}\r\n", bytes.len())),
            RequestBody::Stream(_) => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
        head.push_str("Accept-Encoding: gzip\r\n");
        if !self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("Content-Type"))
        {
            head.push_str("Content-Type: text/xml; charset=\"utf-8\"\r\n");
        }
        if let Some(authorization) = self.authorization {
            head.push_str(&format!("Authorization: {authorization}\r\n"));
        }
        if let Some(depth) = self.depth {
            head.push_str(&format!("Depth: {}\r\n", depth.as_str()));
        }
        if let Some(label) = self.label {
            head.push_str(&format!("Label: {label}\r\n"));
        }
        for (name, value) in self.headers {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
        head.push_str("\r\n");
        head
    }
}

/// Collapses repeated slashes and percent-encodes bytes not allowed in a
/// request target.
pub(crate) fn request_target(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    if !path.starts_with('/') {
        out.push('/');
    }
    let mut prev_slash = false;
    for byte in path.bytes() {
        if byte == b'/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        let safe = byte.is_ascii_alphanumeric() || b"-._~!$&'()*+,;=:@/%".contains(&byte);
        if safe {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// A buffered HTTP transport.
pub(crate) struct Wire {
    io: BufStream<BoxedStream>,
    read_timeout: Duration,
}

impl Wire {
    pub(crate) fn new(stream: BoxedStream, read_timeout: Duration) -> Self {
        Self {
            io: BufStream::new(stream),
            read_timeout,
        }
    }

    /// Writes the head and the body. A streamed body is drained.
    pub(crate) async fn send(&mut self, head: &str, body: &mut RequestBody) -> Result<(), SvnError> {
        self.io.write_all(head.as_bytes()).await?;
        match body {
            RequestBody::Empty => {}
            RequestBody::Bytes(bytes) => self.io.write_all(bytes).await?,
            RequestBody::Stream(reader) => {
                let mut chunk = vec![0u8; CHUNK_SIZE];
                loop {
                    let n = reader.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    self.io.write_all(format!("{n:x}\r\n").as_bytes()).await?;
                    self.io.write_all(&chunk[..n]).await?;
                    self.io.write_all(b"\r\n").await?;
                }
                self.io.write_all(b"0\r\n\r\n").await?;
            }
        }
        self.io.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, SvnError> {
        let mut line = Vec::new();
        let read_timeout = self.read_timeout;
        let n = timed(read_timeout, (&mut self.io).take(MAX_LINE as u64).read_until(b'\n', &mut line)).await?;
        if n == 0 {
            return Err(unexpected_eof());
        }
        if line.last() != Some(&b'\n') {
            return Err(SvnError::Protocol("header line too long".to_string()));
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }

    /// Reads the status line and header block.
    pub(crate) async fn read_head(&mut self) -> Result<HttpStatus, SvnError> {
        let mut line = self.read_line().await?;
        // Tolerate a stray CRLF left over from a previous body.
        if line.is_empty() {
            line = self.read_line().await?;
        }
        let mut parts = line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        let code = parts.next().and_then(|c| c.parse::<u16>().ok());
        let (true, Some(code)) = (version.starts_with("HTTP/"), code) else {
            return Err(SvnError::Protocol(format!("invalid status line '{line}'")));
        };
        let reason = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = Headers::default();
        for _ in 0..MAX_HEADERS {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(HttpStatus { code, reason, headers });
            }
            if line.starts_with([' ', '\t']) {
                headers.append_to_last(&line);
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                return Err(SvnError::Protocol(format!("invalid header line '{line}'")));
            };
            headers.push(name.trim().to_string(), value.trim().to_string());
        }
        Err(SvnError::Protocol("too many response headers".to_string()))
    }

    /// Reads a body with `framing`, decoding it into `handler`.
    pub(crate) async fn read_body(
        &mut self,
        framing: BodyFraming,
        headers: &Headers,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), SvnError> {
        let mut decoder = ContentDecoder::for_headers(headers);
        match framing {
            BodyFraming::Empty => return Ok(()),
            BodyFraming::Length(len) => self.copy(Some(len), &mut decoder, handler).await?,
            BodyFraming::UntilClose => self.copy(None, &mut decoder, handler).await?,
            BodyFraming::Chunked => loop {
                let line = self.read_line().await?;
                let size = line.split(';').next().unwrap_or_default().trim();
                let size = u64::from_str_radix(size, 16)
                    .map_err(|_| SvnError::Protocol(format!("invalid chunk size '{line}'")))?;
                if size == 0 {
                    // Trailers.
                    while !self.read_line().await?.is_empty() {}
                    break;
                }
                self.copy(Some(size), &mut decoder, handler).await?;
                if !self.read_line().await?.is_empty() {
                    return Err(SvnError::Protocol("missing CRLF after chunk".to_string()));
                }
            },
        }
        decoder.finish(handler)
    }

    /// Copies `len` bytes, or everything up to EOF when `len` is `None`.
    async fn copy(
        &mut self,
        len: Option<u64>,
        decoder: &mut ContentDecoder,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), SvnError> {
        let mut remaining = len;
        let read_timeout = self.read_timeout;
        while remaining != Some(0) {
            let available = timed(read_timeout, self.io.fill_buf()).await?;
            if available.is_empty() {
                return match remaining {
                    None => Ok(()),
                    Some(_) => Err(unexpected_eof()),
                };
            }
            let n = match remaining {
                Some(left) => available.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
                None => available.len(),
            };
            decoder.feed(&available[..n], handler)?;
            self.io.consume(n);
            remaining = remaining.map(|left| left - n as u64);
        }
        Ok(())
    }

    /// Returns `true` if the peer closed the connection or sent bytes nobody
    /// asked for.
    pub(crate) async fn is_stale(&mut self) -> bool {
        tokio::time::timeout(Duration::from_millis(1), self.io.fill_buf())
            .await
            .is_ok()
    }

    pub(crate) async fn shutdown(mut self) {
        let _ = self.io.shutdown().await;
    }
}
