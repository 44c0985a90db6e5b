//! HTTP/WebDAV transport.
//!
//! [`HttpConnection`] sends one request at a time over a kept-alive
//! connection, answering `401`/`403` challenges through an
//! [`AuthManager`](crate::auth::AuthManager) and following trailing-slash
//! redirects once. Response bodies are de-chunked and gunzipped before they
//! reach a [`ResponseHandler`].

mod challenge;
mod conn;
mod framing;

pub use challenge::{Challenge, parse_challenges};
pub use conn::HttpConnection;

use tokio::io::AsyncRead;

use crate::SvnError;

/// Value of the `Depth` header.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Depth {
    /// `Depth: 0`
    Zero,
    /// `Depth: 1`
    One,
    /// `Depth: infinity`
    Infinity,
}

impl Depth {
    /// Returns the header value.
    pub fn as_str(self) -> &'static str {
        match self {
            Depth::Zero => "0",
            Depth::One => "1",
            Depth::Infinity => "infinity",
        }
    }
}

/// A request body.
#[derive(Default)]
pub enum RequestBody {
    /// No body; sent with `Content-Length: 0`.
    #[default]
    Empty,
    /// A buffered body. It is resent as-is after an authentication retry.
    Bytes(Vec<u8>),
    /// A streamed body, sent with chunked transfer encoding. It can only be
    /// sent once, so a request that needs to be replayed fails.
    Stream(Box<dyn AsyncRead + Unpin + Send>),
}

impl std::fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestBody::Empty => f.write_str("Empty"),
            RequestBody::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            RequestBody::Stream(_) => f.write_str("Stream"),
        }
    }
}

impl RequestBody {
    pub(crate) fn is_replayable(&self) -> bool {
        !matches!(self, RequestBody::Stream(_))
    }
}

/// One HTTP request.
#[derive(Debug)]
#[must_use]
pub struct HttpRequest {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) depth: Option<Depth>,
    pub(crate) label: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: RequestBody,
    pub(crate) ok_codes: Vec<u16>,
}

impl HttpRequest {
    /// A request for `method` on the absolute `path`.
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            depth: None,
            label: None,
            headers: Vec::new(),
            body: RequestBody::Empty,
            ok_codes: Vec::new(),
        }
    }

    /// Sends a `Depth` header.
    pub fn depth(mut self, depth: Depth) -> Self {
        self.depth = Some(depth);
        self
    }

    /// Sends a `Label` header.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Adds a header. A `Content-Type` given here replaces the default
    /// `text/xml; charset="utf-8"`.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Accepts only these status codes as success. The default is any `2xx`.
    pub fn ok_codes(mut self, codes: &[u16]) -> Self {
        self.ok_codes = codes.to_vec();
        self
    }

    /// The method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn accepts(&self, status: u16) -> bool {
        if self.ok_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.ok_codes.contains(&status)
        }
    }
}

/// Response headers in arrival order. Lookups ignore case.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub(crate) fn push(&mut self, name: String, value: String) {
        self.0.push((name, value));
    }

    pub(crate) fn append_to_last(&mut self, continuation: &str) {
        if let Some((_, value)) = self.0.last_mut() {
            value.push(' ');
            value.push_str(continuation.trim());
        }
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of `name`.
    pub fn get_all<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a str> + use<'a, 'b> {
        self.0
            .iter()
            .filter(move |(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Returns `true` if a comma-separated value of `name` equals `token`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|value| value.split(','))
            .any(|item| item.trim().eq_ignore_ascii_case(token))
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Status line and headers of a response.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpStatus {
    /// Status code.
    pub code: u16,
    /// Reason phrase.
    pub reason: String,
    /// Response headers.
    pub headers: Headers,
}

impl HttpStatus {
    /// Returns `true` for `2xx`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Consumes a decoded response body.
pub trait ResponseHandler: Send {
    /// Called once with the final status before any body bytes.
    fn start(&mut self, _status: &HttpStatus) -> Result<(), SvnError> {
        Ok(())
    }

    /// Called with each piece of the decoded body.
    fn body(&mut self, bytes: &[u8]) -> Result<(), SvnError>;

    /// Called after the last body byte.
    fn finish(&mut self) -> Result<(), SvnError> {
        Ok(())
    }
}

impl ResponseHandler for Vec<u8> {
    fn body(&mut self, bytes: &[u8]) -> Result<(), SvnError> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Drops the body.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardBody;

impl ResponseHandler for DiscardBody {
    fn body(&mut self, _bytes: &[u8]) -> Result<(), SvnError> {
        Ok(())
    }
}

/// Extracts the message of a `mod_dav_svn` error body.
///
/// Returns the trimmed text of the `<m:human-readable>` element, or the
/// whole body when there is none.
pub fn error_message(body: &str) -> String {
    let Some(start) = body.find("<m:human-readable") else {
        return body.trim().to_string();
    };
    let rest = &body[start..];
    let Some(open_end) = rest.find('>') else {
        return String::new();
    };
    let text = &rest[open_end + 1..];
    let text = match text.find("</m:human-readable>") {
        Some(end) => &text[..end],
        None => text,
    };
    text.trim().to_string()
}
