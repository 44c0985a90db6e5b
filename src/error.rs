use thiserror::Error;

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// One error entry as returned by a server-side `failure` response.
pub struct ServerErrorItem {
    /// Subversion error code.
    pub code: u64,
    /// Human-readable error message (UTF-8, lossy-decoded).
    pub message: Option<String>,
    /// Source file on the server side, if provided.
    pub file: Option<String>,
    /// Source line on the server side, if provided.
    pub line: Option<u64>,
}

#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
/// A structured error chain returned by an `svnserve` `failure` response.
///
/// `context` is usually the command name.
pub struct ServerError {
    /// High-level context for the failure (for example, the command name).
    pub context: Option<String>,
    /// The server-provided error chain.
    pub chain: Vec<ServerErrorItem>,
}

impl ServerError {
    /// Attaches additional context to this error.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Returns a single-line summary of the error chain.
    pub fn message_summary(&self) -> String {
        let messages: Vec<&str> = self
            .chain
            .iter()
            .filter_map(|err| err.message.as_deref())
            .filter(|message| !message.is_empty())
            .collect();
        if messages.is_empty() {
            "unknown error".to_string()
        } else {
            messages.join("; ")
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ctx) = self.context.as_deref()
            && !ctx.is_empty()
        {
            write!(f, "{ctx}: ")?;
        }
        write!(f, "{}", self.message_summary())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
/// Errors returned by this crate.
pub enum SvnError {
    /// The provided URL is syntactically invalid or unsupported.
    #[error("invalid svn url: {0}")]
    InvalidUrl(String),
    /// The provided repository path is invalid or unsafe.
    #[error("invalid path: {0}")]
    InvalidPath(String),
    /// An I/O error on a network stream, a temporary file, or an input source.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The transport could not be established (connect refused, timed out
    /// after all attempts, SSH session failure).
    #[error("transport error: {0}")]
    Transport(String),
    /// The peer violated the wire protocol or the handshake could not agree
    /// on a version or capability.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server requested authentication but offered no supported mechanisms.
    #[error("auth required but no supported mechanism")]
    AuthUnavailable,
    /// No usable credential was accepted and the provider chain is exhausted.
    #[error("auth failed: {0}")]
    AuthFailed(String),
    /// The operation was cancelled, either by a cancellation check or because
    /// an interactive provider declined to supply credentials.
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// An HTTP request finished with a non-success status.
    #[error("request failed ({status}): {message}")]
    RequestFailed {
        /// HTTP status code.
        status: u16,
        /// Best-effort human-readable message from the response body.
        message: String,
    },
    /// An HTTP redirect that is not followed automatically.
    #[error("redirected: {0}")]
    Redirect(String),
    /// A line source could not be read while diffing or merging.
    #[error("sequence error: {0}")]
    Sequence(String),
    /// The server returned a `failure` response.
    #[error("server error: {0}")]
    Server(ServerError),
}

impl SvnError {
    /// Returns `true` for errors that mean "stop, the user asked for it".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SvnError::Cancelled(_))
    }

    /// Returns `true` for transport failures after which a fresh connection
    /// may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SvnError::Protocol(msg) => msg.contains("unexpected EOF"),
            SvnError::Io(io) => matches!(
                io.kind(),
                std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    pub(crate) fn sequence_io(err: std::io::Error) -> Self {
        SvnError::Sequence(err.to_string())
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        SvnError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}
