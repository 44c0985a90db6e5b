//! Byte-stream transports shared by the `ra_svn` and HTTP connections.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::url::Scheme;
use crate::{SvnError, SvnUrl};

/// A bidirectional byte stream.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// A type-erased [`Stream`].
pub type BoxedStream = Box<dyn Stream>;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, SvnError>> + Send + 'a>>;

/// Opens transports for a repository URL.
///
/// Implement this to supply TLS, proxies, or in-memory test transports.
pub trait Connector: Send + Sync {
    /// Connects to the server named by `url`.
    fn connect<'a>(&'a self, url: &'a SvnUrl, timeout: Duration) -> ConnectFuture<'a>;
}

/// Where a connection is in its lifecycle.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No transport is open.
    #[default]
    Closed,
    /// The transport is being opened.
    Connecting,
    /// Protocol versions and capabilities are being exchanged.
    Handshaking,
    /// Credentials are being negotiated.
    Authenticating,
    /// Commands may be sent.
    Ready,
}

/// Plain TCP connector.
///
/// Connect attempts that time out are retried; any other connect error is
/// returned at once.
#[derive(Clone, Debug)]
pub struct TcpConnector {
    attempts: usize,
    nodelay: bool,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            attempts: 3,
            nodelay: true,
        }
    }
}

impl TcpConnector {
    /// Three attempts, `TCP_NODELAY` on.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of connect attempts (at least one).
    #[must_use]
    pub fn with_attempts(mut self, attempts: usize) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Enables or disables `TCP_NODELAY`.
    #[must_use]
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Opens a TCP stream to `url`.
    pub async fn connect_tcp(&self, url: &SvnUrl, timeout: Duration) -> Result<TcpStream, SvnError> {
        if url.scheme == Scheme::Https {
            return Err(SvnError::Transport(
                "https requires a TLS connector".to_string(),
            ));
        }
        let addr = url.socket_addr();
        for attempt in 1..=self.attempts {
            match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(stream)) => {
                    stream.set_nodelay(self.nodelay)?;
                    debug!(addr = %addr, attempt, "connected");
                    return Ok(stream);
                }
                Ok(Err(err)) => {
                    return Err(SvnError::Transport(format!(
                        "can't connect to '{addr}': {err}"
                    )));
                }
                Err(_) => debug!(addr = %addr, attempt, "connect timed out"),
            }
        }
        Err(SvnError::Transport(format!(
            "connect to '{addr}' timed out after {} attempts",
            self.attempts
        )))
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, url: &'a SvnUrl, timeout: Duration) -> ConnectFuture<'a> {
        Box::pin(async move {
            let stream = self.connect_tcp(url, timeout).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::future::Future;

    fn run_async<T>(f: impl Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    #[test]
    fn connects_to_a_listening_socket() {
        run_async(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

            let url = SvnUrl::parse(&format!("http://127.0.0.1:{port}/repo")).unwrap();
            let stream = TcpConnector::new()
                .connect_tcp(&url, Duration::from_secs(1))
                .await
                .unwrap();
            assert!(stream.nodelay().unwrap());
            accept.await.unwrap();
        });
    }

    #[test]
    fn refused_connections_fail_without_retry() {
        run_async(async {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let url = SvnUrl::parse(&format!("svn://127.0.0.1:{port}/repo")).unwrap();
            let err = match TcpConnector::new().connect(&url, Duration::from_secs(1)).await {
                Ok(_) => panic!("connect should fail"),
                Err(err) => err,
            };
            assert!(matches!(err, SvnError::Transport(msg) if msg.starts_with("can't connect")));
        });
    }

    #[test]
    fn https_needs_a_tls_connector() {
        run_async(async {
            let url = SvnUrl::parse("https://example.com/repo").unwrap();
            let err = TcpConnector::new()
                .connect_tcp(&url, Duration::from_secs(1))
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Transport(_)));
        });
    }
}
