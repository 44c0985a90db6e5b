use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::auth::{AuthManager, Credential};
use crate::cancel::{Canceller, EventSink, NeverCancel, NoEvents};
use crate::path::rel_path;
use crate::rasvn::SvnItem;
use crate::rasvn::conn::{RaSvnConnection, RaSvnConnectionConfig};
use crate::rasvn::parse::{parse_get_file_response_params, parse_latest_rev, parse_node_kind};
use crate::rasvn::template::{self, Slot};
use crate::ssh::{self, SshSessionFactory};
use crate::transport::{BoxedStream, ConnectionState, Connector, TcpConnector};
use crate::url::Scheme;
use crate::{Capability, GetFileResult, NodeKind, ServerInfo, SvnError, SvnUrl};

const DEFAULT_RA_CLIENT: &str = concat!("svn-core/", env!("CARGO_PKG_VERSION"));

/// Factory for [`RaSvnSession`]s against one repository URL.
///
/// The client itself holds no connection. Every session opened from it gets
/// a clone of the configured [`AuthManager`], so sessions share the runtime
/// credential cache but negotiate independently.
#[derive(Clone)]
pub struct RaSvnClient {
    base_url: SvnUrl,
    auth: AuthManager,
    connector: Arc<dyn Connector>,
    ssh: Option<Arc<dyn SshSessionFactory>>,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    ra_client: String,
    canceller: Arc<dyn Canceller>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for RaSvnClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaSvnClient")
            .field("base_url", &self.base_url.url)
            .field("auth", &self.auth)
            .field("ssh", &self.ssh.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("ra_client", &self.ra_client)
            .finish_non_exhaustive()
    }
}

impl RaSvnClient {
    /// Creates a client for `base_url` with the runtime credential cache only.
    pub fn new(base_url: SvnUrl) -> Self {
        Self {
            base_url,
            auth: AuthManager::default(),
            connector: Arc::new(TcpConnector::new()),
            ssh: None,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            ra_client: DEFAULT_RA_CLIENT.to_string(),
            canceller: Arc::new(NeverCancel),
            events: Arc::new(NoEvents),
        }
    }

    /// Negotiates credentials with `auth`.
    #[must_use]
    pub fn with_auth_manager(mut self, auth: AuthManager) -> Self {
        self.auth = auth;
        self
    }

    /// Opens `svn://` transports with `connector` instead of plain TCP.
    #[must_use]
    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Opens `svn+ssh://` tunnels with `factory`.
    #[must_use]
    pub fn with_ssh_factory(mut self, factory: impl SshSessionFactory + 'static) -> Self {
        self.ssh = Some(Arc::new(factory));
        self
    }

    /// Sets the connect timeout (default 10s).
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the per-read timeout (default 60s).
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the per-write timeout (default 60s).
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the client name sent in the greeting.
    #[must_use]
    pub fn with_ra_client(mut self, ra_client: impl Into<String>) -> Self {
        self.ra_client = ra_client.into();
        self
    }

    /// Polls `canceller` before each handshake and command.
    #[must_use]
    pub fn with_canceller(mut self, canceller: Arc<dyn Canceller>) -> Self {
        self.canceller = canceller;
        self
    }

    /// Reports each completed command to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The repository URL sessions start at.
    pub fn base_url(&self) -> &SvnUrl {
        &self.base_url
    }

    /// The configured auth manager.
    pub fn auth_manager(&self) -> &AuthManager {
        &self.auth
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Write timeout.
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Connects, authenticates and returns a session.
    ///
    /// Sessions opened this way reconnect once when the transport drops
    /// under a command.
    pub async fn open_session(&self) -> Result<RaSvnSession, SvnError> {
        let conn = self.connect().await?;
        Ok(RaSvnSession::new(self.clone(), conn, true))
    }

    /// Runs the handshake over a caller-supplied stream.
    ///
    /// The stream cannot be reopened, so the session never reconnects.
    pub async fn open_session_with_stream<S>(&self, stream: S) -> Result<RaSvnSession, SvnError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let tunneled = self.base_url.scheme == Scheme::SvnSsh;
        let conn = self
            .handshake_over(Box::new(stream), tunneled, self.auth.clone())
            .await?;
        Ok(RaSvnSession::new(self.clone(), conn, false))
    }

    async fn connect(&self) -> Result<RaSvnConnection, SvnError> {
        self.canceller.check()?;
        let url = &self.base_url;
        debug!(url = %url, state = ?ConnectionState::Connecting, "opening ra_svn transport");
        let mut auth = self.auth.clone();
        match url.scheme {
            Scheme::Svn => {
                let stream = self.connector.connect(url, self.connect_timeout).await?;
                self.handshake_over(stream, false, auth).await
            }
            Scheme::SvnSsh => {
                let Some(factory) = self.ssh.as_deref() else {
                    return Err(SvnError::InvalidUrl(format!(
                        "'{url}' needs an SSH session factory"
                    )));
                };
                let stream = ssh::open_tunnel(factory, url, &mut auth, self.connect_timeout).await?;
                self.handshake_over(stream, true, auth).await
            }
            other => Err(SvnError::InvalidUrl(format!(
                "'{}' is not an ra_svn scheme",
                other.as_str()
            ))),
        }
    }

    async fn handshake_over(
        &self,
        stream: BoxedStream,
        is_tunneled: bool,
        auth: AuthManager,
    ) -> Result<RaSvnConnection, SvnError> {
        let mut conn = RaSvnConnection::from_stream(
            stream,
            RaSvnConnectionConfig {
                url: self.base_url.clone(),
                is_tunneled,
                ra_client: self.ra_client.clone(),
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                auth,
                canceller: Arc::clone(&self.canceller),
                events: Arc::clone(&self.events),
            },
        );
        conn.handshake().await?;
        Ok(conn)
    }
}

type CommandFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SvnError>> + Send + 'a>>;

/// A connected `ra_svn` session.
///
/// Holds one connection and the server info from its handshake. Commands
/// borrow the session mutably, so only one is in flight at a time.
pub struct RaSvnSession {
    client: RaSvnClient,
    conn: Option<RaSvnConnection>,
    server_info: ServerInfo,
    allow_reconnect: bool,
}

impl std::fmt::Debug for RaSvnSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaSvnSession")
            .field("url", &self.client.base_url.url)
            .field("state", &self.state())
            .field("allow_reconnect", &self.allow_reconnect)
            .finish_non_exhaustive()
    }
}

impl RaSvnSession {
    fn new(client: RaSvnClient, conn: RaSvnConnection, allow_reconnect: bool) -> Self {
        let server_info = conn.server_info().clone();
        Self {
            client,
            conn: Some(conn),
            server_info,
            allow_reconnect,
        }
    }

    /// The session URL.
    pub fn url(&self) -> &SvnUrl {
        &self.client.base_url
    }

    /// Server info from the most recent handshake.
    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    /// Repository UUID.
    pub fn repos_uuid(&self) -> &str {
        &self.server_info.repository.uuid
    }

    /// Repository root URL, if the server sent one.
    pub fn repos_root_url(&self) -> Option<&str> {
        let root = self.server_info.repository.root_url.as_str();
        (!root.is_empty()).then_some(root)
    }

    /// Returns `true` if the server advertised `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.server_info.has_capability(capability)
    }

    /// The connection's lifecycle state; [`ConnectionState::Closed`] once
    /// the transport was dropped.
    pub fn state(&self) -> ConnectionState {
        self.conn
            .as_ref()
            .map_or(ConnectionState::Closed, RaSvnConnection::state)
    }

    /// The credential the server accepted during the last handshake.
    pub fn last_valid_credential(&self) -> Option<&Credential> {
        self.conn
            .as_ref()
            .and_then(RaSvnConnection::last_valid_credential)
    }

    /// Closes the transport. Reconnecting sessions reopen it on the next
    /// command.
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            conn.close().await;
        }
    }

    /// Replaces the connection with a fresh one.
    pub async fn reconnect(&mut self) -> Result<(), SvnError> {
        if !self.allow_reconnect {
            return Err(SvnError::Protocol(
                "reconnect not supported for this session".to_string(),
            ));
        }
        self.close().await;
        let conn = self.client.connect().await?;
        self.server_info = conn.server_info().clone();
        self.conn = Some(conn);
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<(), SvnError> {
        let usable = match self.conn.as_mut() {
            Some(conn) if self.allow_reconnect => !conn.is_stale().await,
            Some(conn) => conn.state() == ConnectionState::Ready,
            None => false,
        };
        if !usable {
            self.reconnect().await?;
        }
        Ok(())
    }

    fn conn_mut(&mut self) -> Result<&mut RaSvnConnection, SvnError> {
        self.conn
            .as_mut()
            .ok_or_else(|| SvnError::Protocol("not connected".into()))
    }

    async fn with_retry<T, F>(&mut self, op: &'static str, mut f: F) -> Result<T, SvnError>
    where
        F: for<'a> FnMut(&'a mut RaSvnConnection) -> CommandFuture<'a, T>,
    {
        let mut attempt = 0usize;
        loop {
            self.ensure_connected().await?;
            let result = f(self.conn_mut()?).await;
            match result {
                Ok(v) => return Ok(v),
                Err(err) if attempt == 0 && self.allow_reconnect && err.is_retryable() => {
                    debug!(op, error = %err, "connection lost; reconnecting and retrying");
                    self.reconnect().await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Runs `get-latest-rev` and returns the youngest revision.
    pub async fn get_latest_rev(&mut self) -> Result<u64, SvnError> {
        self.with_retry("get-latest-rev", |conn| {
            Box::pin(async move {
                let response = conn
                    .call("get-latest-rev", SvnItem::List(Vec::new()))
                    .await?;
                parse_latest_rev(response.success_params("get-latest-rev")?)
            })
        })
        .await
    }

    /// Runs `check-path` for `path` relative to the session URL.
    ///
    /// `rev` of `None` asks about HEAD.
    pub async fn check_path(&mut self, path: &str, rev: Option<u64>) -> Result<NodeKind, SvnError> {
        let params = template::marshal(
            "s(?n)",
            &[Slot::String(rel_path(path, true)?), optional_rev(rev)],
        )?;
        self.with_retry("check-path", move |conn| {
            let params = params.clone();
            Box::pin(async move {
                let response = conn.call("check-path", params).await?;
                parse_node_kind(response.success_params("check-path")?)
            })
        })
        .await
    }

    /// Moves the session to `new_url` on the same server.
    pub async fn reparent(&mut self, new_url: SvnUrl) -> Result<(), SvnError> {
        if !self.client.base_url.same_server(&new_url) {
            return Err(SvnError::InvalidUrl(
                "reparent requires same host and port".to_string(),
            ));
        }

        let params = SvnItem::List(vec![SvnItem::string(&new_url.url)]);
        let session_url = new_url.clone();
        self.with_retry("reparent", move |conn| {
            let params = params.clone();
            let session_url = session_url.clone();
            Box::pin(async move {
                conn.call("reparent", params)
                    .await?
                    .ensure_success("reparent")?;
                conn.set_session_url(session_url);
                Ok(())
            })
        })
        .await?;

        debug!(url = %new_url, "reparented session");
        self.client.base_url = new_url;
        Ok(())
    }

    /// Streams the contents of `path` at `rev` (HEAD when `None`) into `out`.
    ///
    /// Fails once more than `max_bytes` arrive. A dropped connection is
    /// retried once, but only while nothing has been written to `out`.
    pub async fn get_file<W>(
        &mut self,
        path: &str,
        rev: Option<u64>,
        want_props: bool,
        out: &mut W,
        max_bytes: u64,
    ) -> Result<GetFileResult, SvnError>
    where
        W: AsyncWrite + Unpin,
    {
        let params = template::marshal(
            "s(?n)ttt",
            &[
                Slot::String(rel_path(path, false)?),
                optional_rev(rev),
                Slot::Bool(want_props),
                Slot::Bool(true),
                Slot::Bool(false),
            ],
        )?;

        let mut attempt = 0usize;
        loop {
            self.ensure_connected().await?;
            let mut written = 0u64;
            let result = fetch_file(self.conn_mut()?, &params, out, max_bytes, &mut written).await;
            match result {
                Ok(result) => return Ok(result),
                Err(err)
                    if attempt == 0
                        && written == 0
                        && self.allow_reconnect
                        && err.is_retryable() =>
                {
                    debug!(error = %err, "get-file connection lost before data; reconnecting");
                    self.reconnect().await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn fetch_file<W>(
    conn: &mut RaSvnConnection,
    params: &SvnItem,
    out: &mut W,
    max_bytes: u64,
    written: &mut u64,
) -> Result<GetFileResult, SvnError>
where
    W: AsyncWrite + Unpin,
{
    let response = conn.call("get-file", params.clone()).await?;
    let meta = parse_get_file_response_params(response.success_params("get-file")?)?;

    loop {
        let item = conn.read_stream_item().await?;
        let Some(chunk) = item.as_bytes() else {
            conn.close().await;
            return Err(SvnError::Protocol(format!(
                "expected file chunk string, got {}",
                item.kind()
            )));
        };
        if chunk.is_empty() {
            break;
        }
        *written = written.saturating_add(chunk.len() as u64);
        if *written > max_bytes {
            conn.close().await;
            return Err(SvnError::Protocol(format!(
                "downloaded file exceeds limit {max_bytes}"
            )));
        }
        out.write_all(chunk).await?;
    }
    out.flush().await?;

    conn.read_final_response()
        .await?
        .ensure_success("get-file")?;

    Ok(GetFileResult {
        rev: meta.rev,
        checksum: meta.checksum,
        props: meta.props,
        bytes_written: *written,
    })
}

fn optional_rev(rev: Option<u64>) -> Slot {
    Slot::List(rev.map(Slot::Number).into_iter().collect())
}
