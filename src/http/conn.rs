use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::challenge::{self, Challenge};
use super::framing::{BodyFraming, RequestHead, Wire, request_target};
use super::{DiscardBody, HttpRequest, HttpStatus, ResponseHandler, error_message};
use crate::auth::{AuthManager, Credential, CredentialKind, qualified_realm};
use crate::cancel::{Canceller, Event, EventSink, NeverCancel, NoEvents};
use crate::transport::{ConnectionState, Connector};
use crate::{SvnError, SvnUrl};

const DEFAULT_USER_AGENT: &str = concat!("svn-core/", env!("CARGO_PKG_VERSION"));

/// A kept-alive HTTP/1.1 connection to one server.
///
/// Requests are sent one at a time. Before each request the transport is
/// probed and reopened if the server closed it. The credential that last
/// succeeded is offered again on the next request.
pub struct HttpConnection {
    url: SvnUrl,
    connector: Arc<dyn Connector>,
    wire: Option<Wire>,
    state: ConnectionState,
    auth: Option<AuthManager>,
    challenge: Option<Challenge>,
    last_valid: Option<Credential>,
    nonce_count: u32,
    user_agent: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    canceller: Arc<dyn Canceller>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("url", &self.url.url)
            .field("state", &self.state)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl HttpConnection {
    /// Creates a closed connection to the server of `url`.
    pub fn new(url: SvnUrl, connector: impl Connector + 'static) -> Self {
        Self {
            url,
            connector: Arc::new(connector),
            wire: None,
            state: ConnectionState::Closed,
            auth: None,
            challenge: None,
            last_valid: None,
            nonce_count: 0,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            canceller: Arc::new(NeverCancel),
            events: Arc::new(NoEvents),
        }
    }

    /// Answers authentication challenges from `auth`.
    #[must_use]
    pub fn with_auth_manager(mut self, auth: AuthManager) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Sets the `User-Agent` header.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Sets the connect timeout (default 10s).
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the read timeout (default 60s).
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Polls `canceller` before each request attempt.
    #[must_use]
    pub fn with_canceller(mut self, canceller: Arc<dyn Canceller>) -> Self {
        self.canceller = canceller;
        self
    }

    /// Reports each completed request to `events`.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The server URL.
    pub fn url(&self) -> &SvnUrl {
        &self.url
    }

    /// The current lifecycle state.
    ///
    /// HTTP has no session handshake: a connection goes from `Connecting`
    /// straight to `Ready`, and reports `Authenticating` only while answering
    /// a challenge.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The credential accepted by the last request, if any.
    pub fn last_valid_credential(&self) -> Option<&Credential> {
        self.last_valid.as_ref()
    }

    /// Closes the transport. The next request reconnects.
    pub async fn close(&mut self) {
        if let Some(wire) = self.wire.take() {
            wire.shutdown().await;
        }
        self.state = ConnectionState::Closed;
    }

    /// Sends `request` and streams the decoded response body to `handler`.
    ///
    /// `401`/`403` challenges are answered from the auth manager until a
    /// credential is accepted or the chain is exhausted. A redirect is
    /// followed only when it adds a trailing slash to the requested path;
    /// any other redirect is returned as [`SvnError::Redirect`]. A status
    /// outside the request's accepted codes becomes
    /// [`SvnError::RequestFailed`]. Any error closes the transport.
    pub async fn request(
        &mut self,
        request: HttpRequest,
        handler: &mut dyn ResponseHandler,
    ) -> Result<HttpStatus, SvnError> {
        let method = request.method.clone();
        let result = self.send_request(request, handler).await;
        match &result {
            Ok(status) => self.emit(&method, status.code),
            Err(err) => {
                if let SvnError::RequestFailed { status, .. } = err {
                    self.emit(&method, *status);
                }
                self.close().await;
            }
        }
        result
    }

    /// Sends `request` and returns the status with the whole body.
    pub async fn request_bytes(&mut self, request: HttpRequest) -> Result<(HttpStatus, Vec<u8>), SvnError> {
        let mut body = Vec::new();
        let status = self.request(request, &mut body).await?;
        Ok((status, body))
    }

    fn emit(&self, method: &str, status: u16) {
        self.events.on_event(&Event::RequestCompleted {
            method: method.to_string(),
            status,
        });
    }

    async fn send_request(
        &mut self,
        mut request: HttpRequest,
        handler: &mut dyn ResponseHandler,
    ) -> Result<HttpStatus, SvnError> {
        let mut path = if request.path.is_empty() {
            "/".to_string()
        } else {
            request.path.clone()
        };
        let mut credential = self.last_valid.take();
        let mut realm: Option<String> = None;

        loop {
            self.canceller.check()?;
            self.ensure_open().await?;

            let target = request_target(&path);
            let authorization = match (&credential, &self.challenge) {
                (Some(credential), Some(challenge)) => Some(challenge.authorization(
                    credential,
                    &request.method,
                    &target,
                    &mut self.nonce_count,
                )?),
                _ => None,
            };
            let host = self.url.socket_addr();
            let head = RequestHead {
                method: &request.method,
                target: &target,
                host: &host,
                user_agent: &self.user_agent,
                depth: request.depth,
                label: request.label.as_deref(),
                headers: &request.headers,
                authorization: authorization.as_deref(),
            }
            .render(&request.body);

            let wire = self.wire_mut()?;
            wire.send(&head, &mut request.body).await?;
            let status = wire.read_head().await?;
            debug!(method = %request.method, path = %target, status = status.code, "http response");

            match status.code {
                401 | 403 => {
                    self.skip_body(&request.method, &status).await;
                    let challenges =
                        challenge::parse_challenges(status.headers.get_all("WWW-Authenticate"));
                    if challenges.is_empty() {
                        return Err(SvnError::RequestFailed {
                            status: status.code,
                            message: format!("access forbidden: '{path}'"),
                        });
                    }
                    let Some(chosen) = challenge::select(&challenges).cloned() else {
                        let schemes: Vec<&str> = challenges.iter().map(|c| c.scheme.as_str()).collect();
                        return Err(SvnError::AuthFailed(format!(
                            "authentication challenge '{}' is not supported",
                            schemes.join(", ")
                        )));
                    };
                    if !request.body.is_replayable() {
                        return Err(SvnError::AuthFailed(
                            "authentication failed: streamed request body cannot be resent".to_string(),
                        ));
                    }
                    let qualified = match chosen.realm() {
                        Some(name) => qualified_realm(&self.url, name),
                        None => format!("<{}>", self.url.server_root()),
                    };
                    let Some(auth) = self.auth.as_mut() else {
                        return Err(SvnError::AuthFailed(format!(
                            "authentication required for '{qualified}'"
                        )));
                    };
                    self.state = ConnectionState::Authenticating;
                    let next = match credential.take() {
                        None => auth.first(CredentialKind::Password, &qualified, Some(&self.url))?,
                        Some(rejected) => {
                            let reason = format!("{} {}", status.code, status.reason);
                            auth.acknowledge(
                                false,
                                CredentialKind::Password,
                                &qualified,
                                Some(&reason),
                                &rejected,
                            );
                            auth.next(CredentialKind::Password, &qualified, Some(&self.url))?
                        }
                    };
                    debug!(
                        realm = %qualified,
                        scheme = %chosen.scheme,
                        username = next.username(),
                        "retrying request with credentials"
                    );
                    credential = Some(next);
                    self.challenge = Some(chosen);
                    self.nonce_count = 0;
                    realm = Some(qualified);
                }
                301 | 302 => {
                    self.skip_body(&request.method, &status).await;
                    let Some(location) = status.headers.get("Location").map(str::to_string) else {
                        return Err(SvnError::Redirect(format!(
                            "HTTP {} {} without a Location header",
                            status.code, status.reason
                        )));
                    };
                    if request.body.is_replayable()
                        && location_path(&location)
                            .is_some_and(|new_path| is_trailing_slash_variant(&path, new_path))
                    {
                        debug!(from = %path, to = %location, "following trailing-slash redirect");
                        path.push_str("//");
                        continue;
                    }
                    return Err(SvnError::Redirect(format!(
                        "HTTP {} {}: {location}",
                        status.code, status.reason
                    )));
                }
                _ => {
                    if let (Some(credential), Some(realm), Some(auth)) =
                        (&credential, &realm, self.auth.as_mut())
                    {
                        auth.acknowledge(true, CredentialKind::Password, realm, None, credential);
                    }
                    self.last_valid = credential;
                    self.state = ConnectionState::Ready;
                    if !request.accepts(status.code) {
                        let message = self.read_error(&request.method, &path, &status).await;
                        return Err(SvnError::RequestFailed {
                            status: status.code,
                            message,
                        });
                    }
                    handler.start(&status)?;
                    self.consume_body(&request.method, &status, handler).await?;
                    handler.finish()?;
                    return Ok(status);
                }
            }
        }
    }

    fn wire_mut(&mut self) -> Result<&mut Wire, SvnError> {
        self.wire
            .as_mut()
            .ok_or_else(|| SvnError::Protocol("connection is closed".to_string()))
    }

    async fn ensure_open(&mut self) -> Result<(), SvnError> {
        let stale = match self.wire.as_mut() {
            Some(wire) => wire.is_stale().await,
            None => false,
        };
        if stale {
            debug!(url = %self.url.url, "dropping stale connection");
            self.close().await;
        }
        if self.wire.is_none() {
            self.state = ConnectionState::Connecting;
            let stream = self.connector.connect(&self.url, self.connect_timeout).await?;
            self.wire = Some(Wire::new(stream, self.read_timeout));
            self.state = ConnectionState::Ready;
        }
        Ok(())
    }

    async fn consume_body(
        &mut self,
        method: &str,
        status: &HttpStatus,
        handler: &mut dyn ResponseHandler,
    ) -> Result<(), SvnError> {
        let framing = BodyFraming::for_response(method, status)?;
        self.wire_mut()?
            .read_body(framing, &status.headers, handler)
            .await?;
        if framing == BodyFraming::UntilClose
            || status.headers.has_token("Connection", "close")
            || status.headers.has_token("Proxy-Connection", "close")
        {
            self.close().await;
        }
        Ok(())
    }

    /// Drains the body of a response that is about to be retried, then
    /// closes the transport.
    async fn skip_body(&mut self, method: &str, status: &HttpStatus) {
        if let Err(err) = self.consume_body(method, status, &mut DiscardBody).await {
            debug!(error = %err, "failed to drain response body");
        }
        self.close().await;
    }

    async fn read_error(&mut self, method: &str, path: &str, status: &HttpStatus) -> String {
        if status.code == 404 {
            return format!("'{path}' path not found");
        }
        let mut body = Vec::new();
        let text = match self.consume_body(method, status, &mut body).await {
            Ok(()) => error_message(&String::from_utf8_lossy(&body)),
            Err(err) => {
                debug!(error = %err, "failed to read error body");
                String::new()
            }
        };
        if text.is_empty() {
            format!("{method} request failed on '{path}'")
        } else {
            text
        }
    }
}

/// The path part of a `Location` header value.
fn location_path(location: &str) -> Option<&str> {
    if let Some(scheme_end) = location.find("://") {
        let rest = &location[scheme_end + 3..];
        return Some(rest.find('/').map_or("/", |i| &rest[i..]));
    }
    location.starts_with('/').then_some(location)
}

/// `new_path` is `path` with one trailing slash added.
fn is_trailing_slash_variant(path: &str, new_path: &str) -> bool {
    !path.ends_with('/')
        && !new_path.ends_with("//")
        && new_path.strip_suffix('/') == Some(request_target(path).as_str())
}
