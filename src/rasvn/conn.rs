use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use md5::Md5;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::auth::{AuthManager, Credential, CredentialKind, qualified_realm};
use crate::cancel::{Canceller, Event, EventSink};
use crate::transport::{BoxedStream, ConnectionState};
use crate::{Capability, ServerInfo, SvnError, SvnUrl};

use super::SvnItem;
use super::item::encode_command;
use super::parse::{
    AuthRequest, Challenge, parse_auth_request, parse_challenge, parse_greeting,
    parse_repos_info, parse_server_error,
};
use super::reader::{DynRead, ItemReader};
use super::template::{self, Slot};

type DynWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// A SASL mechanism this client can drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mechanism {
    External,
    Anonymous,
    CramMd5,
    Plain,
}

impl Mechanism {
    fn from_word(word: &str) -> Option<Self> {
        match word {
            "EXTERNAL" => Some(Self::External),
            "ANONYMOUS" => Some(Self::Anonymous),
            "CRAM-MD5" => Some(Self::CramMd5),
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }

    fn as_word(self) -> &'static str {
        match self {
            Self::External => "EXTERNAL",
            Self::Anonymous => "ANONYMOUS",
            Self::CramMd5 => "CRAM-MD5",
            Self::Plain => "PLAIN",
        }
    }

    fn needs_password(self) -> bool {
        matches!(self, Self::CramMd5 | Self::Plain)
    }
}

#[derive(Debug)]
pub(crate) struct CommandResponse {
    success: bool,
    params: Vec<SvnItem>,
    errors: Vec<SvnItem>,
}

impl CommandResponse {
    pub(crate) fn success_params(&self, ctx: &str) -> Result<&[SvnItem], SvnError> {
        if self.success {
            Ok(&self.params)
        } else {
            Err(self.failure(ctx))
        }
    }

    pub(crate) fn ensure_success(&self, ctx: &str) -> Result<(), SvnError> {
        self.success_params(ctx).map(|_| ())
    }

    pub(crate) fn failure(&self, ctx: &str) -> SvnError {
        SvnError::Server(parse_server_error(&self.errors).with_context(ctx))
    }
}

pub(crate) struct RaSvnConnectionConfig {
    pub(crate) url: SvnUrl,
    pub(crate) is_tunneled: bool,
    pub(crate) ra_client: String,
    pub(crate) read_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) auth: AuthManager,
    pub(crate) canceller: Arc<dyn Canceller>,
    pub(crate) events: Arc<dyn EventSink>,
}

/// One `ra_svn` conversation with a server.
///
/// The connection starts in [`ConnectionState::Handshaking`] because the
/// transport is already open. Any error other than a server `failure`
/// response closes it.
pub(crate) struct RaSvnConnection {
    reader: ItemReader,
    write: DynWrite,
    write_buf: Vec<u8>,
    write_timeout: Duration,
    url: SvnUrl,
    is_tunneled: bool,
    ra_client: String,
    auth: AuthManager,
    last_valid: Option<Credential>,
    canceller: Arc<dyn Canceller>,
    events: Arc<dyn EventSink>,
    state: ConnectionState,
    info: ServerInfo,
}

impl RaSvnConnection {
    pub(crate) fn new(read: DynRead, write: DynWrite, config: RaSvnConnectionConfig) -> Self {
        Self {
            reader: ItemReader::new(read, config.read_timeout),
            write,
            write_buf: Vec::new(),
            write_timeout: config.write_timeout,
            url: config.url,
            is_tunneled: config.is_tunneled,
            ra_client: config.ra_client,
            auth: config.auth,
            last_valid: None,
            canceller: config.canceller,
            events: config.events,
            state: ConnectionState::Handshaking,
            info: ServerInfo::default(),
        }
    }

    pub(crate) fn from_stream(stream: BoxedStream, config: RaSvnConnectionConfig) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self::new(Box::new(read), Box::new(write), config)
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn server_info(&self) -> &ServerInfo {
        &self.info
    }

    pub(crate) fn set_session_url(&mut self, url: SvnUrl) {
        self.url = url;
    }

    pub(crate) fn last_valid_credential(&self) -> Option<&Credential> {
        self.last_valid.as_ref()
    }

    /// Runs greeting, authentication and `repos-info`.
    pub(crate) async fn handshake(&mut self) -> Result<ServerInfo, SvnError> {
        let result = self.handshake_inner().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    async fn handshake_inner(&mut self) -> Result<ServerInfo, SvnError> {
        self.canceller.check()?;
        self.state = ConnectionState::Handshaking;
        if self.is_tunneled {
            self.reader.skip_leading_garbage().await?;
        }
        let greeting = self.read_command_response().await?;
        let greeting = parse_greeting(greeting.success_params("greeting")?)?;
        debug!(
            minver = greeting.min_version,
            maxver = greeting.max_version,
            caps = ?greeting.capabilities,
            "received server greeting"
        );
        if !(greeting.min_version <= 2 && 2 <= greeting.max_version) {
            return Err(SvnError::Protocol(format!(
                "server does not support protocol v2 (min={}, max={})",
                greeting.min_version, greeting.max_version
            )));
        }
        self.info = ServerInfo {
            min_version: greeting.min_version,
            max_version: greeting.max_version,
            server_caps: greeting.capabilities,
            repository: Default::default(),
        };
        if !self.info.has_capability(Capability::EditPipeline) {
            return Err(SvnError::Protocol(
                "server does not support edit pipelining".into(),
            ));
        }

        debug!(url = %self.url, ra_client = %self.ra_client, "sending client greeting response");
        let client_caps = Capability::CLIENT
            .iter()
            .map(|cap| Slot::Word(cap.as_wire_word().to_string()))
            .collect();
        let response = template::marshal(
            "n(*w)ss()",
            &[
                Slot::Number(2),
                Slot::List(client_caps),
                Slot::String(self.url.to_string()),
                Slot::String(self.ra_client.clone()),
                Slot::List(Vec::new()),
            ],
        )?;
        self.write_item(&response).await?;

        self.handle_auth_request().await?;

        // Sent once, right after the first authentication.
        let repos_info = self.read_command_response().await?;
        let repository = parse_repos_info(repos_info.success_params("repos-info")?)?;
        for cap in &repository.capabilities {
            if !self.info.server_caps.contains(cap) {
                self.info.server_caps.push(cap.clone());
            }
        }
        self.info.repository = repository;
        self.state = ConnectionState::Ready;
        debug!(uuid = %self.info.repository.uuid, "handshake complete");
        Ok(self.info.clone())
    }

    /// Sends one command and reads its response.
    ///
    /// A `failure` response is returned as a [`CommandResponse`] and keeps
    /// the connection usable; any other error closes it.
    pub(crate) async fn call(
        &mut self,
        command: &str,
        params: SvnItem,
    ) -> Result<CommandResponse, SvnError> {
        if self.state != ConnectionState::Ready {
            return Err(SvnError::Protocol(format!(
                "connection is not ready ({:?})",
                self.state
            )));
        }
        if let Err(err) = self.canceller.check() {
            self.close().await;
            return Err(err);
        }
        let result = self.call_inner(command, &params).await;
        match &result {
            Ok(_) => self.events.on_event(&Event::CommandCompleted {
                command: command.to_string(),
            }),
            Err(err) => {
                debug!(command, error = %err, "command failed; closing connection");
                self.close().await;
            }
        }
        result
    }

    async fn call_inner(
        &mut self,
        command: &str,
        params: &SvnItem,
    ) -> Result<CommandResponse, SvnError> {
        self.write_buf.clear();
        encode_command(command, params, &mut self.write_buf);
        let buf = std::mem::take(&mut self.write_buf);
        let result = self.write_wire_bytes(&buf).await;
        self.write_buf = buf;
        result?;

        self.handle_auth_request().await?;
        self.read_command_response().await
    }

    /// Reads one item of a streamed response. Errors close the connection.
    pub(crate) async fn read_stream_item(&mut self) -> Result<SvnItem, SvnError> {
        let result = self.reader.read_item().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    /// Reads the trailing response of a streamed command.
    pub(crate) async fn read_final_response(&mut self) -> Result<CommandResponse, SvnError> {
        let result = self.read_command_response().await;
        if result.is_err() {
            self.close().await;
        }
        result
    }

    /// Probes an idle connection: `true` if the peer closed it or sent
    /// something unsolicited.
    pub(crate) async fn is_stale(&mut self) -> bool {
        if self.state != ConnectionState::Ready {
            return true;
        }
        match self.reader.data_available().await {
            Ok(false) => false,
            Ok(true) | Err(_) => {
                debug!(url = %self.url, "idle connection is stale");
                true
            }
        }
    }

    pub(crate) async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        let _ = tokio::time::timeout(self.write_timeout, self.write.shutdown()).await;
    }

    async fn handle_auth_request(&mut self) -> Result<(), SvnError> {
        let response = self.read_command_response().await?;
        let request = parse_auth_request(response.success_params("auth-request")?)?;
        if request.mechanisms.is_empty() {
            return Ok(());
        }
        let previous = self.state;
        self.state = ConnectionState::Authenticating;
        self.authenticate(&request).await?;
        self.state = previous;
        Ok(())
    }

    async fn authenticate(&mut self, request: &AuthRequest) -> Result<(), SvnError> {
        let realm = qualified_realm(&self.url, &request.realm);
        debug!(realm = %realm, mechs = ?request.mechanisms, "server requires authentication");
        let mut last_failure = None::<String>;

        for mech in self.select_mechs(&request.mechanisms)? {
            debug!(mech = mech.as_word(), "trying auth mechanism");
            let outcome = if mech.needs_password() {
                self.authenticate_with_password(mech, &realm).await?
            } else {
                let token = Some(Vec::new());
                self.run_mechanism(mech, token, None).await?
            };
            match outcome {
                Ok(()) => return Ok(()),
                Err(message) => {
                    debug!(mech = mech.as_word(), message = %message, "auth mechanism failed");
                    last_failure = Some(message);
                }
            }
        }

        Err(SvnError::AuthFailed(
            last_failure.unwrap_or_else(|| "authentication failed".to_string()),
        ))
    }

    /// Tries credentials from the provider chain until one is accepted.
    ///
    /// The outer `Result` carries fatal errors, including cancellation by an
    /// interactive provider. The inner one reports that the chain ran out.
    async fn authenticate_with_password(
        &mut self,
        mech: Mechanism,
        realm: &str,
    ) -> Result<Result<(), String>, SvnError> {
        let kind = CredentialKind::Password;
        let url = self.url.clone();
        let mut credential = match self.auth.first(kind, realm, Some(&url)) {
            Ok(credential) => credential,
            Err(SvnError::AuthFailed(message)) => return Ok(Err(message)),
            Err(err) => return Err(err),
        };
        loop {
            let token = match mech {
                Mechanism::Plain => Some(plain_token(&credential)?),
                _ => None,
            };
            match self.run_mechanism(mech, token, Some(&credential)).await? {
                Ok(()) => {
                    self.auth.acknowledge(true, kind, realm, None, &credential);
                    self.last_valid = Some(credential);
                    return Ok(Ok(()));
                }
                Err(message) => {
                    self.auth
                        .acknowledge(false, kind, realm, Some(&message), &credential);
                    credential = match self.auth.next(kind, realm, Some(&url)) {
                        Ok(next) => next,
                        Err(SvnError::AuthFailed(_)) => return Ok(Err(message)),
                        Err(err) => return Err(err),
                    };
                }
            }
        }
    }

    /// Runs one mechanism exchange until the server reports success or
    /// failure.
    async fn run_mechanism(
        &mut self,
        mech: Mechanism,
        initial: Option<Vec<u8>>,
        credential: Option<&Credential>,
    ) -> Result<Result<(), String>, SvnError> {
        let token = match initial {
            Some(token) => Slot::List(vec![Slot::Bytes(token)]),
            None => Slot::List(Vec::new()),
        };
        let item = template::marshal("w(?b)", &[Slot::Word(mech.as_word().to_string()), token])?;
        self.write_item(&item).await?;

        loop {
            let reply = self.reader.read_item().await?;
            match parse_challenge(&reply)? {
                Challenge::Step(challenge) => {
                    debug!(mech = mech.as_word(), "auth challenge step");
                    let Some(credential) = credential.filter(|_| mech == Mechanism::CramMd5) else {
                        return Err(SvnError::Protocol(format!(
                            "unexpected auth step for {}",
                            mech.as_word()
                        )));
                    };
                    let answer = cram_md5_reply(credential, &challenge)?;
                    self.write_item(&SvnItem::String(answer)).await?;
                }
                Challenge::Success => return Ok(Ok(())),
                Challenge::Failure(message) => return Ok(Err(message)),
            }
        }
    }

    /// Orders the offered mechanisms.
    ///
    /// `EXTERNAL` comes first on tunnels. Password mechanisms (`CRAM-MD5`,
    /// else `PLAIN`) come before `ANONYMOUS` when the caller supplied
    /// credentials and after it otherwise. `EXTERNAL` is the last resort
    /// on plain connections.
    pub(crate) fn select_mechs(&self, offered: &[String]) -> Result<Vec<Mechanism>, SvnError> {
        let offered: Vec<Mechanism> = offered
            .iter()
            .filter_map(|word| Mechanism::from_word(word))
            .collect();
        let has = |mech| offered.contains(&mech);

        let password = if has(Mechanism::CramMd5) {
            Some(Mechanism::CramMd5)
        } else if has(Mechanism::Plain) {
            Some(Mechanism::Plain)
        } else {
            None
        };
        let anonymous = has(Mechanism::Anonymous).then_some(Mechanism::Anonymous);

        let mut out = Vec::new();
        if self.is_tunneled && has(Mechanism::External) {
            out.push(Mechanism::External);
        }
        if self.auth.has_static_credentials() {
            out.extend(password);
            out.extend(anonymous);
        } else {
            out.extend(anonymous);
            out.extend(password);
        }
        if out.is_empty() && has(Mechanism::External) {
            out.push(Mechanism::External);
        }

        if out.is_empty() {
            Err(SvnError::AuthUnavailable)
        } else {
            Ok(out)
        }
    }

    async fn write_wire_bytes(&mut self, bytes: &[u8]) -> Result<(), SvnError> {
        tokio::time::timeout(self.write_timeout, async {
            self.write.write_all(bytes).await?;
            self.write.flush().await
        })
        .await
        .map_err(|_| SvnError::timed_out("write"))??;
        Ok(())
    }

    async fn write_item(&mut self, item: &SvnItem) -> Result<(), SvnError> {
        self.write_buf.clear();
        item.encode(&mut self.write_buf);
        self.write_buf.push(b'\n');

        let buf = std::mem::take(&mut self.write_buf);
        let result = self.write_wire_bytes(&buf).await;
        self.write_buf = buf;
        result
    }

    async fn read_command_response(&mut self) -> Result<CommandResponse, SvnError> {
        let item = self.reader.read_item().await?;
        let SvnItem::List(mut parts) = item else {
            return Err(SvnError::Protocol("command response not a list".into()));
        };
        let body = match parts.get_mut(1) {
            Some(SvnItem::List(items)) => std::mem::take(items),
            _ => Vec::new(),
        };
        match parts.first().and_then(SvnItem::as_word) {
            Some("success") => Ok(CommandResponse {
                success: true,
                params: body,
                errors: Vec::new(),
            }),
            Some("failure") => Ok(CommandResponse {
                success: false,
                params: Vec::new(),
                errors: body,
            }),
            Some(other) => Err(SvnError::Protocol(format!(
                "unexpected command response kind: {other}"
            ))),
            None => Err(SvnError::Protocol("empty command response".into())),
        }
    }
}

fn plain_token(credential: &Credential) -> Result<Vec<u8>, SvnError> {
    let password = credential
        .password_secret()
        .ok_or_else(|| SvnError::AuthFailed("credential has no password".into()))?;
    let user = credential.username();
    let mut token = Vec::with_capacity(user.len() + password.len() + 2);
    token.push(0);
    token.extend_from_slice(user.as_bytes());
    token.push(0);
    token.extend_from_slice(password.as_bytes());
    Ok(token)
}

/// Answers a CRAM-MD5 challenge with `"<user> <hex hmac-md5(password, challenge)>"`.
pub(crate) fn cram_md5_reply(credential: &Credential, challenge: &[u8]) -> Result<Vec<u8>, SvnError> {
    let password = credential
        .password_secret()
        .ok_or_else(|| SvnError::AuthFailed("credential has no password".into()))?;
    let mut mac = Hmac::<Md5>::new_from_slice(password.as_bytes())
        .map_err(|_| SvnError::Protocol("failed to create HMAC-MD5".into()))?;
    mac.update(challenge);
    let digest = hex::encode(mac.finalize().into_bytes());
    Ok(format!("{} {digest}", credential.username()).into_bytes())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::auth::{CallbackProvider, CredentialRequest};
    use crate::cancel::{CancelFlag, NeverCancel, NoEvents};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn run_async<T>(f: impl Future<Output = T>) -> T {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(f)
    }

    fn config(auth: AuthManager, is_tunneled: bool) -> RaSvnConnectionConfig {
        let url = if is_tunneled {
            "svn+ssh://example.com/repo"
        } else {
            "svn://example.com/repo"
        };
        RaSvnConnectionConfig {
            url: SvnUrl::parse(url).unwrap(),
            is_tunneled,
            ra_client: "test-ra_svn".to_string(),
            read_timeout: Duration::from_secs(1),
            write_timeout: Duration::from_secs(1),
            auth,
            canceller: Arc::new(NeverCancel),
            events: Arc::new(NoEvents),
        }
    }

    async fn connected(config: RaSvnConnectionConfig) -> (RaSvnConnection, TcpStream) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept_task = tokio::spawn(async move { listener.accept().await });
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = accept_task.await.unwrap().unwrap();
        (RaSvnConnection::from_stream(Box::new(client), config), server)
    }

    async fn write_item_line(stream: &mut TcpStream, item: &SvnItem) {
        let mut buf = Vec::new();
        item.encode(&mut buf);
        buf.push(b'\n');
        stream.write_all(&buf).await.unwrap();
        stream.flush().await.unwrap();
    }

    async fn read_until_newline(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = stream.read(&mut byte).await.unwrap();
            if n == 0 {
                break;
            }
            buf.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        buf
    }

    fn line(item: &SvnItem) -> Vec<u8> {
        let mut buf = Vec::new();
        item.encode(&mut buf);
        buf.push(b'\n');
        buf
    }

    fn words(words: &[&str]) -> SvnItem {
        SvnItem::List(words.iter().map(|w| SvnItem::word(*w)).collect())
    }

    fn success(params: Vec<SvnItem>) -> SvnItem {
        SvnItem::List(vec![SvnItem::word("success"), SvnItem::List(params)])
    }

    fn auth_request(mechs: &[&str]) -> SvnItem {
        success(vec![words(mechs), SvnItem::string("realm")])
    }

    fn greeting() -> SvnItem {
        success(vec![
            SvnItem::Number(2),
            SvnItem::Number(2),
            SvnItem::List(Vec::new()),
            words(&["edit-pipeline", "svndiff1"]),
        ])
    }

    fn repos_info() -> SvnItem {
        success(vec![
            SvnItem::string("uuid"),
            SvnItem::string("svn://example.com/repo"),
            words(&["mergeinfo"]),
        ])
    }

    fn expected_client_greeting(url: &str) -> Vec<u8> {
        line(&SvnItem::List(vec![
            SvnItem::Number(2),
            words(&[
                "edit-pipeline",
                "svndiff1",
                "accepts-svndiff2",
                "absent-entries",
                "depth",
                "mergeinfo",
                "log-revprops",
            ]),
            SvnItem::string(url),
            SvnItem::string("test-ra_svn"),
            SvnItem::List(Vec::new()),
        ]))
    }

    fn mech_line(mech: &str, token: Option<&[u8]>) -> Vec<u8> {
        let token = match token {
            Some(t) => SvnItem::List(vec![SvnItem::string(t)]),
            None => SvnItem::List(Vec::new()),
        };
        line(&SvnItem::List(vec![SvnItem::word(mech), token]))
    }

    fn failure(message: &str) -> SvnItem {
        SvnItem::List(vec![
            SvnItem::word("failure"),
            SvnItem::List(vec![SvnItem::string(message)]),
        ])
    }

    fn bare(word: &str) -> SvnItem {
        SvnItem::List(vec![SvnItem::word(word)])
    }

    fn offered(mechs: &[&str]) -> Vec<String> {
        mechs.iter().map(|m| m.to_string()).collect()
    }

    /// Connection already past the handshake.
    async fn ready(config: RaSvnConnectionConfig) -> (RaSvnConnection, TcpStream) {
        let (mut conn, mut server) = connected(config).await;
        let server_task = tokio::spawn(async move {
            write_item_line(&mut server, &greeting()).await;
            read_until_newline(&mut server).await;
            write_item_line(&mut server, &auth_request(&[])).await;
            write_item_line(&mut server, &repos_info()).await;
            server
        });
        conn.handshake().await.unwrap();
        (conn, server_task.await.unwrap())
    }

    #[test]
    fn select_mechs_prefers_password_with_static_credentials() {
        run_async(async {
            let (conn, _server) =
                connected(config(AuthManager::with_credentials("alice", "pw"), false)).await;
            let plan = conn
                .select_mechs(&offered(&["ANONYMOUS", "PLAIN", "CRAM-MD5"]))
                .unwrap();
            assert_eq!(plan, vec![Mechanism::CramMd5, Mechanism::Anonymous]);
            let plan = conn.select_mechs(&offered(&["ANONYMOUS", "PLAIN"])).unwrap();
            assert_eq!(plan, vec![Mechanism::Plain, Mechanism::Anonymous]);
        });
    }

    #[test]
    fn select_mechs_tries_anonymous_first_without_credentials() {
        run_async(async {
            let (conn, _server) = connected(config(AuthManager::default(), false)).await;
            let plan = conn
                .select_mechs(&offered(&["CRAM-MD5", "ANONYMOUS", "EXTERNAL"]))
                .unwrap();
            assert_eq!(plan, vec![Mechanism::Anonymous, Mechanism::CramMd5]);
            let plan = conn.select_mechs(&offered(&["EXTERNAL"])).unwrap();
            assert_eq!(plan, vec![Mechanism::External]);
        });
    }

    #[test]
    fn select_mechs_prefers_external_when_tunneled() {
        run_async(async {
            let (conn, _server) = connected(config(AuthManager::default(), true)).await;
            let plan = conn
                .select_mechs(&offered(&["ANONYMOUS", "EXTERNAL"]))
                .unwrap();
            assert_eq!(plan, vec![Mechanism::External, Mechanism::Anonymous]);
        });
    }

    #[test]
    fn select_mechs_reports_unavailable_when_nothing_is_supported() {
        run_async(async {
            let (conn, _server) = connected(config(AuthManager::default(), false)).await;
            let err = conn
                .select_mechs(&offered(&["GSSAPI", "DIGEST-MD5"]))
                .unwrap_err();
            assert!(matches!(err, SvnError::AuthUnavailable));
        });
    }

    #[test]
    fn cram_md5_reply_matches_known_vector() {
        let reply = cram_md5_reply(
            &Credential::password("alice", "key"),
            b"The quick brown fox jumps over the lazy dog",
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(reply).unwrap(),
            "alice 80070713463e7749b90c2dc24911e275"
        );
    }

    #[test]
    fn handshake_writes_expected_client_greeting() {
        run_async(async {
            let (mut conn, mut server) = connected(config(AuthManager::default(), false)).await;
            assert_eq!(conn.state(), ConnectionState::Handshaking);

            let server_task = tokio::spawn(async move {
                write_item_line(&mut server, &greeting()).await;
                let client_greeting = read_until_newline(&mut server).await;
                assert_eq!(
                    client_greeting,
                    expected_client_greeting("svn://example.com:3690/repo")
                );
                write_item_line(&mut server, &auth_request(&[])).await;
                write_item_line(&mut server, &repos_info()).await;
            });

            let info = conn.handshake().await.unwrap();
            server_task.await.unwrap();
            assert_eq!(conn.state(), ConnectionState::Ready);
            assert_eq!((info.min_version, info.max_version), (2, 2));
            assert!(info.has_capability(Capability::EditPipeline));
            assert!(info.has_capability(Capability::MergeInfo));
            assert_eq!(info.repository.uuid, "uuid");
            assert_eq!(info.repository.root_url, "svn://example.com/repo");
            assert_eq!(conn.server_info(), &info);
        });
    }

    #[test]
    fn handshake_skips_leading_garbage_for_tunneled_connections() {
        run_async(async {
            let (mut conn, mut server) = connected(config(AuthManager::default(), true)).await;

            let server_task = tokio::spawn(async move {
                server
                    .write_all(b"Last login: Thu Jan 01 00:00:00 1970\n")
                    .await
                    .unwrap();
                write_item_line(&mut server, &greeting()).await;
                let client_greeting = read_until_newline(&mut server).await;
                assert_eq!(
                    client_greeting,
                    expected_client_greeting("svn+ssh://example.com:22/repo")
                );
                write_item_line(&mut server, &auth_request(&["EXTERNAL"])).await;
                assert_eq!(
                    read_until_newline(&mut server).await,
                    mech_line("EXTERNAL", Some(b""))
                );
                write_item_line(&mut server, &bare("success")).await;
                write_item_line(&mut server, &repos_info()).await;
            });

            let info = conn.handshake().await.unwrap();
            assert_eq!(info.repository.uuid, "uuid");
            server_task.await.unwrap();
        });
    }

    #[test]
    fn handshake_rejects_servers_without_v2_support() {
        run_async(async {
            let (mut conn, mut server) = connected(config(AuthManager::default(), false)).await;
            let server_task = tokio::spawn(async move {
                let greeting = success(vec![
                    SvnItem::Number(3),
                    SvnItem::Number(4),
                    SvnItem::List(Vec::new()),
                    SvnItem::List(Vec::new()),
                ]);
                write_item_line(&mut server, &greeting).await;
                server
            });

            let err = conn.handshake().await.unwrap_err();
            assert!(matches!(err, SvnError::Protocol(msg) if msg.contains("min=3, max=4")));
            assert_eq!(conn.state(), ConnectionState::Closed);
            drop(server_task.await.unwrap());
        });
    }

    #[test]
    fn handshake_requires_edit_pipeline() {
        run_async(async {
            let (mut conn, mut server) = connected(config(AuthManager::default(), false)).await;
            let server_task = tokio::spawn(async move {
                let greeting = success(vec![
                    SvnItem::Number(2),
                    SvnItem::Number(2),
                    SvnItem::List(Vec::new()),
                    words(&["svndiff1"]),
                ]);
                write_item_line(&mut server, &greeting).await;
                server
            });
            let err = conn.handshake().await.unwrap_err();
            assert!(matches!(err, SvnError::Protocol(msg) if msg.contains("edit pipelining")));
            drop(server_task.await.unwrap());
        });
    }

    #[test]
    fn cram_md5_rejection_advances_to_the_next_provider() {
        run_async(async {
            let prompts = Arc::new(Mutex::new(Vec::<Option<String>>::new()));
            let seen = prompts.clone();
            let prompt = CallbackProvider::new(move |request: &CredentialRequest<'_>| {
                seen.lock()
                    .unwrap()
                    .push(request.previous_error.map(str::to_string));
                Ok(Some(Credential::password("bob", "right")))
            });
            let auth = AuthManager::builder()
                .static_credentials("alice", "wrong")
                .interactive(prompt)
                .build();
            let cache = auth.runtime_cache().unwrap().clone();
            let (mut conn, mut server) = connected(config(auth, false)).await;

            let server_task = tokio::spawn(async move {
                write_item_line(&mut server, &greeting()).await;
                read_until_newline(&mut server).await;
                write_item_line(&mut server, &auth_request(&["CRAM-MD5", "ANONYMOUS"])).await;

                for (user, password) in [("alice", "wrong"), ("bob", "right")] {
                    assert_eq!(
                        read_until_newline(&mut server).await,
                        mech_line("CRAM-MD5", None)
                    );
                    let challenge = b"<1896.697170952@postoffice.example.net>";
                    let step = SvnItem::List(vec![
                        SvnItem::word("step"),
                        SvnItem::List(vec![SvnItem::string(challenge)]),
                    ]);
                    write_item_line(&mut server, &step).await;
                    let expected = cram_md5_reply(&Credential::password(user, password), challenge)
                        .unwrap();
                    assert_eq!(
                        read_until_newline(&mut server).await,
                        line(&SvnItem::String(expected))
                    );
                    if user == "alice" {
                        write_item_line(&mut server, &failure("Username not found")).await;
                    } else {
                        write_item_line(&mut server, &bare("success")).await;
                    }
                }
                write_item_line(&mut server, &repos_info()).await;
            });

            conn.handshake().await.unwrap();
            server_task.await.unwrap();

            assert_eq!(conn.last_valid_credential().unwrap().username(), "bob");
            assert_eq!(
                prompts.lock().unwrap().as_slice(),
                &[Some("Username not found".to_string())]
            );
            let realm = "<svn://example.com:3690> realm";
            assert_eq!(
                cache
                    .get(CredentialKind::Password, realm)
                    .unwrap()
                    .username(),
                "bob"
            );
        });
    }

    #[test]
    fn exhausted_chain_falls_back_to_anonymous() {
        run_async(async {
            let auth = AuthManager::builder()
                .static_credentials("alice", "secret")
                .runtime_cache(None)
                .build();
            let (mut conn, mut server) = connected(config(auth, false)).await;

            let server_task = tokio::spawn(async move {
                write_item_line(&mut server, &greeting()).await;
                read_until_newline(&mut server).await;
                write_item_line(&mut server, &auth_request(&["PLAIN", "ANONYMOUS"])).await;
                assert_eq!(
                    read_until_newline(&mut server).await,
                    mech_line("PLAIN", Some(b"\0alice\0secret"))
                );
                write_item_line(&mut server, &failure("bad")).await;
                assert_eq!(
                    read_until_newline(&mut server).await,
                    mech_line("ANONYMOUS", Some(b""))
                );
                write_item_line(&mut server, &bare("success")).await;
                write_item_line(&mut server, &repos_info()).await;
            });

            conn.handshake().await.unwrap();
            server_task.await.unwrap();
            assert!(conn.last_valid_credential().is_none());
        });
    }

    #[test]
    fn rejected_credentials_without_fallback_fail() {
        run_async(async {
            let auth = AuthManager::builder()
                .static_credentials("alice", "secret")
                .runtime_cache(None)
                .build();
            let (mut conn, mut server) = connected(config(auth, false)).await;

            let server_task = tokio::spawn(async move {
                write_item_line(&mut server, &greeting()).await;
                read_until_newline(&mut server).await;
                write_item_line(&mut server, &auth_request(&["PLAIN"])).await;
                read_until_newline(&mut server).await;
                write_item_line(&mut server, &failure("Password incorrect")).await;
                server
            });

            let err = conn.handshake().await.unwrap_err();
            assert!(matches!(err, SvnError::AuthFailed(msg) if msg == "Password incorrect"));
            assert_eq!(conn.state(), ConnectionState::Closed);
            drop(server_task.await.unwrap());
        });
    }

    #[test]
    fn declined_prompt_cancels_the_handshake() {
        run_async(async {
            let auth = AuthManager::builder()
                .interactive(CallbackProvider::new(|_: &CredentialRequest<'_>| Ok(None)))
                .build();
            let (mut conn, mut server) = connected(config(auth, false)).await;

            let server_task = tokio::spawn(async move {
                write_item_line(&mut server, &greeting()).await;
                read_until_newline(&mut server).await;
                write_item_line(&mut server, &auth_request(&["CRAM-MD5"])).await;
                server
            });

            let err = conn.handshake().await.unwrap_err();
            assert!(err.is_cancellation());
            drop(server_task.await.unwrap());
        });
    }

    #[test]
    fn call_reports_events_and_keeps_failures_recoverable() {
        #[derive(Default)]
        struct Recorder(Mutex<Vec<Event>>);
        impl EventSink for Recorder {
            fn on_event(&self, event: &Event) {
                self.0.lock().unwrap().push(event.clone());
            }
        }

        run_async(async {
            let recorder = Arc::new(Recorder::default());
            let mut cfg = config(AuthManager::default(), false);
            cfg.events = recorder.clone();
            let (mut conn, mut server) = ready(cfg).await;

            let server_task = tokio::spawn(async move {
                assert_eq!(
                    read_until_newline(&mut server).await,
                    b"( get-latest-rev ( ) ) \n"
                );
                write_item_line(&mut server, &auth_request(&[])).await;
                write_item_line(&mut server, &success(vec![SvnItem::Number(12)])).await;

                read_until_newline(&mut server).await;
                write_item_line(&mut server, &auth_request(&[])).await;
                let error = SvnItem::List(vec![
                    SvnItem::Number(160013),
                    SvnItem::string("path not found"),
                    SvnItem::string(""),
                    SvnItem::Number(0),
                ]);
                let reply = SvnItem::List(vec![
                    SvnItem::word("failure"),
                    SvnItem::List(vec![error]),
                ]);
                write_item_line(&mut server, &reply).await;
                server
            });

            let response = conn
                .call("get-latest-rev", SvnItem::List(Vec::new()))
                .await
                .unwrap();
            assert_eq!(response.success_params("get-latest-rev").unwrap(), &[SvnItem::Number(12)]);

            let response = conn
                .call("stat", SvnItem::List(vec![SvnItem::string("missing")]))
                .await
                .unwrap();
            let err = response.ensure_success("stat").unwrap_err();
            assert!(matches!(&err, SvnError::Server(e) if e.message_summary() == "path not found"));
            assert_eq!(conn.state(), ConnectionState::Ready);

            let events = recorder.0.lock().unwrap().clone();
            assert_eq!(
                events,
                vec![
                    Event::CommandCompleted { command: "get-latest-rev".into() },
                    Event::CommandCompleted { command: "stat".into() },
                ]
            );
            drop(server_task.await.unwrap());
        });
    }

    #[test]
    fn eof_closes_the_connection() {
        run_async(async {
            let (mut conn, mut server) = ready(config(AuthManager::default(), false)).await;
            let server_task = tokio::spawn(async move {
                read_until_newline(&mut server).await;
            });
            let err = conn
                .call("get-latest-rev", SvnItem::List(Vec::new()))
                .await
                .unwrap_err();
            server_task.await.unwrap();
            assert!(err.is_retryable());
            assert_eq!(conn.state(), ConnectionState::Closed);

            let err = conn
                .call("get-latest-rev", SvnItem::List(Vec::new()))
                .await
                .unwrap_err();
            assert!(matches!(err, SvnError::Protocol(msg) if msg.contains("not ready")));
        });
    }

    #[test]
    fn cancelled_call_writes_nothing() {
        run_async(async {
            let flag = CancelFlag::new();
            let mut cfg = config(AuthManager::default(), false);
            cfg.canceller = Arc::new(flag.clone());
            let (mut conn, mut server) = ready(cfg).await;

            flag.cancel();
            let err = conn
                .call("get-latest-rev", SvnItem::List(Vec::new()))
                .await
                .unwrap_err();
            assert!(err.is_cancellation());
            assert_eq!(conn.state(), ConnectionState::Closed);
            let mut rest = Vec::new();
            server.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        });
    }

    #[test]
    fn stale_probe_detects_closed_peers() {
        run_async(async {
            let (mut conn, server) = ready(config(AuthManager::default(), false)).await;
            assert!(!conn.is_stale().await);
            drop(server);
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert!(conn.is_stale().await);
        });
    }
}
