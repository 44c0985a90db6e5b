//! `svn+ssh://` tunnels (`svnserve -t` over an SSH session).
//!
//! Opening the SSH session is delegated to an [`SshSessionFactory`].
//! [`open_tunnel`] drives the credential chain around it: a rejection whose
//! message mentions authentication moves on to the next credential, and any
//! other failure ends the attempt. With the `ssh` feature,
//! `RusshSessionFactory` provides a factory built on `russh`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::debug;

use crate::auth::{AuthManager, Credential, CredentialKind};
use crate::transport::BoxedStream;
use crate::{SvnError, SvnUrl};

/// Default SSH port; omitted from realms.
pub const SSH_PORT: u16 = 22;

/// Future returned by [`SshSessionFactory::open`].
pub type TunnelFuture<'a> = Pin<Box<dyn Future<Output = Result<BoxedStream, SvnError>> + Send + 'a>>;

/// Opens an SSH session and starts the tunnel command on it.
///
/// Report credential rejections as [`SvnError::AuthFailed`] with a message
/// mentioning authentication so that [`open_tunnel`] retries.
pub trait SshSessionFactory: Send + Sync {
    /// Connects to `url` as `credential` and returns the channel stream.
    fn open<'a>(
        &'a self,
        url: &'a SvnUrl,
        credential: &'a Credential,
        timeout: Duration,
    ) -> TunnelFuture<'a>;
}

/// The credential realm of an SSH server: `svn+ssh://host[:port]`.
pub fn ssh_realm(url: &SvnUrl) -> String {
    if url.port == SSH_PORT {
        format!("svn+ssh://{}", url.host)
    } else {
        format!("svn+ssh://{}:{}", url.host, url.port)
    }
}

/// Opens a tunnel, asking `auth` for SSH credentials until one is accepted.
pub async fn open_tunnel(
    factory: &dyn SshSessionFactory,
    url: &SvnUrl,
    auth: &mut AuthManager,
    timeout: Duration,
) -> Result<BoxedStream, SvnError> {
    let realm = ssh_realm(url);
    let mut credential = auth.first(CredentialKind::Ssh, &realm, Some(url))?;
    loop {
        match factory.open(url, &credential, timeout).await {
            Ok(stream) => {
                auth.acknowledge(true, CredentialKind::Ssh, &realm, None, &credential);
                return Ok(stream);
            }
            Err(err) if is_auth_rejection(&err) => {
                let reason = err.to_string();
                debug!(realm = %realm, username = credential.username(), error = %reason, "ssh credential rejected");
                auth.acknowledge(false, CredentialKind::Ssh, &realm, Some(&reason), &credential);
                credential = auth.next(CredentialKind::Ssh, &realm, Some(url))?;
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_auth_rejection(err: &SvnError) -> bool {
    matches!(err, SvnError::AuthFailed(msg) if msg.to_ascii_lowercase().contains("auth"))
}

#[cfg(feature = "ssh")]
pub use self::russh_factory::{HostKeyPolicy, RusshSessionFactory};

#[cfg(feature = "ssh")]
mod russh_factory {
    use std::ffi::OsStr;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use russh::client;
    use russh::keys::PrivateKeyWithHashAlg;
    use tracing::debug;

    use super::{SshSessionFactory, TunnelFuture};
    use crate::auth::{Credential, SshSecret};
    use crate::transport::BoxedStream;
    use crate::{SvnError, SvnUrl};

    /// How the server host key is verified.
    #[derive(Clone, Debug)]
    pub enum HostKeyPolicy {
        /// Accept any host key. Vulnerable to man-in-the-middle attacks.
        AcceptAny,
        /// Check `~/.ssh/known_hosts`.
        KnownHosts,
        /// Check the given `known_hosts` file.
        KnownHostsFile(PathBuf),
    }

    /// [`SshSessionFactory`] backed by `russh`.
    #[derive(Clone, Debug)]
    pub struct RusshSessionFactory {
        host_key: HostKeyPolicy,
        accept_new_host_keys: bool,
        command: String,
    }

    impl Default for RusshSessionFactory {
        fn default() -> Self {
            Self {
                host_key: HostKeyPolicy::KnownHosts,
                accept_new_host_keys: false,
                command: "svnserve -t".to_string(),
            }
        }
    }

    impl RusshSessionFactory {
        /// Verifies host keys against `~/.ssh/known_hosts` and runs
        /// `svnserve -t`.
        pub fn new() -> Self {
            Self::default()
        }

        /// Sets the host key policy.
        #[must_use]
        pub fn with_host_key_policy(mut self, policy: HostKeyPolicy) -> Self {
            self.host_key = policy;
            self
        }

        /// Records unknown host keys instead of rejecting them.
        #[must_use]
        pub fn accept_new_host_keys(mut self) -> Self {
            self.accept_new_host_keys = true;
            self
        }

        /// Overrides the remote command.
        #[must_use]
        pub fn with_command(mut self, command: impl Into<String>) -> Self {
            self.command = command.into();
            self
        }

        async fn open_stream(
            &self,
            url: &SvnUrl,
            credential: &Credential,
        ) -> Result<BoxedStream, SvnError> {
            let (username, secret, port) = match credential {
                Credential::Ssh {
                    username,
                    secret,
                    port,
                    ..
                } => (username.as_str(), secret, port.unwrap_or(url.port)),
                Credential::Password { .. } => {
                    return Err(SvnError::AuthFailed(
                        "ssh tunnel needs an ssh credential".to_string(),
                    ));
                }
            };
            let handler = HostKeyCheck {
                host: url.host.clone(),
                port,
                policy: self.host_key.clone(),
                learn: self.accept_new_host_keys,
            };
            let config = Arc::new(client::Config::default());
            let mut session = client::connect(config, (url.host.as_str(), port), handler)
                .await
                .map_err(ssh_error)?;

            let accepted = match secret {
                SshSecret::Password(password) => session
                    .authenticate_password(username.to_string(), password.clone())
                    .await
                    .map_err(ssh_error)?
                    .success(),
                SshSecret::KeyFile { path, passphrase } => {
                    let path = expand_tilde(path);
                    let key = russh::keys::load_secret_key(&path, passphrase.as_deref())
                        .map_err(|e| SvnError::AuthFailed(format!("ssh key '{}' unusable for authentication: {e}", path.display())))?;
                    let hash_alg = session
                        .best_supported_rsa_hash()
                        .await
                        .map_err(ssh_error)?
                        .flatten();
                    session
                        .authenticate_publickey(
                            username.to_string(),
                            PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                        )
                        .await
                        .map_err(ssh_error)?
                        .success()
                }
            };
            if !accepted {
                return Err(SvnError::AuthFailed(format!(
                    "ssh authentication failed for '{username}'"
                )));
            }
            debug!(host = %url.host, port, username, "ssh session authenticated");

            let channel = session.channel_open_session().await.map_err(ssh_error)?;
            channel
                .exec(true, self.command.clone())
                .await
                .map_err(ssh_error)?;
            Ok(Box::new(channel.into_stream()))
        }
    }

    impl SshSessionFactory for RusshSessionFactory {
        fn open<'a>(
            &'a self,
            url: &'a SvnUrl,
            credential: &'a Credential,
            timeout: Duration,
        ) -> TunnelFuture<'a> {
            Box::pin(async move {
                tokio::time::timeout(timeout, self.open_stream(url, credential))
                    .await
                    .map_err(|_| SvnError::timed_out("ssh connect"))?
            })
        }
    }

    fn ssh_error(err: russh::Error) -> SvnError {
        SvnError::Transport(format!("ssh error: {err}"))
    }

    struct HostKeyCheck {
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        learn: bool,
    }

    impl client::Handler for HostKeyCheck {
        type Error = russh::Error;

        async fn check_server_key(
            &mut self,
            server_public_key: &russh::keys::ssh_key::PublicKey,
        ) -> Result<bool, Self::Error> {
            let known = match &self.policy {
                HostKeyPolicy::AcceptAny => return Ok(true),
                HostKeyPolicy::KnownHosts => {
                    russh::keys::check_known_hosts(&self.host, self.port, server_public_key)?
                }
                HostKeyPolicy::KnownHostsFile(path) => russh::keys::check_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                )?,
            };
            if known || !self.learn {
                return Ok(known);
            }
            match &self.policy {
                HostKeyPolicy::KnownHostsFile(path) => russh::keys::known_hosts::learn_known_hosts_path(
                    &self.host,
                    self.port,
                    server_public_key,
                    path,
                )?,
                _ => russh::keys::known_hosts::learn_known_hosts(
                    &self.host,
                    self.port,
                    server_public_key,
                )?,
            }
            Ok(true)
        }
    }

    fn expand_tilde(path: &Path) -> PathBuf {
        let mut components = path.components();
        let Some(first) = components.next() else {
            return path.to_path_buf();
        };
        if first.as_os_str() != OsStr::new("~") {
            return path.to_path_buf();
        }
        let Some(home) = std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .filter(|home| !home.is_empty())
        else {
            return path.to_path_buf();
        };
        let mut out = PathBuf::from(home);
        out.extend(components);
        out
    }
}
