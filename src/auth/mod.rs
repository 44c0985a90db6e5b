//! Credential negotiation.
//!
//! An [`AuthManager`] walks a fixed chain of four [`CredentialProvider`]
//! slots whenever a server asks for credentials:
//!
//! 0. static credentials supplied by the caller,
//! 1. the in-process runtime cache,
//! 2. the persistent on-disk store,
//! 3. an interactive provider.
//!
//! [`AuthManager::first`] starts at slot 0. After a rejection,
//! [`AuthManager::next`] resumes at the slot after the one that produced the
//! rejected credential, so the same credential is never offered twice.
//! Running past the interactive slot reports [`SvnError::Cancelled`]; running
//! out of providers without one reports [`SvnError::AuthFailed`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::{SvnError, SvnUrl};

mod provider;
mod store;

pub use provider::{CallbackProvider, RuntimeCache, StaticProvider};
pub use store::PersistentStore;

/// The kind of credential a server asked for.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CredentialKind {
    /// Username and password (`svn://` SASL mechanisms, HTTP Basic/Digest).
    Password,
    /// SSH login for `svn+ssh://` tunnels.
    Ssh,
}

impl CredentialKind {
    /// Name used as the store directory and cache key prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialKind::Password => "svn.simple",
            CredentialKind::Ssh => "svn.ssh",
        }
    }
}

/// How an SSH credential proves its identity.
#[derive(Clone, PartialEq, Eq)]
pub enum SshSecret {
    /// Password authentication.
    Password(String),
    /// Public key authentication with an on-disk private key.
    KeyFile {
        /// Path to the private key.
        path: PathBuf,
        /// Passphrase protecting the key, if any.
        passphrase: Option<String>,
    },
}

/// A credential offered to a server.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Username and password.
    Password {
        /// Login name.
        username: String,
        /// Password.
        password: String,
        /// Whether this credential may be written to the persistent store.
        storage_allowed: bool,
    },
    /// SSH login.
    Ssh {
        /// Login name.
        username: String,
        /// Password or private key.
        secret: SshSecret,
        /// SSH port override.
        port: Option<u16>,
        /// Whether this credential may be written to the persistent store.
        storage_allowed: bool,
    },
}

impl Credential {
    /// A password credential that may be stored.
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Password {
            username: username.into(),
            password: password.into(),
            storage_allowed: true,
        }
    }

    /// An SSH credential using password authentication.
    pub fn ssh_password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credential::Ssh {
            username: username.into(),
            secret: SshSecret::Password(password.into()),
            port: None,
            storage_allowed: true,
        }
    }

    /// An SSH credential using a private key file.
    pub fn ssh_key(
        username: impl Into<String>,
        path: impl AsRef<Path>,
        passphrase: Option<String>,
    ) -> Self {
        Credential::Ssh {
            username: username.into(),
            secret: SshSecret::KeyFile {
                path: path.as_ref().to_path_buf(),
                passphrase,
            },
            port: None,
            storage_allowed: true,
        }
    }

    /// Returns a copy with storage allowed or forbidden.
    #[must_use]
    pub fn with_storage_allowed(mut self, allowed: bool) -> Self {
        match &mut self {
            Credential::Password {
                storage_allowed, ..
            }
            | Credential::Ssh {
                storage_allowed, ..
            } => *storage_allowed = allowed,
        }
        self
    }

    /// The credential kind.
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::Password { .. } => CredentialKind::Password,
            Credential::Ssh { .. } => CredentialKind::Ssh,
        }
    }

    /// The login name.
    pub fn username(&self) -> &str {
        match self {
            Credential::Password { username, .. } | Credential::Ssh { username, .. } => username,
        }
    }

    /// The password, for password credentials and password-based SSH logins.
    pub fn password_secret(&self) -> Option<&str> {
        match self {
            Credential::Password { password, .. }
            | Credential::Ssh {
                secret: SshSecret::Password(password),
                ..
            } => Some(password),
            Credential::Ssh { .. } => None,
        }
    }

    /// Whether the persistent store may keep this credential.
    pub fn storage_allowed(&self) -> bool {
        match self {
            Credential::Password {
                storage_allowed, ..
            }
            | Credential::Ssh {
                storage_allowed, ..
            } => *storage_allowed,
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Password {
                username,
                storage_allowed,
                ..
            } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"<redacted>")
                .field("storage_allowed", storage_allowed)
                .finish(),
            Credential::Ssh {
                username,
                secret,
                port,
                storage_allowed,
            } => f
                .debug_struct("Ssh")
                .field("username", username)
                .field("secret", secret)
                .field("port", port)
                .field("storage_allowed", storage_allowed)
                .finish(),
        }
    }
}

impl std::fmt::Debug for SshSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshSecret::Password(_) => f.write_str("Password(<redacted>)"),
            SshSecret::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &passphrase.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

/// Everything a provider knows when asked for a credential.
#[derive(Clone, Copy, Debug)]
pub struct CredentialRequest<'a> {
    /// Requested credential kind.
    pub kind: CredentialKind,
    /// Authentication realm (already prefixed with `<scheme://host:port>`).
    pub realm: &'a str,
    /// URL being accessed, if known.
    pub url: Option<&'a SvnUrl>,
    /// Why the previous credential was rejected.
    pub previous_error: Option<&'a str>,
    /// The previously rejected credential. `None` on the first request.
    pub previous: Option<&'a Credential>,
    /// Whether an accepted credential may be stored.
    pub may_store: bool,
}

/// One slot of the provider chain.
pub trait CredentialProvider: Send + Sync {
    /// Returns a credential to try, or `None` to pass to the next slot.
    fn request(&self, request: &CredentialRequest<'_>) -> Result<Option<Credential>, SvnError>;

    /// Called with credentials the server accepted.
    fn save(
        &self,
        _kind: CredentialKind,
        _realm: &str,
        _credential: &Credential,
    ) -> Result<(), SvnError> {
        Ok(())
    }
}

const STATIC_SLOT: usize = 0;
const STORE_SLOT: usize = 2;
const INTERACTIVE_SLOT: usize = 3;
const SLOTS: usize = 4;

/// Walks the provider chain and records the outcome of each attempt.
///
/// Clones share providers and the runtime cache. Negotiation state (the last
/// slot used and the last rejection) belongs to each clone, so give every
/// connection its own clone.
#[derive(Clone)]
pub struct AuthManager {
    providers: [Option<Arc<dyn CredentialProvider>>; SLOTS],
    cache: Option<RuntimeCache>,
    store_auth: bool,
    last_slot: usize,
    previous: Option<Credential>,
    previous_error: Option<String>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots: Vec<bool> = self.providers.iter().map(Option::is_some).collect();
        f.debug_struct("AuthManager")
            .field("slots", &slots)
            .field("store_auth", &self.store_auth)
            .field("last_slot", &self.last_slot)
            .finish()
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl AuthManager {
    /// Starts building a manager. The runtime cache is enabled by default.
    pub fn builder() -> AuthManagerBuilder {
        AuthManagerBuilder {
            static_provider: None,
            cache: Some(RuntimeCache::new()),
            store: None,
            interactive: None,
            store_auth: true,
        }
    }

    /// A manager with static credentials and the runtime cache.
    pub fn with_credentials(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::builder()
            .static_credentials(username, password)
            .build()
    }

    /// Returns `true` if slot 0 holds caller-supplied credentials.
    pub fn has_static_credentials(&self) -> bool {
        self.providers[STATIC_SLOT].is_some()
    }

    /// Returns the shared runtime cache, if enabled.
    pub fn runtime_cache(&self) -> Option<&RuntimeCache> {
        self.cache.as_ref()
    }

    /// Resets the negotiation and asks every slot from the start.
    pub fn first(
        &mut self,
        kind: CredentialKind,
        realm: &str,
        url: Option<&SvnUrl>,
    ) -> Result<Credential, SvnError> {
        self.previous = None;
        self.previous_error = None;
        self.last_slot = STATIC_SLOT;
        self.walk(STATIC_SLOT, kind, realm, url)
    }

    /// Asks for another credential after a rejection.
    pub fn next(
        &mut self,
        kind: CredentialKind,
        realm: &str,
        url: Option<&SvnUrl>,
    ) -> Result<Credential, SvnError> {
        let start = (self.last_slot + 1).min(INTERACTIVE_SLOT);
        self.walk(start, kind, realm, url)
    }

    /// Reports whether the server accepted `credential`.
    ///
    /// Accepted credentials are saved to the runtime cache, and to the
    /// persistent store when storing is enabled and the credential allows
    /// it. A failing store write is logged and otherwise ignored. Rejected
    /// credentials are remembered for the next [`AuthManager::next`] call.
    pub fn acknowledge(
        &mut self,
        accepted: bool,
        kind: CredentialKind,
        realm: &str,
        error: Option<&str>,
        credential: &Credential,
    ) {
        if !accepted {
            debug!(kind = kind.as_str(), realm, error, "credential rejected");
            self.previous_error = error.map(str::to_string);
            self.previous = Some(credential.clone());
            return;
        }
        debug!(kind = kind.as_str(), realm, slot = self.last_slot, "credential accepted");
        if self.store_auth
            && credential.storage_allowed()
            && let Some(store) = &self.providers[STORE_SLOT]
            && let Err(err) = store.save(kind, realm, credential)
        {
            debug!(error = %err, "failed to persist credential");
        }
        if let Some(cache) = &self.cache {
            cache.insert(kind, realm, credential.clone());
        }
    }

    fn walk(
        &mut self,
        start: usize,
        kind: CredentialKind,
        realm: &str,
        url: Option<&SvnUrl>,
    ) -> Result<Credential, SvnError> {
        for slot in start..SLOTS {
            let Some(provider) = &self.providers[slot] else {
                continue;
            };
            let request = CredentialRequest {
                kind,
                realm,
                url,
                previous_error: self.previous_error.as_deref(),
                previous: self.previous.as_ref(),
                may_store: self.store_auth,
            };
            if let Some(credential) = provider.request(&request)? {
                debug!(kind = kind.as_str(), realm, slot, "credential provided");
                self.last_slot = slot;
                self.previous = Some(credential.clone());
                return Ok(credential);
            }
            if slot == INTERACTIVE_SLOT {
                return Err(SvnError::Cancelled("authentication cancelled".to_string()));
            }
        }
        Err(SvnError::AuthFailed(format!(
            "authentication required for '{realm}'"
        )))
    }
}

/// Builder for [`AuthManager`].
#[must_use]
pub struct AuthManagerBuilder {
    static_provider: Option<StaticProvider>,
    cache: Option<RuntimeCache>,
    store: Option<PersistentStore>,
    interactive: Option<Arc<dyn CredentialProvider>>,
    store_auth: bool,
}

impl AuthManagerBuilder {
    /// Credentials tried first, typically from the command line.
    pub fn static_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.static_provider = Some(StaticProvider::new(username, password));
        self
    }

    /// Uses `cache` for slot 1. Pass `None` to disable caching.
    pub fn runtime_cache(mut self, cache: Option<RuntimeCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Reads and writes credentials under `dir`.
    pub fn persistent_store(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store = Some(PersistentStore::new(dir));
        self
    }

    /// Provider asked last, usually a prompt.
    pub fn interactive(mut self, provider: impl CredentialProvider + 'static) -> Self {
        self.interactive = Some(Arc::new(provider));
        self
    }

    /// Whether accepted credentials may be written to the persistent store.
    pub fn store_auth(mut self, store: bool) -> Self {
        self.store_auth = store;
        self
    }

    /// Finishes the builder.
    pub fn build(self) -> AuthManager {
        let store_auth = self.store_auth;
        let providers: [Option<Arc<dyn CredentialProvider>>; SLOTS] = [
            self.static_provider
                .map(|p| Arc::new(p.with_storage_allowed(store_auth)) as Arc<dyn CredentialProvider>),
            self.cache
                .clone()
                .map(|c| Arc::new(c) as Arc<dyn CredentialProvider>),
            self.store
                .map(|s| Arc::new(s) as Arc<dyn CredentialProvider>),
            self.interactive,
        ];
        AuthManager {
            providers,
            cache: self.cache,
            store_auth,
            last_slot: STATIC_SLOT,
            previous: None,
            previous_error: None,
        }
    }
}

/// Prefixes a server realm with `<scheme://host:port>`.
///
/// # Examples
///
/// ```
/// use svn_core::SvnUrl;
/// use svn_core::auth::qualified_realm;
///
/// let url = SvnUrl::parse("svn://example.com/repo").unwrap();
/// assert_eq!(
///     qualified_realm(&url, "Team"),
///     "<svn://example.com:3690> Team"
/// );
/// ```
pub fn qualified_realm(url: &SvnUrl, realm: &str) -> String {
    format!("<{}> {realm}", url.server_root())
}
