use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Credential, CredentialKind, CredentialProvider, CredentialRequest};
use crate::SvnError;

/// Caller-supplied username and password, offered once per negotiation.
#[derive(Clone)]
pub struct StaticProvider {
    username: String,
    password: String,
    storage_allowed: bool,
}

impl std::fmt::Debug for StaticProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticProvider")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl StaticProvider {
    /// Creates a provider for one username and password.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            storage_allowed: true,
        }
    }

    pub(crate) fn with_storage_allowed(mut self, allowed: bool) -> Self {
        self.storage_allowed = allowed;
        self
    }
}

impl CredentialProvider for StaticProvider {
    fn request(&self, request: &CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> {
        if request.previous.is_some() || self.username.trim().is_empty() {
            return Ok(None);
        }
        let credential = match request.kind {
            CredentialKind::Password => Credential::password(&self.username, &self.password),
            CredentialKind::Ssh => Credential::ssh_password(&self.username, &self.password),
        };
        Ok(Some(credential.with_storage_allowed(self.storage_allowed)))
    }
}

/// In-process credential cache keyed by kind and realm.
///
/// Clones share one map, so a cache can back several managers.
#[derive(Clone, Debug, Default)]
pub struct RuntimeCache {
    entries: Arc<Mutex<HashMap<String, Credential>>>,
}

impl RuntimeCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(kind: CredentialKind, realm: &str) -> String {
        format!("{}${realm}", kind.as_str())
    }

    /// Returns the cached credential for `kind` and `realm`.
    pub fn get(&self, kind: CredentialKind, realm: &str) -> Option<Credential> {
        self.entries
            .lock()
            .ok()
            .and_then(|entries| entries.get(&Self::key(kind, realm)).cloned())
    }

    /// Caches `credential` for `kind` and `realm`.
    pub fn insert(&self, kind: CredentialKind, realm: &str, credential: Credential) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(Self::key(kind, realm), credential);
        }
    }

    /// Forgets every cached credential.
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}

impl CredentialProvider for RuntimeCache {
    fn request(&self, request: &CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> {
        if request.previous.is_some() {
            return Ok(None);
        }
        Ok(self.get(request.kind, request.realm))
    }

    fn save(
        &self,
        kind: CredentialKind,
        realm: &str,
        credential: &Credential,
    ) -> Result<(), SvnError> {
        self.insert(kind, realm, credential.clone());
        Ok(())
    }
}

/// Adapts a closure into a [`CredentialProvider`].
///
/// Returning `Ok(None)` from the interactive slot cancels the negotiation.
///
/// # Examples
///
/// ```
/// use svn_core::auth::{AuthManager, CallbackProvider, Credential, CredentialKind};
///
/// let prompt = CallbackProvider::new(|request| {
///     Ok(request
///         .previous
///         .is_none()
///         .then(|| Credential::password("guest", "guest")))
/// });
/// let mut manager = AuthManager::builder().interactive(prompt).build();
/// let credential = manager
///     .first(CredentialKind::Password, "<svn://host:3690> repo", None)
///     .unwrap();
/// assert_eq!(credential.username(), "guest");
/// ```
pub struct CallbackProvider<F> {
    callback: F,
}

impl<F> CallbackProvider<F>
where
    F: Fn(&CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> + Send + Sync,
{
    /// Wraps `callback`.
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

impl<F> CredentialProvider for CallbackProvider<F>
where
    F: Fn(&CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> + Send + Sync,
{
    fn request(&self, request: &CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> {
        (self.callback)(request)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn request<'a>(kind: CredentialKind, previous: Option<&'a Credential>) -> CredentialRequest<'a> {
        CredentialRequest {
            kind,
            realm: "realm",
            url: None,
            previous_error: None,
            previous,
            may_store: true,
        }
    }

    #[test]
    fn static_provider_answers_only_the_first_request() {
        let provider = StaticProvider::new("alice", "pw");
        let first = provider
            .request(&request(CredentialKind::Password, None))
            .unwrap()
            .unwrap();
        assert_eq!(first, Credential::password("alice", "pw"));
        assert!(
            provider
                .request(&request(CredentialKind::Password, Some(&first)))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn static_provider_builds_ssh_logins() {
        let provider = StaticProvider::new("alice", "pw");
        let cred = provider
            .request(&request(CredentialKind::Ssh, None))
            .unwrap()
            .unwrap();
        assert_eq!(cred, Credential::ssh_password("alice", "pw"));
    }

    #[test]
    fn blank_static_username_is_skipped() {
        let provider = StaticProvider::new("  ", "pw");
        assert!(
            provider
                .request(&request(CredentialKind::Password, None))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn cache_keys_by_kind_and_realm() {
        let cache = RuntimeCache::new();
        cache.insert(CredentialKind::Password, "realm", Credential::password("a", "b"));
        assert!(cache.get(CredentialKind::Ssh, "realm").is_none());
        assert!(cache.get(CredentialKind::Password, "other").is_none());
        let hit = cache
            .request(&request(CredentialKind::Password, None))
            .unwrap();
        assert_eq!(hit.unwrap().username(), "a");

        let previous = Credential::password("a", "b");
        assert!(
            cache
                .request(&request(CredentialKind::Password, Some(&previous)))
                .unwrap()
                .is_none()
        );
        cache.clear();
        assert!(cache.get(CredentialKind::Password, "realm").is_none());
    }
}
