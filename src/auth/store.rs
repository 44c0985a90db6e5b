use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};
use tracing::debug;

use super::{Credential, CredentialKind, CredentialProvider, CredentialRequest, SshSecret};
use crate::SvnError;

const REALM_KEY: &str = "svn:realmstring";

/// Credentials saved on disk in the Subversion `auth` directory layout.
///
/// Each credential lives in `<dir>/<kind>/<md5-hex(realm)>` as a hash dump
/// (`K n` / `V n` / `END`). Files whose stored realm differs from the
/// requested one are ignored.
#[derive(Clone, Debug)]
pub struct PersistentStore {
    dir: PathBuf,
}

impl PersistentStore {
    /// Uses `dir` as the root of the store.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The file holding the credential for `kind` and `realm`.
    pub fn path_for(&self, kind: CredentialKind, realm: &str) -> PathBuf {
        self.dir
            .join(kind.as_str())
            .join(hex::encode(Md5::digest(realm.as_bytes())))
    }

    /// Loads the credential stored for `kind` and `realm`.
    pub fn load(&self, kind: CredentialKind, realm: &str) -> Result<Option<Credential>, SvnError> {
        let path = self.path_for(kind, realm);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(values) = read_hash(&bytes) else {
            debug!(path = %path.display(), "ignoring malformed credential file");
            return Ok(None);
        };
        if values.get(REALM_KEY).map(String::as_str) != Some(realm) {
            return Ok(None);
        }
        let Some(username) = values.get("username").filter(|u| !u.trim().is_empty()) else {
            return Ok(None);
        };
        let password = values.get("password").cloned();
        let credential = match kind {
            CredentialKind::Password => Credential::password(username, password.unwrap_or_default()),
            CredentialKind::Ssh => match (values.get("key"), password) {
                (Some(key), _) => {
                    Credential::ssh_key(username, key, values.get("passphrase").cloned())
                }
                (None, Some(password)) => Credential::ssh_password(username, password),
                (None, None) => return Ok(None),
            },
        };
        Ok(Some(credential))
    }

    /// Writes `credential` for `kind` and `realm`, replacing any earlier file.
    pub fn store(
        &self,
        kind: CredentialKind,
        realm: &str,
        credential: &Credential,
    ) -> Result<(), SvnError> {
        let path = self.path_for(kind, realm);
        let dir = path
            .parent()
            .ok_or_else(|| SvnError::InvalidPath(path.display().to_string()))?;
        std::fs::create_dir_all(dir)?;

        let mut values = BTreeMap::new();
        values.insert(REALM_KEY, realm.to_string());
        values.insert("username", credential.username().to_string());
        match credential {
            Credential::Password { password, .. } => {
                values.insert("password", password.clone());
            }
            Credential::Ssh { secret, .. } => match secret {
                SshSecret::Password(password) => {
                    values.insert("password", password.clone());
                }
                SshSecret::KeyFile { path, passphrase } => {
                    values.insert("key", path.display().to_string());
                    if let Some(passphrase) = passphrase {
                        values.insert("passphrase", passphrase.clone());
                    }
                }
            },
        }

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(&write_hash(&values))?;
        file.flush()?;
        file.persist(&path).map_err(|err| SvnError::Io(err.error))?;
        debug!(kind = kind.as_str(), path = %path.display(), "stored credential");
        Ok(())
    }

    /// The root directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CredentialProvider for PersistentStore {
    fn request(&self, request: &CredentialRequest<'_>) -> Result<Option<Credential>, SvnError> {
        let credential = match self.load(request.kind, request.realm) {
            Ok(credential) => credential,
            Err(err) => {
                debug!(error = %err, "failed to read stored credential");
                None
            }
        };
        Ok(credential.map(|c| c.with_storage_allowed(request.may_store)))
    }

    fn save(
        &self,
        kind: CredentialKind,
        realm: &str,
        credential: &Credential,
    ) -> Result<(), SvnError> {
        self.store(kind, realm, credential)
    }
}

fn write_hash(values: &BTreeMap<&str, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in values {
        out.extend_from_slice(format!("K {}\n{key}\nV {}\n{value}\n", key.len(), value.len()).as_bytes());
    }
    out.extend_from_slice(b"END\n");
    out
}

fn read_hash(bytes: &[u8]) -> Option<BTreeMap<String, String>> {
    let mut values = BTreeMap::new();
    let mut rest = bytes;
    loop {
        let (header, after) = split_line(rest)?;
        if header == b"END" {
            return Some(values);
        }
        let (key, after) = read_entry(header, b'K', after)?;
        let (header, after) = split_line(after)?;
        let (value, after) = read_entry(header, b'V', after)?;
        values.insert(key, value);
        rest = after;
    }
}

fn split_line(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    let end = bytes.iter().position(|&b| b == b'\n')?;
    Some((&bytes[..end], &bytes[end + 1..]))
}

fn read_entry<'a>(header: &[u8], tag: u8, rest: &'a [u8]) -> Option<(String, &'a [u8])> {
    let len = match header {
        [t, b' ', digits @ ..] if *t == tag => std::str::from_utf8(digits).ok()?.parse().ok()?,
        _ => return None,
    };
    if rest.len() <= len || rest[len] != b'\n' {
        return None;
    }
    let text = String::from_utf8(rest[..len].to_vec()).ok()?;
    Some((text, &rest[len + 1..]))
}
