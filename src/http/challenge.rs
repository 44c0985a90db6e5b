use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::SvnError;
use crate::auth::Credential;

/// One challenge from a `WWW-Authenticate` header.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Challenge {
    /// Scheme name as sent by the server, e.g. `Basic` or `Digest`.
    pub scheme: String,
    /// Parameters keyed by lowercase name, with quotes removed.
    pub params: BTreeMap<String, String>,
}

impl Challenge {
    /// Looks up a parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The `realm` parameter.
    pub fn realm(&self) -> Option<&str> {
        self.param("realm")
    }

    fn is(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
    }

    /// Builds the `Authorization` header value answering this challenge.
    ///
    /// `nonce_count` is the per-connection Digest counter and is advanced
    /// on each Digest answer.
    pub(crate) fn authorization(
        &self,
        credential: &Credential,
        method: &str,
        uri: &str,
        nonce_count: &mut u32,
    ) -> Result<String, SvnError> {
        let password = credential
            .password_secret()
            .ok_or_else(|| SvnError::AuthFailed("credential has no password".to_string()))?;
        if self.is("Basic") {
            let token = STANDARD.encode(format!("{}:{password}", credential.username()));
            return Ok(format!("Basic {token}"));
        }
        if self.is("Digest") {
            *nonce_count = nonce_count.wrapping_add(1);
            let cnonce = client_nonce(self.param("nonce").unwrap_or_default(), *nonce_count);
            return self.digest(credential.username(), password, method, uri, *nonce_count, &cnonce);
        }
        Err(SvnError::AuthFailed(format!(
            "authentication method '{}' is not supported",
            self.scheme
        )))
    }

    fn digest(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
        nonce_count: u32,
        cnonce: &str,
    ) -> Result<String, SvnError> {
        let realm = self.realm().unwrap_or_default();
        let nonce = self
            .param("nonce")
            .ok_or_else(|| SvnError::AuthFailed("digest challenge without nonce".to_string()))?;
        let algorithm = self.param("algorithm");
        let qop_auth = self
            .param("qop")
            .is_some_and(|qop| qop.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")));
        let nc = format!("{nonce_count:08x}");

        let mut ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
        match algorithm {
            None => {}
            Some(alg) if alg.eq_ignore_ascii_case("MD5") => {}
            Some(alg) if alg.eq_ignore_ascii_case("MD5-sess") => {
                ha1 = md5_hex(&format!("{ha1}:{nonce}:{cnonce}"));
            }
            Some(alg) => {
                return Err(SvnError::AuthFailed(format!(
                    "digest algorithm '{alg}' is not supported"
                )));
            }
        }
        let ha2 = md5_hex(&format!("{method}:{uri}"));
        let response = if qop_auth {
            md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
        } else {
            md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
        };

        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{realm}\", nonce=\"{nonce}\", uri=\"{uri}\", response=\"{response}\""
        );
        if let Some(alg) = algorithm {
            header.push_str(&format!(", algorithm={alg}"));
        }
        if let Some(opaque) = self.param("opaque") {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        if qop_auth {
            header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
        }
        Ok(header)
    }
}

/// Picks the strongest supported challenge: Digest, then Basic.
pub(crate) fn select(challenges: &[Challenge]) -> Option<&Challenge> {
    challenges
        .iter()
        .find(|c| c.is("Digest"))
        .or_else(|| challenges.iter().find(|c| c.is("Basic")))
}

/// Parses `WWW-Authenticate` header values.
///
/// A header may carry several challenges separated by commas; a token not
/// followed by `=` starts a new challenge.
///
/// ```
/// use svn_core::http::parse_challenges;
///
/// let parsed = parse_challenges(["Digest realm=\"svn\", nonce=\"abc\", qop=\"auth\", Basic realm=\"svn\""]);
/// assert_eq!(parsed.len(), 2);
/// assert_eq!(parsed[0].param("nonce"), Some("abc"));
/// assert_eq!(parsed[1].scheme, "Basic");
/// ```
pub fn parse_challenges<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Challenge> {
    let mut out: Vec<Challenge> = Vec::new();
    for value in values {
        let start = out.len();
        let mut rest = value;
        loop {
            rest = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
            if rest.is_empty() {
                break;
            }
            let end = rest
                .find(|c: char| c == ',' || c == '=' || c.is_whitespace())
                .unwrap_or(rest.len());
            if end == 0 {
                // Stray '='.
                rest = &rest[1..];
                continue;
            }
            let token = &rest[..end];
            let after = rest[end..].trim_start();
            if out.len() > start
                && let Some(raw) = after.strip_prefix('=')
            {
                let (value, remainder) = parse_value(raw.trim_start());
                if let Some(current) = out.last_mut() {
                    current.params.insert(token.to_ascii_lowercase(), value);
                }
                rest = remainder;
            } else {
                out.push(Challenge {
                    scheme: token.to_string(),
                    params: BTreeMap::new(),
                });
                rest = after;
            }
        }
    }
    out
}

fn parse_value(input: &str) -> (String, &str) {
    if let Some(quoted) = input.strip_prefix('"') {
        let mut value = String::new();
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '"' => return (value, &quoted[i + 1..]),
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                _ => value.push(c),
            }
        }
        return (value, "");
    }
    let end = input.find(',').unwrap_or(input.len());
    (input[..end].trim_end().to_string(), &input[end..])
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

fn client_nonce(nonce: &str, nonce_count: u32) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut digest = md5_hex(&format!("{nonce}:{nonce_count}:{nanos}"));
    digest.truncate(16);
    digest
}
