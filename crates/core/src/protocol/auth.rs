//! RTSP authentication.
//!
//! - **Basic** (RFC 2617 §2): the server side. Every request except
//!   OPTIONS must carry `Authorization: Basic base64(user:pass)` when the
//!   server has credentials configured.
//! - **Digest** (RFC 2069): the push client side. The server's
//!   `WWW-Authenticate` challenge supplies realm and nonce; the client
//!   answers with
//!   `MD5(MD5(user:realm:pass):nonce:MD5(method:uri))` in lowercase hex.

use base64::prelude::{BASE64_STANDARD, Engine as _};

/// A username/password pair.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// `Authorization` header value for Basic authentication.
    pub fn basic_header(&self) -> String {
        format!(
            "Basic {}",
            BASE64_STANDARD.encode(format!("{}:{}", self.username, self.password))
        )
    }

    /// Check a request's `Authorization` header against these credentials.
    pub fn check_basic(&self, header: Option<&str>) -> bool {
        let Some(value) = header else {
            return false;
        };
        let Some(encoded) = value
            .trim()
            .strip_prefix("Basic ")
            .or_else(|| value.trim().strip_prefix("basic "))
        else {
            return false;
        };
        match BASE64_STANDARD.decode(encoded.trim()) {
            Ok(decoded) => decoded == format!("{}:{}", self.username, self.password).as_bytes(),
            Err(_) => false,
        }
    }
}

/// The realm and nonce of a Digest challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate: Digest realm="...", nonce="..."` value.
    pub fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Digest")?;
        let mut realm = None;
        let mut nonce = None;
        for param in params.split(',') {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_string();
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            nonce: nonce?,
        })
    }

    /// The `response=` hash for one request.
    pub fn response(&self, credentials: &Credentials, method: &str, uri: &str) -> String {
        digest_response(
            &credentials.username,
            &credentials.password,
            &self.realm,
            &self.nonce,
            method,
            uri,
        )
    }

    /// Full `Authorization` header value for one request.
    pub fn authorization(&self, credentials: &Credentials, method: &str, uri: &str) -> String {
        format!(
            "Digest username=\"{}\",realm=\"{}\",nonce=\"{}\",uri=\"{}\",response=\"{}\"",
            credentials.username,
            self.realm,
            self.nonce,
            uri,
            self.response(credentials, method, uri)
        )
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// RFC 2069 digest: `MD5(HA1:nonce:HA2)` with `HA1 = MD5(user:realm:pass)`
/// and `HA2 = MD5(method:uri)`.
pub fn digest_response(
    username: &str,
    password: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{username}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}
