//! Signed session cookies.
//!
//! The cookie value is `{session_id_hex}.{hmac_sha256_hex}`. Only the ID
//! travels to the browser; everything else stays in the store.

use axum::http::{header, HeaderMap};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::types::SessionId;

type HmacSha256 = Hmac<Sha256>;

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

pub const DEFAULT_COOKIE_NAME: &str = "saml_session";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("session secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    TooShort(usize),
    #[error("session secret rejected as HMAC key")]
    InvalidKey,
}

/// Signs and verifies session cookies with the process-wide secret.
///
/// Changing the secret invalidates every cookie issued under the old one.
#[derive(Clone)]
pub struct CookieSigner {
    keyed: HmacSha256,
}

impl std::fmt::Debug for CookieSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieSigner").finish_non_exhaustive()
    }
}

impl CookieSigner {
    pub fn new(secret: &[u8]) -> Result<Self, SecretError> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(SecretError::TooShort(secret.len()));
        }
        let keyed = HmacSha256::new_from_slice(secret).map_err(|_| SecretError::InvalidKey)?;
        Ok(Self { keyed })
    }

    pub fn sign(&self, id: SessionId) -> String {
        let id = id.to_hex();
        let mac = hex::encode(self.mac(&id).finalize().into_bytes());
        format!("{id}.{mac}")
    }

    /// The session ID carried by `value`, if the signature checks out.
    pub fn verify(&self, value: &str) -> Option<SessionId> {
        let (id, signature) = value.split_once('.')?;
        let signature = hex::decode(signature).ok()?;
        self.mac(id).verify_slice(&signature).ok()?;
        SessionId::from_hex(id)
    }

    fn mac(&self, data: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(data.as_bytes());
        mac
    }
}

/// Cookie attributes shared by every `Set-Cookie` the gateway emits.
#[derive(Debug, Clone)]
pub struct CookieConfig {
    pub name: String,
    /// Adds `Secure`. Only disabled for plain-HTTP development.
    pub secure: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_COOKIE_NAME.to_string(),
            secure: true,
        }
    }
}

impl CookieConfig {
    /// `Set-Cookie` value binding the browser to a session.
    pub fn session_cookie(&self, value: &str, max_age_secs: i64) -> String {
        self.render(value, max_age_secs.max(0))
    }

    /// `Set-Cookie` value that makes the browser forget the session.
    pub fn expired_cookie(&self) -> String {
        self.render("", 0)
    }

    fn render(&self, value: &str, max_age_secs: i64) -> String {
        let mut cookie = format!(
            "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
            self.name, value, max_age_secs
        );
        if self.secure {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Value of this cookie in the request's `Cookie` headers.
    pub fn find<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.name)
            .map(|(_, value)| value)
    }
}
