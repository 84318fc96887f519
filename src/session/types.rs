//! Session types for SAML authentication persistence.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::saml::{Attributes, AuthenticatedIdentity};

/// Longest accepted session lifetime: one year.
pub const MAX_SESSION_TTL_SECS: u64 = 366 * 24 * 60 * 60;

/// Unique session identifier (16-byte random value, hex-encoded for storage).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn new() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 16] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The identity a successful ACS exchange bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    /// SAML NameID, when the IdP sent one.
    pub name_id: Option<String>,

    pub name_id_format: Option<String>,

    /// Session index from the AuthnStatement (for Single Logout).
    pub session_index: Option<String>,

    /// Asserted attributes; multi-valued attributes keep the IdP's order.
    pub attributes: Attributes,

    /// Assertion ID, recorded for replay prevention.
    pub assertion_id: String,

    /// IdP entity ID that issued the assertion.
    pub idp_entity_id: String,

    pub authenticated_at: DateTime<Utc>,
}

impl AuthenticatedUser {
    pub fn from_identity(identity: AuthenticatedIdentity) -> Self {
        Self {
            name_id: identity.name_id,
            name_id_format: identity.name_id_format,
            session_index: identity.session_index,
            attributes: identity.attributes,
            assertion_id: identity.assertion_id,
            idp_entity_id: identity.issuer,
            authenticated_at: Utc::now(),
        }
    }

    /// JSON view of the attributes, as stored under `userData`.
    pub fn user_data(&self) -> Value {
        Value::Object(
            self.attributes
                .iter()
                .map(|(name, values)| {
                    let values = values.iter().cloned().map(Value::String).collect();
                    (name.clone(), Value::Array(values))
                })
                .collect(),
        )
    }
}

/// A browser session.
///
/// The authenticated flag and the user data are one field, so no reader can
/// see one without the other.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    pub created_at: DateTime<Utc>,

    pub expires_at: DateTime<Utc>,

    /// Last access time (updated on each request).
    pub last_accessed: DateTime<Utc>,

    auth: Option<AuthenticatedUser>,
}

impl Session {
    /// A fresh, unauthenticated session. Lifetimes beyond
    /// [`MAX_SESSION_TTL_SECS`] are clamped to it.
    pub fn new(ttl_secs: u64) -> Self {
        let now = Utc::now();
        let ttl = i64::try_from(ttl_secs.min(MAX_SESSION_TTL_SECS))
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or_else(Duration::zero);
        Self {
            id: SessionId::new(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
            last_accessed: now,
            auth: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.is_some()
    }

    pub fn user(&self) -> Option<&AuthenticatedUser> {
        self.auth.as_ref()
    }

    /// Read a session field. `authenticated` always reads as a boolean;
    /// `userData`, `sessionIndex` and `nameId` are absent unless authenticated.
    pub fn get(&self, key: &str) -> Option<Value> {
        match key {
            "authenticated" => Some(Value::Bool(self.is_authenticated())),
            "userData" => self.auth.as_ref().map(AuthenticatedUser::user_data),
            "sessionIndex" => self
                .auth
                .as_ref()?
                .session_index
                .clone()
                .map(Value::String),
            "nameId" => self.auth.as_ref()?.name_id.clone().map(Value::String),
            _ => None,
        }
    }

    /// Bind `user` to this session in one step. The lifetime is capped at
    /// `not_on_or_after` when the IdP limited it.
    pub fn authenticate(&mut self, user: AuthenticatedUser, not_on_or_after: Option<DateTime<Utc>>) {
        if let Some(limit) = not_on_or_after {
            self.expires_at = self.expires_at.min(limit);
        }
        self.auth = Some(user);
    }
}
