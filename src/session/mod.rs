//! Session management for SAML authentication.
//!
//! Sessions live in redb behind an in-memory cache; the browser only holds
//! a signed cookie naming its session. Expired sessions are evicted in the
//! background.

pub mod cleanup;
pub mod cookie;
pub mod store;
pub mod types;

pub use cleanup::{spawn_cleanup_task, DEFAULT_CLEANUP_INTERVAL_SECS};
pub use cookie::{CookieConfig, CookieSigner, DEFAULT_COOKIE_NAME};
pub use store::{ReplayDetected, SessionStore};
pub use types::{AuthenticatedUser, Session, SessionId, MAX_SESSION_TTL_SECS};
