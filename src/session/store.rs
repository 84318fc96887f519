//! Session store backed by redb embedded database.
//!
//! Provides persistent storage for browser sessions with:
//! - In-memory cache for hot sessions
//! - Replay prevention via assertion ID tracking
//! - TTL-based expiry

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{AuthenticatedUser, Session, SessionId, MAX_SESSION_TTL_SECS};

/// redb table for sessions (key: session_id hex, value: MessagePack bytes).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_sessions");

/// redb table for consumed assertion IDs (key: assertion_id, value: expiry timestamp).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_assertions");

/// The assertion ID was already consumed by an earlier login.
#[derive(Debug, thiserror::Error)]
#[error("SAML assertion replay detected: {0}")]
pub struct ReplayDetected(pub String);

/// Session store with in-memory cache and persistent storage.
pub struct SessionStore {
    db: Database,

    cache: RwLock<HashMap<SessionId, Session>>,

    /// Default session TTL in seconds.
    default_ttl_secs: u64,

    max_cache_size: usize,
}

impl SessionStore {
    /// Open or create a session store at the given path.
    pub fn open(path: PathBuf, default_ttl_secs: u64) -> Result<Self> {
        anyhow::ensure!(
            (1..=MAX_SESSION_TTL_SECS).contains(&default_ttl_secs),
            "Session TTL must be between 1 and {MAX_SESSION_TTL_SECS} seconds, got {default_ttl_secs}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }

        let db = Database::create(&path)
            .with_context(|| format!("Failed to open session database: {:?}", path))?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
        }
        write_txn.commit()?;

        let cache = Self::load_active_sessions(&db)?;
        debug!(sessions = cache.len(), "Loaded active sessions into cache");

        Ok(Self {
            db,
            cache: RwLock::new(cache),
            default_ttl_secs,
            max_cache_size: 10000,
        })
    }

    /// Record a successful login.
    ///
    /// Consumes `user.assertion_id`, drops the `previous` session and stores
    /// a fresh session under a new ID, all in one write transaction. A second
    /// call with the same assertion fails and leaves the store untouched.
    pub fn establish(
        &self,
        previous: Option<SessionId>,
        user: AuthenticatedUser,
        session_not_on_or_after: Option<DateTime<Utc>>,
        assertion_not_on_or_after: Option<DateTime<Utc>>,
    ) -> Result<Session> {
        let mut session = Session::new(self.default_ttl_secs);
        session.authenticate(user.clone(), session_not_on_or_after);

        let replay_until = match assertion_not_on_or_after {
            Some(limit) => limit.max(session.expires_at),
            None => session.expires_at,
        };
        let marker = rmp_serde::to_vec(&replay_until)?;
        let data = rmp_serde::to_vec(&session).context("Failed to serialize session")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            let used = assertions.get(user.assertion_id.as_str())?.is_some();
            if used {
                // Dropping the transaction aborts it.
                return Err(ReplayDetected(user.assertion_id).into());
            }
            assertions.insert(user.assertion_id.as_str(), marker.as_slice())?;

            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            if let Some(old) = previous {
                sessions.remove(old.to_hex().as_str())?;
            }
            sessions.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            if let Some(old) = previous {
                cache.remove(&old);
            }
            if cache.len() >= self.max_cache_size {
                self.evict_cache_lru(&mut cache);
            }
            cache.insert(session.id, session.clone());
        }

        info!(
            session = %session.id,
            user_id = user.name_id.as_deref().unwrap_or("-"),
            expires_at = %session.expires_at,
            "Session established"
        );
        Ok(session)
    }

    /// Get session by ID, updating last_accessed time.
    ///
    /// The access time is kept in the cache only. Reads never write the
    /// session back, so a read racing a logout or a login rotation cannot
    /// store the removed session again.
    pub fn get(&self, id: SessionId) -> Result<Option<Session>> {
        let Ok(mut cache) = self.cache.write() else {
            return Ok(self.load(id)?.filter(|session| !session.is_expired()));
        };

        if let Some(session) = cache.get_mut(&id) {
            if session.is_expired() {
                cache.remove(&id);
                // cleanup removes it from the database
                return Ok(None);
            }
            session.touch();
            return Ok(Some(session.clone()));
        }

        // Load and cache under the lock: removals commit to the database
        // before they clear the cache, so no stale copy survives them.
        let Some(mut session) = self.load(id)? else {
            return Ok(None);
        };
        if session.is_expired() {
            return Ok(None);
        }
        session.touch();

        if cache.len() >= self.max_cache_size {
            self.evict_cache_lru(&mut cache);
        }
        cache.insert(id, session.clone());
        Ok(Some(session))
    }

    /// Delete a session by ID.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;

        if let Ok(mut cache) = self.cache.write() {
            cache.remove(&id);
        }

        Ok(removed)
    }

    /// Evict all expired sessions and assertion records.
    /// Returns the number of sessions evicted.
    pub fn evict_expired(&self) -> Result<usize> {
        let now = Utc::now();

        if let Ok(mut cache) = self.cache.write() {
            cache.retain(|_, session| !session.is_expired());
        }

        let write_txn = self.db.begin_write()?;
        let evicted = {
            let mut sessions = write_txn.open_table(SESSIONS_TABLE)?;
            let mut expired = Vec::new();
            for entry in sessions.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<Session>(value.value()) {
                    Ok(session) if session.is_expired() => expired.push(key.value().to_string()),
                    Err(e) => {
                        warn!(key = key.value(), error = %e, "Failed to deserialize session, marking for deletion");
                        expired.push(key.value().to_string());
                    }
                    _ => {}
                }
            }
            for key in &expired {
                sessions.remove(key.as_str())?;
            }

            let mut assertions = write_txn.open_table(ASSERTIONS_TABLE)?;
            let mut consumed = Vec::new();
            for entry in assertions.iter()? {
                let (key, value) = entry?;
                match rmp_serde::from_slice::<DateTime<Utc>>(value.value()) {
                    Ok(until) if now > until => consumed.push(key.value().to_string()),
                    Err(_) => consumed.push(key.value().to_string()),
                    _ => {}
                }
            }
            for key in &consumed {
                assertions.remove(key.as_str())?;
            }

            expired.len()
        };
        write_txn.commit()?;

        Ok(evicted)
    }

    /// Number of stored sessions, expired ones included until cleanup runs.
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn load(&self, id: SessionId) -> Result<Option<Session>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let key = id.to_hex();
        let session = match table.get(key.as_str())? {
            Some(value) => Some(
                rmp_serde::from_slice::<Session>(value.value())
                    .context("Failed to deserialize session")?,
            ),
            None => None,
        };
        Ok(session)
    }

    fn load_active_sessions(db: &Database) -> Result<HashMap<SessionId, Session>> {
        let mut sessions = HashMap::new();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        for entry in table.iter()? {
            let (_, value) = entry?;
            match rmp_serde::from_slice::<Session>(value.value()) {
                Ok(session) if !session.is_expired() => {
                    sessions.insert(session.id, session);
                }
                _ => {}
            }
        }

        Ok(sessions)
    }

    /// Evict the least recently accessed session from cache.
    fn evict_cache_lru(&self, cache: &mut HashMap<SessionId, Session>) {
        if let Some(oldest_id) = cache
            .iter()
            .min_by_key(|(_, s)| s.last_accessed)
            .map(|(id, _)| *id)
        {
            cache.remove(&oldest_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::Attributes;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn test_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.redb");
        let store = SessionStore::open(path, 3600).unwrap();
        (store, dir)
    }

    /// Whether `assertion_id` is rejected as a replay. Consumes it otherwise.
    fn is_consumed(store: &SessionStore, assertion_id: &str) -> bool {
        match store.establish(None, user(assertion_id), None, None) {
            Ok(_) => false,
            Err(e) => e.downcast_ref::<ReplayDetected>().is_some(),
        }
    }

    fn user(assertion_id: &str) -> AuthenticatedUser {
        let mut attributes = Attributes::new();
        attributes.insert("uid".to_string(), vec!["user".to_string()]);
        AuthenticatedUser {
            name_id: Some("user@example.com".to_string()),
            name_id_format: None,
            session_index: Some("_idx".to_string()),
            attributes,
            assertion_id: assertion_id.to_string(),
            idp_entity_id: "https://idp.example.com".to_string(),
            authenticated_at: Utc::now(),
        }
    }

    #[test]
    fn test_session_establish_and_get() {
        let (store, _dir) = test_store();

        let session = store.establish(None, user("assertion-123"), None, None).unwrap();
        let retrieved = store.get(session.id).unwrap().unwrap();
        assert_eq!(retrieved.get("authenticated"), Some(json!(true)));
        assert_eq!(retrieved.get("userData"), Some(json!({ "uid": ["user"] })));
        assert_eq!(retrieved.user().unwrap().assertion_id, "assertion-123");
    }

    #[test]
    fn test_sessions_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sessions.redb");
        let id = {
            let store = SessionStore::open(path.clone(), 3600).unwrap();
            store.establish(None, user("assertion-persist"), None, None).unwrap().id
        };

        let store = SessionStore::open(path, 3600).unwrap();
        assert!(store.get(id).unwrap().unwrap().is_authenticated());
        assert!(is_consumed(&store, "assertion-persist"));
    }

    #[test]
    fn test_session_expiry() {
        let (store, _dir) = test_store();

        let expired = Utc::now() - chrono::Duration::seconds(10);
        let session = store
            .establish(None, user("assertion-456"), Some(expired), None)
            .unwrap();

        assert!(store.get(session.id).unwrap().is_none());
    }

    #[test]
    fn test_assertion_replay_prevention() {
        let (store, _dir) = test_store();

        let first = store.establish(None, user("unique-assertion"), None, None).unwrap();

        let err = store
            .establish(None, user("unique-assertion"), None, None)
            .unwrap_err();
        assert!(err.to_string().contains("replay"));
        assert!(err.downcast_ref::<ReplayDetected>().is_some());

        // The first login is untouched.
        assert!(store.get(first.id).unwrap().unwrap().is_authenticated());
        assert_eq!(store.session_count().unwrap(), 1);
    }

    #[test]
    fn test_concurrent_replay_creates_one_session() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.establish(None, user("double-submit"), None, None).is_ok())
            })
            .collect();
        let successes = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();

        assert_eq!(successes, 1);
        assert_eq!(store.session_count().unwrap(), 1);
    }

    #[test]
    fn test_establish_rotates_session_id() {
        let (store, _dir) = test_store();

        let first = store.establish(None, user("assertion-a"), None, None).unwrap();
        let second = store
            .establish(Some(first.id), user("assertion-b"), None, None)
            .unwrap();

        assert_ne!(first.id, second.id);
        assert!(store.get(first.id).unwrap().is_none());
        assert!(store.get(second.id).unwrap().is_some());
    }

    #[test]
    fn test_session_delete() {
        let (store, _dir) = test_store();

        let session = store.establish(None, user("assertion-789"), None, None).unwrap();
        assert!(store.get(session.id).unwrap().is_some());

        assert!(store.delete(session.id).unwrap());
        assert!(store.get(session.id).unwrap().is_none());
        assert!(!store.delete(session.id).unwrap());
    }

    #[test]
    fn test_evict_expired() {
        let (store, _dir) = test_store();

        let expired = Utc::now() - chrono::Duration::seconds(10);
        store
            .establish(None, user("assertion-expired"), Some(expired), Some(expired))
            .unwrap();
        store.establish(None, user("assertion-live"), None, None).unwrap();

        assert_eq!(store.evict_expired().unwrap(), 1);
        assert_eq!(store.session_count().unwrap(), 1);
        // Replay record outlives eviction while its session is live.
        assert!(is_consumed(&store, "assertion-live"));
        assert!(!is_consumed(&store, "assertion-expired"));
    }

    #[test]
    fn test_rejects_out_of_range_ttl() {
        let dir = tempdir().unwrap();
        assert!(SessionStore::open(dir.path().join("zero.redb"), 0).is_err());
        assert!(SessionStore::open(dir.path().join("huge.redb"), u64::MAX).is_err());
    }

    #[test]
    fn test_concurrent_reads_do_not_undo_logout() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);

        for round in 0..50 {
            let session = store
                .establish(None, user(&format!("logout-race-{round}")), None, None)
                .unwrap();
            let id = session.id;

            let reader = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        store.get(id).unwrap();
                    }
                })
            };
            assert!(store.delete(id).unwrap());
            reader.join().unwrap();

            assert!(store.get(id).unwrap().is_none(), "session revived in round {round}");
        }
        assert_eq!(store.session_count().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_reads_do_not_undo_rotation() {
        let (store, _dir) = test_store();
        let store = Arc::new(store);

        for round in 0..50 {
            let old = store
                .establish(None, user(&format!("rotate-old-{round}")), None, None)
                .unwrap()
                .id;

            let reader = {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        store.get(old).unwrap();
                    }
                })
            };
            let new = store
                .establish(Some(old), user(&format!("rotate-new-{round}")), None, None)
                .unwrap()
                .id;
            reader.join().unwrap();

            assert!(store.get(old).unwrap().is_none(), "old session revived in round {round}");
            assert!(store.get(new).unwrap().is_some());
            assert!(store.delete(new).unwrap());
        }
    }
}
