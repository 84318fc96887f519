//! Background session cleanup task.
//!
//! Periodically evicts expired sessions and consumed-assertion records.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use super::store::SessionStore;

/// Default cleanup interval in seconds.
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300; // 5 minutes

/// Spawn a background task that periodically cleans up expired sessions.
///
/// Returns a `JoinHandle` that can be used to abort the task.
pub fn spawn_cleanup_task(
    session_store: Arc<SessionStore>,
    cleanup_interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(cleanup_interval_secs.max(1)));

        // Skip the first immediate tick
        ticker.tick().await;

        loop {
            ticker.tick().await;

            // redb commits fsync, so keep them off the async workers
            let store = Arc::clone(&session_store);
            let evicted = tokio::task::spawn_blocking(move || store.evict_expired()).await;

            match evicted {
                Ok(Ok(count)) => {
                    if count > 0 {
                        info!(evicted = count, "Session cleanup completed");
                    } else {
                        debug!("Session cleanup: no expired sessions");
                    }
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Session cleanup failed");
                }
                Err(e) => {
                    warn!(error = %e, "Session cleanup task panicked");
                }
            }

            match session_store.session_count() {
                Ok(count) => {
                    debug!(active_sessions = count, "Session store status");
                }
                Err(e) => {
                    debug!(error = %e, "Failed to get session count");
                }
            }
        }
    })
}
