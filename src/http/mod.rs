//! HTTP surface of the gateway.

mod routes;
mod views;

use std::sync::Arc;

use axum::{
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::error::AppError;
use crate::request::AdapterOptions;
use crate::session::{CookieConfig, CookieSigner, Session, SessionId, SessionStore};
use crate::settings::SpSettings;

/// Shared by every handler. Settings are read-only for the process lifetime.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<SpSettings>,
    pub sessions: Arc<SessionStore>,
    pub signer: CookieSigner,
    pub cookies: CookieConfig,
    pub adapter: AdapterOptions,
}

impl AppState {
    /// Session ID from a correctly signed cookie. Forged or stale cookies
    /// read as no session.
    pub fn session_id(&self, headers: &HeaderMap) -> Option<SessionId> {
        let value = self.cookies.find(headers)?;
        let id = self.signer.verify(value);
        if id.is_none() {
            debug!("Ignoring session cookie with invalid signature");
        }
        id
    }

    pub async fn current_session(&self, headers: &HeaderMap) -> Result<Option<Session>, AppError> {
        let Some(id) = self.session_id(headers) else {
            return Ok(None);
        };
        self.with_store(move |store| store.get(id))
            .await
            .map_err(|e| AppError::Session(format!("{e:#}")))
    }

    /// Run a store operation on the blocking pool; redb commits fsync.
    pub async fn with_store<T, F>(&self, op: F) -> anyhow::Result<T>
    where
        F: FnOnce(&SessionStore) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.sessions);
        tokio::task::spawn_blocking(move || op(&store)).await?
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(routes::home))
        .route("/saml/metadata", get(routes::metadata))
        .route("/saml/login", get(routes::login))
        .route("/saml/acs", post(routes::acs))
        .route("/authenticated", get(routes::authenticated))
        .route("/logout", get(routes::logout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
