//! Route handlers: translate HTTP into engine and session calls.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};
use chrono::Utc;
use tracing::{debug, info, warn};

use super::views;
use super::AppState;
use crate::error::{AppError, AssertionError, AssertionValidationError, MalformedRequestError};
use crate::request::{self, RequestContext};
use crate::saml::{AssertionResult, SamlAuth};
use crate::session::{AuthenticatedUser, ReplayDetected};

/// Largest ACS form body accepted.
const MAX_FORM_BYTES: usize = 1024 * 1024;

/// 302 to `location`.
fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}

fn not_validated() -> AssertionValidationError {
    AssertionValidationError(vec![AssertionError::format(
        "SAML Response could not be validated",
    )])
}

async fn context(state: &AppState, parts: &Parts, body: Body) -> Result<RequestContext, AppError> {
    let body = to_bytes(body, MAX_FORM_BYTES)
        .await
        .map_err(|e| MalformedRequestError::Body(e.to_string()))?;
    Ok(request::adapt(parts, &body, state.adapter)?)
}

pub async fn home(State(state): State<AppState>, headers: HeaderMap) -> Result<Html<String>, AppError> {
    let authenticated = state
        .current_session(&headers)
        .await?
        .and_then(|session| session.get("authenticated"))
        .and_then(|value| value.as_bool())
        .unwrap_or(false);

    Ok(Html(if authenticated {
        views::already_authenticated()
    } else {
        views::login_prompt()
    }))
}

pub async fn metadata(State(state): State<AppState>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let context = context(&state, &parts, body).await?;
    let auth = SamlAuth::new(Arc::clone(&state.settings), context);

    let xml = auth.metadata().into_result().inspect_err(|e| {
        warn!(errors = ?e.0, "Generated SP metadata failed validation");
    })?;
    Ok(([(header::CONTENT_TYPE, "text/xml")], xml).into_response())
}

pub async fn login(State(state): State<AppState>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let context = context(&state, &parts, body).await?;
    let relay_state = context.get_param("return_to").map(str::to_string);

    let mut auth = SamlAuth::new(Arc::clone(&state.settings), context);
    let url = auth.login(relay_state.as_deref())?;
    debug!(relay_state = relay_state.as_deref().unwrap_or("-"), "Redirecting to IdP");
    Ok(found(&url))
}

pub async fn acs(State(state): State<AppState>, request: Request) -> Result<Response, AppError> {
    let (parts, body) = request.into_parts();
    let context = context(&state, &parts, body).await?;
    let previous = state.session_id(&parts.headers);

    let mut auth = SamlAuth::new(Arc::clone(&state.settings), context);
    if !auth.process_response() {
        let error = auth.validation_error().unwrap_or_else(not_validated);
        return Err(error.into());
    }

    let identity = auth
        .take_result()
        .and_then(AssertionResult::into_identity)
        .ok_or_else(not_validated)?;
    let session_limit = identity.session_not_on_or_after;
    let assertion_limit = identity.assertion_not_on_or_after;
    let user = AuthenticatedUser::from_identity(identity);

    let session = state
        .with_store(move |store| store.establish(previous, user, session_limit, assertion_limit))
        .await
        .map_err(|e| match e.downcast_ref::<ReplayDetected>() {
            Some(replay) => {
                warn!(error = %replay, "Rejected replayed SAML assertion");
                AppError::Replay(replay.to_string())
            }
            None => AppError::Session(format!("{e:#}")),
        })?;

    let max_age = (session.expires_at - Utc::now()).num_seconds();
    let cookie = state
        .cookies
        .session_cookie(&state.signer.sign(session.id), max_age);

    Ok((
        StatusCode::FOUND,
        [
            (header::LOCATION, "/".to_string()),
            (header::SET_COOKIE, cookie),
        ],
    )
        .into_response())
}

pub async fn authenticated(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    let session = state.current_session(&headers).await?;
    let Some(user) = session.as_ref().and_then(|session| session.user()) else {
        return Ok(found("/"));
    };
    Ok(Html(views::authenticated(user.name_id.as_deref(), &user.attributes)).into_response())
}

pub async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Result<Response, AppError> {
    if let Some(id) = state.session_id(&headers) {
        let removed = state
            .with_store(move |store| store.delete(id))
            .await
            .map_err(|e| AppError::Session(format!("{e:#}")))?;
        info!(session = %id, removed, "Session logged out");
    }

    Ok((
        [(header::SET_COOKIE, state.cookies.expired_cookie())],
        Html(views::logged_out()),
    )
        .into_response())
}
