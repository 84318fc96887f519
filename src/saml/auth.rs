//! SAML authentication engine.
//!
//! One engine per HTTP request. Settings are shared read-only; the request
//! context and the result are owned by the engine and dropped with it.

use std::sync::Arc;

use tracing::{info, warn};

use super::metadata::GeneratedMetadata;
use super::result::{AssertionResult, Attributes};
use super::toolkit::{NativeToolkit, SamlToolkit};
use crate::error::{AssertionValidationError, ErrorKind, SamlError};
use crate::request::RequestContext;
use crate::settings::SpSettings;

/// Position in the SP-initiated login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    LoginInitiated,
    AssertionPending,
    Authenticated,
    AuthenticationFailed,
}

pub struct SamlAuth<T: SamlToolkit = NativeToolkit> {
    settings: Arc<SpSettings>,
    request: RequestContext,
    toolkit: T,
    state: AuthState,
    result: Option<AssertionResult>,
}

impl SamlAuth<NativeToolkit> {
    pub fn new(settings: Arc<SpSettings>, request: RequestContext) -> Self {
        Self::with_toolkit(settings, request, NativeToolkit)
    }
}

impl<T: SamlToolkit> SamlAuth<T> {
    pub fn with_toolkit(settings: Arc<SpSettings>, request: RequestContext, toolkit: T) -> Self {
        Self {
            settings,
            request,
            toolkit,
            state: AuthState::Unauthenticated,
            result: None,
        }
    }

    /// Start SP-initiated login. Returns the URL to redirect the browser to.
    ///
    /// `relay_state` is opaque and round-trips through the IdP untouched.
    pub fn login(&mut self, relay_state: Option<&str>) -> Result<String, SamlError> {
        let url = self
            .toolkit
            .initiate_login(&self.settings, &self.request, relay_state)?;
        self.result = None;
        self.state = AuthState::LoginInitiated;
        Ok(url)
    }

    /// Validate the IdP response posted to the ACS. Returns whether the
    /// user is now authenticated.
    pub fn process_response(&mut self) -> bool {
        self.state = AuthState::AssertionPending;
        let result = self
            .toolkit
            .process_assertion(&self.settings, &self.request);
        self.state = if result.is_valid() {
            AuthState::Authenticated
        } else {
            AuthState::AuthenticationFailed
        };
        self.result = Some(result);

        if self.is_authenticated() {
            info!(
                name_id = self.name_id().unwrap_or("-"),
                session_index = self.session_index().unwrap_or("-"),
                attributes = self.attributes().map_or(0, |attributes| attributes.len()),
                "SAML assertion validated"
            );
            true
        } else {
            warn!(
                errors = ?self.errors(),
                kinds = ?self.error_kinds(),
                "SAML assertion rejected"
            );
            false
        }
    }

    /// Error messages from the most recent `process_response`. Empty only
    /// after a successful one.
    pub fn errors(&self) -> Vec<String> {
        self.result
            .as_ref()
            .map(|result| {
                result
                    .errors()
                    .iter()
                    .map(|e| e.message().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.result
            .as_ref()
            .map(AssertionResult::error_kinds)
            .unwrap_or_default()
    }

    /// The failure of the last `process_response` as one aggregated error.
    pub fn validation_error(&self) -> Option<AssertionValidationError> {
        let result = self.result.as_ref()?;
        (!result.is_valid()).then(|| AssertionValidationError(result.errors().to_vec()))
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::Authenticated
    }

    pub fn session_index(&self) -> Option<&str> {
        self.result.as_ref()?.session_index()
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        self.result.as_ref()?.attributes()
    }

    pub fn name_id(&self) -> Option<&str> {
        self.result.as_ref()?.name_id()
    }

    pub fn take_result(&mut self) -> Option<AssertionResult> {
        self.result.take()
    }

    pub fn metadata(&self) -> GeneratedMetadata {
        self.toolkit.generate_metadata(&self.settings)
    }
}
