//! The seam between the engine's state machine and the protocol machinery.

use chrono::Utc;

use super::authn_request::AuthnRequest;
use super::metadata::{self, GeneratedMetadata};
use super::response;
use super::result::AssertionResult;
use crate::error::SamlError;
use crate::request::RequestContext;
use crate::settings::SpSettings;

/// Everything the engine needs from a SAML implementation.
pub trait SamlToolkit: Send + Sync {
    /// Build an AuthnRequest and return the IdP redirect URL.
    fn initiate_login(
        &self,
        settings: &SpSettings,
        request: &RequestContext,
        relay_state: Option<&str>,
    ) -> Result<String, SamlError>;

    /// Validate the IdP response carried by `request`.
    fn process_assertion(&self, settings: &SpSettings, request: &RequestContext) -> AssertionResult;

    fn generate_metadata(&self, settings: &SpSettings) -> GeneratedMetadata;
}

/// Redirect-binding AuthnRequests, in-tree XML-DSig verification and
/// format!-built metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeToolkit;

impl SamlToolkit for NativeToolkit {
    fn initiate_login(
        &self,
        settings: &SpSettings,
        _request: &RequestContext,
        relay_state: Option<&str>,
    ) -> Result<String, SamlError> {
        AuthnRequest::new(settings).redirect_url(settings, relay_state)
    }

    fn process_assertion(&self, settings: &SpSettings, request: &RequestContext) -> AssertionResult {
        response::validate(settings, request, Utc::now())
    }

    fn generate_metadata(&self, settings: &SpSettings) -> GeneratedMetadata {
        metadata::generate(settings)
    }
}
