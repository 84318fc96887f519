//! Outcome of processing an IdP response.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AssertionError, ErrorKind};

/// Attribute name to values, in the order the IdP asserted them.
pub type Attributes = BTreeMap<String, Vec<String>>;

/// Identity established by a valid assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedIdentity {
    pub name_id: Option<String>,
    pub name_id_format: Option<String>,
    pub session_index: Option<String>,
    pub attributes: Attributes,
    pub assertion_id: String,
    pub issuer: String,
    /// `SessionNotOnOrAfter` from the AuthnStatement, if the IdP set one.
    pub session_not_on_or_after: Option<DateTime<Utc>>,
    /// Latest instant at which the assertion itself is acceptable.
    pub assertion_not_on_or_after: Option<DateTime<Utc>>,
}

/// Either a validated identity or the complete list of validation failures.
///
/// The fields are private so the two can never be observed together.
#[derive(Debug, Clone)]
pub struct AssertionResult {
    identity: Option<AuthenticatedIdentity>,
    errors: Vec<AssertionError>,
}

impl AssertionResult {
    pub fn valid(identity: AuthenticatedIdentity) -> Self {
        Self {
            identity: Some(identity),
            errors: Vec::new(),
        }
    }

    /// An invalid result. An empty error list is replaced by a generic
    /// failure so that invalid results always explain themselves.
    pub fn invalid(errors: Vec<AssertionError>) -> Self {
        let errors = if errors.is_empty() {
            vec![AssertionError::format("SAML Response could not be validated")]
        } else {
            errors
        };
        Self {
            identity: None,
            errors,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.identity.is_some()
    }

    pub fn errors(&self) -> &[AssertionError] {
        &self.errors
    }

    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.errors.iter().map(AssertionError::kind).collect()
    }

    pub fn identity(&self) -> Option<&AuthenticatedIdentity> {
        self.identity.as_ref()
    }

    pub fn into_identity(self) -> Option<AuthenticatedIdentity> {
        self.identity
    }

    pub fn session_index(&self) -> Option<&str> {
        self.identity.as_ref()?.session_index.as_deref()
    }

    pub fn attributes(&self) -> Option<&Attributes> {
        self.identity.as_ref().map(|identity| &identity.attributes)
    }

    pub fn name_id(&self) -> Option<&str> {
        self.identity.as_ref()?.name_id.as_deref()
    }
}
