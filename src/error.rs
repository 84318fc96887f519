//! Error taxonomy for the gateway.
//!
//! Configuration errors abort startup. Validation errors are collected
//! exhaustively and surfaced together; they never carry partial user data.

use std::fmt;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Invalid or missing SAML settings. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file could not be read.
    #[error("failed to read settings file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The settings file is not valid JSON or does not match the settings layout.
    #[error("failed to parse settings file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The settings parsed but failed validation. Every problem found is listed.
    #[error("invalid SAML settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// An inbound HTTP request that could not be translated into a request context.
#[derive(Debug, Error)]
pub enum MalformedRequestError {
    #[error("request has no Host header or authority")]
    MissingHost,

    #[error("invalid Host header: {0}")]
    InvalidHost(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("request body is not valid UTF-8")]
    BodyEncoding,

    #[error("invalid percent-encoding in {source_name} parameter {name:?}")]
    ParameterEncoding {
        source_name: &'static str,
        name: String,
    },

    #[error("failed to read request body: {0}")]
    Body(String),
}

/// Category of an assertion validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing, undecodable or structurally unacceptable response.
    Format,
    /// IdP reported a non-success status.
    Status,
    /// Missing or invalid XML signature.
    Signature,
    /// NotBefore / NotOnOrAfter / SessionNotOnOrAfter window violated.
    Time,
    /// Audience restriction does not name this SP.
    Audience,
    /// Destination or Recipient does not match the ACS URL.
    Destination,
    /// Issuer does not match the configured IdP.
    Issuer,
    /// Subject or NameID missing.
    Subject,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Format => "format",
            ErrorKind::Status => "status",
            ErrorKind::Signature => "signature",
            ErrorKind::Time => "time",
            ErrorKind::Audience => "audience",
            ErrorKind::Destination => "destination",
            ErrorKind::Issuer => "issuer",
            ErrorKind::Subject => "subject",
        };
        f.write_str(name)
    }
}

/// A single distinct assertion validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AssertionError {
    kind: ErrorKind,
    message: String,
}

impl AssertionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Format, message)
    }

    pub fn signature(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Signature, message)
    }

    pub fn time(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Time, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Aggregated assertion validation failure, as surfaced to the route layer.
#[derive(Debug, Clone, Error)]
#[error("SAML Authentication Error: {}", join_messages(.0))]
pub struct AssertionValidationError(pub Vec<AssertionError>);

/// Generated SP metadata failed self-validation.
#[derive(Debug, Clone, Error)]
#[error("Error validating metadata: {}", .0.join(", "))]
pub struct MetadataValidationError(pub Vec<String>);

/// Failures inside the SAML toolkit that are not per-assertion validation results.
#[derive(Debug, Error)]
pub enum SamlError {
    #[error("failed to encode SAML message: {0}")]
    Encoding(String),

    #[error("failed to sign SAML message: {0}")]
    Signing(String),
}

/// Errors surfaced by route handlers, mapped onto HTTP status codes.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    MalformedRequest(#[from] MalformedRequestError),

    #[error(transparent)]
    AssertionValidation(#[from] AssertionValidationError),

    #[error(transparent)]
    MetadataValidation(#[from] MetadataValidationError),

    #[error(transparent)]
    Saml(#[from] SamlError),

    /// The assertion was already consumed by an earlier login.
    #[error("SAML Authentication Error: {0}")]
    Replay(String),

    #[error("Session store error: {0}")]
    Session(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}

fn join_messages(errors: &[AssertionError]) -> String {
    errors
        .iter()
        .map(AssertionError::message)
        .collect::<Vec<_>>()
        .join(", ")
}
