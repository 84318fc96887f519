//! SAML 2.0 service provider: SP-initiated SSO over the HTTP-Redirect and
//! HTTP-POST bindings, with assertion validation and metadata.

pub mod algorithms;
pub mod auth;
pub mod authn_request;
pub mod c14n;
pub mod constants;
pub mod metadata;
pub mod response;
pub mod result;
pub mod signature;
pub mod toolkit;

pub use auth::SamlAuth;
pub use result::{AssertionResult, Attributes, AuthenticatedIdentity};
