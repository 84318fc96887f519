//! Serde model of the SAML settings document.
//!
//! The layout follows the widely used `settings.json` shape (`sp`, `idp`,
//! `security`, `organization`, `contactPerson`). Unknown keys are rejected so
//! a misspelled security flag cannot fall back to its default silently.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::saml::algorithms::SignatureAlgorithm;
use crate::saml::constants::{bindings, name_id_formats};

/// Root of the settings document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsDocument {
    /// Strict validation of every received message. Only `true` is supported.
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Log received SAML messages at debug level.
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub sp: ServiceProviderConfig,

    #[serde(default)]
    pub idp: IdentityProviderConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    /// Organization details keyed by language tag, e.g. `en-US`.
    #[serde(default)]
    pub organization: BTreeMap<String, OrganizationConfig>,

    /// Contacts keyed by contact type (`technical`, `support`, ...).
    #[serde(default, rename = "contactPerson")]
    pub contact_person: BTreeMap<String, ContactConfig>,
}

/// A protocol endpoint: location plus binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub binding: Option<String>,
}

impl EndpointConfig {
    pub fn binding_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.binding.as_deref().unwrap_or(default)
    }
}

/// Service provider section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ServiceProviderConfig {
    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub assertion_consumer_service: EndpointConfig,

    #[serde(default)]
    pub single_logout_service: Option<EndpointConfig>,

    #[serde(default, rename = "NameIDFormat")]
    pub name_id_format: Option<String>,

    /// SP certificate published in metadata. Empty means none.
    #[serde(default)]
    pub x509cert: String,

    /// SP private key used to sign AuthnRequests. Empty means none.
    #[serde(default)]
    pub private_key: String,
}

/// Identity provider section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct IdentityProviderConfig {
    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub single_sign_on_service: EndpointConfig,

    #[serde(default)]
    pub single_logout_service: Option<EndpointConfig>,

    /// IdP signing certificate. The only key trusted for response signatures.
    #[serde(default)]
    pub x509cert: String,
}

/// Security policy flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct SecurityConfig {
    #[serde(default)]
    pub authn_requests_signed: bool,

    #[serde(default = "default_true")]
    pub want_assertions_signed: bool,

    #[serde(default)]
    pub want_messages_signed: bool,

    #[serde(default = "default_true")]
    pub want_name_id: bool,

    #[serde(default = "default_signature_algorithm")]
    pub signature_algorithm: String,

    #[serde(default = "default_true")]
    pub reject_deprecated_algorithm: bool,

    /// Clock skew tolerance in seconds.
    #[serde(default = "default_clock_drift")]
    pub allowed_clock_drift: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            authn_requests_signed: false,
            want_assertions_signed: true,
            want_messages_signed: false,
            want_name_id: true,
            signature_algorithm: default_signature_algorithm(),
            reject_deprecated_algorithm: true,
            allowed_clock_drift: default_clock_drift(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganizationConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub displayname: String,

    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ContactConfig {
    #[serde(default)]
    pub given_name: String,

    #[serde(default)]
    pub email_address: String,
}

fn default_true() -> bool {
    true
}

fn default_signature_algorithm() -> String {
    SignatureAlgorithm::RsaSha256.uri().to_string()
}

fn default_clock_drift() -> u32 {
    300 // 5 minutes
}

const CONTACT_TYPES: &[&str] = &["technical", "support", "administrative", "billing", "other"];

impl SettingsDocument {
    /// Structural validation of the document. Returns every problem found.
    ///
    /// Key material is checked separately by the loader.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if !self.strict {
            problems.push("strict must be true; non-strict validation is not supported".to_string());
        }

        if self.sp.entity_id.trim().is_empty() {
            problems.push("sp.entityId is required".to_string());
        }

        let acs = &self.sp.assertion_consumer_service;
        let acs_url = required_url(&acs.url, "sp.assertionConsumerService.url", &mut problems);
        if acs.binding_or(bindings::HTTP_POST) != bindings::HTTP_POST {
            problems.push(format!(
                "sp.assertionConsumerService.binding must be {}",
                bindings::HTTP_POST
            ));
        }

        if let Some(slo) = &self.sp.single_logout_service {
            let slo_url = required_url(&slo.url, "sp.singleLogoutService.url", &mut problems);
            if let (Some(acs_url), Some(slo_url)) = (&acs_url, &slo_url) {
                if acs_url.scheme() != slo_url.scheme() || acs_url.host_str() != slo_url.host_str() {
                    problems.push(
                        "sp.singleLogoutService.url must share scheme and host with the ACS URL"
                            .to_string(),
                    );
                }
            }
        }

        if let Some(format) = &self.sp.name_id_format {
            if format.trim().is_empty() {
                problems.push("sp.NameIDFormat must not be empty when present".to_string());
            }
        }

        if self.idp.entity_id.trim().is_empty() {
            problems.push("idp.entityId is required".to_string());
        }

        let sso = &self.idp.single_sign_on_service;
        required_url(&sso.url, "idp.singleSignOnService.url", &mut problems);
        if sso.binding_or(bindings::HTTP_REDIRECT) != bindings::HTTP_REDIRECT {
            problems.push(format!(
                "idp.singleSignOnService.binding must be {}",
                bindings::HTTP_REDIRECT
            ));
        }

        if let Some(slo) = &self.idp.single_logout_service {
            required_url(&slo.url, "idp.singleLogoutService.url", &mut problems);
        }

        if self.idp.x509cert.trim().is_empty() {
            problems.push("idp.x509cert is required".to_string());
        }

        match SignatureAlgorithm::from_uri(&self.security.signature_algorithm) {
            None => problems.push(format!(
                "security.signatureAlgorithm {:?} is not a supported RSA algorithm",
                self.security.signature_algorithm
            )),
            Some(alg) if alg.is_deprecated() && self.security.reject_deprecated_algorithm => {
                problems.push(
                    "security.signatureAlgorithm uses SHA-1, which is rejected while rejectDeprecatedAlgorithm is set"
                        .to_string(),
                )
            }
            Some(_) => {}
        }

        if self.security.authn_requests_signed && self.sp.private_key.trim().is_empty() {
            problems.push("security.authnRequestsSigned requires sp.privateKey".to_string());
        }

        for (lang, org) in &self.organization {
            if org.name.trim().is_empty() || org.url.trim().is_empty() {
                problems.push(format!("organization.{lang} requires name and url"));
            } else {
                absolute_url(&org.url, &format!("organization.{lang}.url"), &mut problems);
            }
        }

        for (kind, contact) in &self.contact_person {
            if !CONTACT_TYPES.contains(&kind.as_str()) {
                problems.push(format!("contactPerson.{kind} is not a known contact type"));
            }
            if contact.given_name.trim().is_empty() || contact.email_address.trim().is_empty() {
                problems.push(format!("contactPerson.{kind} requires givenName and emailAddress"));
            }
        }

        problems
    }

    /// NameID format requested from the IdP and advertised in metadata.
    pub fn name_id_format(&self) -> &str {
        self.sp
            .name_id_format
            .as_deref()
            .unwrap_or(name_id_formats::UNSPECIFIED)
    }
}

fn required_url(value: &str, field: &str, problems: &mut Vec<String>) -> Option<Url> {
    if value.trim().is_empty() {
        problems.push(format!("{field} is required"));
        return None;
    }
    absolute_url(value, field, problems)
}

fn absolute_url(value: &str, field: &str, problems: &mut Vec<String>) -> Option<Url> {
    match Url::parse(value.trim()) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host_str().is_some() => Some(url),
        Ok(_) => {
            problems.push(format!("{field} must be an absolute http(s) URL"));
            None
        }
        Err(e) => {
            problems.push(format!("{field} is not a valid URL: {e}"));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> SettingsDocument {
        serde_json::from_value(serde_json::json!({
            "sp": {
                "entityId": "https://sp.example.com/saml/metadata",
                "assertionConsumerService": { "url": "https://sp.example.com/saml/acs" }
            },
            "idp": {
                "entityId": "https://idp.example.com",
                "singleSignOnService": { "url": "https://idp.example.com/sso" },
                "x509cert": "MIIB"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let doc = minimal();
        assert!(doc.strict);
        assert!(doc.security.want_assertions_signed);
        assert!(!doc.security.want_messages_signed);
        assert!(doc.security.want_name_id);
        assert!(doc.security.reject_deprecated_algorithm);
        assert_eq!(doc.security.allowed_clock_drift, 300);
        assert_eq!(doc.name_id_format(), name_id_formats::UNSPECIFIED);
        assert!(doc.validate().is_empty(), "{:?}", doc.validate());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let result: Result<SettingsDocument, _> = serde_json::from_value(serde_json::json!({
            "security": { "wantAssertionSigned": false }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_fields_all_reported() {
        let doc: SettingsDocument = serde_json::from_str("{}").unwrap();
        let problems = doc.validate();
        for expected in [
            "sp.entityId is required",
            "sp.assertionConsumerService.url is required",
            "idp.entityId is required",
            "idp.singleSignOnService.url is required",
            "idp.x509cert is required",
        ] {
            assert!(problems.iter().any(|p| p == expected), "missing {expected}: {problems:?}");
        }
    }

    #[test]
    fn test_url_rules() {
        let mut doc = minimal();
        doc.sp.assertion_consumer_service.url = "/saml/acs".to_string();
        assert!(doc.validate().iter().any(|p| p.contains("sp.assertionConsumerService.url")));

        let mut doc = minimal();
        doc.idp.single_sign_on_service.url = "ftp://idp.example.com/sso".to_string();
        assert!(doc
            .validate()
            .iter()
            .any(|p| p == "idp.singleSignOnService.url must be an absolute http(s) URL"));

        let mut doc = minimal();
        doc.sp.single_logout_service = Some(EndpointConfig {
            url: "http://other.example.com/saml/sls".to_string(),
            binding: None,
        });
        assert!(doc.validate().iter().any(|p| p.contains("share scheme and host")));
    }

    #[test]
    fn test_binding_rules() {
        let mut doc = minimal();
        doc.sp.assertion_consumer_service.binding = Some(bindings::HTTP_REDIRECT.to_string());
        doc.idp.single_sign_on_service.binding = Some(bindings::HTTP_POST.to_string());
        let problems = doc.validate();
        assert!(problems.iter().any(|p| p.starts_with("sp.assertionConsumerService.binding")));
        assert!(problems.iter().any(|p| p.starts_with("idp.singleSignOnService.binding")));
    }

    #[test]
    fn test_security_rules() {
        let mut doc = minimal();
        doc.strict = false;
        doc.security.authn_requests_signed = true;
        doc.security.signature_algorithm = SignatureAlgorithm::RsaSha1.uri().to_string();
        let problems = doc.validate();
        assert!(problems.iter().any(|p| p.starts_with("strict must be true")));
        assert!(problems.iter().any(|p| p.contains("requires sp.privateKey")));
        assert!(problems.iter().any(|p| p.contains("uses SHA-1")));

        doc.strict = true;
        doc.security.authn_requests_signed = false;
        doc.security.reject_deprecated_algorithm = false;
        assert!(doc.validate().is_empty());
    }

    #[test]
    fn test_contact_rules() {
        let mut doc = minimal();
        doc.contact_person.insert(
            "sales".to_string(),
            ContactConfig {
                given_name: String::new(),
                email_address: "sales@example.com".to_string(),
            },
        );
        let problems = doc.validate();
        assert!(problems.iter().any(|p| p.contains("not a known contact type")));
        assert!(problems.iter().any(|p| p.contains("requires givenName")));
    }
}
