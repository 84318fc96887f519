//! AuthnRequest construction and HTTP-Redirect encoding.

use std::io::Write;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, SecondsFormat, Utc};
use openssl::sign::Signer;
use quick_xml::escape::escape;
use tracing::debug;

use super::constants::{bindings, ns};
use crate::error::SamlError;
use crate::settings::SpSettings;

/// A freshly built AuthnRequest. Never persisted.
#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub xml: String,
}

impl AuthnRequest {
    pub fn new(settings: &SpSettings) -> Self {
        let id = format!("_{}", uuid::Uuid::new_v4().simple());
        let issue_instant = Utc::now();

        let xml = format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}""#,
                r#" ID="{id}" Version="2.0" IssueInstant="{instant}""#,
                r#" Destination="{destination}" ProtocolBinding="{binding}""#,
                r#" AssertionConsumerServiceURL="{acs}">"#,
                r#"<saml:Issuer>{issuer}</saml:Issuer>"#,
                r#"<samlp:NameIDPolicy Format="{format}" AllowCreate="true"/>"#,
                r#"</samlp:AuthnRequest>"#
            ),
            protocol = ns::PROTOCOL,
            assertion = ns::ASSERTION,
            id = id,
            instant = issue_instant.to_rfc3339_opts(SecondsFormat::Secs, true),
            destination = escape(settings.idp_sso_url()),
            binding = bindings::HTTP_POST,
            acs = escape(settings.acs_url()),
            issuer = escape(settings.sp_entity_id()),
            format = escape(settings.name_id_format()),
        );

        Self {
            id,
            issue_instant,
            xml,
        }
    }

    /// Encode for the HTTP-Redirect binding and return the IdP URL to send
    /// the browser to. Signs the query when `authnRequestsSigned` is set.
    pub fn redirect_url(
        &self,
        settings: &SpSettings,
        relay_state: Option<&str>,
    ) -> Result<String, SamlError> {
        let encoded = deflate_and_encode(&self.xml)?;

        let mut query = format!("SAMLRequest={}", urlencoding::encode(&encoded));
        if let Some(state) = relay_state {
            query.push_str(&format!("&RelayState={}", urlencoding::encode(state)));
        }

        if settings.security().authn_requests_signed {
            let key = settings.sp_private_key().ok_or_else(|| {
                SamlError::Signing("authnRequestsSigned is set but no SP private key is loaded".into())
            })?;
            let algorithm = settings.signature_algorithm();
            query.push_str(&format!("&SigAlg={}", urlencoding::encode(algorithm.uri())));

            let mut signer = Signer::new(algorithm.message_digest(), key)
                .map_err(|e| SamlError::Signing(e.to_string()))?;
            signer
                .update(query.as_bytes())
                .map_err(|e| SamlError::Signing(e.to_string()))?;
            let signature = signer
                .sign_to_vec()
                .map_err(|e| SamlError::Signing(e.to_string()))?;
            query.push_str(&format!(
                "&Signature={}",
                urlencoding::encode(&BASE64.encode(signature))
            ));
        }

        let destination = settings.idp_sso_url();
        let separator = if destination.contains('?') { '&' } else { '?' };
        let url = format!("{destination}{separator}{query}");

        debug!(
            request_id = %self.id,
            issued_at = %self.issue_instant,
            signed = settings.security().authn_requests_signed,
            "Created SAML AuthnRequest redirect"
        );
        Ok(url)
    }
}

/// Deflate and base64 encode for the redirect binding.
fn deflate_and_encode(xml: &str) -> Result<String, SamlError> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| SamlError::Encoding(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SamlError::Encoding(e.to_string()))?;
    Ok(BASE64.encode(compressed))
}
