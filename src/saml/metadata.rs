//! SP metadata generation and self-validation.
//!
//! The document depends only on the settings, so repeated generation yields
//! byte-identical output. No `validUntil`, `cacheDuration` or generated IDs.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::x509::X509;
use quick_xml::escape::escape;
use roxmltree::{Document, Node};
use url::Url;

use super::constants::{bindings, ns};
use crate::error::MetadataValidationError;
use crate::settings::SpSettings;

/// Metadata XML together with the problems found when validating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedMetadata {
    pub xml: String,
    pub validation_errors: Vec<String>,
}

impl GeneratedMetadata {
    /// The XML if it validated, otherwise every validation error.
    pub fn into_result(self) -> Result<String, MetadataValidationError> {
        if self.validation_errors.is_empty() {
            Ok(self.xml)
        } else {
            Err(MetadataValidationError(self.validation_errors))
        }
    }
}

/// Serialize the SP settings as SAML metadata and validate the result.
pub fn generate(settings: &SpSettings) -> GeneratedMetadata {
    let xml = build(settings);
    let validation_errors = validate(&xml);
    GeneratedMetadata {
        xml,
        validation_errors,
    }
}

fn build(settings: &SpSettings) -> String {
    let security = settings.security();
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str(&format!(
        "<md:EntityDescriptor xmlns:md=\"{}\" entityID=\"{}\">\n",
        ns::METADATA,
        escape(settings.sp_entity_id())
    ));
    xml.push_str(&format!(
        "  <md:SPSSODescriptor AuthnRequestsSigned=\"{}\" WantAssertionsSigned=\"{}\" protocolSupportEnumeration=\"{}\">\n",
        security.authn_requests_signed,
        security.want_assertions_signed,
        ns::PROTOCOL
    ));

    if let Some(certificate) = settings.sp_certificate() {
        let body = certificate.to_base64();
        for usage in ["signing", "encryption"] {
            xml.push_str(&format!(
                concat!(
                    "    <md:KeyDescriptor use=\"{usage}\">\n",
                    "      <ds:KeyInfo xmlns:ds=\"{dsig}\">\n",
                    "        <ds:X509Data>\n",
                    "          <ds:X509Certificate>{body}</ds:X509Certificate>\n",
                    "        </ds:X509Data>\n",
                    "      </ds:KeyInfo>\n",
                    "    </md:KeyDescriptor>\n"
                ),
                usage = usage,
                dsig = ns::XMLDSIG,
                body = body
            ));
        }
    }

    if let Some(slo) = settings.sp_slo() {
        xml.push_str(&format!(
            "    <md:SingleLogoutService Binding=\"{}\" Location=\"{}\"/>\n",
            escape(slo.binding_or(bindings::HTTP_REDIRECT)),
            escape(slo.url.trim())
        ));
    }

    xml.push_str(&format!(
        "    <md:NameIDFormat>{}</md:NameIDFormat>\n",
        escape(settings.name_id_format())
    ));
    xml.push_str(&format!(
        "    <md:AssertionConsumerService Binding=\"{}\" Location=\"{}\" index=\"1\"/>\n",
        bindings::HTTP_POST,
        escape(settings.acs_url())
    ));
    xml.push_str("  </md:SPSSODescriptor>\n");

    let organization = &settings.document().organization;
    if !organization.is_empty() {
        xml.push_str("  <md:Organization>\n");
        for (lang, org) in organization {
            xml.push_str(&format!(
                "    <md:OrganizationName xml:lang=\"{}\">{}</md:OrganizationName>\n",
                escape(lang),
                escape(&org.name)
            ));
        }
        for (lang, org) in organization {
            let display = if org.displayname.is_empty() {
                &org.name
            } else {
                &org.displayname
            };
            xml.push_str(&format!(
                "    <md:OrganizationDisplayName xml:lang=\"{}\">{}</md:OrganizationDisplayName>\n",
                escape(lang),
                escape(display)
            ));
        }
        for (lang, org) in organization {
            xml.push_str(&format!(
                "    <md:OrganizationURL xml:lang=\"{}\">{}</md:OrganizationURL>\n",
                escape(lang),
                escape(org.url.trim())
            ));
        }
        xml.push_str("  </md:Organization>\n");
    }

    for (kind, contact) in &settings.document().contact_person {
        xml.push_str(&format!(
            concat!(
                "  <md:ContactPerson contactType=\"{}\">\n",
                "    <md:GivenName>{}</md:GivenName>\n",
                "    <md:EmailAddress>{}</md:EmailAddress>\n",
                "  </md:ContactPerson>\n"
            ),
            escape(kind),
            escape(&contact.given_name),
            escape(&contact.email_address)
        ));
    }

    xml.push_str("</md:EntityDescriptor>\n");
    xml
}

/// Check a metadata document against the structural rules of the SAML 2.0
/// metadata schema that apply to an SP. Returns every problem found.
pub fn validate(xml: &str) -> Vec<String> {
    let doc = match Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => return vec![format!("invalid_xml: {e}")],
    };

    let mut errors = Vec::new();
    let root = doc.root_element();
    if !root.has_tag_name((ns::METADATA, "EntityDescriptor")) {
        errors.push("noEntityDescriptor_xml".to_string());
        return errors;
    }

    if root
        .attribute("entityID")
        .map(|id| id.trim().is_empty())
        .unwrap_or(true)
    {
        errors.push("empty_entityID".to_string());
    }

    let descriptors: Vec<Node> = children_named(root, "SPSSODescriptor").collect();
    let descriptor = match descriptors.as_slice() {
        [single] => *single,
        [] => {
            errors.push("onlySPSSODescriptor_allowed_xml: no SPSSODescriptor".to_string());
            return errors;
        }
        _ => {
            errors.push("onlySPSSODescriptor_allowed_xml: multiple SPSSODescriptor".to_string());
            return errors;
        }
    };

    let protocols = descriptor
        .attribute("protocolSupportEnumeration")
        .unwrap_or("");
    if !protocols.split_whitespace().any(|p| p == ns::PROTOCOL) {
        errors.push("SPSSODescriptor does not advertise the SAML 2.0 protocol".to_string());
    }

    for flag in ["AuthnRequestsSigned", "WantAssertionsSigned"] {
        if let Some(value) = descriptor.attribute(flag) {
            if !matches!(value, "true" | "false" | "1" | "0") {
                errors.push(format!("{flag} is not a boolean: {value}"));
            }
        }
    }

    let services: Vec<Node> = children_named(descriptor, "AssertionConsumerService").collect();
    if services.is_empty() {
        errors.push("sp_acs_not_found".to_string());
    }
    for service in services {
        if service.attribute("Binding").map(str::trim).unwrap_or("").is_empty() {
            errors.push("AssertionConsumerService has no Binding".to_string());
        }
        check_location(service, "AssertionConsumerService", &mut errors);
        if let Some(index) = service.attribute("index") {
            if index.parse::<u16>().is_err() {
                errors.push(format!("AssertionConsumerService index is not numeric: {index}"));
            }
        }
    }

    for service in children_named(descriptor, "SingleLogoutService") {
        check_location(service, "SingleLogoutService", &mut errors);
    }

    let certificates = doc
        .descendants()
        .filter(|node| node.has_tag_name((ns::XMLDSIG, "X509Certificate")));
    for certificate in certificates {
        let body: String = certificate
            .text()
            .unwrap_or("")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let parsed = STANDARD
            .decode(body.as_bytes())
            .ok()
            .and_then(|der| X509::from_der(&der).ok());
        if parsed.is_none() {
            errors.push("X509Certificate is not a valid certificate".to_string());
        }
    }

    errors
}

fn children_named<'a, 'input>(
    parent: Node<'a, 'input>,
    local: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    parent
        .children()
        .filter(move |child| child.has_tag_name((ns::METADATA, local)))
}

fn check_location(service: Node<'_, '_>, label: &str, errors: &mut Vec<String>) {
    let location = service.attribute("Location").unwrap_or("").trim();
    match Url::parse(location) {
        Ok(url) if url.host_str().is_some() => {}
        _ => errors.push(format!("{label} Location is not an absolute URL: {location:?}")),
    }
}
