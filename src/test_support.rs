//! Test fixtures: an in-process IdP with its own key pair, settings that
//! trust it, and a builder for signed SAML Responses.

use std::collections::HashMap;
use std::sync::OnceLock;

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::{X509Builder, X509NameBuilder, X509};
use roxmltree::Document;
use serde_json::{json, Value};

use crate::request::RequestContext;
use crate::saml::algorithms::{DigestAlgorithm, SignatureAlgorithm};
use crate::saml::c14n::canonicalize;
use crate::saml::constants::{ns, status, transforms, SUBJECT_CONFIRMATION_BEARER};
use crate::settings::SpSettings;

pub const SP_ENTITY_ID: &str = "http://sp.example.com:5000/saml/metadata";
pub const ACS_URL: &str = "http://sp.example.com:5000/saml/acs";
pub const SLO_URL: &str = "http://sp.example.com:5000/saml/sls";
pub const SP_HOST: &str = "sp.example.com:5000";
pub const IDP_ENTITY_ID: &str = "https://idp.example.com/saml/metadata";
pub const IDP_SSO_URL: &str = "https://idp.example.com/saml/sso";

const RESPONSE_SIGNATURE_MARKER: &str = "<!--response-signature-->";
const ASSERTION_SIGNATURE_MARKER: &str = "<!--assertion-signature-->";

/// A key pair with a self-signed certificate.
#[derive(Clone)]
pub struct Identity {
    pub key: PKey<Private>,
    pub cert: X509,
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate a fresh RSA identity for `common_name`.
pub fn identity(common_name: &str) -> Identity {
    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("CN", common_name).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    Identity {
        cert_pem: String::from_utf8(cert.to_pem().unwrap()).unwrap(),
        key_pem: String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        key,
        cert,
    }
}

/// IdP and SP identities, generated once per test binary.
#[derive(Clone)]
pub struct Fixture {
    pub idp: Identity,
    pub sp: Identity,
}

impl Fixture {
    pub fn new() -> Self {
        static IDP: OnceLock<Identity> = OnceLock::new();
        static SP: OnceLock<Identity> = OnceLock::new();
        Self {
            idp: IDP.get_or_init(|| identity("idp.example.com")).clone(),
            sp: SP.get_or_init(|| identity("sp.example.com")).clone(),
        }
    }

    pub fn settings_json(&self) -> Value {
        json!({
            "strict": true,
            "debug": false,
            "sp": {
                "entityId": SP_ENTITY_ID,
                "assertionConsumerService": {
                    "url": ACS_URL,
                    "binding": "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST"
                },
                "singleLogoutService": {
                    "url": SLO_URL,
                    "binding": "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect"
                },
                "NameIDFormat": "urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress",
                "x509cert": "",
                "privateKey": ""
            },
            "idp": {
                "entityId": IDP_ENTITY_ID,
                "singleSignOnService": {
                    "url": IDP_SSO_URL,
                    "binding": "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect"
                },
                "x509cert": self.idp.cert_pem
            },
            "security": {
                "wantAssertionsSigned": true,
                "wantMessagesSigned": false
            }
        })
    }

    pub fn settings(&self) -> SpSettings {
        SpSettings::from_json(&self.settings_json().to_string()).unwrap()
    }

    pub fn settings_with(&self, patch: impl FnOnce(&mut Value)) -> SpSettings {
        let mut json = self.settings_json();
        patch(&mut json);
        SpSettings::from_json(&json.to_string()).unwrap()
    }

    /// The request context of an ACS POST carrying `saml_response`.
    pub fn acs_request(&self, saml_response: Option<&str>) -> RequestContext {
        let mut form = HashMap::new();
        if let Some(value) = saml_response {
            form.insert("SAMLResponse".to_string(), value.to_string());
        }
        RequestContext::for_test(false, "sp.example.com", "/saml/acs", 5000, form.clone(), form)
    }
}

/// Builds SAML Responses as the IdP would send them.
pub struct ResponseBuilder {
    signer: Identity,
    response_id: String,
    assertion_id: String,
    response_issuer: Option<String>,
    assertion_issuer: String,
    destination: Option<String>,
    status: String,
    status_message: Option<String>,
    audience: Option<String>,
    recipient: String,
    name_id: Option<String>,
    not_before: DateTime<Utc>,
    not_on_or_after: DateTime<Utc>,
    confirmation_not_on_or_after: DateTime<Utc>,
    session_index: Option<String>,
    session_not_on_or_after: Option<DateTime<Utc>>,
    attributes: Vec<(String, Vec<String>)>,
    extra_assertion: bool,
    sign_assertion: bool,
    sign_response: bool,
    signature_algorithm: SignatureAlgorithm,
    digest_algorithm: DigestAlgorithm,
}

impl ResponseBuilder {
    pub fn new(fixture: &Fixture) -> Self {
        let now = Utc::now();
        Self {
            signer: fixture.idp.clone(),
            response_id: format!("_r{}", uuid::Uuid::new_v4().simple()),
            assertion_id: format!("_a{}", uuid::Uuid::new_v4().simple()),
            response_issuer: Some(IDP_ENTITY_ID.to_string()),
            assertion_issuer: IDP_ENTITY_ID.to_string(),
            destination: Some(ACS_URL.to_string()),
            status: status::SUCCESS.to_string(),
            status_message: None,
            audience: Some(SP_ENTITY_ID.to_string()),
            recipient: ACS_URL.to_string(),
            name_id: Some("alice@example.com".to_string()),
            not_before: now - Duration::minutes(1),
            not_on_or_after: now + Duration::minutes(10),
            confirmation_not_on_or_after: now + Duration::minutes(10),
            session_index: Some("_session-42".to_string()),
            session_not_on_or_after: None,
            attributes: vec![
                ("uid".to_string(), vec!["alice".to_string()]),
                ("mail".to_string(), vec!["alice@example.com".to_string()]),
                (
                    "eduPersonAffiliation".to_string(),
                    vec!["staff".to_string(), "member".to_string()],
                ),
            ],
            extra_assertion: false,
            sign_assertion: true,
            sign_response: false,
            signature_algorithm: SignatureAlgorithm::RsaSha256,
            digest_algorithm: DigestAlgorithm::Sha256,
        }
    }

    pub fn assertion_id(&self) -> &str {
        &self.assertion_id
    }

    pub fn sign_assertion(mut self, sign: bool) -> Self {
        self.sign_assertion = sign;
        self
    }

    pub fn sign_response(mut self, sign: bool) -> Self {
        self.sign_response = sign;
        self
    }

    pub fn signed_by(mut self, signer: &Identity) -> Self {
        self.signer = signer.clone();
        self
    }

    pub fn algorithms(mut self, signature: SignatureAlgorithm, digest: DigestAlgorithm) -> Self {
        self.signature_algorithm = signature;
        self.digest_algorithm = digest;
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.response_issuer = Some(issuer.to_string());
        self.assertion_issuer = issuer.to_string();
        self
    }

    pub fn destination(mut self, destination: Option<&str>) -> Self {
        self.destination = destination.map(str::to_string);
        self
    }

    pub fn status(mut self, code: &str, message: Option<&str>) -> Self {
        self.status = code.to_string();
        self.status_message = message.map(str::to_string);
        self
    }

    pub fn audience(mut self, audience: Option<&str>) -> Self {
        self.audience = audience.map(str::to_string);
        self
    }

    pub fn recipient(mut self, recipient: &str) -> Self {
        self.recipient = recipient.to_string();
        self
    }

    pub fn name_id(mut self, name_id: Option<&str>) -> Self {
        self.name_id = name_id.map(str::to_string);
        self
    }

    pub fn not_before(mut self, at: DateTime<Utc>) -> Self {
        self.not_before = at;
        self
    }

    /// Expire both the conditions and the subject confirmation at `at`.
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.not_on_or_after = at;
        self.confirmation_not_on_or_after = at;
        self
    }

    pub fn session_index(mut self, index: Option<&str>) -> Self {
        self.session_index = index.map(str::to_string);
        self
    }

    pub fn session_not_on_or_after(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.session_not_on_or_after = at;
        self
    }

    pub fn attributes(mut self, attributes: Vec<(&str, Vec<&str>)>) -> Self {
        self.attributes = attributes
            .into_iter()
            .map(|(name, values)| {
                (
                    name.to_string(),
                    values.into_iter().map(str::to_string).collect(),
                )
            })
            .collect();
        self
    }

    /// Append a second, unsigned assertion after the real one.
    pub fn with_extra_assertion(mut self) -> Self {
        self.extra_assertion = true;
        self
    }

    pub fn build_xml(&self) -> String {
        let mut xml = self.unsigned_xml();
        if self.sign_assertion {
            xml = self.sign(&xml, &self.assertion_id, ASSERTION_SIGNATURE_MARKER);
        }
        if self.sign_response {
            xml = self.sign(&xml, &self.response_id, RESPONSE_SIGNATURE_MARKER);
        }
        xml.replace(ASSERTION_SIGNATURE_MARKER, "")
            .replace(RESPONSE_SIGNATURE_MARKER, "")
    }

    /// Base64 encoded, as posted to the ACS.
    pub fn build(&self) -> String {
        STANDARD.encode(self.build_xml())
    }

    fn unsigned_xml(&self) -> String {
        let ts = |at: DateTime<Utc>| at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let now = Utc::now();

        let mut xml = format!(
            r#"<samlp:Response xmlns:samlp="{}" xmlns:saml="{}" ID="{}" Version="2.0" IssueInstant="{}""#,
            ns::PROTOCOL,
            ns::ASSERTION,
            self.response_id,
            ts(now)
        );
        if let Some(destination) = &self.destination {
            xml.push_str(&format!(r#" Destination="{destination}""#));
        }
        xml.push('>');
        if let Some(issuer) = &self.response_issuer {
            xml.push_str(&format!("<saml:Issuer>{issuer}</saml:Issuer>"));
        }
        xml.push_str(RESPONSE_SIGNATURE_MARKER);
        xml.push_str(&format!(
            r#"<samlp:Status><samlp:StatusCode Value="{}"/>"#,
            self.status
        ));
        if let Some(message) = &self.status_message {
            xml.push_str(&format!("<samlp:StatusMessage>{message}</samlp:StatusMessage>"));
        }
        xml.push_str("</samlp:Status>");

        xml.push_str(&format!(
            r#"<saml:Assertion xmlns:xs="http://www.w3.org/2001/XMLSchema" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" ID="{}" Version="2.0" IssueInstant="{}">"#,
            self.assertion_id,
            ts(now)
        ));
        xml.push_str(&format!("<saml:Issuer>{}</saml:Issuer>", self.assertion_issuer));
        xml.push_str(ASSERTION_SIGNATURE_MARKER);

        xml.push_str("<saml:Subject>");
        if let Some(name_id) = &self.name_id {
            xml.push_str(&format!(
                r#"<saml:NameID Format="urn:oasis:names:tc:SAML:1.1:nameid-format:emailAddress">{name_id}</saml:NameID>"#
            ));
        }
        xml.push_str(&format!(
            r#"<saml:SubjectConfirmation Method="{}"><saml:SubjectConfirmationData NotOnOrAfter="{}" Recipient="{}"/></saml:SubjectConfirmation>"#,
            SUBJECT_CONFIRMATION_BEARER,
            ts(self.confirmation_not_on_or_after),
            self.recipient
        ));
        xml.push_str("</saml:Subject>");

        xml.push_str(&format!(
            r#"<saml:Conditions NotBefore="{}" NotOnOrAfter="{}">"#,
            ts(self.not_before),
            ts(self.not_on_or_after)
        ));
        if let Some(audience) = &self.audience {
            xml.push_str(&format!(
                "<saml:AudienceRestriction><saml:Audience>{audience}</saml:Audience></saml:AudienceRestriction>"
            ));
        }
        xml.push_str("</saml:Conditions>");

        xml.push_str(&format!(r#"<saml:AuthnStatement AuthnInstant="{}""#, ts(now)));
        if let Some(index) = &self.session_index {
            xml.push_str(&format!(r#" SessionIndex="{index}""#));
        }
        if let Some(at) = self.session_not_on_or_after {
            xml.push_str(&format!(r#" SessionNotOnOrAfter="{}""#, ts(at)));
        }
        xml.push_str(
            "><saml:AuthnContext><saml:AuthnContextClassRef>urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport</saml:AuthnContextClassRef></saml:AuthnContext></saml:AuthnStatement>",
        );

        if !self.attributes.is_empty() {
            xml.push_str("<saml:AttributeStatement>");
            for (name, values) in &self.attributes {
                xml.push_str(&format!(
                    r#"<saml:Attribute Name="{name}" NameFormat="urn:oasis:names:tc:SAML:2.0:attrname-format:basic">"#
                ));
                for value in values {
                    xml.push_str(&format!(
                        r#"<saml:AttributeValue xsi:type="xs:string">{value}</saml:AttributeValue>"#
                    ));
                }
                xml.push_str("</saml:Attribute>");
            }
            xml.push_str("</saml:AttributeStatement>");
        }
        xml.push_str("</saml:Assertion>");

        if self.extra_assertion {
            xml.push_str(&format!(
                r#"<saml:Assertion ID="_injected" Version="2.0" IssueInstant="{}"><saml:Issuer>{}</saml:Issuer></saml:Assertion>"#,
                ts(now),
                self.assertion_issuer
            ));
        }

        xml.push_str("</samlp:Response>");
        xml
    }

    /// Enveloped signature over the element with `id`, inserted at `marker`.
    fn sign(&self, xml: &str, id: &str, marker: &str) -> String {
        let doc = Document::parse(xml).unwrap();
        let element = doc
            .descendants()
            .find(|node| node.attribute("ID") == Some(id))
            .unwrap();
        let digest = hash(
            self.digest_algorithm.message_digest(),
            canonicalize(element, None, &[]).as_bytes(),
        )
        .unwrap();

        let signed_info = format!(
            concat!(
                r#"<ds:SignedInfo xmlns:ds="{dsig}">"#,
                r#"<ds:CanonicalizationMethod Algorithm="{c14n}"/>"#,
                r#"<ds:SignatureMethod Algorithm="{method}"/>"#,
                r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
                r#"<ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{c14n}"/>"#,
                r#"</ds:Transforms><ds:DigestMethod Algorithm="{digest_method}"/>"#,
                r#"<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>"#
            ),
            dsig = ns::XMLDSIG,
            c14n = transforms::EXCLUSIVE_C14N,
            method = self.signature_algorithm.uri(),
            id = id,
            enveloped = transforms::ENVELOPED_SIGNATURE,
            digest_method = self.digest_algorithm.uri(),
            digest = STANDARD.encode(digest),
        );

        let signed_info_doc = Document::parse(&signed_info).unwrap();
        let canonical = canonicalize(signed_info_doc.root_element(), None, &[]);
        let mut signer =
            Signer::new(self.signature_algorithm.message_digest(), &self.signer.key).unwrap();
        signer.update(canonical.as_bytes()).unwrap();
        let signature_value = STANDARD.encode(signer.sign_to_vec().unwrap());

        let signature = format!(
            concat!(
                r#"<ds:Signature xmlns:ds="{dsig}">{signed_info}"#,
                "<ds:SignatureValue>{value}</ds:SignatureValue>",
                "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
                "</ds:Signature>"
            ),
            dsig = ns::XMLDSIG,
            signed_info = signed_info,
            value = signature_value,
            cert = STANDARD.encode(self.signer.cert.to_der().unwrap()),
        );
        xml.replacen(marker, &signature, 1)
    }
}
