//! ACS response validation.
//!
//! Every check runs and contributes its own error, so one failed login
//! shows the operator every mismatch at once. Only structural failures that
//! make further checks meaningless stop early.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};
use samael::schema::{Assertion, Response};
use tracing::debug;

use super::constants::{ns, status, SUBJECT_CONFIRMATION_BEARER};
use super::result::{AssertionResult, Attributes, AuthenticatedIdentity};
use super::signature::{self, SignatureError, VerifyOptions};
use crate::error::{AssertionError, ErrorKind};
use crate::request::RequestContext;
use crate::settings::SpSettings;

pub const SAML_RESPONSE_PARAM: &str = "SAMLResponse";

/// Validate the ACS POST in `request` as of `now`.
pub fn validate(settings: &SpSettings, request: &RequestContext, now: DateTime<Utc>) -> AssertionResult {
    match validate_inner(settings, request, now) {
        Ok(identity) => AssertionResult::valid(identity),
        Err(errors) => AssertionResult::invalid(errors),
    }
}

fn validate_inner(
    settings: &SpSettings,
    request: &RequestContext,
    now: DateTime<Utc>,
) -> Result<AuthenticatedIdentity, Vec<AssertionError>> {
    let encoded = request
        .post_param(SAML_RESPONSE_PARAM)
        .ok_or_else(|| vec![AssertionError::format("SAML Response not found")])?;

    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let raw = BASE64
        .decode(compact.as_bytes())
        .map_err(|_| vec![AssertionError::format("SAML Response is not valid base64")])?;
    let xml = String::from_utf8(raw)
        .map_err(|_| vec![AssertionError::format("SAML Response is not valid UTF-8")])?;

    if settings.debug() {
        debug!(response = %xml, "Received SAML Response");
    }

    let doc = Document::parse(&xml)
        .map_err(|e| vec![AssertionError::format(format!("Invalid SAML Response XML: {e}"))])?;
    let root = doc.root_element();
    if !root.has_tag_name((ns::PROTOCOL, "Response")) {
        return Err(vec![AssertionError::format(
            "Document is not a SAML 2.0 Response",
        )]);
    }

    if doc
        .descendants()
        .any(|node| node.has_tag_name((ns::ASSERTION, "EncryptedAssertion")))
    {
        return Err(vec![AssertionError::format(
            "Encrypted assertions are not supported",
        )]);
    }
    let assertions: Vec<Node> = doc
        .descendants()
        .filter(|node| node.has_tag_name((ns::ASSERTION, "Assertion")))
        .collect();
    let assertion_node = match assertions.as_slice() {
        [single] if single.parent_element() == Some(root) => *single,
        [_] => {
            return Err(vec![AssertionError::format(
                "The Assertion must be a direct child of the Response",
            )])
        }
        _ => {
            return Err(vec![AssertionError::format(
                "SAML Response must contain exactly one Assertion",
            )])
        }
    };

    let response: Response = xml
        .parse()
        .map_err(|e| vec![AssertionError::format(format!("Failed to parse SAML Response: {e}"))])?;
    let assertion = response.assertion.as_ref().ok_or_else(|| {
        vec![AssertionError::format("SAML Response contains no assertion")]
    })?;

    let mut errors = Vec::new();
    let skew = settings.clock_skew();

    if response.version != "2.0" || assertion.version != "2.0" {
        errors.push(AssertionError::format("Unsupported SAML version"));
    }

    check_status(&response, &mut errors);
    check_destination(settings, request, &response, &mut errors);
    check_issuers(settings, &response, assertion, &mut errors);
    check_signatures(settings, root, assertion_node, &response, assertion, &mut errors);

    if let Some(conditions) = &assertion.conditions {
        if let Some(not_before) = conditions.not_before {
            if now < not_before - skew {
                errors.push(AssertionError::time(
                    "Could not validate timestamp: not yet valid. Check system clock.",
                ));
            }
        }
        if let Some(not_on_or_after) = conditions.not_on_or_after {
            if now >= not_on_or_after + skew {
                errors.push(AssertionError::time(
                    "Could not validate timestamp: expired. Check system clock.",
                ));
            }
        }

        let audiences: Vec<&str> = conditions
            .audience_restrictions
            .iter()
            .flatten()
            .flat_map(|restriction| restriction.audience.iter())
            .map(|audience| audience.trim())
            .collect();
        if audiences.is_empty() {
            errors.push(AssertionError::new(
                ErrorKind::Audience,
                "The Assertion does not contain an AudienceRestriction",
            ));
        } else if !audiences.contains(&settings.sp_entity_id()) {
            errors.push(AssertionError::new(
                ErrorKind::Audience,
                format!(
                    "{} is not a valid audience for this Response",
                    audiences.join(", ")
                ),
            ));
        }
    } else {
        errors.push(AssertionError::new(
            ErrorKind::Audience,
            "The Assertion does not contain Conditions",
        ));
    }

    let (name_id, name_id_format) = check_subject(settings, assertion, now, &mut errors);

    let first_statement = assertion
        .authn_statements
        .as_ref()
        .and_then(|statements| statements.first());
    let session_index = first_statement.and_then(|statement| statement.session_index.clone());
    let session_not_on_or_after =
        first_statement.and_then(|statement| statement.session_not_on_or_after);
    if let Some(limit) = session_not_on_or_after {
        if now >= limit + skew {
            errors.push(AssertionError::time(
                "The attributes have expired, based on the SessionNotOnOrAfter of the AuthnStatement of this Response",
            ));
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(AuthenticatedIdentity {
        name_id,
        name_id_format,
        session_index,
        attributes: collect_attributes(assertion),
        assertion_id: assertion.id.clone(),
        issuer: settings.idp_entity_id().to_string(),
        session_not_on_or_after,
        assertion_not_on_or_after: assertion
            .conditions
            .as_ref()
            .and_then(|conditions| conditions.not_on_or_after),
    })
}

fn check_status(response: &Response, errors: &mut Vec<AssertionError>) {
    let Some(response_status) = &response.status else {
        errors.push(AssertionError::new(ErrorKind::Status, "Missing Status on response"));
        return;
    };
    let code = response_status.status_code.value.as_deref().unwrap_or("");
    if code != status::SUCCESS {
        let message = response_status
            .status_message
            .as_ref()
            .and_then(|m| m.value.clone())
            .unwrap_or_else(|| "no status message".to_string());
        errors.push(AssertionError::new(
            ErrorKind::Status,
            format!("The status code of the Response was not Success, was {code} -> {message}"),
        ));
    }
}

fn check_destination(
    settings: &SpSettings,
    request: &RequestContext,
    response: &Response,
    errors: &mut Vec<AssertionError>,
) {
    let acs_url = settings.acs_url();
    if let Some(destination) = &response.destination {
        if destination.trim().is_empty() {
            errors.push(AssertionError::new(
                ErrorKind::Destination,
                "The response has an empty Destination value",
            ));
        } else if destination.trim() != acs_url {
            errors.push(AssertionError::new(
                ErrorKind::Destination,
                format!("The response was sent to {destination} instead of {acs_url}"),
            ));
        }
    }
    if !request.received_at(acs_url) {
        errors.push(AssertionError::new(
            ErrorKind::Destination,
            format!(
                "The response was received at {} instead of {acs_url}",
                request.self_url()
            ),
        ));
    }
}

fn check_issuers(
    settings: &SpSettings,
    response: &Response,
    assertion: &Assertion,
    errors: &mut Vec<AssertionError>,
) {
    let expected = settings.idp_entity_id();
    if let Some(issuer) = &response.issuer {
        let value = issuer.value.as_deref().unwrap_or("").trim();
        if value != expected {
            errors.push(AssertionError::new(
                ErrorKind::Issuer,
                format!("Invalid issuer in the Response (expected {expected}, received {value})"),
            ));
        }
    }
    let value = assertion.issuer.value.as_deref().unwrap_or("").trim();
    if value != expected {
        errors.push(AssertionError::new(
            ErrorKind::Issuer,
            format!("Invalid issuer in the Assertion (expected {expected}, received {value})"),
        ));
    }
}

fn check_signatures(
    settings: &SpSettings,
    root: Node<'_, '_>,
    assertion_node: Node<'_, '_>,
    response: &Response,
    assertion: &Assertion,
    errors: &mut Vec<AssertionError>,
) {
    let security = settings.security();
    let certificate = settings.idp_certificate().x509();
    let options = VerifyOptions {
        reject_deprecated: security.reject_deprecated_algorithm,
    };

    // The serde view and the tree must agree on which elements are in play.
    if root.attribute("ID") != Some(response.id.as_str())
        || assertion_node.attribute("ID") != Some(assertion.id.as_str())
    {
        errors.push(AssertionError::signature(
            "Signed element IDs do not match the consumed Response",
        ));
        return;
    }

    let outcome = |element: Node<'_, '_>| match signature::verify_enveloped(element, certificate, options) {
        Ok(()) => SignatureOutcome::Valid,
        Err(SignatureError::Missing) => SignatureOutcome::Absent,
        Err(e) => SignatureOutcome::Invalid(e),
    };
    let message_signature = outcome(root);
    let assertion_signature = outcome(assertion_node);

    if let SignatureOutcome::Invalid(e) = &message_signature {
        errors.push(AssertionError::signature(format!(
            "Signature validation failed on the Response: {e}"
        )));
    }
    if let SignatureOutcome::Invalid(e) = &assertion_signature {
        errors.push(AssertionError::signature(format!(
            "Signature validation failed on the Assertion: {e}"
        )));
    }

    if security.want_messages_signed && message_signature == SignatureOutcome::Absent {
        errors.push(AssertionError::signature(
            "The Message of the Response is not signed and the SP requires it",
        ));
    }
    if security.want_assertions_signed && assertion_signature == SignatureOutcome::Absent {
        errors.push(AssertionError::signature(
            "The Assertion of the Response is not signed and the SP requires it",
        ));
    }
    if message_signature == SignatureOutcome::Absent && assertion_signature == SignatureOutcome::Absent {
        errors.push(AssertionError::signature(
            "No Signature found. SAML Response rejected",
        ));
    }
}

#[derive(Debug, PartialEq, Eq)]
enum SignatureOutcome {
    Valid,
    Absent,
    Invalid(SignatureError),
}

/// Returns the NameID and its format.
fn check_subject(
    settings: &SpSettings,
    assertion: &Assertion,
    now: DateTime<Utc>,
    errors: &mut Vec<AssertionError>,
) -> (Option<String>, Option<String>) {
    let Some(subject) = &assertion.subject else {
        errors.push(AssertionError::new(
            ErrorKind::Subject,
            "The Assertion does not contain a Subject",
        ));
        return (None, None);
    };

    let name_id = subject
        .name_id
        .as_ref()
        .map(|name_id| (name_id.value.trim().to_string(), name_id.format.clone()))
        .filter(|(value, _)| !value.is_empty());
    if name_id.is_none() && settings.security().want_name_id {
        errors.push(AssertionError::new(
            ErrorKind::Subject,
            "NameID not found in the assertion of the Response",
        ));
    }

    let skew = settings.clock_skew();
    let acs_url = settings.acs_url();
    // (Recipient, NotBefore, NotOnOrAfter) of each bearer confirmation.
    let bearer_data: Vec<(Option<&str>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = subject
        .subject_confirmations
        .iter()
        .flatten()
        .filter(|confirmation| confirmation.method.as_deref() == Some(SUBJECT_CONFIRMATION_BEARER))
        .filter_map(|confirmation| confirmation.subject_confirmation_data.as_ref())
        .map(|data| (data.recipient.as_deref(), data.not_before, data.not_on_or_after))
        .collect();

    let recipient_ok = |data: &(Option<&str>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)| {
        data.0.map(str::trim) == Some(acs_url)
    };
    let time_ok = |data: &(Option<&str>, Option<DateTime<Utc>>, Option<DateTime<Utc>>)| {
        data.2.map(|limit| now < limit + skew).unwrap_or(false)
            && data.1.map(|start| now >= start - skew).unwrap_or(true)
    };

    if bearer_data.is_empty() {
        errors.push(AssertionError::new(
            ErrorKind::Subject,
            "A valid bearer SubjectConfirmation was not found on this Response",
        ));
    } else if !bearer_data.iter().any(|data| recipient_ok(data) && time_ok(data)) {
        if !bearer_data.iter().any(recipient_ok) {
            errors.push(AssertionError::new(
                ErrorKind::Destination,
                format!("SubjectConfirmationData Recipient does not match {acs_url}"),
            ));
        }
        if !bearer_data.iter().any(time_ok) {
            errors.push(AssertionError::time(
                "SubjectConfirmationData is missing NotOnOrAfter or is no longer valid",
            ));
        }
        if bearer_data.iter().any(recipient_ok) && bearer_data.iter().any(time_ok) {
            errors.push(AssertionError::new(
                ErrorKind::Subject,
                "A valid bearer SubjectConfirmation was not found on this Response",
            ));
        }
    }

    match name_id {
        Some((value, format)) => (Some(value), format),
        None => (None, None),
    }
}

/// Attribute values keyed by name. Repeated statements or attributes with the
/// same name append in document order; nothing is deduplicated.
fn collect_attributes(assertion: &Assertion) -> Attributes {
    let mut attributes = Attributes::new();
    for statement in assertion.attribute_statements.iter().flatten() {
        for attribute in &statement.attributes {
            let Some(name) = &attribute.name else {
                continue;
            };
            let values = attributes.entry(name.clone()).or_default();
            values.extend(attribute.values.iter().filter_map(|v| v.value.clone()));
        }
    }
    attributes
}
