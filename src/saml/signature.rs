//! Enveloped XML-DSig verification against the configured IdP certificate.
//!
//! Only the certificate from the settings is trusted. `KeyInfo` content in
//! the message is ignored.

use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::hash::hash;
use openssl::memcmp;
use openssl::sign::Verifier;
use openssl::x509::X509;
use roxmltree::Node;
use thiserror::Error;

use super::algorithms::{DigestAlgorithm, SignatureAlgorithm};
use super::c14n::canonicalize;
use super::constants::{ns, transforms};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("element is not signed")]
    Missing,

    #[error("element carries more than one Signature")]
    Multiple,

    #[error("malformed Signature: {0}")]
    Malformed(String),

    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("deprecated algorithm {0} rejected")]
    DeprecatedAlgorithm(String),

    #[error("signature Reference {found:?} does not point at the signed element {expected:?}")]
    ReferenceMismatch { expected: String, found: String },

    #[error("digest of the signed element does not match")]
    DigestMismatch,

    #[error("signature value does not verify against the IdP certificate")]
    InvalidSignature,

    #[error("cryptographic failure: {0}")]
    Crypto(String),
}

/// Verification policy.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    pub reject_deprecated: bool,
}

/// Element children of `parent` named `ds:{local}`.
fn dsig_children<'a, 'input>(
    parent: Node<'a, 'input>,
    local: &'static str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    parent
        .children()
        .filter(move |child| child.has_tag_name((ns::XMLDSIG, local)))
}

/// Verify the enveloped signature on `element` with `certificate`.
///
/// Exclusive canonicalization without comments is the only accepted
/// `CanonicalizationMethod` and `Reference` transform besides the enveloped
/// signature transform.
pub fn verify_enveloped<'a, 'input>(
    element: Node<'a, 'input>,
    certificate: &X509,
    options: VerifyOptions,
) -> Result<(), SignatureError> {
    let mut signatures = dsig_children(element, "Signature");
    let signature = signatures.next().ok_or(SignatureError::Missing)?;
    if signatures.next().is_some() {
        return Err(SignatureError::Multiple);
    }
    let signed_info = required_child(signature, "SignedInfo")?;

    let c14n_method = required_child(signed_info, "CanonicalizationMethod")?;
    let c14n_algorithm = algorithm_attribute(c14n_method)?;
    if c14n_algorithm != transforms::EXCLUSIVE_C14N {
        return Err(SignatureError::UnsupportedAlgorithm(c14n_algorithm.to_string()));
    }
    let signed_info_prefixes = inclusive_prefixes(c14n_method);

    let method = required_child(signed_info, "SignatureMethod")?;
    let method_uri = algorithm_attribute(method)?;
    let signature_algorithm = SignatureAlgorithm::from_uri(method_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(method_uri.to_string()))?;
    if options.reject_deprecated && signature_algorithm.is_deprecated() {
        return Err(SignatureError::DeprecatedAlgorithm(
            signature_algorithm.uri().to_string(),
        ));
    }

    let mut references = dsig_children(signed_info, "Reference");
    let reference = references
        .next()
        .ok_or_else(|| SignatureError::Malformed("SignedInfo has no Reference".to_string()))?;
    if references.next().is_some() {
        return Err(SignatureError::Malformed(
            "SignedInfo must contain exactly one Reference".to_string(),
        ));
    }

    let expected_id = element
        .attribute("ID")
        .ok_or_else(|| SignatureError::Malformed("signed element has no ID".to_string()))?;
    let uri = reference.attribute("URI").unwrap_or("");
    if uri.strip_prefix('#') != Some(expected_id) {
        return Err(SignatureError::ReferenceMismatch {
            expected: expected_id.to_string(),
            found: uri.to_string(),
        });
    }
    // The ID must identify exactly this element.
    let mut holders = element
        .document()
        .descendants()
        .filter(|node| node.attribute("ID") == Some(expected_id));
    match (holders.next(), holders.next()) {
        (Some(found), None) if found == element => {}
        (_, Some(_)) => {
            return Err(SignatureError::Malformed(format!(
                "ID {expected_id:?} is not unique in the document"
            )))
        }
        _ => {
            return Err(SignatureError::Malformed(format!(
                "ID {expected_id:?} does not resolve to the signed element"
            )))
        }
    }

    let mut enveloped = false;
    let mut reference_prefixes = Vec::new();
    if let Some(transform_list) = dsig_children(reference, "Transforms").next() {
        for transform in dsig_children(transform_list, "Transform") {
            match algorithm_attribute(transform)? {
                transforms::ENVELOPED_SIGNATURE => enveloped = true,
                transforms::EXCLUSIVE_C14N => {
                    reference_prefixes = inclusive_prefixes(transform);
                }
                other => return Err(SignatureError::UnsupportedAlgorithm(other.to_string())),
            }
        }
    }

    let digest_method = required_child(reference, "DigestMethod")?;
    let digest_uri = algorithm_attribute(digest_method)?;
    let digest_algorithm = DigestAlgorithm::from_uri(digest_uri)
        .ok_or_else(|| SignatureError::UnsupportedAlgorithm(digest_uri.to_string()))?;
    if options.reject_deprecated && digest_algorithm.is_deprecated() {
        return Err(SignatureError::DeprecatedAlgorithm(
            digest_algorithm.uri().to_string(),
        ));
    }

    let expected_digest = decode_base64(required_child(reference, "DigestValue")?)?;
    let skip = enveloped.then_some(signature);
    let canonical = canonicalize(element, skip, &reference_prefixes);
    let actual_digest = hash(digest_algorithm.message_digest(), canonical.as_bytes())
        .map_err(|e| SignatureError::Crypto(e.to_string()))?;
    if actual_digest.len() != expected_digest.len() || !memcmp::eq(&actual_digest, &expected_digest) {
        return Err(SignatureError::DigestMismatch);
    }

    let signature_value = decode_base64(required_child(signature, "SignatureValue")?)?;
    let canonical_signed_info = canonicalize(signed_info, None, &signed_info_prefixes);

    let public_key = certificate
        .public_key()
        .map_err(|e| SignatureError::Crypto(e.to_string()))?;
    let mut verifier = Verifier::new(signature_algorithm.message_digest(), &public_key)
        .map_err(|e| SignatureError::Crypto(e.to_string()))?;
    verifier
        .update(canonical_signed_info.as_bytes())
        .map_err(|e| SignatureError::Crypto(e.to_string()))?;
    // A malformed signature value makes OpenSSL error rather than return false.
    match verifier.verify(&signature_value) {
        Ok(true) => Ok(()),
        Ok(false) | Err(_) => Err(SignatureError::InvalidSignature),
    }
}

fn required_child<'a, 'input>(
    parent: Node<'a, 'input>,
    local: &'static str,
) -> Result<Node<'a, 'input>, SignatureError> {
    dsig_children(parent, local)
        .next()
        .ok_or_else(|| SignatureError::Malformed(format!("missing ds:{local}")))
}

fn algorithm_attribute<'a>(node: Node<'a, '_>) -> Result<&'a str, SignatureError> {
    node.attribute("Algorithm")
        .map(str::trim)
        .ok_or_else(|| SignatureError::Malformed("missing Algorithm attribute".to_string()))
}

fn inclusive_prefixes(method: Node<'_, '_>) -> Vec<String> {
    method
        .children()
        .filter(|child| child.has_tag_name((transforms::EXCLUSIVE_C14N, "InclusiveNamespaces")))
        .filter_map(|list| list.attribute("PrefixList"))
        .flat_map(|list| list.split_whitespace().map(str::to_string))
        .collect()
}

/// Base64 content of `node`, ignoring the line breaks IdPs wrap it with.
fn decode_base64(node: Node<'_, '_>) -> Result<Vec<u8>, SignatureError> {
    let compact: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .flat_map(str::chars)
        .filter(|c| !c.is_whitespace())
        .collect();
    STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| SignatureError::Malformed(format!("invalid base64: {e}")))
}
