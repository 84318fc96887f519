//! Certificate and key material handling for the SAML settings.
//!
//! Certificates in the settings file may be PEM armoured or a bare base64
//! DER body, possibly wrapped across lines. Everything is normalised to DER
//! once at load time.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;
use x509_parser::prelude::*;

const BEGIN_CERTIFICATE: &str = "-----BEGIN CERTIFICATE-----";
const END_CERTIFICATE: &str = "-----END CERTIFICATE-----";

/// Parsed certificate details logged at startup.
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Full Subject Distinguished Name.
    pub subject_dn: String,
    /// Issuer Distinguished Name.
    pub issuer_dn: String,
    /// Certificate serial number (hex).
    pub serial: String,
    /// Not valid before (Unix timestamp).
    pub not_before: i64,
    /// Not valid after (Unix timestamp).
    pub not_after: i64,
}

impl CertificateInfo {
    pub fn is_expired_at(&self, unix_time: i64) -> bool {
        unix_time > self.not_after
    }

    pub fn is_not_yet_valid_at(&self, unix_time: i64) -> bool {
        unix_time < self.not_before
    }
}

/// A certificate loaded from settings.
#[derive(Debug, Clone)]
pub struct Certificate {
    der: Vec<u8>,
    x509: X509,
    info: CertificateInfo,
}

impl Certificate {
    /// Decode, parse and inspect a certificate from settings text.
    pub fn from_settings(data: &str) -> Result<Self> {
        let der = decode_certificate(data)?;
        let info = inspect_certificate(&der)?;
        let x509 = X509::from_der(&der).context("OpenSSL rejected the certificate")?;
        Ok(Self { der, x509, info })
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    /// Base64 DER body without armour, as embedded in `ds:X509Certificate`.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }
}

/// Decode certificate text into DER bytes.
pub fn decode_certificate(data: &str) -> Result<Vec<u8>> {
    let data = data.trim();
    if data.is_empty() {
        return Err(anyhow!("certificate is empty"));
    }

    let body = if let Some(start) = data.find(BEGIN_CERTIFICATE) {
        let end = data
            .find(END_CERTIFICATE)
            .ok_or_else(|| anyhow!("Invalid PEM: missing END marker"))?;
        if end < start {
            return Err(anyhow!("Invalid PEM: END marker precedes BEGIN marker"));
        }
        &data[start + BEGIN_CERTIFICATE.len()..end]
    } else {
        data
    };

    let base64_content: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(base64_content.as_bytes())
        .context("Failed to base64 decode certificate")
}

/// Parse an X.509 certificate and extract the details worth logging.
pub fn inspect_certificate(der_bytes: &[u8]) -> Result<CertificateInfo> {
    let (_, cert) = X509Certificate::from_der(der_bytes)
        .map_err(|e| anyhow!("Failed to parse X.509 certificate: {:?}", e))?;

    let serial = cert
        .serial
        .to_bytes_be()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":");

    Ok(CertificateInfo {
        subject_dn: cert.subject().to_string(),
        issuer_dn: cert.issuer().to_string(),
        serial,
        not_before: cert.validity().not_before.timestamp(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

/// Parse the SP private key. Accepts PKCS#8 or traditional RSA PEM, with or
/// without armour.
pub fn parse_private_key(data: &str) -> Result<PKey<Private>> {
    let data = data.trim();
    if data.is_empty() {
        return Err(anyhow!("private key is empty"));
    }

    if data.contains("-----BEGIN") {
        return PKey::private_key_from_pem(data.as_bytes())
            .context("Failed to parse PEM private key");
    }

    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(compact.as_bytes())
        .context("Failed to base64 decode private key")?;
    PKey::private_key_from_der(&der).context("Failed to parse DER private key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn test_decode_pem_and_bare_body_agree() {
        let identity = test_support::identity("idp.example.com");
        let from_pem = decode_certificate(&identity.cert_pem).unwrap();

        let bare: String = identity
            .cert_pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("\n");
        let from_bare = decode_certificate(&bare).unwrap();

        assert_eq!(from_pem, from_bare);
    }

    #[test]
    fn test_inspect_certificate() {
        let identity = test_support::identity("idp.example.com");
        let cert = Certificate::from_settings(&identity.cert_pem).unwrap();

        assert!(cert.info().subject_dn.contains("idp.example.com"));
        assert!(!cert.info().serial.is_empty());
        let now = chrono::Utc::now().timestamp();
        assert!(!cert.info().is_expired_at(now));
        assert!(!cert.info().is_not_yet_valid_at(now));
        assert!(cert.info().is_expired_at(cert.info().not_after + 1));
    }

    #[test]
    fn test_reject_garbage() {
        assert!(decode_certificate("").is_err());
        assert!(decode_certificate("not base64 at all!").is_err());
        assert!(Certificate::from_settings("aGVsbG8=").is_err());
        assert!(decode_certificate(&format!("{}\nAAAA", BEGIN_CERTIFICATE)).is_err());
    }

    #[test]
    fn test_parse_private_key_forms() {
        let identity = test_support::identity("sp.example.com");
        assert!(parse_private_key(&identity.key_pem).is_ok());

        let bare: String = identity
            .key_pem
            .lines()
            .filter(|line| !line.starts_with("-----"))
            .collect();
        assert!(parse_private_key(&bare).is_ok());
        assert!(parse_private_key("").is_err());
    }
}
