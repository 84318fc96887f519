//! SAML settings: loaded once at startup, validated, then shared read-only.

mod certificate;
mod config;

use certificate::Certificate;
use config::{EndpointConfig, SecurityConfig, SettingsDocument};

use std::path::Path;

use chrono::Duration;
use openssl::pkey::{PKey, Private};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::saml::algorithms::SignatureAlgorithm;

/// Validated SP/IdP settings with parsed key material.
///
/// Immutable once built. `main` wraps it in an `Arc` for the process lifetime.
#[derive(Debug, Clone)]
pub struct SpSettings {
    document: SettingsDocument,
    idp_certificate: Certificate,
    sp_certificate: Option<Certificate>,
    sp_private_key: Option<PKey<Private>>,
    signature_algorithm: SignatureAlgorithm,
}

/// Load and validate the settings file.
pub fn load(path: impl AsRef<Path>) -> Result<SpSettings, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let document: SettingsDocument =
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let settings = SpSettings::from_document(document)?;
    info!(
        path = %path.display(),
        sp_entity_id = %settings.sp_entity_id(),
        idp_entity_id = %settings.idp_entity_id(),
        idp_cert_subject = %settings.idp_certificate().info().subject_dn,
        idp_cert_not_after = settings.idp_certificate().info().not_after,
        "Loaded SAML settings"
    );
    Ok(settings)
}

impl SpSettings {
    /// Validate a parsed document and resolve its key material.
    pub fn from_document(document: SettingsDocument) -> Result<Self, ConfigError> {
        let mut problems = document.validate();

        let idp_certificate = if document.idp.x509cert.trim().is_empty() {
            None
        } else {
            match Certificate::from_settings(&document.idp.x509cert) {
                Ok(cert) => Some(cert),
                Err(e) => {
                    problems.push(format!("idp.x509cert: {e:#}"));
                    None
                }
            }
        };

        let sp_certificate = if document.sp.x509cert.trim().is_empty() {
            None
        } else {
            match Certificate::from_settings(&document.sp.x509cert) {
                Ok(cert) => Some(cert),
                Err(e) => {
                    problems.push(format!("sp.x509cert: {e:#}"));
                    None
                }
            }
        };

        let sp_private_key = if document.sp.private_key.trim().is_empty() {
            None
        } else {
            match certificate::parse_private_key(&document.sp.private_key) {
                Ok(key) => Some(key),
                Err(e) => {
                    problems.push(format!("sp.privateKey: {e:#}"));
                    None
                }
            }
        };

        let signature_algorithm = SignatureAlgorithm::from_uri(&document.security.signature_algorithm);

        let (Some(idp_certificate), Some(signature_algorithm), true) =
            (idp_certificate, signature_algorithm, problems.is_empty())
        else {
            return Err(ConfigError::Invalid(problems));
        };

        let now = chrono::Utc::now().timestamp();
        for (label, cert) in std::iter::once(("IdP", &idp_certificate))
            .chain(sp_certificate.as_ref().map(|c| ("SP", c)))
        {
            if cert.info().is_expired_at(now) {
                warn!(
                    subject_dn = %cert.info().subject_dn,
                    not_after = cert.info().not_after,
                    "{label} certificate has expired"
                );
            } else if cert.info().is_not_yet_valid_at(now) {
                warn!(
                    subject_dn = %cert.info().subject_dn,
                    not_before = cert.info().not_before,
                    "{label} certificate is not yet valid"
                );
            }
        }

        Ok(Self {
            document,
            idp_certificate,
            sp_certificate,
            sp_private_key,
            signature_algorithm,
        })
    }

    /// Parse and validate settings from JSON text.
    #[cfg(test)]
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let document: SettingsDocument = serde_json::from_str(raw).map_err(|source| {
            ConfigError::Parse {
                path: "<inline>".into(),
                source,
            }
        })?;
        Self::from_document(document)
    }

    pub fn document(&self) -> &SettingsDocument {
        &self.document
    }

    pub fn debug(&self) -> bool {
        self.document.debug
    }

    pub fn sp_entity_id(&self) -> &str {
        self.document.sp.entity_id.trim()
    }

    pub fn acs_url(&self) -> &str {
        self.document.sp.assertion_consumer_service.url.trim()
    }

    pub fn sp_slo(&self) -> Option<&EndpointConfig> {
        self.document.sp.single_logout_service.as_ref()
    }

    pub fn name_id_format(&self) -> &str {
        self.document.name_id_format()
    }

    pub fn idp_entity_id(&self) -> &str {
        self.document.idp.entity_id.trim()
    }

    pub fn idp_sso_url(&self) -> &str {
        self.document.idp.single_sign_on_service.url.trim()
    }

    pub fn idp_certificate(&self) -> &Certificate {
        &self.idp_certificate
    }

    pub fn sp_certificate(&self) -> Option<&Certificate> {
        self.sp_certificate.as_ref()
    }

    pub fn sp_private_key(&self) -> Option<&PKey<Private>> {
        self.sp_private_key.as_ref()
    }

    pub fn security(&self) -> &SecurityConfig {
        &self.document.security
    }

    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.signature_algorithm
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::seconds(i64::from(self.document.security.allowed_clock_drift))
    }
}
