//! Signature and digest algorithms accepted by the service provider.

use openssl::hash::MessageDigest;

use super::constants::{digest_algorithms, signature_algorithms};

/// RSA signature algorithm, identified by its XML-DSig URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithm {
    RsaSha1,
    RsaSha256,
    RsaSha384,
    RsaSha512,
}

impl SignatureAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.trim() {
            signature_algorithms::RSA_SHA1 => Some(Self::RsaSha1),
            signature_algorithms::RSA_SHA256 => Some(Self::RsaSha256),
            signature_algorithms::RSA_SHA384 => Some(Self::RsaSha384),
            signature_algorithms::RSA_SHA512 => Some(Self::RsaSha512),
            _ => None,
        }
    }

    pub fn uri(&self) -> &'static str {
        match self {
            Self::RsaSha1 => signature_algorithms::RSA_SHA1,
            Self::RsaSha256 => signature_algorithms::RSA_SHA256,
            Self::RsaSha384 => signature_algorithms::RSA_SHA384,
            Self::RsaSha512 => signature_algorithms::RSA_SHA512,
        }
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::RsaSha1 => MessageDigest::sha1(),
            Self::RsaSha256 => MessageDigest::sha256(),
            Self::RsaSha384 => MessageDigest::sha384(),
            Self::RsaSha512 => MessageDigest::sha512(),
        }
    }

    /// SHA-1 based algorithms are deprecated.
    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::RsaSha1)
    }
}

/// Reference digest algorithm, identified by its XML-DSig URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn from_uri(uri: &str) -> Option<Self> {
        match uri.trim() {
            digest_algorithms::SHA1 => Some(Self::Sha1),
            digest_algorithms::SHA256 => Some(Self::Sha256),
            digest_algorithms::SHA384 => Some(Self::Sha384),
            digest_algorithms::SHA512 => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn uri(&self) -> &'static str {
        match self {
            Self::Sha1 => digest_algorithms::SHA1,
            Self::Sha256 => digest_algorithms::SHA256,
            Self::Sha384 => digest_algorithms::SHA384,
            Self::Sha512 => digest_algorithms::SHA512,
        }
    }

    pub fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }

    pub fn is_deprecated(&self) -> bool {
        matches!(self, Self::Sha1)
    }
}
