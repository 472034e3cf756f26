//! # PKI
//!
//! Self-signed certificate authority and leaf certificates for a tenant's
//! services.
//!
//! The CA is generated once and stored in the tenant's CA secret; it is never
//! rotated here. Leaf certificates are signed by that CA and carry the
//! tenant's service names as DNS SANs. [`CertificateAuthority::verify_leaf`]
//! tells whether a stored leaf is still good for the current CA, key and SAN
//! list, which is the drift check for the TLS secret.

mod password;

pub use password::{generate_password, generate_secret_key, hash_password, verify_password_hash};

use crate::constants::{CA_VALIDITY_YEARS, CERT_VALIDITY_YEARS};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use std::collections::BTreeSet;
use thiserror::Error;
use x509_parser::prelude::*;

const ORGANIZATION: &str = "Tenant Controller";

#[derive(Debug, Error)]
pub enum PkiError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("certificate parsing error: {0}")]
    Parse(String),

    #[error("password generation failed: {0}")]
    Password(String),
}

pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// DER bytes of the first PEM block in `pem_data`
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {e}")))?;
    Ok(block.contents().to_vec())
}

/// Result of checking a stored leaf certificate against the current CA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeafCheck {
    Valid,
    /// Not signed by this CA
    WrongIssuer,
    /// Private key does not belong to the certificate
    KeyMismatch,
    /// Desired SANs not present on the certificate
    MissingSans(Vec<String>),
    /// Outside its validity window
    Expired,
    /// Certificate or key could not be parsed
    Unreadable(String),
}

impl LeafCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, LeafCheck::Valid)
    }
}

/// CA key pair and certificate, both PEM encoded
#[derive(Clone)]
pub struct CertificateAuthority {
    cert_pem: String,
    key_pem: String,
}

impl std::fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// New self-signed CA valid for ten years
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {e}")))?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA certificate: {e}"))
        })?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Load a stored CA, rejecting unparsable material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {e}")))?;
        let der = parse_pem(cert_pem)?;
        X509Certificate::from_der(&der)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA certificate: {e}")))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Issue a server leaf certificate for `sans`, returns `(cert_pem, key_pem)`
    pub fn issue_leaf(&self, common_name: &str, sans: &[String]) -> Result<(String, String)> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;
        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                Ia5String::try_from(san.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGeneration(format!("invalid DNS name '{san}': {e}"))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate leaf key: {e}")))?;
        let ca_key = KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {e}")))?;
        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign leaf certificate: {e}"))
        })?;

        Ok((cert.pem(), leaf_key.serialize_pem()))
    }

    /// Check a stored leaf pair against this CA and the desired SANs.
    /// Extra SANs on the certificate are accepted.
    pub fn verify_leaf(&self, cert_pem: &str, key_pem: &str, sans: &[String]) -> LeafCheck {
        let ca_der = match parse_pem(&self.cert_pem) {
            Ok(der) => der,
            Err(e) => return LeafCheck::Unreadable(e.to_string()),
        };
        let leaf_der = match parse_pem(cert_pem) {
            Ok(der) => der,
            Err(e) => return LeafCheck::Unreadable(e.to_string()),
        };
        let (ca_cert, leaf_cert) = match (
            X509Certificate::from_der(&ca_der),
            X509Certificate::from_der(&leaf_der),
        ) {
            (Ok((_, ca)), Ok((_, leaf))) => (ca, leaf),
            (Err(e), _) | (_, Err(e)) => return LeafCheck::Unreadable(e.to_string()),
        };

        if leaf_cert
            .verify_signature(Some(ca_cert.public_key()))
            .is_err()
        {
            return LeafCheck::WrongIssuer;
        }

        let key_pair = match KeyPair::from_pem(key_pem) {
            Ok(kp) => kp,
            Err(e) => return LeafCheck::Unreadable(format!("failed to parse leaf key: {e}")),
        };
        if key_pair.subject_public_key_info() != leaf_cert.public_key().raw {
            return LeafCheck::KeyMismatch;
        }

        if !leaf_cert.validity().is_valid() {
            return LeafCheck::Expired;
        }

        let present: BTreeSet<&str> = match leaf_cert.subject_alternative_name() {
            Ok(Some(ext)) => ext
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(*dns),
                    _ => None,
                })
                .collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => return LeafCheck::Unreadable(e.to_string()),
        };
        let missing: Vec<String> = sans
            .iter()
            .filter(|san| !present.contains(san.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return LeafCheck::MissingSans(missing);
        }

        LeafCheck::Valid
    }
}
