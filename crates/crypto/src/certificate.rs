//! X.509 certificate inspection and generation
//!
//! Fingerprints are `SHA-256(cert_der)` rendered as colon-separated upper
//! hex (`AB:CD:...`), the form voice clients display and the form used as a
//! password substitute for certificate-based user authentication.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, DnValue, IsCa, KeyPair,
    KeyUsagePurpose,
};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("No certificate found in PEM input")]
    NoCertificate,

    #[error("Certificate parse failed: {0}")]
    Parse(String),

    #[error("Certificate generation failed: {0}")]
    Generate(String),
}

/// Metadata of one certificate used as a TLS identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub server_id: String,
    pub pem: String,
    pub fingerprint: String,
    /// Unix seconds
    pub not_before: i64,
    /// Unix seconds
    pub not_after: i64,
    pub subject: String,
    pub issuer: String,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM document
    pub fn from_pem(server_id: impl Into<String>, pem: &str) -> Result<Self, CertError> {
        let (_, parsed) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|_| CertError::NoCertificate)?;
        Self::parse(server_id.into(), pem.to_string(), &parsed.contents)
    }

    fn parse(server_id: String, pem: String, der: &[u8]) -> Result<Self, CertError> {
        use x509_parser::prelude::*;

        let (_, cert) =
            X509Certificate::from_der(der).map_err(|e| CertError::Parse(e.to_string()))?;

        Ok(Self {
            server_id,
            pem,
            fingerprint: fingerprint(der),
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
        })
    }

    pub fn is_valid_at(&self, unix_secs: i64) -> bool {
        self.not_before <= unix_secs && unix_secs <= self.not_after
    }

    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }
}

/// SHA-256 of the DER encoding as colon-separated upper hex
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// A freshly generated certificate with its private key
pub struct GeneratedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub info: CertificateInfo,
}

/// Generate a self-signed leaf certificate valid for `names`
pub fn generate_self_signed(server_id: &str, names: &[&str]) -> Result<GeneratedCert, CertError> {
    let params = leaf_params(server_id, names)?;
    let key = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
    let cert = params
        .self_signed(&key)
        .map_err(|e| CertError::Generate(e.to_string()))?;

    finish(server_id, &cert, &key)
}

/// A throwaway certificate authority for mutual-TLS deployments and tests
pub struct CertificateAuthority {
    cert: Certificate,
    key: KeyPair,
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self, CertError> {
        let mut params =
            CertificateParams::new(Vec::<String>::new()).map_err(|e| CertError::Generate(e.to_string()))?;
        params.distinguished_name.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let key = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| CertError::Generate(e.to_string()))?;

        Ok(Self { cert, key })
    }

    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// Issue a leaf certificate usable as a TLS server or client identity
    pub fn issue(&self, server_id: &str, names: &[&str]) -> Result<GeneratedCert, CertError> {
        let params = leaf_params(server_id, names)?;
        let key = KeyPair::generate().map_err(|e| CertError::Generate(e.to_string()))?;
        let cert = params
            .signed_by(&key, &self.cert, &self.key)
            .map_err(|e| CertError::Generate(e.to_string()))?;

        finish(server_id, &cert, &key)
    }
}

fn leaf_params(server_id: &str, names: &[&str]) -> Result<CertificateParams, CertError> {
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    let mut params =
        CertificateParams::new(names).map_err(|e| CertError::Generate(e.to_string()))?;
    params.distinguished_name.push(
        DnType::CommonName,
        DnValue::Utf8String(server_id.to_string()),
    );
    Ok(params)
}

fn finish(server_id: &str, cert: &Certificate, key: &KeyPair) -> Result<GeneratedCert, CertError> {
    let cert_pem = cert.pem();
    let info = CertificateInfo::parse(server_id.to_string(), cert_pem.clone(), cert.der())?;

    Ok(GeneratedCert {
        cert_pem,
        key_pem: key.serialize_pem(),
        info,
    })
}
