//! rustls configuration shared by every protocol

use crate::{TlsMaterial, TransportError};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Build the server side. With `require_client_cert` peers must present a
/// certificate chaining to `ca`.
pub fn server_config(tls: &TlsMaterial, alpn: &[&[u8]]) -> Result<rustls::ServerConfig, TransportError> {
    let (Some(cert), Some(key)) = (&tls.cert, &tls.key) else {
        return Err(TransportError::Config("listener requires tls.cert and tls.key".into()));
    };

    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(config_error)?;

    let builder = if tls.require_client_cert {
        let ca = tls.ca.as_ref().ok_or_else(|| {
            TransportError::Config("require_client_cert needs tls.ca".into())
        })?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(ca)?), provider())
            .build()
            .map_err(|e| TransportError::Config(format!("client verifier: {}", e)))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder
        .with_single_cert(load_certs(cert)?, load_key(key)?)
        .map_err(config_error)?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

/// Build the client side, presenting `cert`/`key` when configured
pub fn client_config(tls: &TlsMaterial, alpn: &[&[u8]]) -> Result<rustls::ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(config_error)?;

    let builder = if tls.insecure_skip_verify {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new()))
    } else {
        let ca = tls.ca.as_ref().ok_or_else(|| {
            TransportError::Config("tls.ca is required unless insecure_skip_verify is set".into())
        })?;
        builder.with_root_certificates(root_store(ca)?)
    };

    let mut config = match (&tls.cert, &tls.key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(config_error)?,
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    Ok(config)
}

pub(crate) fn server_name(name: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(name.to_string())
        .map_err(|_| TransportError::Config(format!("invalid server name: {}", name)))
}

/// Fingerprint of the leaf certificate the peer presented, if any
pub(crate) fn peer_fingerprint(certs: Option<&[CertificateDer<'_>]>) -> Option<String> {
    certs
        .and_then(|chain| chain.first())
        .map(|leaf| chorus_crypto::fingerprint(leaf))
}

fn pem_bytes(source: &str) -> Result<Vec<u8>, TransportError> {
    if source.trim_start().starts_with("-----BEGIN") {
        Ok(source.as_bytes().to_vec())
    } else {
        std::fs::read(source)
            .map_err(|e| TransportError::Config(format!("cannot read {}: {}", source, e)))
    }
}

fn load_certs(source: &str) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let pem = pem_bytes(source)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Config(format!("bad certificate PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Config("no certificate in PEM input".into()));
    }
    Ok(certs)
}

fn load_key(source: &str) -> Result<PrivateKeyDer<'static>, TransportError> {
    let pem = pem_bytes(source)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TransportError::Config(format!("bad key PEM: {}", e)))?
        .ok_or_else(|| TransportError::Config("no private key in PEM input".into()))
}

fn root_store(source: &str) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(source)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Config(format!("bad CA certificate: {}", e)))?;
    }
    Ok(roots)
}

fn config_error(e: rustls::Error) -> TransportError {
    TransportError::Config(format!("TLS configuration: {}", e))
}

/// Accepts any server certificate while still checking handshake signatures
#[derive(Debug)]
struct SkipServerVerification {
    algorithms: WebPkiSupportedAlgorithms,
}

impl SkipServerVerification {
    fn new() -> Self {
        Self {
            algorithms: provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chorus_crypto::generate_self_signed;

    #[test]
    fn test_server_requires_identity() {
        let result = server_config(&TlsMaterial::default(), &[]);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_client_requires_roots_unless_insecure() {
        assert!(client_config(&TlsMaterial::default(), &[]).is_err());

        let insecure = TlsMaterial {
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(client_config(&insecure, &[b"h2"]).is_ok());
    }

    #[test]
    fn test_inline_pem_material() {
        let generated = generate_self_signed("hub", &["localhost"]).unwrap();
        let tls = TlsMaterial {
            cert: Some(generated.cert_pem.clone()),
            key: Some(generated.key_pem.clone()),
            ca: Some(generated.cert_pem),
            require_client_cert: true,
            ..Default::default()
        };

        let config = server_config(&tls, &[b"h2"]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn test_client_cert_requires_ca() {
        let generated = generate_self_signed("hub", &["localhost"]).unwrap();
        let tls = TlsMaterial {
            cert: Some(generated.cert_pem),
            key: Some(generated.key_pem),
            require_client_cert: true,
            ..Default::default()
        };
        assert!(server_config(&tls, &[]).is_err());
    }
}
