//! TLS configuration for broker sessions.
//!
//! Builds a rustls `ClientConfig` from the broker config's CA / client
//! certificate / key material, honouring the version pin and the
//! insecure-skip-verify toggle.

use std::io::BufReader;
use std::sync::Arc;

use rumqttc::{TlsConfiguration, Transport};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::warn;

use crate::error::ClientError;
use yardconf::BrokerConfig;

/// Certificate verifier that accepts any server certificate.
///
/// Only installed when `tls_insecure` is set; self-signed device brokers
/// are common in the field.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// Build a rumqttc transport from the broker's TLS settings.
///
/// Returns `Transport::Tcp` when TLS is disabled.
pub fn build_transport(config: &BrokerConfig) -> Result<Transport, ClientError> {
    if !config.use_tls {
        return Ok(Transport::Tcp);
    }

    let versions: &[&rustls::SupportedProtocolVersion] = match config.tls_version.as_deref() {
        None => rustls::ALL_VERSIONS,
        Some("tlsv1.2") => &[&rustls::version::TLS12],
        Some("tlsv1.3") => &[&rustls::version::TLS13],
        Some(other) => {
            return Err(ClientError::Tls(format!(
                "unsupported tls_version: {other} (expected tlsv1.2 or tlsv1.3)"
            )))
        }
    };

    let builder = ClientConfig::builder_with_protocol_versions(versions);

    // Server verification and client auth are orthogonal; resolve the
    // verifier first, then attach client credentials if configured.
    let builder = if config.tls_insecure {
        warn!("TLS certificate verification disabled (tls_insecure)");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    } else {
        let ca_file = config
            .ca_file
            .as_ref()
            .ok_or_else(|| ClientError::Tls("use_tls set but no ca_file".to_string()))?;
        let mut roots = RootCertStore::empty();
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("bad CA certificate in {ca_file}: {e}")))?;
        }
        builder.with_root_certificates(roots)
    };

    let client_config = match (&config.cert_file, &config.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("client auth setup failed: {e}")))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
        client_config,
    ))))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs = certs.map_err(|e| ClientError::Tls(format!("cannot parse {path}: {e}")))?;
    if certs.is_empty() {
        return Err(ClientError::Tls(format!("no certificates found in {path}")));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = std::fs::File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {path}: {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::Tls(format!("cannot parse {path}: {e}")))?
        .ok_or_else(|| ClientError::Tls(format!("no private key found in {path}")))
}
