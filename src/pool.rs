//! Short-lived connection pools, one per job per side (source/target).

use crate::error::EngineError;
use crate::types::{ConnectionSpec, TlsMode};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::sync::Arc;
use tokio_postgres::Config as PgConfig;

pub fn build_pool(spec: &ConnectionSpec, max_size: usize) -> Result<Pool, EngineError> {
    let mut pg_config = PgConfig::new();
    pg_config
        .host(&spec.host)
        .port(spec.port)
        .dbname(&spec.database)
        .user(&spec.user)
        .password(&spec.password);

    let mgr_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };

    let manager = if spec.tls.enabled && spec.tls.mode != TlsMode::Disable {
        let tls = build_rustls_connector(spec.tls.verify_peer)?;
        Manager::from_config(pg_config, tls, mgr_config)
    } else {
        Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config)
    };

    Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| EngineError::Connection(format!("failed to build connection pool: {e}")))
}

fn build_rustls_connector(
    verify_peer: bool,
) -> Result<tokio_postgres_rustls::MakeRustlsConnect, EngineError> {
    let client_config = if verify_peer {
        let mut roots = rustls::RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            roots
                .add(cert)
                .map_err(|e| EngineError::Connection(format!("invalid root certificate: {e}")))?;
        }
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth()
    };

    Ok(tokio_postgres_rustls::MakeRustlsConnect::new(client_config))
}

/// Accepts any server certificate. Only reached when the caller's
/// `ConnectionSpec.tls.verify_peer` is explicitly false.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
