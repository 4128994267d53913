//! mTLS listener.
//!
//! Identity here is resolved by exact DER-byte match against the identity
//! store, not by certificate-authority trust, so the server's
//! `ClientCertVerifier` accepts any client certificate structurally while
//! still performing genuine TLS signature verification — an attacker who
//! does not hold the private key for a cert they present still fails the
//! handshake. Anonymous clients must also be accepted (enrollment
//! bootstrap), so client auth is requested but not mandatory.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::rustls::client::danger::HandshakeSignatureValid;
use tokio_rustls::rustls::crypto::verify_tls12_signature;
use tokio_rustls::rustls::crypto::verify_tls13_signature;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime, pem::PemObject};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, ServerConfig, SignatureScheme};
use tokio_rustls::TlsAcceptor;

use crate::config::Tls as TlsConfig;
use crate::router::Daemon;

#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<tokio_rustls::rustls::crypto::CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        // Not checking a CA chain here is intentional: trust comes from an
        // exact DER match in the identity store, applied after the
        // handshake. This still proves possession of the private key via
        // the signature checks below.
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn build_acceptor(config: &TlsConfig) -> anyhow::Result<TlsAcceptor> {
    let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());

    let certs = CertificateDer::pem_file_iter(&config.certificate)?.collect::<Result<Vec<_>, _>>()?;
    let key = PrivateKeyDer::from_pem_file(&config.private_key)?;

    let server_config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert { provider }))
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}

/// Bind `config.listen` and serve `daemon` over mTLS until the process stops.
pub async fn serve(config: &TlsConfig, daemon: Arc<Daemon>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen).await?;
    let acceptor = build_acceptor(config)?;

    log::info!("tls listening addr={}", config.listen);

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("tls accept failed: {e}");
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let daemon = daemon.clone();

        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::warn!("tls handshake failed peer={peer_addr}: {e}");
                    return;
                }
            };

            let client_cert_der = stream
                .get_ref()
                .1
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| cert.as_ref().to_vec());

            if let Err(e) = crate::router::serve_tls_connection(daemon, stream, client_cert_der).await {
                log::warn!("tls connection error peer={peer_addr}: {e}");
            }
        });
    }
}
