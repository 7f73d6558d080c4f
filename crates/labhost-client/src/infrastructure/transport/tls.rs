//! TLS client handshake with certificate pinning.
//!
//! Hosts usually present a self-signed certificate whose SHA-256 fingerprint
//! is advertised in their mDNS TXT record.  The handshake therefore never
//! aborts on an untrusted chain: the web-PKI verdict is *recorded*, and the
//! caller decides afterwards whether to require it, to require a matching
//! fingerprint, or both.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::{TlsInfo, TlsOptions, TransportError};

/// Returns the lowercase hex SHA-256 digest of a DER certificate.
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der).iter().map(|b| format!("{b:02x}")).collect()
}

/// Delegates to the web-PKI verifier but only records its verdict.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    provider: Arc<CryptoProvider>,
    authorized: Arc<AtomicBool>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Ok(_) => self.authorized.store(true, Ordering::SeqCst),
            Err(e) => {
                debug!("server certificate not authorized: {e}");
                self.authorized.store(false, Ordering::SeqCst);
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn config_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Tls(std::io::Error::other(format!("TLS configuration error: {e}")))
}

fn client_config(authorized: Arc<AtomicBool>) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(&provider))
        .build()
        .map_err(config_error)?;

    let verifier = RecordingVerifier { inner, provider: Arc::clone(&provider), authorized };

    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(config_error)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth())
}

/// Runs the TLS handshake over `stream` and applies the trust policy.
///
/// On a policy failure the TLS session is shut down before the error (which
/// carries the computed [`TlsInfo`]) is returned.
pub(super) async fn handshake<IO>(
    stream: IO,
    host: &str,
    options: &TlsOptions,
) -> Result<(TlsStream<IO>, TlsInfo), TransportError>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TransportError::InvalidParameters(format!("invalid TLS server name {host:?}")))?;

    let authorized = Arc::new(AtomicBool::new(false));
    let connector = TlsConnector::from(Arc::new(client_config(Arc::clone(&authorized))?));

    let mut tls = connector.connect(server_name, stream).await.map_err(TransportError::Tls)?;

    let certificate = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|chain| chain.first())
        .map(|cert| cert.as_ref().to_vec())
        .ok_or_else(|| TransportError::Tls(std::io::Error::other("server sent no certificate")))?;

    let info = TlsInfo {
        fingerprint: fingerprint(&certificate),
        certificate,
        trusted: authorized.load(Ordering::SeqCst),
    };

    let failure = if options.server_certificate_check && !info.trusted {
        Some(TransportError::UntrustedServer { info: info.clone() })
    } else {
        match &options.server_certificate_fingerprint {
            Some(pinned) if *pinned != info.fingerprint => {
                Some(TransportError::FingerprintMismatch { expected: pinned.clone(), info: info.clone() })
            }
            _ => None,
        }
    };

    if let Some(err) = failure {
        warn!("rejecting TLS peer {host}: {err}");
        if let Err(e) = tls.shutdown().await {
            debug!("TLS shutdown after rejection failed: {e}");
        }
        return Err(err);
    }

    debug!(host, fingerprint = %info.fingerprint, trusted = info.trusted, "TLS session established");
    Ok((tls, info))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
