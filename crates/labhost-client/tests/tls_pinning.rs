//! Integration tests for TLS certificate pinning.
//!
//! A host is started with a freshly generated self-signed certificate
//! (`rcgen`), so the web-PKI check never authorizes it.  The tests verify the
//! trust policy applied after the handshake:
//!
//! | check | pin            | outcome                 |
//! |-------|----------------|-------------------------|
//! | off   | none           | connected, untrusted    |
//! | off   | correct        | connected               |
//! | off   | wrong          | `fingerprint_mismatch`  |
//! | on    | none           | `untrusted_server`      |

use std::sync::Arc;

use labhost_client::application::protocol_client::{Handshake, ProtocolClient};
use labhost_client::infrastructure::transport::tls::fingerprint;
use labhost_client::infrastructure::transport::{OpenOptions, TlsOptions, Transport, TransportError};
use labhost_core::FailureReason;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

const HANDSHAKE: &[u8] = b"{\"type\":\"initialize\",\"identifier\":\"secure-1\",\"version\":1}\n{\"type\":\"state\",\"data\":{}}\n";

/// A TLS host that serves the handshake to every connection.
struct TlsHost {
    port: u16,
    fingerprint: String,
}

async fn start_tls_host() -> TlsHost {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der: CertificateDer<'static> = certified.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let pin = fingerprint(cert_der.as_ref());

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der], key_der)
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                // Rejected clients hang up mid-session; that is expected.
                let Ok(mut tls) = acceptor.accept(stream).await else { return };
                if tls.write_all(HANDSHAKE).await.is_err() {
                    return;
                }
                let mut sink = [0u8; 1024];
                while matches!(tls.read(&mut sink).await, Ok(n) if n > 0) {}
            });
        }
    });

    TlsHost { port, fingerprint: pin }
}

fn options(port: u16, check: bool, pin: Option<String>) -> OpenOptions {
    OpenOptions::tcp("127.0.0.1", port).with_tls(TlsOptions {
        server_certificate_check: check,
        server_certificate_fingerprint: pin,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_without_policy_connects_and_reports_untrusted() {
    // Arrange
    let host = start_tls_host().await;

    // Act
    let transport = Transport::open(options(host.port, false, None)).await.unwrap();

    // Assert
    let info = transport.tls_info().unwrap().clone();
    assert!(!info.trusted);
    assert_eq!(info.fingerprint, host.fingerprint);
    assert_eq!(fingerprint(&info.certificate), host.fingerprint);
    transport.close().await;
}

#[tokio::test]
async fn test_correct_pin_connects_and_completes_handshake() {
    // Arrange
    let host = start_tls_host().await;
    let transport = Transport::open(options(host.port, false, Some(host.fingerprint.clone())))
        .await
        .unwrap();
    let client = ProtocolClient::new(transport);

    // Act
    let handshake = client.initialize().await.unwrap();

    // Assert
    let Handshake::Accepted(info) = handshake else {
        panic!("expected handshake to be accepted, got {handshake:?}")
    };
    assert_eq!(info.identifier, "secure-1");
    client.close().await;
}

#[tokio::test]
async fn test_wrong_pin_is_a_fingerprint_mismatch() {
    // Arrange
    let host = start_tls_host().await;
    let wrong = "00".repeat(32);

    // Act
    let result = Transport::open(options(host.port, false, Some(wrong.clone()))).await;

    // Assert
    let Err(err) = result else { panic!("pinning must reject a different certificate") };
    assert_eq!(err.reason(), Some(FailureReason::FingerprintMismatch));
    let TransportError::FingerprintMismatch { expected, info } = err else {
        panic!("unexpected error variant")
    };
    assert_eq!(expected, wrong);
    assert_eq!(info.fingerprint, host.fingerprint);
}

#[tokio::test]
async fn test_required_check_rejects_self_signed_certificate() {
    // Arrange
    let host = start_tls_host().await;

    // Act
    let result = Transport::open(options(host.port, true, None)).await;

    // Assert
    let Err(err) = result else { panic!("a self-signed certificate must not be trusted") };
    assert_eq!(err.reason(), Some(FailureReason::UntrustedServer));
    let info = err.tls_info().unwrap();
    assert!(!info.trusted);
    assert_eq!(info.fingerprint, host.fingerprint);
}

#[tokio::test]
async fn test_uppercase_pin_does_not_match() {
    // Fingerprints are compared exactly; callers normalise before pinning.
    let host = start_tls_host().await;

    let result = Transport::open(options(host.port, false, Some(host.fingerprint.to_uppercase()))).await;

    assert!(matches!(result, Err(TransportError::FingerprintMismatch { .. })));
}
