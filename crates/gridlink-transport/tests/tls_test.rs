//! TLS upgrade against a local rustls acceptor

use gridlink_core::TlsOptions;
use gridlink_transport::{TlsUpgrader, TransportError};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

const SERVER_NAME: &str = "member.gridlink.test";

struct TestPki {
    ca_file: NamedTempFile,
    acceptor: TlsAcceptor,
}

fn pki() -> TestPki {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "Gridlink Test CA");
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let server_key = KeyPair::generate().unwrap();
    let mut server_params = CertificateParams::new(vec![SERVER_NAME.to_string()]).unwrap();
    server_params
        .subject_alt_names
        .push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    let server_cert = server_params
        .signed_by(&server_key, &ca_cert, &ca_key)
        .unwrap();

    let ca_file = NamedTempFile::new().unwrap();
    std::fs::write(ca_file.path(), ca_cert.pem()).unwrap();

    let chain: Vec<CertificateDer<'static>> = vec![server_cert.der().clone()];
    let key = PrivateKeyDer::Pkcs8(server_key.serialize_der().into());
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(chain, key)
    .unwrap();

    TestPki {
        ca_file,
        acceptor: TlsAcceptor::from(Arc::new(config)),
    }
}

/// Accepts one TLS connection and writes a greeting
async fn spawn_server(acceptor: TlsAcceptor) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        if let Ok(mut tls) = acceptor.accept(socket).await {
            let _ = tls.write_all(b"hello").await;
            let _ = tls.flush().await;
            let mut sink = [0u8; 1];
            let _ = tls.read(&mut sink).await;
        }
    });

    addr
}

fn options(pki: &TestPki) -> TlsOptions {
    TlsOptions {
        enabled: true,
        ca_path: Some(pki.ca_file.path().to_string_lossy().into_owned()),
        certificate_name: Some(SERVER_NAME.to_string()),
        ..Default::default()
    }
}

async fn handshake(options: &TlsOptions, pki: &TestPki) -> Result<Vec<u8>, TransportError> {
    let addr = spawn_server(pki.acceptor.clone()).await;
    let upgrader = TlsUpgrader::from_options(options).unwrap();
    let socket = TcpStream::connect(addr).await.unwrap();

    let mut stream = upgrader.upgrade(socket, addr.ip()).await?;
    let mut greeting = vec![0u8; 5];
    stream.read_exact(&mut greeting).await.unwrap();
    Ok(greeting)
}

#[tokio::test]
async fn test_trusted_certificate_accepted() {
    let pki = pki();
    let greeting = handshake(&options(&pki), &pki).await.unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn test_remote_ip_used_without_certificate_name() {
    let pki = pki();
    let options = TlsOptions {
        certificate_name: None,
        ..options(&pki)
    };
    let greeting = handshake(&options, &pki).await.unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn test_name_mismatch_rejected() {
    let pki = pki();
    let options = TlsOptions {
        certificate_name: Some("other.gridlink.test".to_string()),
        ..options(&pki)
    };
    let err = handshake(&options, &pki).await.unwrap_err();
    assert!(matches!(err, TransportError::Tls(_)));
}

#[tokio::test]
async fn test_name_mismatch_ignored_when_disabled() {
    let pki = pki();
    let options = TlsOptions {
        certificate_name: Some("other.gridlink.test".to_string()),
        validate_certificate_name: false,
        ..options(&pki)
    };
    let greeting = handshake(&options, &pki).await.unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn test_untrusted_chain_rejected() {
    let pki = pki();
    let options = TlsOptions {
        ca_path: None,
        ..options(&pki)
    };
    let err = handshake(&options, &pki).await.unwrap_err();
    assert!(matches!(err, TransportError::Tls(_)));
}

#[tokio::test]
async fn test_untrusted_chain_ignored_when_disabled() {
    let pki = pki();
    let options = TlsOptions {
        ca_path: None,
        validate_certificate_chain: false,
        ..options(&pki)
    };
    let greeting = handshake(&options, &pki).await.unwrap();
    assert_eq!(greeting, b"hello");
}

#[tokio::test]
async fn test_presence_toggle_keeps_other_checks() {
    let pki = pki();
    let options = TlsOptions {
        validate_certificate_presence: false,
        ..options(&pki)
    };
    let greeting = handshake(&options, &pki).await.unwrap();
    assert_eq!(greeting, b"hello");

    let untrusted = TlsOptions {
        ca_path: None,
        ..options
    };
    let err = handshake(&untrusted, &pki).await.unwrap_err();
    assert!(matches!(err, TransportError::Tls(_)));
}

#[tokio::test]
async fn test_disabled_upgrader_passes_through() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        socket.write_all(b"plain").await.unwrap();
    });

    let upgrader = TlsUpgrader::disabled();
    let socket = TcpStream::connect(addr).await.unwrap();
    let mut stream = upgrader.upgrade(socket, addr.ip()).await.unwrap();

    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"plain");
}
