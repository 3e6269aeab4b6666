//! TLS upgrade of established sockets
//!
//! Server certificates are checked by [`PolicyVerifier`], which runs the
//! chain and name checks separately so each can be switched to
//! log-and-ignore. A failing check that is not ignored fails the handshake;
//! there is no fallback to plaintext.
//!
//! A server that presents no certificate is always rejected: rustls fails
//! the handshake with `NoCertificatesPresented` before any verifier runs, so
//! `validate_certificate_presence` cannot relax it.

use crate::error::{TransportError, TransportResult};
use crate::BoxedStream;
use gridlink_core::TlsOptions;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{
    CertificateDer, CertificateRevocationListDer, PrivateKeyDer, ServerName, UnixTime,
};
use rustls::server::ParsedCertificate;
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Optional TLS upgrade step between dialing and framing
#[derive(Clone)]
pub struct TlsUpgrader {
    settings: Option<Arc<TlsSettings>>,
}

struct TlsSettings {
    connector: TlsConnector,
    certificate_name: Option<String>,
}

impl std::fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsUpgrader")
            .field("enabled", &self.is_enabled())
            .field(
                "certificate_name",
                &self.settings.as_ref().and_then(|s| s.certificate_name.clone()),
            )
            .finish()
    }
}

impl TlsUpgrader {
    /// Pass-through upgrader
    pub fn disabled() -> Self {
        Self { settings: None }
    }

    /// Build from options; reads certificate, CA and CRL files eagerly
    pub fn from_options(options: &TlsOptions) -> TransportResult<Self> {
        if !options.enabled {
            return Ok(Self::disabled());
        }

        if !options.validate_certificate_presence {
            warn!("Certificate presence check cannot be disabled; servers must present one");
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        if let Some(ca_path) = &options.ca_path {
            for cert in load_certs(Path::new(ca_path))? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
            }
        }

        let identity = match &options.certificate_path {
            Some(path) => Some(load_identity(Path::new(path))?),
            None => None,
        };

        // Chain certificates of the client bundle are also trusted, so the
        // whole chain is presented and verifiable during the handshake
        if let Some(identity) = &identity {
            for cert in identity.chain.iter().skip(1) {
                if let Err(e) = roots.add(cert.clone()) {
                    debug!("Not staging bundle certificate as trust anchor: {}", e);
                }
            }
        }

        let crls = options
            .crl_paths
            .iter()
            .map(|path| load_crls(Path::new(path)))
            .collect::<TransportResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect::<Vec<_>>();

        let verifier = PolicyVerifier::new(options, Arc::new(roots), crls, provider.clone())?;

        let builder = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(format!("Unsupported protocol versions: {}", e)))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier));

        let config = match identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.chain, identity.key)
                .map_err(|e| TransportError::Tls(format!("Invalid client certificate: {}", e)))?,
            None => builder.with_no_client_auth(),
        };

        Ok(Self {
            settings: Some(Arc::new(TlsSettings {
                connector: TlsConnector::from(Arc::new(config)),
                certificate_name: options.certificate_name.clone(),
            })),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    /// Wrap `stream` in TLS, or box it unchanged when disabled
    ///
    /// The handshake targets the configured certificate name, or the remote
    /// IP when none is set.
    pub async fn upgrade<S>(&self, stream: S, remote: IpAddr) -> TransportResult<BoxedStream>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let Some(settings) = &self.settings else {
            return Ok(Box::new(stream));
        };

        let server_name = match &settings.certificate_name {
            Some(name) => ServerName::try_from(name.clone())
                .map_err(|e| TransportError::Tls(format!("Invalid certificate name {:?}: {}", name, e)))?,
            None => ServerName::from(remote),
        };

        debug!("Starting TLS handshake with {} as {:?}", remote, server_name);
        let tls = settings
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| TransportError::Tls(format!("Handshake with {} failed: {}", remote, e)))?;

        Ok(Box::new(tls))
    }
}

/// Client certificate chain (leaf first) and its key
struct Identity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

fn load_identity(path: &Path) -> TransportResult<Identity> {
    let pem = std::fs::read(path).map_err(|e| {
        TransportError::Tls(format!("Failed to read certificate {}: {}", path.display(), e))
    })?;

    let mut certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs: {}", e)))?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificate found in {}",
            path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|e| TransportError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| {
            TransportError::Tls(format!("No private key found in {}", path.display()))
        })?;

    let leaf = select_leaf(&certs, &key);
    if leaf != 0 {
        debug!("Using certificate #{} of {} as client certificate", leaf, certs.len());
    }
    let leaf = certs.remove(leaf);
    let mut chain = Vec::with_capacity(certs.len() + 1);
    chain.push(leaf);
    chain.extend(certs);

    Ok(Identity { chain, key })
}

/// Index of the certificate that belongs to `key`
///
/// Falls back to the first non-CA certificate, then to the first one.
fn select_leaf(certs: &[CertificateDer<'_>], key: &PrivateKeyDer<'_>) -> usize {
    if certs.len() <= 1 {
        return 0;
    }

    if let Ok(pair) = rcgen::KeyPair::try_from(key.secret_der()) {
        let public = pair.public_key_raw();
        if let Some(index) = certs
            .iter()
            .position(|c| subject_public_key(c).as_deref() == Some(public))
        {
            return index;
        }
    }

    certs
        .iter()
        .position(|c| !is_ca(c))
        .unwrap_or(0)
}

fn subject_public_key(cert: &CertificateDer<'_>) -> Option<Vec<u8>> {
    let (_, parsed) = x509_parser::parse_x509_certificate(cert.as_ref()).ok()?;
    Some(parsed.public_key().subject_public_key.data.to_vec())
}

fn is_ca(cert: &CertificateDer<'_>) -> bool {
    x509_parser::parse_x509_certificate(cert.as_ref())
        .map(|(_, parsed)| parsed.is_ca())
        .unwrap_or(false)
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open cert file: {}", e)))?;
    rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs: {}", e)))
}

fn load_crls(path: &Path) -> TransportResult<Vec<CertificateRevocationListDer<'static>>> {
    let pem = std::fs::read(path)
        .map_err(|e| TransportError::Tls(format!("Failed to open CRL file: {}", e)))?;
    rustls_pemfile::crls(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse CRLs: {}", e)))
}

#[derive(Debug, Clone, Copy)]
enum Check {
    Chain,
    Name,
}

/// Server certificate verifier with independently toggleable checks
#[derive(Debug)]
struct PolicyVerifier {
    roots: Arc<RootCertStore>,
    provider: Arc<CryptoProvider>,
    revocation: Option<Arc<WebPkiServerVerifier>>,
    validate_chain: bool,
    validate_name: bool,
}

impl PolicyVerifier {
    fn new(
        options: &TlsOptions,
        roots: Arc<RootCertStore>,
        crls: Vec<CertificateRevocationListDer<'static>>,
        provider: Arc<CryptoProvider>,
    ) -> TransportResult<Self> {
        let revocation = if options.check_certificate_revocation && !crls.is_empty() {
            let verifier = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
                .with_crls(crls)
                .allow_unknown_revocation_status()
                .build()
                .map_err(|e| TransportError::Tls(format!("Invalid revocation setup: {}", e)))?;
            Some(verifier)
        } else {
            if options.check_certificate_revocation {
                warn!("Certificate revocation check enabled without CRLs; skipping it");
            }
            None
        };

        Ok(Self {
            roots,
            provider,
            revocation,
            validate_chain: options.validate_certificate_chain,
            validate_name: options.validate_certificate_name,
        })
    }

    /// Turn a failed check into an error, or log it when the check is off
    fn enforce(&self, check: Check, result: Result<(), rustls::Error>) -> Result<(), rustls::Error> {
        let enabled = match check {
            Check::Chain => self.validate_chain,
            Check::Name => self.validate_name,
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if enabled => Err(e),
            Err(e) => {
                warn!("Ignoring certificate {:?} failure: {}", check, e);
                Ok(())
            }
        }
    }
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let cert = match ParsedCertificate::try_from(end_entity) {
            Ok(cert) => cert,
            Err(e) => {
                self.enforce(Check::Chain, Err(e.clone()))?;
                self.enforce(Check::Name, Err(e))?;
                return Ok(ServerCertVerified::assertion());
            }
        };

        self.enforce(
            Check::Chain,
            rustls::client::verify_server_cert_signed_by_trust_anchor(
                &cert,
                &self.roots,
                intermediates,
                now,
                self.provider.signature_verification_algorithms.all,
            ),
        )?;

        self.enforce(
            Check::Name,
            rustls::client::verify_server_name(&cert, server_name),
        )?;

        if let Some(revocation) = &self.revocation {
            if let Err(e) = revocation.verify_server_cert(
                end_entity,
                intermediates,
                server_name,
                ocsp_response,
                now,
            ) {
                if matches!(e, rustls::Error::InvalidCertificate(CertificateError::Revoked)) {
                    return Err(e);
                }
                debug!("Revocation check inconclusive: {}", e);
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
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
