//! Mutual-TLS plumbing shared by the server, the client's server link and
//! the peer-to-peer sessions. Both sides present a certificate and verify
//! the other against the same CA.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

/// Paths to one side's CA bundle, certificate chain and private key.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub ca: PathBuf,
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsIdentity {
    pub fn new(ca: impl Into<PathBuf>, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        TlsIdentity {
            ca: ca.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }

    fn roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca)? {
            roots
                .add(cert)
                .with_context(|| format!("adding root from {}", self.ca.display()))?;
        }
        Ok(roots)
    }

    /// Server side: require and verify a client certificate.
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots()?))
            .build()
            .context("building client certificate verifier")?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(load_certs(&self.cert)?, load_key(&self.key)?)
            .context("building server TLS config")?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Client side: verify the server and present our own certificate.
    pub fn connector(&self) -> Result<TlsConnector> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots()?)
            .with_client_auth_cert(load_certs(&self.cert)?, load_key(&self.key)?)
            .context("building client TLS config")?;
        Ok(TlsConnector::from(Arc::new(config)))
    }

    /// The identity's own certificate file, as sent to the server for
    /// publication.
    pub fn certificate_pem(&self) -> Result<Vec<u8>> {
        std::fs::read(&self.cert).with_context(|| format!("reading {}", self.cert.display()))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<std::io::Result<_>>()
        .with_context(|| format!("parsing certificates from {}", path.display()))?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("parsing key from {}", path.display()))?
        .with_context(|| format!("no private key in {}", path.display()))
}

/// Dial `addr` and complete the handshake as `server_name`.
pub async fn connect(
    connector: &TlsConnector,
    addr: &str,
    server_name: &str,
) -> Result<client::TlsStream<TcpStream>> {
    let tcp = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to {addr}"))?;
    let name = ServerName::try_from(server_name.to_string())
        .with_context(|| format!("invalid server name {server_name}"))?;
    let stream = connector
        .connect(name, tcp)
        .await
        .with_context(|| format!("TLS handshake with {addr}"))?;
    Ok(stream)
}

/// The verified leaf certificate the peer presented, in DER.
pub fn peer_certificate_der<IO>(stream: &server::TlsStream<IO>) -> Option<Vec<u8>> {
    stream
        .get_ref()
        .1
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| cert.as_ref().to_vec())
}

/// Wrap a DER certificate as a single-block PEM.
pub fn pem_encode_certificate(der: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for (i, ch) in encoded.chars().enumerate() {
        if i > 0 && i % 64 == 0 {
            out.push('\n');
        }
        out.push(ch);
    }
    out.push_str("\n-----END CERTIFICATE-----\n");
    out.into_bytes()
}
