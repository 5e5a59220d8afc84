//! TLS 1.3 over TCP transport.
//!
//! The server side loads a PEM certificate chain and private key; the
//! client side authenticates the server by pinning the SHA-256 fingerprint
//! of the certificate's SubjectPublicKeyInfo against the `key_hash` carried
//! in the server address. An address without a key hash accepts any
//! certificate and is meant for tests only.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::crypto::sha256;
use crate::protocol::address::SmpServer;
use crate::transport::{BoxedRead, BoxedWrite, IoTransportRead, IoTransportWrite, TransportError};

/// SHA-256 fingerprint of a certificate's SubjectPublicKeyInfo.
pub fn spki_fingerprint(cert: &[u8]) -> Result<[u8; 32], TransportError> {
    let (_, parsed) = X509Certificate::from_der(cert)
        .map_err(|e| TransportError::Tls(format!("certificate parse failure: {e}")))?;
    Ok(sha256(parsed.tbs_certificate.subject_pki.raw))
}

/// Load a PEM certificate chain and PKCS#8/RSA private key into a rustls
/// server config, returning the acceptor and the leaf SPKI fingerprint
/// (what clients must pin).
pub fn tls_acceptor(
    certificate_file: &Path,
    private_key_file: &Path,
) -> Result<(TlsAcceptor, [u8; 32]), TransportError> {
    let mut cert_reader = BufReader::new(File::open(certificate_file)?);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .map_err(|e| TransportError::Tls(format!("certificate file: {e}")))?;
    let leaf = certs
        .first()
        .ok_or_else(|| TransportError::Tls("certificate file holds no certificate".into()))?;
    let fingerprint = spki_fingerprint(leaf)?;

    let mut key_reader = BufReader::new(File::open(private_key_file)?);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| TransportError::Tls(format!("private key file: {e}")))?
        .ok_or_else(|| TransportError::Tls("private key file holds no key".into()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    Ok((TlsAcceptor::from(Arc::new(config)), fingerprint))
}

/// Accept one TLS session on an already-accepted TCP stream.
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    stream.set_nodelay(true)?;
    let tls = acceptor
        .accept(stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    let (r, w) = tokio::io::split(tls);
    Ok((
        Box::new(IoTransportRead::new(r)),
        Box::new(IoTransportWrite::new(w)),
    ))
}

/// Connect to `server`, verifying its certificate against the pinned
/// `key_hash` of the address (any certificate when the hash is absent).
pub async fn connect(server: &SmpServer) -> Result<(BoxedRead, BoxedWrite), TransportError> {
    let addr = (server.host.as_str(), server.port_or_default());
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;

    let verifier = PinnedCertVerifier::new(server.key_hash.clone());
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));

    let name = ServerName::try_from(server.host.clone())
        .map_err(|_| TransportError::Tls(format!("invalid server name: {}", server.host)))?;
    let tls = connector
        .connect(name, stream)
        .await
        .map_err(|e| TransportError::Tls(e.to_string()))?;
    debug!(host = %server.host, "TLS session established");

    let (r, w) = tokio::io::split(tls);
    Ok((
        Box::new(IoTransportRead::new(r)),
        Box::new(IoTransportWrite::new(w)),
    ))
}

/// Certificate verifier that checks only the pinned SPKI fingerprint.
///
/// Chain building and name checks are intentionally skipped: a broker
/// address names one exact key, and anything presenting that key is the
/// broker. Handshake signatures are still verified with the provider's
/// algorithms.
#[derive(Debug)]
struct PinnedCertVerifier {
    pin: Option<Vec<u8>>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl PinnedCertVerifier {
    fn new(pin: Option<Vec<u8>>) -> Self {
        Self {
            pin,
            algorithms: ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(pin) = &self.pin {
            let fingerprint = spki_fingerprint(end_entity)
                .map_err(|_| rustls::Error::General("unparseable server certificate".into()))?;
            if fingerprint[..] != pin[..] {
                return Err(rustls::Error::General(
                    "server certificate fingerprint mismatch".into(),
                ));
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
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
