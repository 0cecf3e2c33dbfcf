//! TLS setup for both sides of the relay.
//!
//! Backends get a [`TlsConnector`], optionally with certificate checking
//! switched off. The frontend gets a [`TlsAcceptor`] built from PEM files.
//! Both use the `ring` provider explicitly so no process-wide default has to
//! be installed.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};

use crate::config::{BackendConfig, FrontendTls};
use crate::error::ConfigError;

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Builds the connector used to reach a TLS backend.
pub fn client_connector(backend: &BackendConfig) -> Result<TlsConnector, ConfigError> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?;

    let config = if backend.insecure_skip_verify {
        warn!(
            backend = %backend.host,
            "TLS certificate verification disabled"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier {
                schemes: provider
                    .signature_verification_algorithms
                    .supported_schemes(),
            }))
            .with_no_client_auth()
    } else {
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!(error = %err, "Failed to load a native root certificate");
        }

        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(backend = %backend.host, added, ignored, "Loaded native root certificates");

        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// The SNI name presented to a TLS backend: the host part of its address.
pub fn server_name(backend: &BackendConfig) -> Result<ServerName<'static>, ConfigError> {
    let (host, _) = backend.authority()?;
    ServerName::try_from(host.as_str())
        .map(|name| name.to_owned())
        .map_err(|e| ConfigError::Tls(format!("invalid server name {host:?}: {e}")))
}

/// Builds the acceptor that terminates TLS on the listening socket.
pub fn acceptor(tls: &FrontendTls) -> Result<TlsAcceptor, ConfigError> {
    let certs = load_certs(&tls.cert_file)?;
    let key = load_private_key(&tls.key_file)?;

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ConfigError::Tls(format!("failed to create TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, ConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to read certificate: {e}")))?;

    if certs.is_empty() {
        return Err(ConfigError::Tls(format!(
            "no certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| ConfigError::Tls(format!("failed to read private key: {e}")))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}

/// Accepts any server certificate. Only installed for backends configured
/// with `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

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
        self.schemes.clone()
    }
}
