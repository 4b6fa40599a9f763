//! TLS configuration for the sync channel
//!
//! Both directions authenticate against the cluster CA: the server
//! requires and verifies a client certificate, and the client verifies
//! the server certificate against the same bundle. TLS 1.2 is the floor.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::{Result, SyncError};

/// Paths to the cluster CA bundle and this node's keypair
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub ca_cert: PathBuf,
    pub node_cert: PathBuf,
    pub node_key: PathBuf,
}

impl TlsConfig {
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        node_cert: impl Into<PathBuf>,
        node_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            node_cert: node_cert.into(),
            node_key: node_key.into(),
        }
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&self.ca_cert)? {
            roots
                .add(cert)
                .map_err(|err| SyncError::Tls(format!("bad CA certificate: {}", err)))?;
        }
        if roots.is_empty() {
            return Err(SyncError::Tls(format!(
                "no CA certificates in {}",
                self.ca_cert.display()
            )));
        }
        Ok(roots)
    }

    /// Server config requiring a client certificate signed by the
    /// cluster CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let roots = self.root_store()?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| SyncError::Tls(format!("client verifier: {}", err)))?;
        let certs = load_certs(&self.node_cert)?;
        let key = load_key(&self.node_key)?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|err| SyncError::Tls(err.to_string()))?;
        Ok(Arc::new(config))
    }

    /// Client config presenting this node's certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let roots = self.root_store()?;
        let certs = load_certs(&self.node_cert)?;
        let key = load_key(&self.node_key)?;
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|err| SyncError::Tls(err.to_string()))?;
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .map_err(|err| SyncError::Tls(format!("read {}: {}", path.display(), err)))?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut data.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| SyncError::Tls(format!("parse {}: {}", path.display(), err)))?;
    if certs.is_empty() {
        return Err(SyncError::Tls(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .map_err(|err| SyncError::Tls(format!("read {}: {}", path.display(), err)))?;
    rustls_pemfile::private_key(&mut data.as_slice())
        .map_err(|err| SyncError::Tls(format!("parse {}: {}", path.display(), err)))?
        .ok_or_else(|| SyncError::Tls(format!("no private key in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_files_are_reported() {
        let config = TlsConfig::new("/nonexistent/ca.pem", "/nonexistent/node.pem", "/nonexistent/node.key");
        assert!(matches!(config.server_config(), Err(SyncError::Tls(_))));
        assert!(matches!(config.client_config(), Err(SyncError::Tls(_))));
    }

    #[test]
    fn test_empty_ca_bundle_rejected() {
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(b"not a certificate\n").unwrap();
        let config = TlsConfig::new(ca.path(), ca.path(), ca.path());
        match config.server_config() {
            Err(SyncError::Tls(message)) => assert!(message.contains("no CA certificates")),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}
