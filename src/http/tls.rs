//! TLS termination for the HTTPS listeners.
//!
//! # Design Decisions
//! - rustls, no OpenSSL dependency
//! - Certificate chain and key are loaded once at startup; a reload requires
//!   a process restart, matching the rest of the instance configuration

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("can't read TLS file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no private key found in {0}")]
    NoPrivateKey(std::path::PathBuf),

    #[error("invalid TLS material: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Builds a TLS acceptor from PEM-encoded certificate chain and private key.
pub fn build_acceptor(certificate: &Path, private_key: &Path) -> Result<TlsAcceptor, TlsError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
    };

    let cert_chain = rustls_pemfile::certs(&mut open(certificate)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: certificate.to_path_buf(),
            source,
        })?;

    let key = rustls_pemfile::private_key(&mut open(private_key)?)
        .map_err(|source| TlsError::Io {
            path: private_key.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(private_key.to_path_buf()))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
