use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::config::ServerConfig;

/// Acceptor for the TLS listener, or `None` when no certificate is configured.
pub fn build_tls_acceptor(config: &ServerConfig) -> anyhow::Result<Option<TlsAcceptor>> {
    match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => load_acceptor(cert, key).map(Some),
        _ => Ok(None),
    }
}

fn load_acceptor(cert_path: &Path, key_path: &Path) -> anyhow::Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read TLS cert: {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("Failed to read TLS key: {}", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse TLS certificates")?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", cert_path.display());
    }
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("Failed to parse TLS private key")?
        .context("No private key found in PEM file")?;

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS configuration")?;
    tls.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(tls)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_paths_means_no_tls() {
        let config = crate::config::ServerConfig::from_lookup(|_| None).unwrap();
        assert!(build_tls_acceptor(&config).unwrap().is_none());
    }

    #[test]
    fn missing_cert_file_is_reported() {
        let config = crate::config::ServerConfig::from_lookup(|name| match name {
            "SRMC_TLS_CERT" => Some("/nonexistent/cert.pem".into()),
            "SRMC_TLS_KEY" => Some("/nonexistent/key.pem".into()),
            _ => None,
        })
        .unwrap();
        let Err(err) = build_tls_acceptor(&config) else {
            panic!("missing cert file should fail");
        };
        assert!(err.to_string().contains("Failed to read TLS cert"));
    }
}
