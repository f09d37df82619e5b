use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

/// HTTPS configuration for the API listener from PEM files.
pub fn rustls_config(cert_path: &Path, key_path: &Path) -> Result<RustlsConfig> {
    let config = load_server_config(cert_path, key_path)?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig> {
    let cert_chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Failed to create TLS server config")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("Failed to open cert file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    let certs: Vec<_> = certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates from {:?}", path))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("Failed to open key file: {:?}", path))?;
    let mut reader = BufReader::new(file);
    private_key(&mut reader)
        .with_context(|| format!("Failed to parse private key from {:?}", path))?
        .with_context(|| format!("No private key found in {:?}", path))
}
