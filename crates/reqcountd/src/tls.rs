use anyhow::Context;
use reqcount_core::TlsPaths;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub fn acceptor(paths: &TlsPaths) -> anyhow::Result<TlsAcceptor> {
    let config = server_config(&paths.cert, &paths.key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn server_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<ServerConfig> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path).with_context(|| format!("open cert {}", cert_path.display()))?,
    );
    let mut key_reader = BufReader::new(
        File::open(key_path).with_context(|| format!("open key {}", key_path.display()))?,
    );

    let chain: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .context("read certs")?;
    if chain.is_empty() {
        anyhow::bail!("no certificate found in {}", cert_path.display());
    }

    let key: PrivateKeyDer<'static> = private_key(&mut key_reader)
        .context("read private key")?
        .context("no private key found")?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("build tls config")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}
