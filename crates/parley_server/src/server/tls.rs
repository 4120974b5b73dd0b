#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context as _, anyhow, bail};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls;

use crate::config::ServerSettings;

/// Build the optional TLS acceptor from the configured cert/key pair.
///
/// `tls_only` with no certificate configured is a startup error: the
/// server refuses to open a plaintext listener rather than silently
/// downgrade.
pub fn build_tls_acceptor(settings: &ServerSettings) -> anyhow::Result<Option<TlsAcceptor>> {
	let (cert_path, key_path) = match (settings.tls_cert_path.as_deref(), settings.tls_key_path.as_deref()) {
		(Some(cert), Some(key)) => (cert, key),
		(None, None) => {
			if settings.tls_only {
				bail!("tls_only is set but no TLS certificate/key is configured; refusing plaintext inbound connections");
			}
			return Ok(None);
		}
		_ => bail!("tls_cert_path and tls_key_path must be configured together"),
	};

	let cert_pem =
		std::fs::read(cert_path).with_context(|| format!("read TLS certificate {}", cert_path.display()))?;
	let key_pem = std::fs::read(key_path).with_context(|| format!("read TLS key {}", key_path.display()))?;

	let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.context("parse TLS certificate")?;
	let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
		.context("parse TLS key")?
		.ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

	let config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(certs, key)
		.context("build TLS config")?;

	Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
