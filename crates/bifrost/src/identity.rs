//! Loads the proxy's TLS identity from PEM files.

use crate::config::TlsSettings;
use anyhow::{anyhow, bail, Context, Result};
use proxy_server::TlsIdentity;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::{info, warn};

/// Reads the certificate chain and key named in `settings`.
///
/// When both files are missing and `generate_self_signed` is set, a
/// self-signed certificate for `localhost` is written first. Clients must
/// then trust that certificate explicitly.
pub fn load_identity(settings: &TlsSettings) -> Result<TlsIdentity> {
    let cert_path = Path::new(&settings.certificate_path);
    let key_path = Path::new(&settings.private_key_path);

    if !cert_path.exists() && !key_path.exists() && settings.generate_self_signed {
        generate_self_signed(cert_path, key_path)?;
    }

    let cert_chain = read_certificates(cert_path)?;
    let key = read_private_key(key_path)?;
    info!(
        "🔐 Loaded TLS identity from {} ({} certificate(s))",
        cert_path.display(),
        cert_chain.len()
    );
    Ok(TlsIdentity::new(cert_chain, key))
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path).with_context(|| format!("cannot open certificate {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("cannot parse certificate {}", path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path).with_context(|| format!("cannot open private key {}", path.display()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .with_context(|| format!("cannot parse private key {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("cannot generate self-signed certificate")?;

    for path in [cert_path, key_path] {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
    }
    std::fs::write(cert_path, certified.cert.pem())
        .with_context(|| format!("cannot write {}", cert_path.display()))?;
    std::fs::write(key_path, certified.key_pair.serialize_pem())
        .with_context(|| format!("cannot write {}", key_path.display()))?;

    warn!(
        "🔏 Generated a self-signed certificate at {}; use a real certificate in production",
        cert_path.display()
    );
    Ok(())
}
