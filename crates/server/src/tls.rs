use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Result;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio_rustls::TlsAcceptor;

use shared::log;

fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;
    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// TLS acceptor for the tunnel listener, rebuilt whenever the certificate or
/// key file changes on disk. Accepted connections keep whatever session they
/// started with; a malformed pair on reload keeps the previous one serving.
pub struct TlsReloader {
    acceptor: Arc<RwLock<TlsAcceptor>>,
    _watcher: notify::RecommendedWatcher,
}

impl TlsReloader {
    pub fn new(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let acceptor = Arc::new(RwLock::new(build_acceptor(cert_path, key_path)?));

        let watcher = {
            let acceptor = acceptor.clone();
            let cert = cert_path.to_path_buf();
            let key = key_path.to_path_buf();
            let mut watcher =
                notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
                    let Ok(event) = event else { return };
                    // Writes, creations and renames all surface as these kinds
                    if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        return;
                    }
                    match build_acceptor(&cert, &key) {
                        Ok(fresh) => {
                            *acceptor.write().unwrap() = fresh;
                            log::info!("tls certificate reloaded");
                        }
                        Err(e) => {
                            log::warn!("certificate reload failed, keeping the previous one: {:#}", e);
                        }
                    }
                })?;
            watcher.watch(cert_path, RecursiveMode::NonRecursive)?;
            watcher.watch(key_path, RecursiveMode::NonRecursive)?;
            watcher
        };

        Ok(TlsReloader {
            acceptor,
            _watcher: watcher,
        })
    }

    /// Snapshot for a single accept.
    pub fn acceptor(&self) -> TlsAcceptor {
        self.acceptor.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    fn write_test_pair(tag: &str) -> (PathBuf, PathBuf) {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("pubtunnel-test-{}-{}.crt", tag, std::process::id()));
        let key_path = dir.join(format!("pubtunnel-test-{}-{}.key", tag, std::process::id()));
        std::fs::write(&cert_path, certified.cert.pem()).unwrap();
        std::fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_build_acceptor_from_pem_pair() {
        let (cert_path, key_path) = write_test_pair("ok");
        assert!(build_acceptor(&cert_path, &key_path).is_ok());
        let reloader = TlsReloader::new(&cert_path, &key_path).unwrap();
        let _ = reloader.acceptor();
    }

    #[test]
    fn test_garbage_pair_fails_to_build() {
        let dir = std::env::temp_dir();
        let cert_path = dir.join(format!("pubtunnel-test-bad-{}.crt", std::process::id()));
        let key_path = dir.join(format!("pubtunnel-test-bad-{}.key", std::process::id()));
        std::fs::write(&cert_path, "not a certificate").unwrap();
        std::fs::write(&key_path, "not a key").unwrap();
        assert!(build_acceptor(&cert_path, &key_path).is_err());
    }
}
