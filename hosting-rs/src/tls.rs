//! TLS certificate loading and SNI-based selection
//!
//! Certificates are loaded from PEM files into `rustls` certified keys.
//! The SNI resolver consults the app registry during the handshake and
//! presents the matching host's certificate, or nothing at all for
//! unregistered and plaintext-only hosts.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{HostingError, Result};
use crate::registry::AppRegistry;

/// Certbot-convention certificate and key paths for a hostname:
/// `{cert_root}/{hostname}/fullchain.pem` and `{cert_root}/{hostname}/privkey.pem`
pub fn certbot_cert_paths(cert_root: &Path, hostname: &str) -> (PathBuf, PathBuf) {
    let dir = cert_root.join(hostname);
    (dir.join("fullchain.pem"), dir.join("privkey.pem"))
}

/// Load a certificate chain and private key into a reusable TLS context
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey> {
    // Load certificates
    let cert_file = File::open(cert_path)
        .map_err(|e| HostingError::Tls(format!("Failed to open certificate file: {}", e)))?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs_der = certs(&mut cert_reader)
        .map_err(|e| HostingError::Tls(format!("Failed to read certificates: {}", e)))?;

    if certs_der.is_empty() {
        return Err(HostingError::Tls("No certificates found in file".to_string()));
    }

    // Load private key
    let key_file = File::open(key_path)
        .map_err(|e| HostingError::Tls(format!("Failed to open key file: {}", e)))?;
    let mut key_reader = BufReader::new(key_file);

    // Try PKCS8 first, then RSA
    let keys = pkcs8_private_keys(&mut key_reader)
        .map_err(|e| HostingError::Tls(format!("Failed to read PKCS8 keys: {}", e)))?;

    let key = if !keys.is_empty() {
        rustls::PrivateKey(keys[0].clone())
    } else {
        // Reset reader and try RSA
        let key_file = File::open(key_path)
            .map_err(|e| HostingError::Tls(format!("Failed to open key file: {}", e)))?;
        let mut key_reader = BufReader::new(key_file);
        let rsa_keys = rsa_private_keys(&mut key_reader)
            .map_err(|e| HostingError::Tls(format!("Failed to read RSA keys: {}", e)))?;

        if rsa_keys.is_empty() {
            return Err(HostingError::Tls("No private key found in file".to_string()));
        }
        rustls::PrivateKey(rsa_keys[0].clone())
    };

    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| HostingError::Tls(format!("Unsupported private key: {:?}", e)))?;

    let cert_chain = certs_der.into_iter().map(rustls::Certificate).collect();

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

/// Handshake-time certificate selector backed by the app registry
///
/// Runs synchronously inside the TLS handshake, so it only does a map
/// lookup and a context clone.
pub struct SniResolver {
    registry: Arc<AppRegistry>,
}

impl SniResolver {
    /// Create a resolver over the given registry
    pub fn new(registry: Arc<AppRegistry>) -> Self {
        Self { registry }
    }

    /// Core resolution by server name; the rustls trait impl wraps this
    pub fn resolve_name(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        let name = server_name?;
        let app = self.registry.lookup(name);
        let context = app.as_ref().and_then(|a| a.tls_context());

        debug!(
            servername = %name,
            matched = app.is_some(),
            has_context = context.is_some(),
            "SNI lookup"
        );

        context
    }
}

impl fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SniResolver").finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        self.resolve_name(client_hello.server_name())
    }
}

/// Build the rustls server config with dynamic per-handshake selection
pub fn build_server_config(registry: Arc<AppRegistry>) -> ServerConfig {
    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(SniResolver::new(registry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AppOptions, RegistrySettings};
    use std::time::Duration;

    fn write_self_signed(dir: &Path, host: &str) -> (PathBuf, PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let cert_path = dir.join(format!("{}.crt", host));
        let key_path = dir.join(format!("{}.key", host));
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn test_settings(dir: &Path) -> RegistrySettings {
        RegistrySettings {
            cert_root: Some(dir.to_path_buf()),
            watch_interval: Duration::from_millis(50),
            reload_debounce: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_certbot_cert_paths() {
        let (cert, key) = certbot_cert_paths(Path::new("/etc/letsencrypt/live"), "a.example.com");
        assert_eq!(
            cert,
            PathBuf::from("/etc/letsencrypt/live/a.example.com/fullchain.pem")
        );
        assert_eq!(
            key,
            PathBuf::from("/etc/letsencrypt/live/a.example.com/privkey.pem")
        );
    }

    #[test]
    fn test_load_certified_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path(), "a.test");
        assert!(load_certified_key(&cert_path, &key_path).is_ok());
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_certified_key(&dir.path().join("nope.crt"), &dir.path().join("nope.key"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_garbage_key() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, _) = write_self_signed(dir.path(), "a.test");
        let bad_key = dir.path().join("bad.key");
        std::fs::write(&bad_key, "not a key").unwrap();
        assert!(load_certified_key(&cert_path, &bad_key).is_err());
    }

    #[tokio::test]
    async fn test_sni_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed(dir.path(), "secure.test");

        let registry = Arc::new(AppRegistry::new(test_settings(dir.path())));
        registry
            .add(
                "secure.test",
                AppOptions::new("http://127.0.0.1:9000")
                    .with_cert(cert_path)
                    .with_key(key_path),
            )
            .unwrap();
        registry
            .add("plain.test", AppOptions::new("http://127.0.0.1:9001"))
            .unwrap();

        let resolver = SniResolver::new(registry.clone());

        assert!(resolver.resolve_name(Some("secure.test")).is_some());
        assert!(resolver.resolve_name(Some("plain.test")).is_none());
        assert!(resolver.resolve_name(Some("unknown.test")).is_none());
        assert!(resolver.resolve_name(None).is_none());

        registry.close();
    }
}
