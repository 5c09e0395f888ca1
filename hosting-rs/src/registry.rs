//! App registry
//!
//! Single source of truth mapping hostnames to application records, read
//! by both the request dispatcher and the SNI resolver. Mutations build a
//! fresh record and replace the map entry, so a concurrent reader sees
//! either the fully old or the fully new record.

use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::config::{AppConfig, TlsConfig};
use crate::error::{HostingError, Result};
use crate::reload::{CertReloader, DEFAULT_RELOAD_DEBOUNCE};
use crate::tls::certbot_cert_paths;
use crate::watch::DEFAULT_WATCH_INTERVAL;

/// Registry-wide settings for certificate bindings
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Certbot-style certificate root; `None` disables certificate bindings
    pub cert_root: Option<PathBuf>,
    /// Poll interval for certificate file watchers
    pub watch_interval: Duration,
    /// Debounce window before a reload attempt
    pub reload_debounce: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            cert_root: None,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            reload_debounce: DEFAULT_RELOAD_DEBOUNCE,
        }
    }
}

impl RegistrySettings {
    /// Derive settings from the TLS config section
    pub fn from_tls_config(tls: Option<&TlsConfig>) -> Self {
        match tls {
            Some(tls) => Self {
                cert_root: Some(tls.cert_root.clone()),
                watch_interval: Duration::from_secs(tls.watch_interval_seconds),
                reload_debounce: Duration::from_secs(tls.reload_debounce_seconds),
            },
            None => Self::default(),
        }
    }
}

/// Path-prefix sub-route
#[derive(Debug, Clone)]
pub struct Location {
    /// Literal path prefix (e.g., "/api")
    pub path_prefix: String,
    /// Backend URL for requests under this prefix
    pub destination: String,
}

/// Certificate material bound to one app
///
/// Owned exclusively by its record; the context slot inside the reloader
/// is shared by reference with the TLS listener during handshakes.
pub struct TlsBinding {
    reloader: CertReloader,
}

impl TlsBinding {
    /// The currently active context; `None` while no certificate loads
    pub fn context(&self) -> Option<Arc<CertifiedKey>> {
        self.reloader.current()
    }

    /// Release the file watchers and any pending reload timer
    pub fn unwatch(&self) {
        self.reloader.unwatch();
    }
}

/// One registered hostname
pub struct AppRecord {
    /// Registered hostname (lowercase)
    pub hostname: String,
    /// Default backend URL
    pub destination: String,
    /// Sub-routes, matched in registration order
    pub locations: Vec<Location>,
    /// Certificate binding; absent for plaintext-only hosts
    pub tls: Option<Arc<TlsBinding>>,
}

impl AppRecord {
    /// Resolve the backend for a request path: first location whose prefix
    /// is a literal prefix of the path, else the default destination
    pub fn route(&self, path: &str) -> &str {
        for location in &self.locations {
            if path.starts_with(&location.path_prefix) {
                return &location.destination;
            }
        }
        &self.destination
    }

    /// The active TLS context, if this host has one loaded
    pub fn tls_context(&self) -> Option<Arc<CertifiedKey>> {
        self.tls.as_ref().and_then(|b| b.context())
    }
}

/// Registration and edit options
///
/// `cert` + `key` take precedence over `certbot_host`; fields left unset
/// keep their existing values on edit.
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Default backend URL (required on add)
    pub destination: Option<String>,
    /// Explicit certificate PEM path
    pub cert: Option<PathBuf>,
    /// Explicit private key PEM path
    pub key: Option<PathBuf>,
    /// Hostname for certbot-convention paths under the cert root
    pub certbot_host: Option<String>,
    /// Replacement set of sub-routes
    pub locations: Option<Vec<Location>>,
}

impl AppOptions {
    /// Options with just a destination
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: Some(destination.into()),
            ..Self::default()
        }
    }

    /// Set an explicit certificate path
    pub fn with_cert(mut self, cert: impl Into<PathBuf>) -> Self {
        self.cert = Some(cert.into());
        self
    }

    /// Set an explicit private key path
    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Derive certificate paths from the certbot convention for `host`
    pub fn with_certbot_host(mut self, host: impl Into<String>) -> Self {
        self.certbot_host = Some(host.into());
        self
    }

    /// Replace the sub-route table
    pub fn with_locations(mut self, locations: Vec<Location>) -> Self {
        self.locations = Some(locations);
        self
    }
}

impl From<&AppConfig> for AppOptions {
    fn from(app: &AppConfig) -> Self {
        Self {
            destination: Some(app.destination.clone()),
            cert: app.cert.clone(),
            key: app.key.clone(),
            certbot_host: app.certbot.then(|| app.hostname.clone()),
            locations: Some(
                app.locations
                    .iter()
                    .map(|l| Location {
                        path_prefix: l.path_prefix.clone(),
                        destination: l.destination.clone(),
                    })
                    .collect(),
            ),
        }
    }
}

/// Hostname to app mapping
pub struct AppRegistry {
    apps: RwLock<HashMap<String, Arc<AppRecord>>>,
    settings: RegistrySettings,
}

impl AppRegistry {
    /// Create an empty registry
    pub fn new(settings: RegistrySettings) -> Self {
        Self {
            apps: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Register a new hostname
    pub fn add(&self, hostname: &str, opts: AppOptions) -> Result<()> {
        let hostname = normalize_hostname(hostname);

        let destination = opts
            .destination
            .clone()
            .filter(|d| !d.is_empty())
            .ok_or_else(|| HostingError::InvalidConfig("Destination is required".to_string()))?;
        validate_destination(&destination)?;

        if self.apps.read().unwrap().contains_key(&hostname) {
            return Err(HostingError::AlreadyExists(hostname));
        }

        let tls = self.build_binding(&hostname, &opts)?;
        let record = Arc::new(AppRecord {
            hostname: hostname.clone(),
            destination,
            locations: opts.locations.unwrap_or_default(),
            tls,
        });

        // Re-check under the write lock: a concurrent add must not clobber
        let mut apps = self.apps.write().unwrap();
        if apps.contains_key(&hostname) {
            if let Some(binding) = &record.tls {
                binding.unwatch();
            }
            return Err(HostingError::AlreadyExists(hostname));
        }
        apps.insert(hostname.clone(), record);
        drop(apps);

        debug!(hostname = %hostname, "App registered");
        Ok(())
    }

    /// Edit an existing hostname; only fields present in `opts` change
    pub fn edit(&self, hostname: &str, opts: AppOptions) -> Result<()> {
        let hostname = normalize_hostname(hostname);

        let current = self
            .lookup(&hostname)
            .ok_or_else(|| HostingError::NotFound(hostname.clone()))?;

        let destination = match opts.destination.clone().filter(|d| !d.is_empty()) {
            Some(destination) => {
                validate_destination(&destination)?;
                destination
            }
            None => current.destination.clone(),
        };

        // New certificate material replaces the binding; otherwise the
        // existing binding is carried over into the new record
        let new_binding = self.build_binding(&hostname, &opts)?;
        let (tls, replaced) = match new_binding {
            Some(binding) => (Some(binding), current.tls.clone()),
            None => (current.tls.clone(), None),
        };

        let record = Arc::new(AppRecord {
            hostname: hostname.clone(),
            destination,
            locations: opts
                .locations
                .unwrap_or_else(|| current.locations.clone()),
            tls,
        });

        self.apps.write().unwrap().insert(hostname.clone(), record);

        if let Some(old) = replaced {
            old.unwatch();
        }

        debug!(hostname = %hostname, "App updated");
        Ok(())
    }

    /// Remove a hostname, revoking its watch handles before returning
    pub fn remove(&self, hostname: &str) -> Result<()> {
        let hostname = normalize_hostname(hostname);

        let removed = self
            .apps
            .write()
            .unwrap()
            .remove(&hostname)
            .ok_or(HostingError::NotFound(hostname))?;

        if let Some(binding) = &removed.tls {
            binding.unwatch();
        }
        Ok(())
    }

    /// Look up the record for a hostname
    pub fn lookup(&self, hostname: &str) -> Option<Arc<AppRecord>> {
        self.apps
            .read()
            .unwrap()
            .get(&normalize_hostname(hostname))
            .cloned()
    }

    /// Hostnames with a certificate binding (diagnostics)
    pub fn tls_hostnames(&self) -> Vec<String> {
        self.apps
            .read()
            .unwrap()
            .values()
            .filter(|a| a.tls.is_some())
            .map(|a| a.hostname.clone())
            .collect()
    }

    /// Revoke every binding's watchers and pending timers
    pub fn close(&self) {
        for app in self.apps.read().unwrap().values() {
            if let Some(binding) = &app.tls {
                binding.unwatch();
            }
        }
    }

    fn build_binding(&self, hostname: &str, opts: &AppOptions) -> Result<Option<Arc<TlsBinding>>> {
        let paths = match (&opts.cert, &opts.key, &opts.certbot_host) {
            (Some(cert), Some(key), _) => Some((cert.clone(), key.clone())),
            (Some(_), None, _) | (None, Some(_), _) => {
                return Err(HostingError::InvalidConfig(
                    "cert and key must be provided together".to_string(),
                ));
            }
            (None, None, Some(host)) => {
                let root = self.settings.cert_root.as_deref().ok_or_else(|| {
                    HostingError::InvalidConfig(
                        "Certificate material configured but TLS is disabled".to_string(),
                    )
                })?;
                Some(certbot_cert_paths(root, host))
            }
            (None, None, None) => None,
        };

        let Some((cert_path, key_path)) = paths else {
            return Ok(None);
        };

        if opts.cert.is_some() && self.settings.cert_root.is_none() {
            return Err(HostingError::InvalidConfig(
                "Certificate material configured but TLS is disabled".to_string(),
            ));
        }

        let reloader = CertReloader::new(
            hostname,
            cert_path,
            key_path,
            self.settings.watch_interval,
            self.settings.reload_debounce,
        );
        Ok(Some(Arc::new(TlsBinding { reloader })))
    }
}

fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().to_ascii_lowercase()
}

fn validate_destination(destination: &str) -> Result<()> {
    url::Url::parse(destination).map_err(|e| {
        HostingError::InvalidConfig(format!("Invalid destination URL '{}': {}", destination, e))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AppRegistry {
        AppRegistry::new(RegistrySettings::default())
    }

    #[test]
    fn test_add_and_lookup() {
        let registry = registry();
        registry
            .add("A.Example.Com", AppOptions::new("http://127.0.0.1:1337"))
            .unwrap();

        let app = registry.lookup("a.example.com").unwrap();
        assert_eq!(app.destination, "http://127.0.0.1:1337");
        assert!(app.tls.is_none());

        // Lookup normalizes case the same way registration does
        assert!(registry.lookup("A.EXAMPLE.COM").is_some());
        assert!(registry.lookup("other.example.com").is_none());
    }

    #[test]
    fn test_add_requires_destination() {
        let registry = registry();
        let err = registry.add("a.example.com", AppOptions::default()).unwrap_err();
        assert!(matches!(err, HostingError::InvalidConfig(_)));
    }

    #[test]
    fn test_add_rejects_invalid_destination() {
        let registry = registry();
        let err = registry
            .add("a.example.com", AppOptions::new("not a url"))
            .unwrap_err();
        assert!(matches!(err, HostingError::InvalidConfig(_)));
    }

    #[test]
    fn test_duplicate_add_fails_without_mutating() {
        let registry = registry();
        registry
            .add("a.example.com", AppOptions::new("http://127.0.0.1:1337"))
            .unwrap();

        let err = registry
            .add("a.example.com", AppOptions::new("http://127.0.0.1:9999"))
            .unwrap_err();
        assert!(matches!(err, HostingError::AlreadyExists(_)));

        let app = registry.lookup("a.example.com").unwrap();
        assert_eq!(app.destination, "http://127.0.0.1:1337");
    }

    #[test]
    fn test_edit_unknown_host_fails() {
        let registry = registry();
        let err = registry
            .edit("a.example.com", AppOptions::new("http://127.0.0.1:1337"))
            .unwrap_err();
        assert!(matches!(err, HostingError::NotFound(_)));
    }

    #[test]
    fn test_edit_applies_only_present_fields() {
        let registry = registry();
        registry
            .add(
                "a.example.com",
                AppOptions::new("http://127.0.0.1:1337").with_locations(vec![Location {
                    path_prefix: "/api".to_string(),
                    destination: "http://127.0.0.1:2000".to_string(),
                }]),
            )
            .unwrap();

        registry
            .edit("a.example.com", AppOptions::new("http://127.0.0.1:1400"))
            .unwrap();

        let app = registry.lookup("a.example.com").unwrap();
        assert_eq!(app.destination, "http://127.0.0.1:1400");
        assert_eq!(app.locations.len(), 1, "locations carry over when not set");
    }

    #[test]
    fn test_remove_revokes_entry() {
        let registry = registry();
        registry
            .add("a.example.com", AppOptions::new("http://127.0.0.1:1337"))
            .unwrap();
        registry.remove("a.example.com").unwrap();
        assert!(registry.lookup("a.example.com").is_none());
        assert!(matches!(
            registry.remove("a.example.com"),
            Err(HostingError::NotFound(_))
        ));
    }

    #[test]
    fn test_lone_cert_rejected() {
        let registry = registry();
        let err = registry
            .add(
                "a.example.com",
                AppOptions::new("http://127.0.0.1:1337").with_cert("/tmp/cert.pem"),
            )
            .unwrap_err();
        assert!(matches!(err, HostingError::InvalidConfig(_)));
    }

    #[test]
    fn test_cert_material_requires_tls() {
        let registry = registry(); // no cert_root configured
        let err = registry
            .add(
                "a.example.com",
                AppOptions::new("http://127.0.0.1:1337").with_certbot_host("a.example.com"),
            )
            .unwrap_err();
        assert!(matches!(err, HostingError::InvalidConfig(_)));
    }

    #[test]
    fn test_route_first_prefix_match_in_order() {
        let record = AppRecord {
            hostname: "a.example.com".to_string(),
            destination: "http://127.0.0.1:3000".to_string(),
            locations: vec![
                Location {
                    path_prefix: "/api".to_string(),
                    destination: "http://127.0.0.1:8080".to_string(),
                },
                Location {
                    path_prefix: "/api/v2".to_string(),
                    destination: "http://127.0.0.1:8081".to_string(),
                },
            ],
            tls: None,
        };

        assert_eq!(record.route("/api/users"), "http://127.0.0.1:8080");
        // Registration order wins, not the longest prefix
        assert_eq!(record.route("/api/v2/users"), "http://127.0.0.1:8080");
        assert_eq!(record.route("/index.html"), "http://127.0.0.1:3000");
    }

    #[tokio::test]
    async fn test_certbot_binding_with_missing_files_is_pending() {
        let dir = tempfile::tempdir().unwrap();
        let registry = AppRegistry::new(RegistrySettings {
            cert_root: Some(dir.path().to_path_buf()),
            watch_interval: Duration::from_millis(50),
            reload_debounce: Duration::from_millis(50),
        });

        registry
            .add(
                "a.example.com",
                AppOptions::new("http://127.0.0.1:1337").with_certbot_host("a.example.com"),
            )
            .unwrap();

        let app = registry.lookup("a.example.com").unwrap();
        let binding = app.tls.as_ref().unwrap();
        assert!(binding.context().is_none(), "no files yet, context pending");
        assert_eq!(registry.tls_hostnames(), vec!["a.example.com".to_string()]);

        registry.close();
    }
}
