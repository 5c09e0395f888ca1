//! Configuration for hosting-rs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{HostingError, Result};

/// Main hosting configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostingConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Shared-secret authentication (optional)
    pub auth: Option<AuthConfig>,
    /// TLS configuration (optional; absent disables the encrypted listener)
    pub tls: Option<TlsConfig>,
    /// Apps registered at startup
    #[serde(default)]
    pub apps: Vec<AppConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address for both listeners (e.g., "0.0.0.0")
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Plaintext listener port
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Upstream request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,
    /// Bounded wait for in-flight requests during shutdown
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_seconds: u64,
    /// Whether forwarding headers from an upstream proxy are trusted
    #[serde(default)]
    pub trust_upstream: UpstreamTrust,
}

/// How much to trust inbound forwarding headers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamTrust {
    /// Direct exposure: inbound forwarding headers are stripped and rewritten
    #[default]
    None,
    /// Behind a load balancer setting X-Forwarded-For
    Standard,
    /// Behind Cloudflare (CF-Connecting-IP / CF-IPCountry)
    Cloudflare,
}

/// Shared-secret authentication configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// Header carrying the secret; never forwarded upstream
    #[serde(default = "default_auth_header")]
    pub header: String,
    /// The shared secret
    pub secret: String,
}

/// TLS configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Encrypted listener port
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    /// Certbot-style certificate root ({cert_root}/{host}/fullchain.pem)
    #[serde(default = "default_cert_root")]
    pub cert_root: PathBuf,
    /// Webroot that the ACME client writes challenge files into
    #[serde(default = "default_challenge_root")]
    pub challenge_root: PathBuf,
    /// Delay between a certificate file change and the reload attempt
    #[serde(default = "default_reload_debounce")]
    pub reload_debounce_seconds: u64,
    /// Certificate file poll interval
    #[serde(default = "default_watch_interval")]
    pub watch_interval_seconds: u64,
}

/// App registered at startup
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Hostname to match (e.g., "mail.example.com")
    pub hostname: String,
    /// Default backend URL (e.g., "http://localhost:8080")
    pub destination: String,
    /// Explicit certificate path (takes precedence over `certbot`)
    pub cert: Option<PathBuf>,
    /// Explicit private key path
    pub key: Option<PathBuf>,
    /// Derive certificate paths from the certbot convention
    #[serde(default)]
    pub certbot: bool,
    /// Path-prefix sub-routes, matched in order
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

/// Path-prefix sub-route
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocationConfig {
    /// Path prefix to match (e.g., "/api")
    pub path_prefix: String,
    /// Backend URL for this prefix
    pub destination: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    80
}

fn default_https_port() -> u16 {
    443
}

fn default_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    30
}

fn default_auth_header() -> String {
    "x-hosting-secret".to_string()
}

fn default_cert_root() -> PathBuf {
    PathBuf::from("/etc/letsencrypt/live")
}

fn default_challenge_root() -> PathBuf {
    PathBuf::from("/var/lib/hosting/acme")
}

fn default_reload_debounce() -> u64 {
    30
}

fn default_watch_interval() -> u64 {
    2
}

impl HostingConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HostingError::InvalidConfig(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| HostingError::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                bind_addr: "127.0.0.1".to_string(),
                http_port: 8080,
                timeout_seconds: 30,
                drain_timeout_seconds: 30,
                trust_upstream: UpstreamTrust::None,
            },
            auth: None,
            tls: None,
            apps: vec![AppConfig {
                hostname: "localhost".to_string(),
                destination: "http://127.0.0.1:3000".to_string(),
                cert: None,
                key: None,
                certbot: false,
                locations: vec![],
            }],
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for app in &self.apps {
            if app.hostname.is_empty() {
                return Err(HostingError::InvalidConfig(
                    "App hostname must not be empty".to_string(),
                ));
            }

            url::Url::parse(&app.destination).map_err(|e| {
                HostingError::InvalidConfig(format!(
                    "Invalid destination URL '{}': {}",
                    app.destination, e
                ))
            })?;

            for location in &app.locations {
                url::Url::parse(&location.destination).map_err(|e| {
                    HostingError::InvalidConfig(format!(
                        "Invalid destination URL '{}': {}",
                        location.destination, e
                    ))
                })?;
            }
        }

        if let Some(ref auth) = self.auth {
            if auth.secret.is_empty() {
                return Err(HostingError::InvalidConfig(
                    "Auth secret must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for HostingConfig {
    fn default() -> Self {
        Self::development()
    }
}
