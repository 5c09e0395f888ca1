//! hosting-rs: TLS-terminating virtual-hosting reverse proxy
//!
//! One process accepts plaintext and encrypted connections for many
//! domains, selects the right certificate per handshake via SNI, and
//! routes each request to a backend by host and path prefix.
//!
//! # Features
//!
//! - Name-based virtual hosting over HTTP/HTTPS
//! - Dynamic SNI certificate selection from a live app registry
//! - Certificate hot reload with debounced file watching
//! - ACME HTTP-01 challenge responses from a webroot
//! - Shared-secret authentication with spoofing-safe forwarded headers
//! - Graceful drain on shutdown
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! http_port = 80
//! timeout_seconds = 30
//!
//! [auth]
//! header = "x-hosting-secret"
//! secret = "change-me"
//!
//! [tls]
//! https_port = 443
//! cert_root = "/etc/letsencrypt/live"
//! challenge_root = "/var/lib/hosting/acme"
//!
//! [[apps]]
//! hostname = "a.example.com"
//! destination = "http://127.0.0.1:1337"
//! certbot = true
//!
//! [[apps.locations]]
//! path_prefix = "/api"
//! destination = "http://127.0.0.1:8080"
//! ```

pub mod acme;
pub mod config;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod tls;
pub mod watch;

pub use config::HostingConfig;
pub use error::{HostingError, Result};
pub use proxy::HostingServer;
pub use registry::{AppOptions, AppRegistry, Location};
