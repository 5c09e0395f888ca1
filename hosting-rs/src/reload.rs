//! Certificate hot reload
//!
//! One controller per watched certificate/key pair. Change events from
//! either file arm a single debounce timer; repeated writes within the
//! window (certbot rewrites both files in sequence) collapse into one
//! reload attempt. A failed reload keeps the previous context so a
//! half-replaced pair never takes a working host offline.

use rustls::sign::CertifiedKey;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::tls::load_certified_key;
use crate::watch::{watch_file, WatchHandle};

/// Default delay between a file change and the reload attempt
pub const DEFAULT_RELOAD_DEBOUNCE: Duration = Duration::from_secs(30);

/// Live TLS context slot shared with the SNI resolver
///
/// `None` means no certificate is currently available for the host; the
/// value is replaced wholesale on reload, never mutated in place.
type ContextSlot = RwLock<Option<Arc<CertifiedKey>>>;

struct ReloaderInner {
    hostname: String,
    cert_path: PathBuf,
    key_path: PathBuf,
    debounce: Duration,
    context: ContextSlot,
    pending: Mutex<Option<JoinHandle<()>>>,
    watches: Mutex<Vec<WatchHandle>>,
    closed: AtomicBool,
}

impl ReloaderInner {
    fn schedule_reload(self: &Arc<Self>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let mut pending = self.pending.lock().unwrap();
        // Single timer slot: a new change restarts the window
        if let Some(timer) = pending.take() {
            timer.abort();
        }

        let inner = self.clone();
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(inner.debounce).await;
            inner.reload();
        }));
    }

    fn reload(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match load_certified_key(&self.cert_path, &self.key_path) {
            Ok(key) => {
                *self.context.write().unwrap() = Some(Arc::new(key));
                info!(hostname = %self.hostname, "Certificate reloaded");
            }
            Err(e) => {
                warn!(
                    hostname = %self.hostname,
                    error = %e,
                    "Certificate reload failed, keeping previous context"
                );
            }
        }
    }
}

/// Watches one host's certificate and key files and swaps the live TLS
/// context when they change
pub struct CertReloader {
    inner: Arc<ReloaderInner>,
}

impl CertReloader {
    /// Start watching `cert_path` and `key_path` for `hostname`
    ///
    /// The initial load is attempted immediately; if it fails the context
    /// stays empty but the watchers still run, so a certificate that
    /// appears later is picked up.
    pub fn new(
        hostname: &str,
        cert_path: PathBuf,
        key_path: PathBuf,
        watch_interval: Duration,
        debounce: Duration,
    ) -> Self {
        let inner = Arc::new(ReloaderInner {
            hostname: hostname.to_string(),
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
            debounce,
            context: RwLock::new(None),
            pending: Mutex::new(None),
            watches: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });

        match load_certified_key(&inner.cert_path, &inner.key_path) {
            Ok(key) => *inner.context.write().unwrap() = Some(Arc::new(key)),
            Err(e) => warn!(
                hostname = %inner.hostname,
                error = %e,
                "Initial certificate load failed, watching for files to appear"
            ),
        }

        let mut watches = Vec::with_capacity(2);
        for path in [cert_path, key_path] {
            let watcher_inner = inner.clone();
            watches.push(watch_file(path, watch_interval, move |_, _| {
                watcher_inner.schedule_reload();
            }));
        }
        *inner.watches.lock().unwrap() = watches;

        Self { inner }
    }

    /// The currently active context, if any
    pub fn current(&self) -> Option<Arc<CertifiedKey>> {
        self.inner.context.read().unwrap().clone()
    }

    /// Certificate path being watched
    pub fn cert_path(&self) -> &Path {
        &self.inner.cert_path
    }

    /// Key path being watched
    pub fn key_path(&self) -> &Path {
        &self.inner.key_path
    }

    /// Cancel the pending debounce timer and both watchers
    ///
    /// Idempotent; must be called before the binding is discarded.
    pub fn unwatch(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);

        if let Some(timer) = self.inner.pending.lock().unwrap().take() {
            timer.abort();
        }
        for watch in self.inner.watches.lock().unwrap().drain(..) {
            watch.unwatch();
        }
    }
}

impl Drop for CertReloader {
    fn drop(&mut self) {
        self.unwatch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATCH: Duration = Duration::from_millis(20);
    const DEBOUNCE: Duration = Duration::from_millis(60);
    const SETTLE: Duration = Duration::from_millis(400);

    fn write_self_signed(cert_path: &Path, key_path: &Path, host: &str) {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        std::fs::write(cert_path, cert.cert.pem()).unwrap();
        std::fs::write(key_path, cert.key_pair.serialize_pem()).unwrap();
    }

    #[tokio::test]
    async fn test_initial_load() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("privkey.pem");
        write_self_signed(&cert_path, &key_path, "a.test");

        let reloader = CertReloader::new("a.test", cert_path, key_path, WATCH, DEBOUNCE);
        assert!(reloader.current().is_some());
        reloader.unwatch();
    }

    #[tokio::test]
    async fn test_reload_swaps_context_after_debounce() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("privkey.pem");
        write_self_signed(&cert_path, &key_path, "a.test");

        let reloader =
            CertReloader::new("a.test", cert_path.clone(), key_path.clone(), WATCH, DEBOUNCE);
        let before = reloader.current().unwrap();
        // Let the background watchers establish their baseline stamp before we
        // mutate, otherwise (on a single-threaded runtime) they first run after
        // the rewrite and never observe a transition.
        tokio::time::sleep(SETTLE).await;

        write_self_signed(&cert_path, &key_path, "a.test");
        tokio::time::sleep(SETTLE).await;

        let after = reloader.current().unwrap();
        assert!(
            !Arc::ptr_eq(&before, &after),
            "context should be replaced after the debounce window"
        );
        reloader.unwatch();
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_context() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("privkey.pem");
        write_self_signed(&cert_path, &key_path, "a.test");

        let reloader =
            CertReloader::new("a.test", cert_path.clone(), key_path.clone(), WATCH, DEBOUNCE);
        let before = reloader.current().unwrap();

        // Simulate a half-written replacement: key truncated to garbage
        std::fs::write(&key_path, "garbage").unwrap();
        tokio::time::sleep(SETTLE).await;

        let after = reloader.current().unwrap();
        assert!(Arc::ptr_eq(&before, &after), "bad reload must not clear the context");
        reloader.unwatch();
    }

    #[tokio::test]
    async fn test_certificate_appearing_later_is_picked_up() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("privkey.pem");

        let reloader =
            CertReloader::new("a.test", cert_path.clone(), key_path.clone(), WATCH, DEBOUNCE);
        assert!(reloader.current().is_none());
        // Let the background watchers establish their baseline stamp before we
        // create the files, otherwise (on a single-threaded runtime) they first
        // run after creation and never observe the absent->present transition.
        tokio::time::sleep(SETTLE).await;

        write_self_signed(&cert_path, &key_path, "a.test");
        tokio::time::sleep(SETTLE).await;

        assert!(reloader.current().is_some());
        reloader.unwatch();
    }

    #[tokio::test]
    async fn test_unwatch_cancels_pending_reload() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("fullchain.pem");
        let key_path = dir.path().join("privkey.pem");

        let reloader =
            CertReloader::new("a.test", cert_path.clone(), key_path.clone(), WATCH, DEBOUNCE);

        write_self_signed(&cert_path, &key_path, "a.test");
        tokio::time::sleep(Duration::from_millis(40)).await;
        reloader.unwatch();
        reloader.unwatch(); // idempotent

        tokio::time::sleep(SETTLE).await;
        assert!(reloader.current().is_none(), "reload must not fire after unwatch");
    }
}
