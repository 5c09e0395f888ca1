//! File change detection by metadata polling
//!
//! Certificate files are replaced rarely, so a poll loop is enough; a
//! watcher reports transitions (appeared, disappeared, touched) rather
//! than raw poll results.

use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;

/// Default interval between metadata polls
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot of the watched file's metadata; `None` means the file is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    mtime: Option<SystemTime>,
    ctime: (i64, i64),
}

#[cfg(unix)]
fn ctime_of(meta: &Metadata) -> (i64, i64) {
    use std::os::unix::fs::MetadataExt;
    (meta.ctime(), meta.ctime_nsec())
}

#[cfg(not(unix))]
fn ctime_of(_meta: &Metadata) -> (i64, i64) {
    (0, 0)
}

async fn stamp(path: &Path) -> Option<FileStamp> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(FileStamp {
        mtime: meta.modified().ok(),
        ctime: ctime_of(&meta),
    })
}

/// Subscription handle returned by [`watch_file`]
///
/// The poll loop runs until `unwatch` is called or the handle is dropped.
pub struct WatchHandle {
    closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop polling and cancel any pending timer
    ///
    /// Safe to call multiple times; no callback fires after this returns.
    pub fn unwatch(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.unwatch();
    }
}

/// Poll `path` on `interval` and invoke `callback(path, currently_exists)`
/// whenever the observed state transitions: absent to present, present to
/// absent, or a change in modification/status-change timestamps.
pub fn watch_file<F>(path: impl Into<PathBuf>, interval: Duration, callback: F) -> WatchHandle
where
    F: Fn(&Path, bool) + Send + Sync + 'static,
{
    let path = path.into();
    let closed = Arc::new(AtomicBool::new(false));
    let closed_flag = closed.clone();

    let task = tokio::spawn(async move {
        let mut prev = stamp(&path).await;

        loop {
            tokio::time::sleep(interval).await;
            if closed_flag.load(Ordering::SeqCst) {
                break;
            }

            let current = stamp(&path).await;
            if current != prev && !closed_flag.load(Ordering::SeqCst) {
                callback(&path, current.is_some());
            }
            prev = current;
        }
    });

    WatchHandle { closed, task }
}
