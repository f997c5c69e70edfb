//! Reload the serving certificate when its files are rotated.
//!
//! Rotation produces a burst of events in the certificate directory
//! (CREATE, CHMOD, CREATE, RENAME, CREATE, REMOVE). The REMOVE comes last,
//! once the new files are in place, so that is the only event that triggers
//! a reload. Reloading on earlier events risks reading a half-written pair.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CertificateStore, TlsError};
use crate::health::HealthState;

/// A change observed in the certificate directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileEvent {
    Created,
    Modified,
    AttributesChanged,
    Renamed,
    Removed,
    /// The kernel dropped events; whatever happened is unknown
    Overflow,
}

impl FileEvent {
    /// Whether this event means a rotation has finished
    pub fn triggers_reload(self) -> bool {
        matches!(self, FileEvent::Removed | FileEvent::Overflow)
    }
}

/// Running watcher task
#[derive(Debug)]
pub struct WatcherHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Stop watching and wait for the task to exit
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.task.await {
            error!(error = %e, "Certificate watcher task panicked");
        }
    }
}

/// Background task that owns reloads of a [`CertificateStore`]
pub struct CertificateWatcher {
    store: CertificateStore,
    recorder: Option<Arc<dyn ReloadRecorder>>,
}

/// Receives reload results; implemented by the metrics registry
pub trait ReloadRecorder: Send + Sync {
    fn record(&self, success: bool);
}

impl ReloadRecorder for HealthState {
    fn record(&self, success: bool) {
        self.metrics.record_certificate_reload(success);
    }
}

impl CertificateWatcher {
    pub fn new(store: CertificateStore) -> Self {
        Self {
            store,
            recorder: None,
        }
    }

    /// Report every reload attempt to `recorder`
    pub fn with_recorder(mut self, recorder: Arc<dyn ReloadRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Start watching the certificate directory.
    ///
    /// Fails if the directory cannot be watched; the caller decides whether
    /// serving with a static certificate is acceptable.
    pub fn spawn(self) -> Result<WatcherHandle, TlsError> {
        let dir = self.store.watch_dir();
        let events = DirectoryEvents::watch(&dir)?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(dir = %dir.display(), "Watching certificate directory");
        let task = tokio::spawn(self.run(events, dir, shutdown_rx));

        Ok(WatcherHandle {
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    async fn run(
        self,
        mut events: DirectoryEvents,
        dir: PathBuf,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                batch = events.next_batch() => match batch {
                    Ok(batch) => {
                        debug!(events = ?batch, "Certificate directory changed");
                        if batch.into_iter().any(FileEvent::triggers_reload) {
                            self.reload().await;
                        }
                    }
                    Err(e) => {
                        error!(dir = %dir.display(), error = %e, "Error watching certificate files");
                        return;
                    }
                },
                _ = &mut shutdown_rx => {
                    debug!("Certificate watcher stopped");
                    return;
                }
            }
        }
    }

    async fn reload(&self) {
        info!("Certificate files modified. Reloading...");
        let result = self.store.reload().await;
        if let Some(recorder) = &self.recorder {
            recorder.record(result.is_ok());
        }
        match result {
            Ok(()) => info!("Certificate reloaded successfully"),
            Err(e) => warn!(error = %e, "Failed to reload certificate, keeping previous"),
        }
    }
}

#[cfg(target_os = "linux")]
use self::inotify::DirectoryEvents;

#[cfg(target_os = "linux")]
mod inotify {
    use std::io;
    use std::os::fd::{AsFd, AsRawFd, RawFd};
    use std::path::Path;

    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
    use tokio::io::unix::AsyncFd;

    use super::{FileEvent, TlsError};

    struct InotifyFd(Inotify);

    impl AsRawFd for InotifyFd {
        fn as_raw_fd(&self) -> RawFd {
            self.0.as_fd().as_raw_fd()
        }
    }

    /// inotify watch on one directory, driven by the tokio reactor
    pub(super) struct DirectoryEvents {
        fd: AsyncFd<InotifyFd>,
    }

    impl DirectoryEvents {
        pub(super) fn watch(dir: &Path) -> Result<Self, TlsError> {
            let to_error = |source: io::Error| TlsError::Watch {
                path: dir.to_path_buf(),
                source,
            };

            let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)
                .map_err(|e| to_error(e.into()))?;
            inotify
                .add_watch(
                    dir,
                    AddWatchFlags::IN_CREATE
                        | AddWatchFlags::IN_MODIFY
                        | AddWatchFlags::IN_ATTRIB
                        | AddWatchFlags::IN_MOVED_FROM
                        | AddWatchFlags::IN_MOVED_TO
                        | AddWatchFlags::IN_DELETE
                        | AddWatchFlags::IN_DELETE_SELF,
                )
                .map_err(|e| to_error(e.into()))?;

            let fd = AsyncFd::new(InotifyFd(inotify)).map_err(to_error)?;
            Ok(Self { fd })
        }

        /// Wait for the next batch of events.
        pub(super) async fn next_batch(&mut self) -> io::Result<Vec<FileEvent>> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from)) {
                    Ok(result) => {
                        return result.map(|events| {
                            events.into_iter().filter_map(|e| classify(e.mask)).collect()
                        });
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }

    pub(super) fn classify(mask: AddWatchFlags) -> Option<FileEvent> {
        if mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
            Some(FileEvent::Overflow)
        } else if mask.intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF) {
            Some(FileEvent::Removed)
        } else if mask.intersects(AddWatchFlags::IN_MOVED_FROM | AddWatchFlags::IN_MOVED_TO) {
            Some(FileEvent::Renamed)
        } else if mask.contains(AddWatchFlags::IN_CREATE) {
            Some(FileEvent::Created)
        } else if mask.contains(AddWatchFlags::IN_ATTRIB) {
            Some(FileEvent::AttributesChanged)
        } else if mask.contains(AddWatchFlags::IN_MODIFY) {
            Some(FileEvent::Modified)
        } else {
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
struct DirectoryEvents;

#[cfg(not(target_os = "linux"))]
impl DirectoryEvents {
    fn watch(_dir: &std::path::Path) -> Result<Self, TlsError> {
        Err(TlsError::WatchUnsupported)
    }

    async fn next_batch(&mut self) -> std::io::Result<Vec<FileEvent>> {
        std::future::pending().await
    }
}
