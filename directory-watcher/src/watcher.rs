//! Public watcher interface for the owning UI component.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, info, warn};

use crate::config::{FilterSet, WatcherConfig};
use crate::error::{Result, WatcherError};
use crate::event::{NodeId, Notification};
use crate::registry::{OpQueue, WatchOp, WatchRegistry};
use crate::sink::NotificationSink;
use crate::worker::{ControlMessage, Worker};

/// Monitors a dynamically changing set of directories for structural changes
/// and notifies the owner, keyed by opaque node identifiers.
///
/// All watching happens on one dedicated background thread, started with
/// [`start_thread`](Self::start_thread) and stopped explicitly. `add_dir` /
/// `remove_dir` never block beyond a short lock; they enqueue operations the
/// worker applies on its next cycle. Notifications arrive on the channel
/// returned by [`new`](Self::new).
///
/// Shutdown order matters: call [`remove_all_dirs`](Self::remove_all_dirs)
/// (which blocks, bounded, until every native handle is closed) before
/// [`stop_thread`](Self::stop_thread). `Drop` performs both best-effort.
pub struct DirectoryWatcher {
    config: WatcherConfig,
    queue: Arc<OpQueue>,
    control_tx: Sender<ControlMessage>,
    notify_tx: Sender<Notification>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl DirectoryWatcher {
    /// Create a watcher and the channel its notifications arrive on.
    pub fn new(config: WatcherConfig) -> (Self, Receiver<Notification>) {
        let (notify_tx, notify_rx) = bounded(config.channel_capacity);
        // Replaced with a live channel when the thread starts; sends into
        // this placeholder are no-ops.
        let (control_tx, _) = unbounded();

        let watcher = Self {
            config,
            queue: Arc::new(OpQueue::new()),
            control_tx,
            notify_tx,
            handle: None,
        };
        (watcher, notify_rx)
    }

    /// Start the background thread. A watcher that is already running is
    /// left as is.
    pub fn start_thread(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let (control_tx, control_rx) = unbounded();
        let worker = Worker {
            control_rx,
            control_tx: control_tx.clone(),
            queue: Arc::clone(&self.queue),
            registry: WatchRegistry::new(),
            sink: NotificationSink::new(
                self.notify_tx.clone(),
                self.config.delivery_timeout,
                self.config.max_deferred,
            ),
            poll_interval: self.config.poll_interval,
        };

        let handle = std::thread::Builder::new()
            .name("directory-watcher".into())
            .spawn(move || worker.run())
            .map_err(WatcherError::ThreadSpawn)?;

        self.control_tx = control_tx;
        self.handle = Some(handle);
        info!("directory watcher started");
        Ok(())
    }

    /// Signal the worker to exit and join it.
    ///
    /// Call [`remove_all_dirs`](Self::remove_all_dirs) first; the loop exits
    /// without waiting for outstanding native completions. A fatal worker
    /// error (control channel disconnect) surfaces here.
    pub fn stop_thread(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let _ = self.control_tx.send(ControlMessage::Stop);
        let result = handle.join().map_err(|_| WatcherError::ThreadPanicked)?;
        info!("directory watcher stopped");
        result
    }

    /// Whether the background thread is running.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Watch `path` on behalf of `node`. Non-blocking; the first
    /// notification for the node follows asynchronously once the worker
    /// picks up the new watch, independent of any detected change.
    ///
    /// A node may watch at most one path; adding the same node twice is a
    /// programming error (asserted in debug builds, logged and ignored in
    /// release).
    pub fn add_dir(&self, path: impl AsRef<Path>, node: NodeId, filters: FilterSet) {
        self.queue.push(WatchOp::Add {
            path: path.as_ref().to_path_buf(),
            node,
            filters,
        });
        let _ = self.control_tx.send(ControlMessage::Wake);
    }

    /// Stop watching `path` on behalf of `node`. Idempotent: removing a
    /// pairing that is already gone logs and does nothing.
    pub fn remove_dir(&self, path: impl AsRef<Path>, node: NodeId) {
        self.queue.push(WatchOp::Remove {
            path: path.as_ref().to_path_buf(),
            node,
        });
        let _ = self.control_tx.send(ControlMessage::Wake);
    }

    /// Retire every watch and block until all native handles are closed.
    ///
    /// Bounded by the configured shutdown timeout; the timeout elapsing
    /// means a watcher bug, surfaced as [`WatcherError::ShutdownTimeout`].
    pub fn remove_all_dirs(&self) -> Result<()> {
        if self.handle.is_none() {
            // No worker, no targets; just discard anything still queued.
            self.queue.clear();
            return Ok(());
        }

        self.queue.push(WatchOp::RemoveAll);
        let _ = self.control_tx.send(ControlMessage::Wake);

        self.queue
            .wait_drained(self.config.shutdown_timeout)
            .map_err(|pending| WatcherError::ShutdownTimeout { pending })
    }

    /// Skip the remainder of the current poll interval and recheck every
    /// target immediately, bypassing the modification-time pre-check.
    pub fn force_update(&self) {
        let _ = self.control_tx.send(ControlMessage::ForceUpdate);
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        debug!("directory watcher dropped while running, shutting down");
        if let Err(err) = self.remove_all_dirs() {
            warn!(%err, "shutdown: targets did not retire cleanly");
        }
        if let Err(err) = self.stop_thread() {
            warn!(%err, "shutdown: worker did not stop cleanly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_watcher_is_not_running() {
        let (watcher, _rx) = DirectoryWatcher::new(WatcherConfig::default());
        assert!(!watcher.is_running());
    }

    #[test]
    fn operations_before_start_are_queued_not_lost() {
        let dir = tempfile::TempDir::new().unwrap();
        let (watcher, _rx) = DirectoryWatcher::new(WatcherConfig::default());

        // Must not panic or block without a running worker.
        watcher.add_dir(dir.path(), NodeId(1), FilterSet::match_all());
        watcher.remove_dir(dir.path(), NodeId(1));
        watcher.force_update();
        assert!(watcher.remove_all_dirs().is_ok());
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let (mut watcher, _rx) = DirectoryWatcher::new(WatcherConfig::default());
        assert!(watcher.stop_thread().is_ok());
    }
}
