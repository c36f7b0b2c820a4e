//! The background watcher thread.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use crate::error::{Result, WatcherError};
use crate::event::NodeId;
use crate::registry::{OpQueue, WatchRegistry};
use crate::sink::NotificationSink;

/// Messages multiplexed onto the worker's single wait point.
///
/// Native watch callbacks and the owning [`DirectoryWatcher`] share one
/// channel, so the worker blocks in exactly one place: `recv_timeout` with
/// the poll interval as the upper bound.
///
/// [`DirectoryWatcher`]: crate::watcher::DirectoryWatcher
#[derive(Debug)]
pub(crate) enum ControlMessage {
    /// Exit the loop. The caller must have retired all targets first.
    Stop,
    /// Skip the rest of the poll interval and recheck everything now.
    ForceUpdate,
    /// Registry operations were queued; start a cycle.
    Wake,
    /// A native completion fired for the watched directory.
    NativeEvent(PathBuf),
    /// The native watch reported an error.
    NativeError(PathBuf, String),
}

/// State owned by the watcher thread: all targets, their native handles, and
/// the delivery sink. Nothing here is shared; the UI reaches the worker only
/// through the op queue and the control channel.
pub(crate) struct Worker {
    pub(crate) control_rx: Receiver<ControlMessage>,
    pub(crate) control_tx: Sender<ControlMessage>,
    pub(crate) queue: Arc<OpQueue>,
    pub(crate) registry: WatchRegistry,
    pub(crate) sink: NotificationSink,
    pub(crate) poll_interval: Duration,
}

impl Worker {
    /// The main loop. Returns only on [`ControlMessage::Stop`] or on a fatal
    /// multiplex failure (control channel disconnect).
    pub(crate) fn run(mut self) -> Result<()> {
        info!("watcher thread started");

        loop {
            let first = match self.control_rx.recv_timeout(self.poll_interval) {
                Ok(message) => Some(message),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    self.registry.clear(&self.queue);
                    return Err(WatcherError::ControlChannelClosed);
                }
            };

            // Coalesce the burst: everything already queued belongs to this
            // cycle.
            let mut force = false;
            let mut stop = false;
            let mut native_events: BTreeSet<PathBuf> = BTreeSet::new();
            let mut native_errors: Vec<(PathBuf, String)> = Vec::new();
            for message in first.into_iter().chain(self.control_rx.try_iter()) {
                match message {
                    ControlMessage::Stop => {
                        stop = true;
                        break;
                    }
                    ControlMessage::ForceUpdate => force = true,
                    ControlMessage::Wake => {}
                    ControlMessage::NativeEvent(path) => {
                        native_events.insert(path);
                    }
                    ControlMessage::NativeError(path, err) => native_errors.push((path, err)),
                }
            }
            if stop {
                break;
            }

            self.cycle(force, native_events, native_errors);
        }

        // The loop exits without waiting for outstanding completions; their
        // callbacks hold only a channel sender. Remaining targets (there
        // should be none in correct usage) are dropped here, closing their
        // native handles.
        self.registry.clear(&self.queue);
        info!("watcher thread stopped");
        Ok(())
    }

    fn cycle(
        &mut self,
        force: bool,
        native_events: BTreeSet<PathBuf>,
        native_errors: Vec<(PathBuf, String)>,
    ) {
        // 1. Apply queued registry mutations; new dependents get their first
        //    population instantly, without waiting for the poll sweep.
        let forced = self
            .registry
            .apply_pending(&self.queue, &self.control_tx, &mut self.sink);
        let mut delivered = 0;
        let mut posted: HashSet<NodeId> = HashSet::new();
        for node in forced {
            if posted.insert(node) && self.sink.post(node) {
                delivered += 1;
            }
        }

        for (path, err) in native_errors {
            self.registry.handle_native_error(&path, &err);
        }

        // 2. Sweep all targets: online-status flips and (forced) re-reads.
        let mut notify: BTreeSet<NodeId> = BTreeSet::new();
        self.registry.sweep(&self.control_tx, force, &mut notify);

        // 3. Re-arm targets whose native completion woke us.
        for path in native_events {
            self.registry
                .handle_native_event(&path, &self.control_tx, &mut notify);
        }

        // 4. Deliver, oldest deferrals first; at most one notification per
        //    node per cycle.
        for node in self.sink.flush_deferred(&posted) {
            posted.insert(node);
            delivered += 1;
        }
        for node in notify {
            if posted.insert(node) && self.sink.post(node) {
                delivered += 1;
            }
        }

        if delivered > 0 {
            debug!(delivered, "cycle delivered notifications, settling batch");
            self.sink.settle();
        }
    }
}
