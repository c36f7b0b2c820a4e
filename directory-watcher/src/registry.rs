//! Watch target bookkeeping and the UI↔worker operation queue.
//!
//! The worker thread exclusively owns every [`WatchTarget`] and all of their
//! state transitions. The UI thread never touches targets; it enqueues
//! [`WatchOp`]s on the shared [`OpQueue`] under a short lock, and the worker
//! applies the queue atomically at the start of each cycle. No native call
//! is ever made while the queue lock is held.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::config::FilterSet;
use crate::event::NodeId;
use crate::sink::NotificationSink;
use crate::target::{WatchState, WatchTarget};
use crate::worker::ControlMessage;

/// An operation captured from the UI thread.
#[derive(Debug)]
pub(crate) enum WatchOp {
    /// Attach `node` to `path`, creating a target if none exists.
    Add {
        path: PathBuf,
        node: NodeId,
        filters: FilterSet,
    },
    /// Detach `node` from `path`; retires the target when it was the last
    /// dependent.
    Remove { path: PathBuf, node: NodeId },
    /// Retire every target.
    RemoveAll,
}

struct OpQueueState {
    ops: Vec<WatchOp>,
    /// Live target count as last reported by the worker; lets
    /// [`OpQueue::wait_drained`] block until retirement completed.
    active_targets: usize,
}

/// Shared mailbox between the UI thread and the worker.
pub(crate) struct OpQueue {
    state: Mutex<OpQueueState>,
    settled: Condvar,
}

impl OpQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(OpQueueState {
                ops: Vec::new(),
                active_targets: 0,
            }),
            settled: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OpQueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn push(&self, op: WatchOp) {
        self.lock().ops.push(op);
    }

    /// Take every queued operation, preserving submission order.
    pub(crate) fn drain(&self) -> Vec<WatchOp> {
        std::mem::take(&mut self.lock().ops)
    }

    /// Discard queued operations; used when the worker is not running.
    pub(crate) fn clear(&self) {
        let mut state = self.lock();
        state.ops.clear();
        self.settled.notify_all();
    }

    /// Worker-side: publish the live target count after applying a batch.
    pub(crate) fn report_active(&self, count: usize) {
        let mut state = self.lock();
        state.active_targets = count;
        self.settled.notify_all();
    }

    /// Block until the queue is empty and no targets remain, or until
    /// `timeout` elapses. Returns the pending count on timeout.
    pub(crate) fn wait_drained(&self, timeout: Duration) -> std::result::Result<(), usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.ops.is_empty() && state.active_targets == 0 {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(state.active_targets.max(state.ops.len()));
            }
            let (guard, _) = match self.settled.wait_timeout(state, deadline - now) {
                Ok(result) => result,
                Err(poisoned) => poisoned.into_inner(),
            };
            state = guard;
        }
    }
}

/// Normalize a path so that equivalent spellings collide on the registry key:
/// trailing separators are stripped, and case is folded on hosts whose
/// filesystems ignore it.
pub(crate) fn normalize_path(path: &Path) -> PathBuf {
    let mut text = path.to_string_lossy().into_owned();
    while text.len() > 1
        && text.ends_with(['/', '\\'])
        // A drive root keeps its separator.
        && !text.ends_with(":/")
        && !text.ends_with(":\\")
    {
        text.pop();
    }
    #[cfg(windows)]
    {
        text = text.to_lowercase();
    }
    PathBuf::from(text)
}

/// Worker-owned mapping from normalized path to watch target.
pub(crate) struct WatchRegistry {
    by_path: HashMap<PathBuf, WatchTarget>,
    /// Reverse index enforcing that a node watches at most one path.
    node_paths: HashMap<NodeId, PathBuf>,
    /// Nodes owed an immediate first-population notification this cycle.
    forced: Vec<NodeId>,
}

impl WatchRegistry {
    pub(crate) fn new() -> Self {
        Self {
            by_path: HashMap::new(),
            node_paths: HashMap::new(),
            forced: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_path.len()
    }

    #[cfg(test)]
    pub(crate) fn target(&self, path: &Path) -> Option<&WatchTarget> {
        self.by_path.get(&normalize_path(path))
    }

    /// Apply one queued batch. New targets have their native watch opened
    /// here, in worker context; retired targets are destroyed here as well.
    /// Returns the nodes owed an immediate notification.
    pub(crate) fn apply_pending(
        &mut self,
        queue: &OpQueue,
        control_tx: &Sender<ControlMessage>,
        sink: &mut NotificationSink,
    ) -> Vec<NodeId> {
        for op in queue.drain() {
            match op {
                WatchOp::Add {
                    path,
                    node,
                    filters,
                } => self.add(path, node, filters, control_tx),
                WatchOp::Remove { path, node } => self.remove(&path, node, sink),
                WatchOp::RemoveAll => self.remove_all(sink),
            }
        }
        queue.report_active(self.by_path.len());
        std::mem::take(&mut self.forced)
    }

    fn add(
        &mut self,
        path: PathBuf,
        node: NodeId,
        filters: FilterSet,
        control_tx: &Sender<ControlMessage>,
    ) {
        let path = normalize_path(&path);

        if let Some(existing) = self.node_paths.get(&node) {
            // A node watches at most one path; watching two is a programming
            // error on the caller's side.
            debug_assert!(
                false,
                "{node} already watches {}, cannot also watch {}",
                existing.display(),
                path.display()
            );
            warn!(
                %node,
                existing = %existing.display(),
                requested = %path.display(),
                "node already watches a path, ignoring duplicate add"
            );
            return;
        }

        match self.by_path.get_mut(&path) {
            Some(target) => {
                if *target.filters() != filters {
                    warn!(
                        path = %path.display(),
                        "path already watched with different filters, keeping the original set"
                    );
                }
                target.add_dependent(node);
            }
            None => {
                let mut target = WatchTarget::new(path.clone(), filters);
                target.add_dependent(node);
                target.start_watch(control_tx);
                self.by_path.insert(path.clone(), target);
            }
        }

        self.node_paths.insert(node, path);
        self.forced.push(node);
    }

    fn remove(&mut self, path: &Path, node: NodeId, sink: &mut NotificationSink) {
        let path = normalize_path(path);

        match self.node_paths.get(&node) {
            Some(current) if *current == path => {}
            Some(current) => {
                warn!(
                    %node,
                    current = %current.display(),
                    requested = %path.display(),
                    "remove names a path the node does not watch, ignoring"
                );
                return;
            }
            None => {
                // Idempotent: the pairing is already gone.
                debug!(%node, path = %path.display(), "remove for unknown node, ignoring");
                return;
            }
        }

        self.node_paths.remove(&node);
        sink.cancel(node);

        if let Some(target) = self.by_path.get_mut(&path) {
            if target.remove_dependent(node) {
                target.retire();
                self.by_path.remove(&path);
                debug!(path = %path.display(), "last dependent left, target retired");
            }
        }
    }

    fn remove_all(&mut self, sink: &mut NotificationSink) {
        for (_, mut target) in self.by_path.drain() {
            target.retire();
        }
        self.node_paths.clear();
        self.forced.clear();
        sink.cancel_all();
        debug!("all targets retired");
    }

    /// Sweep every target: flip online status where existence changed,
    /// confirm starting targets, and re-read those that may have changed.
    /// Dependents of every target that changed land in `notify`.
    pub(crate) fn sweep(
        &mut self,
        control_tx: &Sender<ControlMessage>,
        force: bool,
        notify: &mut BTreeSet<NodeId>,
    ) {
        for target in self.by_path.values_mut() {
            if target.check_online_status_changed(control_tx) {
                notify.extend(target.dependents().iter().copied());
            } else if target.take_immediate() {
                notify.extend(target.dependents().iter().copied());
                // Keep the fingerprint current alongside the forced report.
                target.refresh(true);
            } else if target.is_watching() && target.refresh(force) {
                notify.extend(target.dependents().iter().copied());
            }
        }
    }

    /// Handle a native completion for `path`: re-arm the watch and collect
    /// dependents if the content actually differs. Completions for retired
    /// or unknown paths are discarded.
    pub(crate) fn handle_native_event(
        &mut self,
        path: &Path,
        control_tx: &Sender<ControlMessage>,
        notify: &mut BTreeSet<NodeId>,
    ) {
        let Some(target) = self.by_path.get_mut(path) else {
            debug!(path = %path.display(), "native completion for retired watch, dropping");
            return;
        };
        if target.state() == WatchState::Retiring {
            return;
        }

        target.invoke(control_tx);
        // The event already says something happened; skip the mtime pre-check.
        if target.take_immediate() || target.refresh(true) {
            notify.extend(target.dependents().iter().copied());
        }
    }

    /// Degrade the target for `path` after a native error report.
    pub(crate) fn handle_native_error(&mut self, path: &Path, err: &str) {
        if let Some(target) = self.by_path.get_mut(path) {
            warn!(path = %path.display(), err, "native watch reported an error, target offline");
            target.go_offline();
        }
    }

    /// Drop every remaining target; used when the worker loop exits.
    pub(crate) fn clear(&mut self, queue: &OpQueue) {
        if !self.by_path.is_empty() {
            debug!(count = self.by_path.len(), "dropping targets on worker exit");
        }
        self.by_path.clear();
        self.node_paths.clear();
        self.forced.clear();
        queue.report_active(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Notification;
    use crossbeam_channel::{Receiver, bounded, unbounded};
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        registry: WatchRegistry,
        queue: OpQueue,
        control_tx: Sender<ControlMessage>,
        _control_rx: Receiver<ControlMessage>,
        sink: NotificationSink,
        _notify_rx: Receiver<Notification>,
    }

    fn fixture() -> Fixture {
        let (control_tx, _control_rx) = unbounded();
        let (notify_tx, _notify_rx) = bounded(64);
        Fixture {
            registry: WatchRegistry::new(),
            queue: OpQueue::new(),
            control_tx,
            _control_rx,
            sink: NotificationSink::new(notify_tx, Duration::from_millis(10), 2000),
            _notify_rx,
        }
    }

    fn apply(f: &mut Fixture) -> Vec<NodeId> {
        f.registry.apply_pending(&f.queue, &f.control_tx, &mut f.sink)
    }

    #[test]
    fn two_dependents_share_one_target() {
        let dir = TempDir::new().unwrap();
        let mut f = fixture();

        f.queue.push(WatchOp::Add {
            path: dir.path().to_path_buf(),
            node: NodeId(1),
            filters: FilterSet::match_all(),
        });
        f.queue.push(WatchOp::Add {
            path: dir.path().to_path_buf(),
            node: NodeId(2),
            filters: FilterSet::match_all(),
        });
        let forced = apply(&mut f);

        assert_eq!(f.registry.len(), 1);
        assert_eq!(forced, vec![NodeId(1), NodeId(2)]);
        let target = f.registry.target(dir.path()).unwrap();
        assert_eq!(target.dependents().len(), 2);
    }

    #[test]
    fn equivalent_path_spellings_collide() {
        let dir = TempDir::new().unwrap();
        let mut f = fixture();

        let with_slash = PathBuf::from(format!("{}/", dir.path().display()));
        f.queue.push(WatchOp::Add {
            path: dir.path().to_path_buf(),
            node: NodeId(1),
            filters: FilterSet::match_all(),
        });
        f.queue.push(WatchOp::Add {
            path: with_slash,
            node: NodeId(2),
            filters: FilterSet::match_all(),
        });
        apply(&mut f);

        assert_eq!(f.registry.len(), 1);
    }

    #[test]
    fn partial_unwatch_keeps_the_target() {
        let dir = TempDir::new().unwrap();
        let mut f = fixture();

        for node in [NodeId(1), NodeId(2)] {
            f.queue.push(WatchOp::Add {
                path: dir.path().to_path_buf(),
                node,
                filters: FilterSet::match_all(),
            });
        }
        apply(&mut f);

        f.queue.push(WatchOp::Remove {
            path: dir.path().to_path_buf(),
            node: NodeId(1),
        });
        apply(&mut f);

        assert_eq!(f.registry.len(), 1);
        let target = f.registry.target(dir.path()).unwrap();
        assert!(target.is_watching());
        assert_eq!(
            target.dependents().iter().copied().collect::<Vec<_>>(),
            vec![NodeId(2)]
        );
    }

    #[test]
    fn last_unwatch_retires_and_destroys_the_target() {
        let dir = TempDir::new().unwrap();
        let mut f = fixture();

        f.queue.push(WatchOp::Add {
            path: dir.path().to_path_buf(),
            node: NodeId(1),
            filters: FilterSet::match_all(),
        });
        apply(&mut f);
        assert_eq!(f.registry.len(), 1);

        f.queue.push(WatchOp::Remove {
            path: dir.path().to_path_buf(),
            node: NodeId(1),
        });
        apply(&mut f);
        assert_eq!(f.registry.len(), 0);

        // A late native completion for the destroyed path is discarded.
        let mut notify = BTreeSet::new();
        let normalized = normalize_path(dir.path());
        f.registry
            .handle_native_event(&normalized, &f.control_tx, &mut notify);
        assert!(notify.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut f = fixture();

        f.queue.push(WatchOp::Remove {
            path: dir.path().to_path_buf(),
            node: NodeId(9),
        });
        apply(&mut f);
        assert_eq!(f.registry.len(), 0);
    }

    #[test]
    fn remove_all_empties_the_registry() {
        let dir_a = TempDir::new().unwrap();
        let dir_b = TempDir::new().unwrap();
        let mut f = fixture();

        for (dir, node) in [(&dir_a, NodeId(1)), (&dir_b, NodeId(2))] {
            f.queue.push(WatchOp::Add {
                path: dir.path().to_path_buf(),
                node,
                filters: FilterSet::match_all(),
            });
        }
        apply(&mut f);
        assert_eq!(f.registry.len(), 2);

        f.queue.push(WatchOp::RemoveAll);
        apply(&mut f);
        assert_eq!(f.registry.len(), 0);
        assert!(f.queue.wait_drained(Duration::from_millis(10)).is_ok());
    }

    #[test]
    fn offline_flip_notifies_all_dependents_once() {
        let parent = TempDir::new().unwrap();
        let late = parent.path().join("late");
        let mut f = fixture();

        for node in [NodeId(1), NodeId(2)] {
            f.queue.push(WatchOp::Add {
                path: late.clone(),
                node,
                filters: FilterSet::match_all(),
            });
        }
        apply(&mut f);

        // Nothing to report while the path stays missing.
        let mut notify = BTreeSet::new();
        f.registry.sweep(&f.control_tx, false, &mut notify);
        assert!(notify.is_empty());

        std::fs::create_dir(&late).unwrap();
        f.registry.sweep(&f.control_tx, false, &mut notify);
        assert_eq!(
            notify.iter().copied().collect::<Vec<_>>(),
            vec![NodeId(1), NodeId(2)]
        );

        // Exactly one burst: the following sweep is quiet.
        let mut again = BTreeSet::new();
        f.registry.sweep(&f.control_tx, false, &mut again);
        assert!(again.is_empty());
    }

    #[test]
    fn wait_drained_times_out_while_targets_remain() {
        let queue = OpQueue::new();
        queue.report_active(3);
        assert_eq!(queue.wait_drained(Duration::from_millis(20)), Err(3));
        queue.report_active(0);
        assert!(queue.wait_drained(Duration::from_millis(20)).is_ok());
    }

    #[test]
    fn normalize_strips_trailing_separators() {
        assert_eq!(
            normalize_path(Path::new("/tmp/watched///")),
            PathBuf::from("/tmp/watched")
        );
        assert_eq!(normalize_path(Path::new("/")), PathBuf::from("/"));
    }
}
