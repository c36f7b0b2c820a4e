//! Per-directory watch state machine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crossbeam_channel::Sender;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::config::FilterSet;
use crate::event::NodeId;
use crate::snapshot::DirectorySnapshot;
use crate::worker::ControlMessage;

/// Lifecycle state of a watched directory.
///
/// `Starting → Online ⇄ Offline`, with terminal `Retiring`. The native
/// handle is held iff the state is `Starting` or `Online`. Native change
/// notification cannot observe a path that does not resolve, so offline
/// targets are recovered by the worker's existence poll, not by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WatchState {
    /// Native watch opened, first completion not yet observed.
    Starting,
    /// Native watch active, events flowing.
    Online,
    /// Path does not resolve (or the watch failed); poll-driven.
    Offline,
    /// Marked for destruction; no new dependents may attach.
    Retiring,
}

/// One watched directory: native handle, baseline snapshot, and the set of
/// UI nodes depending on it.
pub(crate) struct WatchTarget {
    path: PathBuf,
    filters: FilterSet,
    state: WatchState,
    native: Option<RecommendedWatcher>,
    snapshot: DirectorySnapshot,
    dependents: HashSet<NodeId>,
    /// Forces one change report after the watch is (re)established, so a
    /// newly expanded node is populated even with no detected diff.
    immediate: bool,
}

impl WatchTarget {
    /// Create a target in `Starting` with no native handle yet; the worker
    /// calls [`start_watch`](Self::start_watch) on its next cycle.
    pub(crate) fn new(path: PathBuf, filters: FilterSet) -> Self {
        let snapshot = DirectorySnapshot::absent(&path);
        Self {
            path,
            filters,
            state: WatchState::Starting,
            native: None,
            snapshot,
            dependents: HashSet::new(),
            immediate: false,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn state(&self) -> WatchState {
        self.state
    }

    pub(crate) fn filters(&self) -> &FilterSet {
        &self.filters
    }

    pub(crate) fn dependents(&self) -> &HashSet<NodeId> {
        &self.dependents
    }

    pub(crate) fn add_dependent(&mut self, node: NodeId) {
        self.dependents.insert(node);
    }

    /// Remove a dependent; returns true when none remain and the target
    /// should retire.
    pub(crate) fn remove_dependent(&mut self, node: NodeId) -> bool {
        self.dependents.remove(&node);
        self.dependents.is_empty()
    }

    /// Whether the state currently requires a native handle.
    pub(crate) fn is_watching(&self) -> bool {
        matches!(self.state, WatchState::Starting | WatchState::Online)
    }

    /// Open (or reopen) the native change watch on this path.
    ///
    /// A path that does not resolve sends the target `Offline` with the
    /// handle released. On success the target enters `Starting` with a fresh
    /// baseline snapshot and `immediate` set, so dependents get their first
    /// population without waiting for a detected change.
    pub(crate) fn start_watch(&mut self, control_tx: &Sender<ControlMessage>) {
        self.native = None;

        if !self.path.is_dir() {
            debug!(path = %self.path.display(), "path does not resolve, target offline");
            self.state = WatchState::Offline;
            self.snapshot = DirectorySnapshot::absent(&self.path);
            return;
        }

        match open_native(&self.path, control_tx) {
            Ok(watcher) => {
                self.native = Some(watcher);
                self.state = WatchState::Starting;
                self.snapshot = DirectorySnapshot::read(&self.path, &self.filters);
                self.immediate = true;
                debug!(path = %self.path.display(), "native watch opened");
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "native watch failed, target offline");
                self.state = WatchState::Offline;
                self.snapshot = DirectorySnapshot::absent(&self.path);
            }
        }
    }

    /// Existence probe for targets in `Starting`/`Online`/`Offline`.
    ///
    /// If existence flipped relative to the current state, restarts the
    /// watch and returns true: a state transition occurred and dependents
    /// must be notified. This is the only way a vanished drive or a
    /// not-yet-created directory is detected.
    pub(crate) fn check_online_status_changed(
        &mut self,
        control_tx: &Sender<ControlMessage>,
    ) -> bool {
        let exists = self.path.is_dir();
        let flipped = match self.state {
            WatchState::Starting | WatchState::Online => !exists,
            WatchState::Offline => exists,
            WatchState::Retiring => false,
        };
        if !flipped {
            return false;
        }

        debug!(
            path = %self.path.display(),
            exists,
            "online status flipped, restarting watch"
        );
        self.start_watch(control_tx);
        // The transition itself is the change to report; the immediate flag
        // must not produce a second burst next cycle.
        self.immediate = false;
        true
    }

    /// Confirm a native completion: `Starting` targets go `Online`; a target
    /// whose handle was lost is restarted.
    ///
    /// Valid only while watching; other states ignore the completion.
    pub(crate) fn invoke(&mut self, control_tx: &Sender<ControlMessage>) {
        match self.state {
            WatchState::Starting => {
                if self.native.is_some() {
                    self.state = WatchState::Online;
                } else {
                    self.start_watch(control_tx);
                }
            }
            WatchState::Online => {
                if self.native.is_none() {
                    self.start_watch(control_tx);
                }
            }
            WatchState::Offline | WatchState::Retiring => {}
        }
    }

    /// Degrade to `Offline` after a native error report. The existence poll
    /// recovers the target if the path still (or again) resolves.
    pub(crate) fn go_offline(&mut self) {
        self.native = None;
        self.state = WatchState::Offline;
    }

    /// Mark `Retiring` and release the native handle. The owning registry
    /// drops the target afterwards; late native completions for this path
    /// no longer find it and are discarded at lookup.
    pub(crate) fn retire(&mut self) {
        self.state = WatchState::Retiring;
        self.native = None;
    }

    /// Consume the pending first-population report, if set.
    pub(crate) fn take_immediate(&mut self) -> bool {
        std::mem::take(&mut self.immediate)
    }

    /// Re-read the directory and report whether its content actually differs
    /// from the baseline snapshot.
    ///
    /// Unless `force` is set, a directory whose modification time has not
    /// moved is skipped without a full listing. The baseline is replaced on
    /// every full read so the fingerprint stays current.
    pub(crate) fn refresh(&mut self, force: bool) -> bool {
        if !force && !self.snapshot.fingerprint_changed() {
            return false;
        }
        let next = DirectorySnapshot::read(&self.path, &self.filters);
        let changed = next != self.snapshot;
        self.snapshot = next;
        changed
    }
}

/// Open a non-recursive native watch whose callback forwards completions to
/// the worker's control channel.
///
/// The callback captures only the sender and the watched path, never target
/// memory, so a completion racing with retirement is dropped at registry
/// lookup instead of touching freed state.
fn open_native(
    path: &Path,
    control_tx: &Sender<ControlMessage>,
) -> notify::Result<RecommendedWatcher> {
    let tx = control_tx.clone();
    let origin = path.to_path_buf();

    let mut watcher =
        notify::recommended_watcher(move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                // Access events carry no structural change.
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let _ = tx.send(ControlMessage::NativeEvent(origin.clone()));
            }
            Err(err) => {
                let _ = tx.send(ControlMessage::NativeError(origin.clone(), err.to_string()));
            }
        })?;
    watcher.watch(path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::fs::{self, File};
    use tempfile::TempDir;

    fn control() -> (
        Sender<ControlMessage>,
        crossbeam_channel::Receiver<ControlMessage>,
    ) {
        unbounded()
    }

    #[test]
    fn missing_path_goes_offline() {
        let dir = TempDir::new().unwrap();
        let gone = dir.path().join("missing");
        let mut target = WatchTarget::new(gone, FilterSet::match_all());

        let (tx, _rx) = control();
        target.start_watch(&tx);
        assert_eq!(target.state(), WatchState::Offline);
        assert!(!target.is_watching());
    }

    #[test]
    fn existing_path_starts_watching_with_immediate_set() {
        let dir = TempDir::new().unwrap();
        let mut target = WatchTarget::new(dir.path().to_path_buf(), FilterSet::match_all());

        let (tx, _rx) = control();
        target.start_watch(&tx);
        assert_eq!(target.state(), WatchState::Starting);
        assert!(target.take_immediate());
        assert!(!target.take_immediate());
    }

    #[test]
    fn offline_target_flips_online_when_path_appears() {
        let dir = TempDir::new().unwrap();
        let late = dir.path().join("late");
        let (tx, _rx) = control();

        let mut target = WatchTarget::new(late.clone(), FilterSet::match_all());
        target.start_watch(&tx);
        assert_eq!(target.state(), WatchState::Offline);
        assert!(!target.check_online_status_changed(&tx));

        fs::create_dir(&late).unwrap();
        assert!(target.check_online_status_changed(&tx));
        assert!(target.is_watching());
        // The flip already accounts for the notification burst.
        assert!(!target.take_immediate());
    }

    #[test]
    fn online_target_flips_offline_when_path_vanishes() {
        let parent = TempDir::new().unwrap();
        let child = parent.path().join("child");
        fs::create_dir(&child).unwrap();
        let (tx, _rx) = control();

        let mut target = WatchTarget::new(child.clone(), FilterSet::match_all());
        target.start_watch(&tx);
        target.invoke(&tx);
        assert_eq!(target.state(), WatchState::Online);

        fs::remove_dir(&child).unwrap();
        assert!(target.check_online_status_changed(&tx));
        assert_eq!(target.state(), WatchState::Offline);
    }

    #[test]
    fn refresh_detects_an_added_file() {
        let dir = TempDir::new().unwrap();
        File::create(dir.path().join("a.txt")).unwrap();
        let (tx, _rx) = control();

        let mut target = WatchTarget::new(dir.path().to_path_buf(), FilterSet::match_all());
        target.start_watch(&tx);
        target.take_immediate();
        assert!(!target.refresh(true));

        File::create(dir.path().join("b.txt")).unwrap();
        assert!(target.refresh(true));
        assert!(!target.refresh(true));
    }

    #[test]
    fn retire_releases_the_native_handle() {
        let dir = TempDir::new().unwrap();
        let mut target = WatchTarget::new(dir.path().to_path_buf(), FilterSet::match_all());
        let (tx, _rx) = control();
        target.start_watch(&tx);

        target.retire();
        assert_eq!(target.state(), WatchState::Retiring);
        assert!(!target.is_watching());
        assert!(target.native.is_none());
    }

    #[test]
    fn dependents_track_membership() {
        let dir = TempDir::new().unwrap();
        let mut target = WatchTarget::new(dir.path().to_path_buf(), FilterSet::match_all());
        target.add_dependent(NodeId(1));
        target.add_dependent(NodeId(2));

        assert!(!target.remove_dependent(NodeId(1)));
        assert!(target.remove_dependent(NodeId(2)));
    }
}
