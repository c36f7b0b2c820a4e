//! Differential directory snapshots.
//!
//! A [`DirectorySnapshot`] is a lightweight listing of one directory's
//! immediate children, taken synchronously and never mutated afterwards.
//! Re-reads supersede the old snapshot; [`DirectorySnapshot::synchronize_to`]
//! reports the difference between two reads through a [`DiffHandler`] before
//! replacing the receiver, so a tree view can mirror the edits without ever
//! observing a half-updated listing.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::debug;
use walkdir::WalkDir;

use crate::config::FilterSet;

/// Receiver of the edits between two snapshots of the same tree position.
///
/// All methods have empty defaults; implement only what the view needs.
/// For one `synchronize_to` call the methods fire in a fixed order:
/// `on_begin_sync`, every removed directory, every added directory, every
/// removed file, every added file, `on_end_sync`. Names within each phase
/// arrive in lexicographic order.
pub trait DiffHandler {
    /// The full edit set is known; the receiver's snapshot is still the old one.
    fn on_begin_sync(&mut self, _next: &DirectorySnapshot) {}
    /// A subdirectory present in the old snapshot is gone.
    fn on_dir_removed(&mut self, _name: &str) {}
    /// A subdirectory appeared.
    fn on_dir_added(&mut self, _name: &str) {}
    /// A file present in the old snapshot is gone.
    fn on_file_removed(&mut self, _name: &str) {}
    /// A file appeared.
    fn on_file_added(&mut self, _name: &str) {}
    /// All edits were reported; the receiver is about to take `next`'s state.
    fn on_end_sync(&mut self, _next: &DirectorySnapshot) {}
}

/// An immutable-per-read listing of a single directory's immediate children.
#[derive(Debug, Clone)]
pub struct DirectorySnapshot {
    path: PathBuf,
    exists: bool,
    files: BTreeSet<String>,
    subdirs: BTreeSet<String>,
    fingerprint: Option<SystemTime>,
}

impl DirectorySnapshot {
    /// A snapshot of a path that does not resolve (or was never read).
    pub fn absent(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            exists: false,
            files: BTreeSet::new(),
            subdirs: BTreeSet::new(),
            fingerprint: None,
        }
    }

    /// Read the immediate children of `path`.
    ///
    /// A directory that cannot be opened (missing, permission denied, racing
    /// with deletion) yields `exists == false`; it is never an error.
    /// Directories are enumerated unfiltered; files pass `filters`.
    pub fn read(path: &Path, filters: &FilterSet) -> Self {
        let mut snapshot = Self::absent(path);

        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) => {
                debug!(path = %path.display(), %err, "directory not readable, treating as absent");
                return snapshot;
            }
        };
        snapshot.exists = true;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            match entry.file_type() {
                Ok(kind) if kind.is_dir() => {
                    snapshot.subdirs.insert(name);
                }
                Ok(_) => {
                    if filters.matches(&name) {
                        snapshot.files.insert(name);
                    }
                }
                Err(err) => {
                    debug!(path = %path.display(), name, %err, "entry type unavailable, skipping");
                }
            }
        }

        snapshot.fingerprint = read_fingerprint(path);
        snapshot
    }

    /// The directory this snapshot describes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the path resolved to a readable directory at snapshot time.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Immediate child file names, in canonical (lexicographic) order.
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    /// Immediate child directory names, in canonical order.
    pub fn subdirs(&self) -> &BTreeSet<String> {
        &self.subdirs
    }

    /// Cheap pre-check: has the directory's own modification time moved since
    /// this snapshot was taken?
    ///
    /// Returns `true` whenever the answer cannot be determined for a
    /// previously readable directory; the full listing decides then.
    pub fn fingerprint_changed(&self) -> bool {
        let current = read_fingerprint(&self.path);
        match (self.fingerprint, current) {
            (Some(before), Some(now)) => before != now,
            // Was absent, still can't be stat'ed: nothing changed.
            (None, None) => self.exists,
            _ => true,
        }
    }

    /// Report the edits from `self` to `next` through `handler`, then replace
    /// `self` with `next`.
    ///
    /// The callbacks fire after the full edit set is known but before the
    /// receiver's state changes; `handler` can still inspect the old listing
    /// via the receiver it captured it from, and the new one via the `next`
    /// reference passed to the begin/end hooks.
    pub fn synchronize_to(&mut self, next: DirectorySnapshot, handler: &mut dyn DiffHandler) {
        handler.on_begin_sync(&next);
        for name in self.subdirs.difference(&next.subdirs) {
            handler.on_dir_removed(name);
        }
        for name in next.subdirs.difference(&self.subdirs) {
            handler.on_dir_added(name);
        }
        for name in self.files.difference(&next.files) {
            handler.on_file_removed(name);
        }
        for name in next.files.difference(&self.files) {
            handler.on_file_added(name);
        }
        handler.on_end_sync(&next);
        *self = next;
    }
}

/// Two snapshots are equal iff their existence flags and child-name sets
/// match; fingerprint and path are not part of the comparison.
impl PartialEq for DirectorySnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.exists == other.exists && self.files == other.files && self.subdirs == other.subdirs
    }
}

impl Eq for DirectorySnapshot {}

/// Whether `path` or any descendant, to arbitrary depth, contains at least
/// one file matching `filters`.
///
/// Used to decide whether a filtered view should hide an empty directory.
/// Unreadable directories count as empty. Stops at the first match.
pub fn contains_data(path: &Path, filters: &FilterSet) -> bool {
    WalkDir::new(path)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .any(|entry| {
            entry.file_type().is_file() && filters.matches(&entry.file_name().to_string_lossy())
        })
}

fn read_fingerprint(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).ok().and_then(|meta| meta.modified().ok())
}
