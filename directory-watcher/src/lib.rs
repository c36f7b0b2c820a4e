//! # Directory Watcher
//!
//! Directory-change monitoring for the file-browser panel. An owning UI
//! component registers `(path, node)` pairs; the watcher keeps one
//! lightweight snapshot per watched directory and posts a notification
//! whenever a directory's content actually differs from what was last
//! observed. Notifications are deduplicated per cycle and rate-limited, and
//! watched directories may be offline or not yet exist.
//!
//! ## Architecture
//!
//! ```text
//! UI thread                      watcher thread
//! ─────────                      ──────────────
//! add_dir / remove_dir ──► OpQueue ──► WatchRegistry ──► WatchTarget*
//! force_update ──────────► control channel ◄── native completions
//!                                   │
//! Receiver<Notification> ◄── NotificationSink ◄── changed dependents
//! ```
//!
//! Detection is two-tier: event-driven through the native change
//! notification while a directory is online, poll-driven (bounded existence
//! probe per cycle) to catch directories that vanish or appear, since the
//! native facility cannot watch a path that does not resolve.

pub mod config;
pub mod error;
pub mod event;
pub mod snapshot;
pub mod watcher;

mod registry;
mod sink;
mod target;
mod worker;

pub use config::{FilterSet, WatcherConfig};
pub use error::{Result, WatcherError};
pub use event::{NodeId, Notification};
pub use snapshot::{DiffHandler, DirectorySnapshot, contains_data};
pub use watcher::DirectoryWatcher;
