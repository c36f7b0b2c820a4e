//! Error types for the directory watcher.

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatcherError>;

/// Errors that can occur in the directory watcher.
///
/// Per-target failures (a native watch that cannot be opened, a path that
/// stops resolving) are never surfaced here; they degrade the affected
/// target to offline and are recovered by polling.
#[derive(Error, Debug)]
pub enum WatcherError {
    /// The worker thread could not be spawned.
    #[error("failed to spawn watcher thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The worker thread panicked.
    #[error("watcher thread panicked")]
    ThreadPanicked,

    /// The control channel disconnected while the worker was running.
    ///
    /// The multiplexed wait cannot function without it; this is a contract
    /// violation, not a recoverable runtime state.
    #[error("control channel closed while watcher thread was running")]
    ControlChannelClosed,

    /// `remove_all_dirs` timed out before every target had retired.
    ///
    /// Not expected in correct usage; treated as a bug in the caller or the
    /// watcher, never as a condition to retry.
    #[error("shutdown timed out with {pending} watch target(s) still active")]
    ShutdownTimeout {
        /// Number of targets that had not retired when the timeout elapsed.
        pending: usize,
    },
}
