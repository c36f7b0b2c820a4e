//! Configuration types for directory watching.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

/// Tuning knobs for the watcher.
///
/// The defaults mirror the behavior the file-browser panel shipped with:
/// one-second polling, a delivery timeout of a few seconds so a hung owner
/// cannot stall the watcher, and a bounded retry set for undeliverable
/// notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Upper bound on the multiplexed wait; targets are re-polled at least
    /// this often even when no native event arrives.
    pub poll_interval: Duration,

    /// How long a single notification delivery may block before the node is
    /// deferred to the next cycle.
    pub delivery_timeout: Duration,

    /// Cap on the deferred retry set. Nodes past this cap are dropped and
    /// never retried; the watcher stays live even if the owner is stuck.
    pub max_deferred: usize,

    /// Capacity of the notification channel handed to the owner.
    pub channel_capacity: usize,

    /// How long `remove_all_dirs` waits for every target to retire.
    pub shutdown_timeout: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            delivery_timeout: Duration::from_secs(5),
            max_deferred: 2000,
            channel_capacity: 256,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl WatcherConfig {
    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the delivery timeout.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Set the deferred retry cap.
    pub fn with_max_deferred(mut self, max: usize) -> Self {
        self.max_deferred = max;
        self
    }
}

/// File name filters for a watched directory.
///
/// Patterns use OS-glob syntax (`*.rs`, `Makefile*`). An empty set and the
/// catch-all `*.*` both match every file; directories are always enumerated
/// unfiltered. Matching is case-insensitive to line up with the path
/// normalization on case-insensitive filesystems.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    patterns: Vec<String>,
}

impl FilterSet {
    /// Build a filter set from glob patterns; empty strings are dropped.
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns
                .into_iter()
                .map(Into::into)
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// A filter set matching every file.
    pub fn match_all() -> Self {
        Self::default()
    }

    /// The configured patterns.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// Whether `name` passes at least one pattern.
    pub fn matches(&self, name: &str) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let name = name.to_lowercase();
        self.patterns.iter().any(|p| {
            // "*.*" is the OS catch-all; it matches extensionless names too.
            p == "*.*" || WildMatch::new(&p.to_lowercase()).matches(&name)
        })
    }
}
