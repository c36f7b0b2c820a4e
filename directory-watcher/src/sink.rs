//! Rate-limited notification delivery to the owner's channel.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::{debug, warn};

use crate::event::{NodeId, Notification};

/// Delivers change notifications to the owner, never blocking the watcher
/// for longer than the configured timeout per attempt.
///
/// A delivery that times out defers the node for retry on the following
/// cycle. The deferred set is deduplicated and capped; nodes past the cap
/// are dropped for good, so a permanently stuck owner cannot grow the
/// watcher's memory without bound.
pub(crate) struct NotificationSink {
    tx: Sender<Notification>,
    delivery_timeout: Duration,
    max_deferred: usize,
    deferred: VecDeque<NodeId>,
    deferred_members: HashSet<NodeId>,
    dropped: u64,
    disconnected_logged: bool,
}

impl NotificationSink {
    pub(crate) fn new(
        tx: Sender<Notification>,
        delivery_timeout: Duration,
        max_deferred: usize,
    ) -> Self {
        Self {
            tx,
            delivery_timeout,
            max_deferred,
            deferred: VecDeque::new(),
            deferred_members: HashSet::new(),
            dropped: 0,
            disconnected_logged: false,
        }
    }

    /// Deliver one change notification. Returns whether delivery succeeded;
    /// on timeout the node is deferred for the next cycle.
    pub(crate) fn post(&mut self, node: NodeId) -> bool {
        match self
            .tx
            .send_timeout(Notification::changed(node), self.delivery_timeout)
        {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                debug!(%node, "owner unresponsive, deferring notification");
                self.defer(node);
                false
            }
            Err(SendTimeoutError::Disconnected(_)) => {
                if !self.disconnected_logged {
                    warn!("notification receiver dropped, discarding all further notifications");
                    self.disconnected_logged = true;
                }
                false
            }
        }
    }

    /// Retry every node deferred in earlier cycles, returning those that
    /// went through; failures are re-deferred. Nodes in `already_posted`
    /// had a delivery attempt this cycle already (a failed one, or this
    /// would run before any could be deferred), so they stay deferred
    /// rather than being retried against a sink that just timed out.
    pub(crate) fn flush_deferred(&mut self, already_posted: &HashSet<NodeId>) -> Vec<NodeId> {
        if self.deferred.is_empty() {
            return Vec::new();
        }

        let pending: Vec<NodeId> = self.deferred.drain(..).collect();
        self.deferred_members.clear();

        let mut delivered = Vec::new();
        for node in pending {
            if already_posted.contains(&node) {
                self.defer(node);
                continue;
            }
            if self.post(node) {
                delivered.push(node);
            }
        }
        delivered
    }

    /// Forget any deferred delivery for `node`. Called when the node's watch
    /// is retired, so nothing is ever delivered for it afterwards.
    pub(crate) fn cancel(&mut self, node: NodeId) {
        if self.deferred_members.remove(&node) {
            self.deferred.retain(|n| *n != node);
        }
    }

    /// Forget every deferred delivery.
    pub(crate) fn cancel_all(&mut self) {
        self.deferred.clear();
        self.deferred_members.clear();
    }

    /// Post the end-of-batch marker. Called once after a cycle that
    /// delivered at least one notification.
    pub(crate) fn settle(&mut self) {
        let _ = self
            .tx
            .send_timeout(Notification::settled(), self.delivery_timeout);
    }

    #[cfg(test)]
    pub(crate) fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    #[cfg(test)]
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    fn defer(&mut self, node: NodeId) {
        if self.deferred_members.contains(&node) {
            return;
        }
        if self.deferred.len() >= self.max_deferred {
            self.dropped += 1;
            debug!(%node, dropped = self.dropped, "deferred set full, dropping notification");
            return;
        }
        self.deferred_members.insert(node);
        self.deferred.push_back(node);
    }
}
