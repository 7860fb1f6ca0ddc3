//! # Work Queue
//!
//! Single queue shared by watch events, the scheduler and the admin API.
//!
//! A key is queued at most once: pushing a key that is already pending
//! merges the trigger into the pending entry instead of queueing a
//! duplicate. Popping removes the pending entry, so the same key can be
//! queued again while it executes (one queued plus one in flight).
//! Cancelled keys stay in the channel but are skipped on pop.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::controller::locks::lock;

/// Why a task was queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerSource {
    /// Source secret created or changed
    SourceChange,
    /// Rule or store configuration changed
    ConfigChange,
    /// Periodic refresh tick
    Refresh,
    /// Backoff retry
    Retry,
    /// Operator request
    Manual,
}

impl TriggerSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::SourceChange => "source-change",
            TriggerSource::ConfigChange => "config-change",
            TriggerSource::Refresh => "refresh",
            TriggerSource::Retry => "retry",
            TriggerSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trigger {
    pub source: TriggerSource,
    /// Read remote values and re-push when they differ
    pub check_drift: bool,
}

impl Trigger {
    #[must_use]
    pub fn new(source: TriggerSource) -> Self {
        Self {
            source,
            check_drift: false,
        }
    }

    #[must_use]
    pub fn with_drift_check(mut self, check_drift: bool) -> Self {
        self.check_drift = check_drift;
        self
    }

    fn merge(&mut self, other: Trigger) {
        self.check_drift |= other.check_drift;
        // SourceChange takes precedence over timers
        if other.source == TriggerSource::SourceChange {
            self.source = other.source;
        }
    }
}

pub struct WorkQueue<K> {
    tx: mpsc::UnboundedSender<K>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<K>>,
    pending: Mutex<HashMap<K, Trigger>>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue `key`; returns false when it was already pending and got merged
    pub fn push(&self, key: K, trigger: Trigger) -> bool {
        let mut pending = lock(&self.pending);
        if let Some(existing) = pending.get_mut(&key) {
            existing.merge(trigger);
            return false;
        }
        pending.insert(key.clone(), trigger);
        // The receiver lives as long as the queue, so sending cannot fail
        let _ = self.tx.send(key);
        true
    }

    /// Wait for the next live key
    pub async fn pop(&self) -> Option<(K, Trigger)> {
        let mut rx = self.rx.lock().await;
        loop {
            let key = rx.recv().await?;
            if let Some(trigger) = lock(&self.pending).remove(&key) {
                return Some((key, trigger));
            }
        }
    }

    /// Drop every pending key matching `predicate`
    pub fn cancel(&self, predicate: impl Fn(&K) -> bool) -> usize {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|key, _| !predicate(key));
        before - pending.len()
    }

    #[must_use]
    pub fn is_pending(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }

    /// Number of pending keys
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("pending", &lock(&self.pending).len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicates_are_coalesced() {
        let queue = WorkQueue::new();
        assert!(queue.push("a", Trigger::new(TriggerSource::Refresh)));
        assert!(!queue.push("a", Trigger::new(TriggerSource::Refresh).with_drift_check(true)));
        assert!(queue.push("b", Trigger::new(TriggerSource::Retry)));
        assert_eq!(queue.len(), 2);

        let (key, trigger) = queue.pop().await.unwrap();
        assert_eq!(key, "a");
        assert!(trigger.check_drift);
        assert_eq!(queue.pop().await.unwrap().0, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_source_change_wins_on_merge() {
        let queue = WorkQueue::new();
        queue.push(1, Trigger::new(TriggerSource::Refresh));
        queue.push(1, Trigger::new(TriggerSource::SourceChange));
        assert_eq!(queue.pop().await.unwrap().1.source, TriggerSource::SourceChange);
    }

    #[tokio::test]
    async fn test_cancelled_keys_are_skipped() {
        let queue = WorkQueue::new();
        queue.push(1, Trigger::new(TriggerSource::SourceChange));
        queue.push(2, Trigger::new(TriggerSource::SourceChange));
        assert_eq!(queue.cancel(|key| *key == 1), 1);
        assert_eq!(queue.pop().await.unwrap().0, 2);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_requeue_after_cancel_is_delivered_once() {
        let queue = WorkQueue::new();
        queue.push(7, Trigger::new(TriggerSource::SourceChange));
        queue.cancel(|_| true);
        queue.push(7, Trigger::new(TriggerSource::Retry));
        queue.push(8, Trigger::new(TriggerSource::Retry));

        // The stale channel entry for 7 delivers the live trigger; the
        // second entry for 7 is then skipped.
        assert_eq!(queue.pop().await.unwrap(), (7, Trigger::new(TriggerSource::Retry)));
        assert_eq!(queue.pop().await.unwrap().0, 8);
    }

    #[tokio::test]
    async fn test_key_can_be_queued_while_in_flight() {
        let queue = WorkQueue::new();
        queue.push("a", Trigger::new(TriggerSource::SourceChange));
        let _in_flight = queue.pop().await.unwrap();
        assert!(queue.push("a", Trigger::new(TriggerSource::SourceChange)));
        assert!(queue.is_pending(&"a"));
    }
}
