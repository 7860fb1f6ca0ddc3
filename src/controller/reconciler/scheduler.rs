//! Retry and refresh timers.
//!
//! Each triple has at most one pending timer. A ticker moves due timers onto
//! the work queue; refresh ticks of rules with drift detection read the remote
//! values before deciding to skip.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::types::TaskKey;
use super::Reconciler;
use crate::controller::locks::lock;
use crate::controller::queue::{Trigger, TriggerSource};
use crate::controller::rules::PushRule;
use crate::observability::metrics;

/// A pending timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub at: Instant,
    pub source: TriggerSource,
}

impl Reconciler {
    pub(super) async fn run_scheduler(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.scheduler_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let now = ticker.tick().await;
            self.enqueue_due(now);
        }
    }

    /// Queue every triple whose timer fired at or before `now`
    pub(super) fn enqueue_due(&self, now: Instant) -> usize {
        let mut due = Vec::new();
        lock(&self.schedule).retain(|key, scheduled| {
            if scheduled.at <= now {
                due.push((key.clone(), scheduled.source));
                false
            } else {
                true
            }
        });

        let count = due.len();
        for (key, source) in due {
            let Some(rule) = self.rule(&key.rule) else {
                continue;
            };
            let check_drift = source == TriggerSource::Refresh && rule.drift_detection;
            debug!("Timer fired for {} ({})", key, source.as_str());
            self.enqueue(key, Trigger::new(source).with_drift_check(check_drift), &rule);
        }
        if count > 0 {
            metrics::set_queue_depth(self.queue.len());
        }
        count
    }

    pub(super) fn schedule_in(&self, key: &TaskKey, delay: Duration, source: TriggerSource) {
        let at = Instant::now() + delay;
        lock(&self.schedule).insert(key.clone(), Scheduled { at, source });
    }

    /// Next refresh after a successful push
    ///
    /// Expiring values refresh `token_refresh_margin` before they expire, or
    /// at the rule's interval when that comes first. Rules that never refresh
    /// only get a timer for expiring values.
    pub(super) fn schedule_refresh(
        &self,
        key: &TaskKey,
        rule: &PushRule,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) {
        match self.refresh_delay(rule, expires_at) {
            Some(delay) => self.schedule_in(key, delay, TriggerSource::Refresh),
            None => {
                lock(&self.schedule).remove(key);
            }
        }
    }

    /// Schedule a refresh unless a timer is already pending
    pub(super) fn ensure_refresh_scheduled(
        &self,
        key: &TaskKey,
        rule: &PushRule,
        expires_at: Option<chrono::DateTime<Utc>>,
    ) {
        if lock(&self.schedule).contains_key(key) {
            return;
        }
        if let Some(delay) = self.refresh_delay(rule, expires_at) {
            self.schedule_in(key, delay, TriggerSource::Refresh);
        }
    }

    /// Retry of a triple that will not back off any further
    pub(super) fn schedule_fallback(&self, key: &TaskKey, rule: &PushRule) {
        let delay = rule
            .refresh
            .interval()
            .unwrap_or(self.config.failed_retry_interval);
        self.schedule_in(key, delay, TriggerSource::Refresh);
    }

    fn refresh_delay(&self, rule: &PushRule, expires_at: Option<chrono::DateTime<Utc>>) -> Option<Duration> {
        let until_expiry = expires_at.map(|expires_at| {
            (expires_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .saturating_sub(self.config.token_refresh_margin)
        });
        match (rule.refresh.interval(), until_expiry) {
            (Some(interval), Some(expiry)) => Some(interval.min(expiry)),
            (Some(interval), None) => Some(interval),
            (None, expiry) => expiry,
        }
    }

    /// Pending timer of a triple
    #[must_use]
    pub fn next_scheduled(&self, key: &TaskKey) -> Option<Scheduled> {
        lock(&self.schedule).get(key).copied()
    }
}
