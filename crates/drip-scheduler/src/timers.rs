//! Timer Scheduler — durable "wake me at T" registrations, one per subscriber.
//!
//! Rows live in the shared state database and are replaced or removed only
//! together with the log entry that acknowledges them, so a timer whose tick
//! never committed is still there after a restart and fires again.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Notify;

use drip_core::{Result, SubscriberId};

use crate::persistence::StateDb;

/// A pending tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledTimer {
    pub subscriber_id: SubscriberId,
    pub run: u32,
    /// Sequence number the TickCompleted entry of this firing will get.
    pub seq: u64,
    pub due_at: DateTime<Utc>,
}

/// Timer side of a log append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerChange {
    Keep,
    Arm(ScheduledTimer),
    Clear,
}

pub struct TimerScheduler {
    db: Arc<StateDb>,
    wake: Notify,
}

impl TimerScheduler {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self {
            db,
            wake: Notify::new(),
        }
    }

    /// Register (or replace) the subscriber's wake-up.
    pub fn schedule(&self, timer: &ScheduledTimer) -> Result<()> {
        self.db.upsert_timer(timer)?;
        tracing::debug!(
            "⏰ Timer set for {} (run {}, seq {}) at {}",
            timer.subscriber_id,
            timer.run,
            timer.seq,
            timer.due_at
        );
        self.notify_changed();
        Ok(())
    }

    /// Drop the subscriber's pending wake-up, if any.
    pub fn cancel_pending(&self, subscriber: &SubscriberId) -> Result<bool> {
        self.db.delete_timer(subscriber)
    }

    /// Drop a registration that turned out to be stale.
    pub fn discard(&self, timer: &ScheduledTimer) -> Result<bool> {
        self.db.delete_timer_exact(timer)
    }

    pub fn pending(&self, subscriber: &SubscriberId) -> Result<Option<ScheduledTimer>> {
        self.db.get_timer(subscriber)
    }

    /// Timers whose due time has passed, oldest first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimer>> {
        self.db.due_timers(now)
    }

    pub fn next_due_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        self.db.next_due_after(now)
    }

    pub fn pending_count(&self) -> Result<usize> {
        self.db.timer_count()
    }

    /// Wake the timer loop; a registration may now be earlier than its park.
    pub fn notify_changed(&self) {
        self.wake.notify_one();
    }

    /// Resolves after the next [`notify_changed`](Self::notify_changed).
    pub async fn wait_for_change(&self) {
        self.wake.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::from_millis;
    use std::time::Duration;

    fn timer(s: &str, due_ms: i64) -> ScheduledTimer {
        ScheduledTimer {
            subscriber_id: SubscriberId::parse(s).unwrap(),
            run: 1,
            seq: 2,
            due_at: from_millis(due_ms),
        }
    }

    #[test]
    fn test_schedule_replaces_previous() {
        let timers = TimerScheduler::new(Arc::new(StateDb::in_memory().unwrap()));
        timers.schedule(&timer("a@x.com", 1_000)).unwrap();
        timers.schedule(&timer("a@x.com", 7_000)).unwrap();

        assert_eq!(timers.pending_count().unwrap(), 1);
        let id = SubscriberId::parse("a@x.com").unwrap();
        assert_eq!(timers.pending(&id).unwrap().unwrap().due_at, from_millis(7_000));
    }

    #[test]
    fn test_cancel_pending() {
        let timers = TimerScheduler::new(Arc::new(StateDb::in_memory().unwrap()));
        timers.schedule(&timer("a@x.com", 1_000)).unwrap();
        let id = SubscriberId::parse("a@x.com").unwrap();
        assert!(timers.cancel_pending(&id).unwrap());
        assert!(timers.due(from_millis(10_000)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_schedule_wakes_waiter() {
        let timers = Arc::new(TimerScheduler::new(Arc::new(StateDb::in_memory().unwrap())));
        let waiter = {
            let timers = timers.clone();
            tokio::spawn(async move { timers.wait_for_change().await })
        };
        timers.schedule(&timer("a@x.com", 1_000)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
