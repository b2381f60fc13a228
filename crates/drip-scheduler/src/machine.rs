//! Subscription State Machine — one per subscriber run.
//!
//! `Active → (tick)* → Cancelling → Terminated`. Every transition is a log
//! append; in-memory state only moves after the append committed. A failed
//! append halts the machine until the process restarts.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;

use drip_core::{CampaignState, DripError, EmailDetails, Result, SubscriberId};

use crate::clock::Clock;
use crate::executor::{Execution, SideEffectExecutor, farewell_key, tick_key};
use crate::journal::{DurableLog, EntryKind, LogEntry, replay};
use crate::timers::{ScheduledTimer, TimerChange, TimerScheduler};

/// Collaborators every machine shares.
pub struct CampaignContext {
    pub log: DurableLog,
    pub timers: TimerScheduler,
    pub executor: SideEffectExecutor,
    pub clock: Arc<dyn Clock>,
    pub interval: TimeDelta,
}

/// Point-in-time view published after every commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub details: EmailDetails,
    pub state: CampaignState,
    pub run: u32,
    pub last_seq: u64,
    pub halted: bool,
}

/// What a restored machine still has to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    /// Terminated; nothing left.
    Idle,
    /// Active; this timer must be pending.
    ResumeTicks(ScheduledTimer),
    /// Cancel was logged but the run never terminated.
    FinishCancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Ticked { tick_count: u64, delivery: Execution },
    /// The timer did not belong to the machine's current position.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Terminated { delivery: Execution },
    AlreadyCancelling,
    AlreadyTerminated,
}

pub struct SubscriptionMachine {
    ctx: Arc<CampaignContext>,
    run: u32,
    state: CampaignState,
    details: EmailDetails,
    last_seq: u64,
    last_logical: DateTime<Utc>,
    next_due: Option<DateTime<Utc>>,
    halted: bool,
    snapshot_tx: watch::Sender<Snapshot>,
}

impl SubscriptionMachine {
    /// Open run `run` for `subscriber`: log Created and arm the first tick.
    pub fn start(ctx: Arc<CampaignContext>, subscriber: SubscriberId, run: u32) -> Result<Self> {
        let now = ctx.clock.now();
        let details = EmailDetails::welcome(subscriber);
        let mut machine = Self::blank(ctx, run, details.clone(), now);

        let first = ScheduledTimer {
            subscriber_id: details.subscriber_id.clone(),
            run,
            seq: 2,
            due_at: now + machine.ctx.interval,
        };
        machine.append(EntryKind::Created, details, now, TimerChange::Arm(first))?;
        machine.ctx.timers.notify_changed();
        tracing::info!("📬 Subscription started for {} (run {run})", machine.subscriber());
        Ok(machine)
    }

    /// Rebuild a machine from its run's log.
    pub fn restore(
        ctx: Arc<CampaignContext>,
        subscriber: &SubscriberId,
        run: u32,
        entries: &[LogEntry],
    ) -> Result<(Self, Recovery)> {
        let replayed = replay(subscriber, entries)?;
        let mut machine = Self::blank(ctx, run, replayed.details, replayed.last_logical);
        machine.state = replayed.state;
        machine.last_seq = replayed.last_seq;
        machine.next_due = replayed.next_due;
        machine.publish();

        let recovery = match replayed.state {
            CampaignState::Active => Recovery::ResumeTicks(machine.expected_timer()),
            CampaignState::Cancelling => Recovery::FinishCancel,
            CampaignState::Terminated => Recovery::Idle,
        };
        Ok((machine, recovery))
    }

    fn blank(
        ctx: Arc<CampaignContext>,
        run: u32,
        details: EmailDetails,
        logical: DateTime<Utc>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot {
            details: details.clone(),
            state: CampaignState::Active,
            run,
            last_seq: 0,
            halted: false,
        });
        Self {
            ctx,
            run,
            state: CampaignState::Active,
            details,
            last_seq: 0,
            last_logical: logical,
            next_due: None,
            halted: false,
            snapshot_tx,
        }
    }

    pub fn subscriber(&self) -> &SubscriberId {
        &self.details.subscriber_id
    }

    pub fn run(&self) -> u32 {
        self.run
    }

    pub fn state(&self) -> CampaignState {
        self.state
    }

    pub fn details(&self) -> &EmailDetails {
        &self.details
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Receiver that always holds the latest committed snapshot.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The timer an Active machine should have pending: the one logged with
    /// the last entry, or one interval after its logical time for entries
    /// that carry no due time.
    pub fn expected_timer(&self) -> ScheduledTimer {
        ScheduledTimer {
            subscriber_id: self.subscriber().clone(),
            run: self.run,
            seq: self.last_seq + 1,
            due_at: self
                .next_due
                .unwrap_or(self.last_logical + self.ctx.interval),
        }
    }

    /// One tick: send, then log TickCompleted and arm the next timer together.
    pub async fn on_timer_fire(&mut self, timer: &ScheduledTimer) -> Result<FireOutcome> {
        self.ensure_running()?;

        if self.state != CampaignState::Active {
            tracing::debug!("⏭️ Dropping timer for {} in state {}", self.subscriber(), self.state);
            self.ctx.timers.discard(timer)?;
            return Ok(FireOutcome::Stale);
        }
        if timer.run != self.run || timer.seq != self.last_seq + 1 {
            tracing::warn!(
                "⚠️ Stale timer for {} (run {}, seq {}); expected run {} seq {}",
                self.subscriber(),
                timer.run,
                timer.seq,
                self.run,
                self.last_seq + 1
            );
            self.ctx.timers.schedule(&self.expected_timer())?;
            return Ok(FireOutcome::Stale);
        }

        let next = self.details.next_tick();
        let key = tick_key(self.subscriber(), self.run, next.tick_count);
        let delivery = match self.ctx.executor.execute(&key, &next).await {
            Ok(delivery) => delivery,
            Err(e) => {
                self.halt(&e);
                return Err(e);
            }
        };
        if let Execution::Failed(err) = &delivery {
            tracing::warn!(
                "⚠️ Tick {} for {} counted without delivery: {err}",
                next.tick_count,
                self.subscriber()
            );
        }

        let now = self.ctx.clock.now();
        let mut next_due = timer.due_at + self.ctx.interval;
        if next_due <= now {
            // Down for more than an interval: resume the cadence from now, no burst.
            next_due = now + self.ctx.interval;
        }
        let following = ScheduledTimer {
            subscriber_id: self.subscriber().clone(),
            run: self.run,
            seq: timer.seq + 1,
            due_at: next_due,
        };

        let tick_count = next.tick_count;
        self.append(
            EntryKind::TickCompleted,
            next,
            timer.due_at,
            TimerChange::Arm(following),
        )?;
        self.ctx.timers.notify_changed();
        tracing::info!("✉️ Tick {tick_count} completed for {}", self.subscriber());

        Ok(FireOutcome::Ticked {
            tick_count,
            delivery,
        })
    }

    /// Cancel an Active run: log CancelRequested, send the farewell, terminate.
    pub async fn cancel(&mut self) -> Result<CancelOutcome> {
        self.ensure_running()?;
        match self.state {
            CampaignState::Terminated => return Ok(CancelOutcome::AlreadyTerminated),
            CampaignState::Cancelling => return Ok(CancelOutcome::AlreadyCancelling),
            CampaignState::Active => {}
        }

        let farewell = self.details.farewell();
        let now = self.ctx.clock.now();
        self.append(EntryKind::CancelRequested, farewell, now, TimerChange::Clear)?;
        tracing::info!(
            "🛑 Cancellation started for {} at tick {}",
            self.subscriber(),
            self.details.tick_count
        );
        self.farewell_and_terminate().await
    }

    /// Finish a run restored in Cancelling.
    pub async fn resume_cancel(&mut self) -> Result<CancelOutcome> {
        self.ensure_running()?;
        match self.state {
            CampaignState::Cancelling => self.farewell_and_terminate().await,
            CampaignState::Terminated => Ok(CancelOutcome::AlreadyTerminated),
            CampaignState::Active => Err(DripError::corrupt_log(
                self.subscriber().as_str(),
                "resume_cancel on an active run",
            )),
        }
    }

    async fn farewell_and_terminate(&mut self) -> Result<CancelOutcome> {
        let key = farewell_key(self.subscriber(), self.run);
        let delivery = match self.ctx.executor.execute(&key, &self.details).await {
            Ok(delivery) => delivery,
            Err(e) => {
                self.halt(&e);
                return Err(e);
            }
        };
        if let Execution::Failed(err) = &delivery {
            tracing::warn!("⚠️ Farewell to {} not delivered: {err}", self.subscriber());
        }

        let now = self.ctx.clock.now();
        let details = self.details.clone();
        self.append(EntryKind::Terminated, details, now, TimerChange::Clear)?;
        tracing::info!("👋 Subscription terminated for {} (run {})", self.subscriber(), self.run);
        Ok(CancelOutcome::Terminated { delivery })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.halted {
            Err(DripError::Halted(self.subscriber().to_string()))
        } else {
            Ok(())
        }
    }

    fn append(
        &mut self,
        kind: EntryKind,
        details: EmailDetails,
        logical: DateTime<Utc>,
        change: TimerChange,
    ) -> Result<()> {
        let next_due = match &change {
            TimerChange::Arm(timer) => Some(timer.due_at),
            TimerChange::Keep | TimerChange::Clear => None,
        };
        let entry = LogEntry {
            subscriber_id: details.subscriber_id.clone(),
            run: self.run,
            seq: self.last_seq + 1,
            kind,
            details,
            logical_time: logical,
            next_due,
            recorded_at: self.ctx.clock.now(),
        };
        if let Err(e) = self.ctx.log.commit(&entry, &change) {
            self.halt(&e);
            return Err(e);
        }

        self.last_seq = entry.seq;
        self.last_logical = logical;
        self.next_due = next_due;
        self.state = match kind {
            EntryKind::Created | EntryKind::TickCompleted => CampaignState::Active,
            EntryKind::CancelRequested => CampaignState::Cancelling,
            EntryKind::Terminated => CampaignState::Terminated,
        };
        self.details = entry.details;
        self.publish();
        Ok(())
    }

    fn halt(&mut self, cause: &DripError) {
        tracing::error!(
            "❌ Halting {} (run {}) after storage fault: {cause}",
            self.subscriber(),
            self.run
        );
        self.halted = true;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Snapshot {
            details: self.details.clone(),
            state: self.state,
            run: self.run,
            last_seq: self.last_seq,
            halted: self.halted,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, from_millis};
    use crate::persistence::StateDb;
    use crate::testing::{RecordingNotifier, fast_policy};
    use drip_core::{FAREWELL_MESSAGE, SendOutcome, THANK_YOU_MESSAGE, WELCOME_MESSAGE};

    struct Rig {
        ctx: Arc<CampaignContext>,
        clock: Arc<ManualClock>,
        notifier: Arc<RecordingNotifier>,
    }

    fn rig() -> Rig {
        let db = Arc::new(StateDb::in_memory().unwrap());
        let clock = Arc::new(ManualClock::new(from_millis(1_700_000_000_000)));
        let notifier = Arc::new(RecordingNotifier::new());
        let ctx = Arc::new(CampaignContext {
            log: DurableLog::new(db.clone()),
            timers: TimerScheduler::new(db.clone()),
            executor: SideEffectExecutor::new(db, notifier.clone(), fast_policy(3)),
            clock: clock.clone(),
            interval: TimeDelta::seconds(12),
        });
        Rig {
            ctx,
            clock,
            notifier,
        }
    }

    fn id() -> SubscriberId {
        SubscriberId::parse("a@x.com").unwrap()
    }

    async fn fire_next(rig: &Rig, machine: &mut SubscriptionMachine) -> FireOutcome {
        let timer = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        rig.clock.set(timer.due_at);
        machine.on_timer_fire(&timer).await.unwrap()
    }

    #[tokio::test]
    async fn test_start_logs_created_and_arms_first_tick() {
        let rig = rig();
        let start = rig.clock.now();
        let machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();

        let snap = machine.snapshot();
        assert_eq!(snap.details.message, WELCOME_MESSAGE);
        assert_eq!(snap.details.tick_count, 0);
        assert!(snap.details.subscribed);
        assert_eq!(snap.state, CampaignState::Active);

        let timer = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        assert_eq!(timer.seq, 2);
        assert_eq!(timer.due_at, start + TimeDelta::seconds(12));
        assert!(rig.notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ticks_follow_message_progression() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();

        fire_next(&rig, &mut machine).await;
        assert_eq!(machine.details().tick_count, 1);
        assert_eq!(machine.details().message, WELCOME_MESSAGE);

        fire_next(&rig, &mut machine).await;
        assert_eq!(machine.details().tick_count, 2);
        assert_eq!(machine.details().message, THANK_YOU_MESSAGE);

        let calls = rig.notifier.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].dedup_key, "a@x.com/run-1/tick-1");
        assert_eq!(calls[1].tick_count, 2);
    }

    #[tokio::test]
    async fn test_next_tick_uses_logical_due_time() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        let first = rig.ctx.timers.pending(&id()).unwrap().unwrap();

        // Fire a little late; the cadence stays anchored to the due time.
        rig.clock.set(first.due_at + TimeDelta::seconds(3));
        machine.on_timer_fire(&first).await.unwrap();
        let second = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        assert_eq!(second.due_at, first.due_at + TimeDelta::seconds(12));

        // Fire far too late; the next tick is one interval from now.
        rig.clock.set(second.due_at + TimeDelta::seconds(100));
        machine.on_timer_fire(&second).await.unwrap();
        let third = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        assert_eq!(third.due_at, rig.clock.now() + TimeDelta::seconds(12));
    }

    #[tokio::test]
    async fn test_lost_timer_rebuilt_at_armed_time() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        let first = rig.ctx.timers.pending(&id()).unwrap().unwrap();

        // A very late tick arms the next one relative to now, not to its due time.
        rig.clock.set(first.due_at + TimeDelta::seconds(100));
        machine.on_timer_fire(&first).await.unwrap();
        let armed = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        assert_eq!(armed.due_at, rig.clock.now() + TimeDelta::seconds(12));
        drop(machine);

        rig.ctx.timers.cancel_pending(&id()).unwrap();
        let entries = rig.ctx.log.entries(&id(), 1).unwrap();
        assert_eq!(entries.last().unwrap().next_due, Some(armed.due_at));
        let (_, recovery) =
            SubscriptionMachine::restore(rig.ctx.clone(), &id(), 1, &entries).unwrap();
        assert_eq!(recovery, Recovery::ResumeTicks(armed));
    }

    /// Occupy the seq the machine will write next, so its append fails.
    fn block_next_append(rig: &Rig, machine: &SubscriptionMachine) {
        let now = rig.clock.now();
        rig.ctx
            .log
            .commit(
                &LogEntry {
                    subscriber_id: id(),
                    run: 1,
                    seq: machine.snapshot().last_seq + 1,
                    kind: EntryKind::TickCompleted,
                    details: machine.details().next_tick(),
                    logical_time: now,
                    next_due: None,
                    recorded_at: now,
                },
                &TimerChange::Keep,
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_failed_append_halts_machine() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        let before = machine.snapshot();
        let timer = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        block_next_append(&rig, &machine);

        rig.clock.set(timer.due_at);
        let err = machine.on_timer_fire(&timer).await.unwrap_err();
        assert!(err.is_storage());
        assert!(machine.is_halted());

        // Nothing moved in memory; only the halt flag is published.
        let snap = machine.snapshot();
        assert!(snap.halted);
        assert_eq!(snap.details, before.details);
        assert_eq!(snap.last_seq, before.last_seq);
        assert_eq!(machine.state(), CampaignState::Active);
        // The timer row survived the rolled-back transaction.
        assert_eq!(rig.ctx.timers.pending(&id()).unwrap(), Some(timer.clone()));

        assert!(matches!(
            machine.on_timer_fire(&timer).await,
            Err(DripError::Halted(_))
        ));
        assert!(matches!(machine.cancel().await, Err(DripError::Halted(_))));
        assert!(matches!(
            machine.resume_cancel().await,
            Err(DripError::Halted(_))
        ));
        assert_eq!(rig.notifier.calls_for("a@x.com/run-1/farewell"), 0);
    }

    #[tokio::test]
    async fn test_failed_cancel_append_halts_machine() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        block_next_append(&rig, &machine);

        assert!(machine.cancel().await.unwrap_err().is_storage());
        assert!(machine.is_halted());
        assert_eq!(machine.state(), CampaignState::Active);
        assert!(machine.details().subscribed);
        assert!(rig.notifier.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_send_still_counts_tick() {
        let rig = rig();
        rig.notifier
            .script([SendOutcome::Terminal("550 mailbox unavailable".into())]);
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();

        match fire_next(&rig, &mut machine).await {
            FireOutcome::Ticked { tick_count, delivery } => {
                assert_eq!(tick_count, 1);
                assert!(matches!(delivery, Execution::Failed(_)));
            }
            other => panic!("expected tick, got {other:?}"),
        }
        assert_eq!(machine.state(), CampaignState::Active);
        assert!(rig.ctx.timers.pending(&id()).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_stale_timer_is_ignored() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        let timer = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        machine.on_timer_fire(&timer).await.unwrap();

        // Redelivery of the already-committed firing.
        assert_eq!(machine.on_timer_fire(&timer).await.unwrap(), FireOutcome::Stale);
        assert_eq!(machine.details().tick_count, 1);
        assert_eq!(rig.notifier.calls().len(), 1);
        assert_eq!(rig.ctx.timers.pending(&id()).unwrap().unwrap().seq, 3);
    }

    #[tokio::test]
    async fn test_cancel_sends_farewell_and_terminates() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        for _ in 0..3 {
            fire_next(&rig, &mut machine).await;
        }

        let outcome = machine.cancel().await.unwrap();
        assert!(matches!(outcome, CancelOutcome::Terminated { .. }));

        let snap = machine.snapshot();
        assert_eq!(snap.state, CampaignState::Terminated);
        assert_eq!(snap.details.tick_count, 3);
        assert!(!snap.details.subscribed);
        assert_eq!(snap.details.message, FAREWELL_MESSAGE);
        assert_eq!(rig.notifier.calls_for("a@x.com/run-1/farewell"), 1);
        assert!(rig.ctx.timers.pending(&id()).unwrap().is_none());

        let entries = rig.ctx.log.entries(&id(), 1).unwrap();
        let kinds: Vec<_> = entries.iter().rev().take(2).map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EntryKind::Terminated, EntryKind::CancelRequested]);

        assert_eq!(machine.cancel().await.unwrap(), CancelOutcome::AlreadyTerminated);
        assert_eq!(rig.notifier.calls_for("a@x.com/run-1/farewell"), 1);
    }

    #[tokio::test]
    async fn test_farewell_failure_still_terminates() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        rig.notifier.script([SendOutcome::Terminal("rejected".into())]);

        let outcome = machine.cancel().await.unwrap();
        assert!(matches!(
            outcome,
            CancelOutcome::Terminated {
                delivery: Execution::Failed(_)
            }
        ));
        assert_eq!(machine.state(), CampaignState::Terminated);
    }

    #[tokio::test]
    async fn test_restore_resumes_where_log_ends() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        fire_next(&rig, &mut machine).await;
        fire_next(&rig, &mut machine).await;
        let pending = rig.ctx.timers.pending(&id()).unwrap().unwrap();
        drop(machine);

        let entries = rig.ctx.log.entries(&id(), 1).unwrap();
        let (restored, recovery) =
            SubscriptionMachine::restore(rig.ctx.clone(), &id(), 1, &entries).unwrap();
        assert_eq!(restored.details().tick_count, 2);
        assert_eq!(restored.snapshot().last_seq, 3);
        assert_eq!(recovery, Recovery::ResumeTicks(pending));
    }

    #[tokio::test]
    async fn test_restore_cancelling_finishes_once() {
        let rig = rig();
        let mut machine = SubscriptionMachine::start(rig.ctx.clone(), id(), 1).unwrap();
        fire_next(&rig, &mut machine).await;

        // Simulate a crash right after CancelRequested was logged.
        let farewell = machine.details().farewell();
        let now = rig.clock.now();
        machine
            .append(EntryKind::CancelRequested, farewell, now, TimerChange::Clear)
            .unwrap();
        drop(machine);

        let entries = rig.ctx.log.entries(&id(), 1).unwrap();
        let (mut restored, recovery) =
            SubscriptionMachine::restore(rig.ctx.clone(), &id(), 1, &entries).unwrap();
        assert_eq!(recovery, Recovery::FinishCancel);
        assert_eq!(restored.cancel().await.unwrap(), CancelOutcome::AlreadyCancelling);

        restored.resume_cancel().await.unwrap();
        assert_eq!(restored.state(), CampaignState::Terminated);
        assert_eq!(restored.details().tick_count, 1);
        assert_eq!(rig.notifier.calls_for("a@x.com/run-1/farewell"), 1);
    }
}
