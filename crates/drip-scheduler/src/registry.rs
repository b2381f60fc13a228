//! Process Registry — routes requests to the one live machine per subscriber.
//!
//! Machines are resident in memory behind a per-subscriber `tokio::sync::Mutex`
//! and loaded from the durable log on demand. Queries read a `watch` snapshot
//! and never wait for a transition. The timer loop (`run_timers`) parks until
//! the earliest due time and hands each due timer to its own task, so a slow
//! send only holds up its own subscriber. Terminated runs are released from
//! memory and reloaded from the log on demand.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use drip_core::{CampaignState, DripConfig, DripError, Notifier, Result, SubscriberId};

use crate::clock::Clock;
use crate::executor::{RetryPolicy, SideEffectExecutor};
use crate::journal::{DurableLog, LogEntry};
use crate::machine::{CampaignContext, FireOutcome, Recovery, Snapshot, SubscriptionMachine};
use crate::persistence::StateDb;
use crate::timers::{ScheduledTimer, TimerScheduler};

/// Engine tuning derived from [`DripConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub interval: Duration,
    pub retry: RetryPolicy,
    pub max_park: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &DripConfig) -> Self {
        Self {
            interval: config.campaign.interval(),
            retry: RetryPolicy::from_config(&config.retry),
            max_park: Duration::from_secs(config.timers.max_park_secs.max(1)),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&DripConfig::default())
    }
}

/// Answer to an accepted cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelAck {
    /// The farewell sequence is now running in the background.
    Accepted,
    AlreadyCancelling,
    AlreadyTerminated,
}

/// What [`ProcessRegistry::recover`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Active runs brought back.
    pub resumed: usize,
    /// Of those, runs whose pending timer had to be re-registered.
    pub timers_rearmed: usize,
    /// Runs found mid-cancel; their farewell is being finished.
    pub cancels_finished: usize,
    /// Runs skipped because their log did not replay.
    pub corrupt: usize,
}

type Slots = Arc<Mutex<HashMap<SubscriberId, Arc<Slot>>>>;

struct Slot {
    machine: tokio::sync::Mutex<SubscriptionMachine>,
    snapshot: watch::Receiver<Snapshot>,
    cancel_requested: AtomicBool,
}

impl Slot {
    fn new(machine: SubscriptionMachine) -> Self {
        Self {
            snapshot: machine.watch(),
            machine: tokio::sync::Mutex::new(machine),
            cancel_requested: AtomicBool::new(false),
        }
    }

    fn current(&self) -> Snapshot {
        self.snapshot.borrow().clone()
    }
}

/// A subscriber whose timer is being fired. Released on drop.
struct FiringClaim {
    firing: Arc<Mutex<HashSet<SubscriberId>>>,
    subscriber: SubscriberId,
}

impl Drop for FiringClaim {
    fn drop(&mut self) {
        let mut firing = self.firing.lock().unwrap_or_else(|e| e.into_inner());
        firing.remove(&self.subscriber);
    }
}

/// Forget `slot` if it is still the resident one and its run has terminated.
fn release_terminated(slots: &Slots, subscriber: &SubscriberId, slot: &Arc<Slot>) {
    let mut slots = slots.lock().unwrap_or_else(|e| e.into_inner());
    let resident = slots.get(subscriber).is_some_and(|s| Arc::ptr_eq(s, slot));
    if resident && slot.current().state == CampaignState::Terminated {
        slots.remove(subscriber);
        tracing::debug!("🧹 Released terminated run of {subscriber}");
    }
}

pub struct ProcessRegistry {
    ctx: Arc<CampaignContext>,
    slots: Slots,
    firing: Arc<Mutex<HashSet<SubscriberId>>>,
    accepting: AtomicBool,
    background: Mutex<JoinSet<()>>,
    shutdown_tx: watch::Sender<bool>,
    max_park: Duration,
}

impl ProcessRegistry {
    pub fn new(
        db: Arc<StateDb>,
        notifier: Arc<dyn Notifier>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let interval = TimeDelta::from_std(settings.interval)
            .map_err(|e| DripError::Config(format!("campaign interval: {e}")))?;
        if interval <= TimeDelta::zero() {
            return Err(DripError::Config("campaign interval must be positive".into()));
        }

        let ctx = CampaignContext {
            log: DurableLog::new(db.clone()),
            timers: TimerScheduler::new(db.clone()),
            executor: SideEffectExecutor::new(db, notifier, settings.retry),
            clock,
            interval,
        };
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Self {
            ctx: Arc::new(ctx),
            slots: Arc::new(Mutex::new(HashMap::new())),
            firing: Arc::new(Mutex::new(HashSet::new())),
            accepting: AtomicBool::new(true),
            background: Mutex::new(JoinSet::new()),
            shutdown_tx,
            max_park: settings.max_park,
        })
    }

    pub fn notifier_name(&self) -> &str {
        self.ctx.executor.notifier_name()
    }

    /// Start a new run for `subscriber`.
    ///
    /// Fails with `Conflict` while a run is Active or Cancelling.
    pub fn start(&self, subscriber: &SubscriberId) -> Result<Snapshot> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(DripError::ShuttingDown);
        }

        let mut slots = self.lock_slots()?;
        let previous_run = match self.load_into(&mut slots, subscriber)? {
            Some(slot) => {
                let snap = slot.current();
                let cancelling = slot.cancel_requested.load(Ordering::SeqCst)
                    && snap.state != CampaignState::Terminated;
                if snap.state.is_live() || cancelling {
                    return Err(DripError::Conflict(subscriber.to_string()));
                }
                snap.run
            }
            None => 0,
        };

        let latest = self.ctx.log.latest_run(subscriber)?.unwrap_or(0);
        let run = latest.max(previous_run) + 1;
        let machine = SubscriptionMachine::start(self.ctx.clone(), subscriber.clone(), run)?;
        let snapshot = machine.snapshot();
        slots.insert(subscriber.clone(), Arc::new(Slot::new(machine)));
        Ok(snapshot)
    }

    /// Latest committed snapshot. Never waits on a running transition.
    pub fn query(&self, subscriber: &SubscriberId) -> Result<Snapshot> {
        self.lookup(subscriber)?
            .map(|slot| slot.current())
            .ok_or_else(|| DripError::NotFound(subscriber.to_string()))
    }

    /// Request cancellation. Returns once the request is accepted; the
    /// farewell and termination run on a background task.
    pub fn cancel(&self, subscriber: &SubscriberId) -> Result<CancelAck> {
        let slot = self
            .lookup(subscriber)?
            .ok_or_else(|| DripError::NotFound(subscriber.to_string()))?;

        let snap = slot.current();
        match snap.state {
            CampaignState::Terminated => return Ok(CancelAck::AlreadyTerminated),
            CampaignState::Cancelling => return Ok(CancelAck::AlreadyCancelling),
            CampaignState::Active => {}
        }
        if snap.halted {
            return Err(DripError::Halted(subscriber.to_string()));
        }
        if slot.cancel_requested.swap(true, Ordering::SeqCst) {
            return Ok(CancelAck::AlreadyCancelling);
        }

        tracing::info!("🛑 Cancel requested for {subscriber}");
        let id = subscriber.clone();
        let slots = self.slots.clone();
        self.spawn_background(async move {
            let outcome = slot.machine.lock().await.cancel().await;
            match outcome {
                Ok(_) => release_terminated(&slots, &id, &slot),
                Err(e) => tracing::error!("❌ Cancel of {id} failed: {e}"),
            }
        });
        Ok(CancelAck::Accepted)
    }

    /// Resolves with the final snapshot once the subscriber's run is Terminated.
    pub async fn wait_terminated(&self, subscriber: &SubscriberId) -> Result<Snapshot> {
        let slot = self
            .lookup(subscriber)?
            .ok_or_else(|| DripError::NotFound(subscriber.to_string()))?;
        let mut rx = slot.snapshot.clone();
        let snap = rx
            .wait_for(|s| s.state == CampaignState::Terminated)
            .await
            .map_err(|_| DripError::NotFound(subscriber.to_string()))?
            .clone();
        Ok(snap)
    }

    /// Drop terminated machines from memory. Their logs stay on disk.
    ///
    /// Cancels release their own run; this sweeps runs that were only loaded
    /// to answer a query. The timer loop calls it on every pass.
    pub fn prune_terminated(&self) -> Result<usize> {
        let mut slots = self.lock_slots()?;
        let before = slots.len();
        slots.retain(|_, slot| slot.current().state != CampaignState::Terminated);
        Ok(before - slots.len())
    }

    pub fn resident_count(&self) -> usize {
        self.slots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn pending_timers(&self) -> Result<usize> {
        self.ctx.timers.pending_count()
    }

    // ─── Recovery ──────────────────────────────────────

    /// Rebuild every unfinished run from the log and resume it.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let mut slots = self.lock_slots()?;

        for (subscriber, run) in self.ctx.log.unfinished_runs()? {
            if slots.contains_key(&subscriber) {
                continue;
            }
            let entries = self.ctx.log.entries(&subscriber, run)?;
            let (_, recovery) = match self.restore_into(&mut slots, &subscriber, run, &entries) {
                Ok(restored) => restored,
                Err(e @ DripError::CorruptLog { .. }) => {
                    tracing::error!("❌ Not resuming {subscriber}: {e}");
                    report.corrupt += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            match recovery {
                (Recovery::ResumeTicks(_), rearmed) => {
                    report.resumed += 1;
                    if rearmed {
                        report.timers_rearmed += 1;
                    }
                }
                (Recovery::FinishCancel, _) => report.cancels_finished += 1,
                (Recovery::Idle, _) => {}
            }
        }

        self.ctx.timers.notify_changed();
        tracing::info!(
            "🔁 Recovery: {} resumed ({} timers re-armed), {} cancels finishing, {} corrupt",
            report.resumed,
            report.timers_rearmed,
            report.cancels_finished,
            report.corrupt
        );
        Ok(report)
    }

    fn lock_slots(&self) -> Result<MutexGuard<'_, HashMap<SubscriberId, Arc<Slot>>>> {
        self.slots
            .lock()
            .map_err(|e| DripError::Storage(format!("Registry lock: {e}")))
    }

    fn lookup(&self, subscriber: &SubscriberId) -> Result<Option<Arc<Slot>>> {
        let mut slots = self.lock_slots()?;
        self.load_into(&mut slots, subscriber)
    }

    /// Resident slot, or one rebuilt from the subscriber's latest run.
    fn load_into(
        &self,
        slots: &mut HashMap<SubscriberId, Arc<Slot>>,
        subscriber: &SubscriberId,
    ) -> Result<Option<Arc<Slot>>> {
        if let Some(slot) = slots.get(subscriber) {
            return Ok(Some(slot.clone()));
        }
        let Some((run, entries)) = self.ctx.log.latest(subscriber)? else {
            return Ok(None);
        };
        let (slot, _) = self.restore_into(slots, subscriber, run, &entries)?;
        Ok(Some(slot))
    }

    /// Replay a run into a resident slot and carry out what recovery demands.
    /// The flag reports whether a timer had to be re-registered.
    fn restore_into(
        &self,
        slots: &mut HashMap<SubscriberId, Arc<Slot>>,
        subscriber: &SubscriberId,
        run: u32,
        entries: &[LogEntry],
    ) -> Result<(Arc<Slot>, (Recovery, bool))> {
        let (machine, recovery) =
            SubscriptionMachine::restore(self.ctx.clone(), subscriber, run, entries)?;
        let slot = Arc::new(Slot::new(machine));
        slots.insert(subscriber.clone(), slot.clone());

        let mut rearmed = false;
        match &recovery {
            Recovery::ResumeTicks(expected) => {
                let pending = self.ctx.timers.pending(subscriber)?;
                let matches = pending
                    .as_ref()
                    .is_some_and(|t| t.run == expected.run && t.seq == expected.seq);
                if !matches {
                    tracing::warn!(
                        "⚠️ Re-arming tick {} of {subscriber} at {}",
                        expected.seq,
                        expected.due_at
                    );
                    self.ctx.timers.schedule(expected)?;
                    rearmed = true;
                }
            }
            Recovery::FinishCancel => {
                slot.cancel_requested.store(true, Ordering::SeqCst);
                let task_slot = slot.clone();
                let id = subscriber.clone();
                let slots = self.slots.clone();
                self.spawn_background(async move {
                    let outcome = task_slot.machine.lock().await.resume_cancel().await;
                    match outcome {
                        Ok(_) => release_terminated(&slots, &id, &task_slot),
                        Err(e) => tracing::error!("❌ Finishing cancel of {id} failed: {e}"),
                    }
                });
            }
            Recovery::Idle => {}
        }
        Ok((slot, (recovery, rearmed)))
    }

    fn spawn_background(&self, task: impl Future<Output = ()> + Send + 'static) {
        let mut tasks = self.background.lock().unwrap_or_else(|e| e.into_inner());
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    // ─── Timers ──────────────────────────────────────

    /// Fire every timer due at `now` and wait for all of them. Returns the
    /// number of ticks committed. Subscribers already being fired elsewhere
    /// are left out.
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let claimed = self.claim_due(now)?;
        let fired = join_all(claimed.into_iter().map(move |(timer, claim)| async move {
            let ticked = self.fire_one(timer).await;
            drop(claim);
            ticked
        }))
        .await;
        Ok(fired.into_iter().filter(|ticked| *ticked).count())
    }

    /// Due timers whose subscriber is not being fired yet, each with a claim
    /// that keeps a second firing of that subscriber out until dropped.
    fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<(ScheduledTimer, FiringClaim)>> {
        let due = self.ctx.timers.due(now)?;
        let mut firing = self.firing.lock().unwrap_or_else(|e| e.into_inner());
        let claimed: Vec<_> = due
            .into_iter()
            .filter(|timer| firing.insert(timer.subscriber_id.clone()))
            .map(|timer| {
                let claim = FiringClaim {
                    firing: self.firing.clone(),
                    subscriber: timer.subscriber_id.clone(),
                };
                (timer, claim)
            })
            .collect();
        if !claimed.is_empty() {
            tracing::debug!("🔔 {} timer(s) due", claimed.len());
        }
        Ok(claimed)
    }

    async fn fire_one(&self, timer: ScheduledTimer) -> bool {
        let id = timer.subscriber_id.clone();
        let slot = match self.lookup(&id) {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                tracing::warn!("🧹 Dropping timer of unknown subscriber {id}");
                if let Err(e) = self.ctx.timers.discard(&timer) {
                    tracing::warn!("⚠️ Could not drop orphan timer of {id}: {e}");
                }
                return false;
            }
            Err(e) => {
                tracing::warn!("⚠️ Cannot load {id} for its timer: {e}");
                return false;
            }
        };

        let mut machine = slot.machine.lock().await;
        let stopping = *self.shutdown_tx.borrow();
        if stopping {
            return false;
        }
        if machine.is_halted() {
            tracing::debug!("⏸️ Skipping timer of halted subscriber {id}");
            return false;
        }
        if slot.cancel_requested.load(Ordering::SeqCst) && machine.state() == CampaignState::Active
        {
            // Cancel wins over a tick that has not committed yet.
            let outcome = machine.cancel().await;
            drop(machine);
            match outcome {
                Ok(_) => release_terminated(&self.slots, &id, &slot),
                Err(e) => tracing::error!("❌ Cancel of {id} failed: {e}"),
            }
            return false;
        }

        match machine.on_timer_fire(&timer).await {
            Ok(FireOutcome::Ticked { .. }) => true,
            Ok(FireOutcome::Stale) => false,
            Err(e) => {
                tracing::error!("❌ Tick for {id} failed: {e}");
                false
            }
        }
    }

    /// Timer loop. Runs until [`shutdown`](Self::shutdown).
    pub async fn run_timers(self: Arc<Self>) {
        let mut stop = self.shutdown_tx.subscribe();
        let mut in_flight: JoinSet<bool> = JoinSet::new();
        tracing::info!("⏱️ Timer loop started (max park {:?})", self.max_park);

        loop {
            if *stop.borrow_and_update() {
                break;
            }
            while let Some(joined) = in_flight.try_join_next() {
                Self::note_fired(joined);
            }
            if let Err(e) = self.prune_terminated() {
                tracing::warn!("⚠️ Cannot prune terminated runs: {e}");
            }

            let now = self.ctx.clock.now();
            match self.claim_due(now) {
                Ok(claimed) => {
                    for (timer, claim) in claimed {
                        let reg = self.clone();
                        in_flight.spawn(async move {
                            let ticked = reg.fire_one(timer).await;
                            drop(claim);
                            if ticked {
                                // The next timer may already be due.
                                reg.ctx.timers.notify_changed();
                            }
                            ticked
                        });
                    }
                }
                Err(e) => tracing::warn!("⚠️ Timer poll failed: {e}"),
            }

            let park = self.park_duration(now);
            tracing::debug!("💤 Timer loop parked for {park:?}");
            tokio::select! {
                _ = tokio::time::sleep(park) => {}
                _ = self.ctx.timers.wait_for_change() => {}
                _ = stop.changed() => {}
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            Self::note_fired(joined);
        }
        tracing::info!("⏱️ Timer loop stopped");
    }

    fn note_fired(joined: std::result::Result<bool, tokio::task::JoinError>) {
        match joined {
            Ok(true) => tracing::debug!("✅ Tick committed"),
            Ok(false) => {}
            Err(e) => tracing::warn!("⚠️ Timer task ended abnormally: {e}"),
        }
    }

    /// Sleep until the first timer that was not due at `polled_at`. Timers
    /// that were due then are firing already; their commit wakes the loop.
    fn park_duration(&self, polled_at: DateTime<Utc>) -> Duration {
        let now = self.ctx.clock.now();
        match self.ctx.timers.next_due_after(polled_at) {
            Ok(Some(due)) => (due - now)
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.max_park),
            Ok(None) => self.max_park,
            Err(e) => {
                tracing::warn!("⚠️ Cannot read next due time: {e}");
                self.max_park
            }
        }
    }

    /// Graceful drain: refuse new starts, stop the timer loop, let running
    /// transitions and farewell sends finish. Pending timers stay durable.
    pub async fn shutdown(&self) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("🛑 Registry draining");
        self.shutdown_tx.send_replace(true);

        let mut tasks = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::warn!("⚠️ Background task ended abnormally: {e}");
            }
        }

        let slots: Vec<Arc<Slot>> = match self.slots.lock() {
            Ok(slots) => slots.values().cloned().collect(),
            Err(e) => e.into_inner().values().cloned().collect(),
        };
        for slot in slots {
            drop(slot.machine.lock().await);
        }

        let pending = self.ctx.timers.pending_count().unwrap_or(0);
        tracing::info!("👋 Registry drained, {pending} timer(s) left for the next start");
    }
}
