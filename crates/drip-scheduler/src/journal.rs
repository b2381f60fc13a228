//! Durable Log — the append-only record each subscription is rebuilt from.
//!
//! A lifecycle (run) always reads `Created, TickCompleted*, [CancelRequested,
//! Terminated]`. [`replay`] folds a run back into the state machine's view and
//! rejects anything that does not have that shape.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use drip_core::{CampaignState, DripError, EmailDetails, Result, SubscriberId};

use crate::persistence::StateDb;
use crate::timers::TimerChange;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Created,
    TickCompleted,
    CancelRequested,
    Terminated,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::TickCompleted => "tick_completed",
            Self::CancelRequested => "cancel_requested",
            Self::Terminated => "terminated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "tick_completed" => Some(Self::TickCompleted),
            "cancel_requested" => Some(Self::CancelRequested),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

/// One durable event of a subscriber run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub subscriber_id: SubscriberId,
    pub run: u32,
    pub seq: u64,
    pub kind: EntryKind,
    /// Snapshot after the event.
    pub details: EmailDetails,
    /// Creation time, a tick's scheduled due time, or the cancel/termination time.
    pub logical_time: DateTime<Utc>,
    /// Due time of the timer armed together with this entry, if any.
    pub next_due: Option<DateTime<Utc>>,
    pub recorded_at: DateTime<Utc>,
}

/// State rebuilt from a run's entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replayed {
    pub details: EmailDetails,
    pub state: CampaignState,
    pub last_seq: u64,
    pub last_kind: EntryKind,
    pub last_logical: DateTime<Utc>,
    pub next_due: Option<DateTime<Utc>>,
    pub ticks_logged: u64,
}

/// Fold a run's entries (in sequence order) into its current state.
pub fn replay(subscriber: &SubscriberId, entries: &[LogEntry]) -> Result<Replayed> {
    let corrupt = |reason: String| DripError::corrupt_log(subscriber.as_str(), reason);

    let (first, rest) = entries
        .split_first()
        .ok_or_else(|| corrupt("empty run".into()))?;
    if first.kind != EntryKind::Created || first.seq != 1 {
        return Err(corrupt(format!(
            "run must open with created at seq 1, found {} at seq {}",
            first.kind, first.seq
        )));
    }

    let mut acc = Replayed {
        details: first.details.clone(),
        state: CampaignState::Active,
        last_seq: first.seq,
        last_kind: first.kind,
        last_logical: first.logical_time,
        next_due: first.next_due,
        ticks_logged: 0,
    };

    for entry in rest {
        if entry.run != first.run {
            return Err(corrupt(format!("entry from run {} mixed into run {}", entry.run, first.run)));
        }
        if Some(entry.seq) != acc.last_seq.checked_add(1) {
            return Err(corrupt(format!(
                "sequence gap: {} follows {}",
                entry.seq, acc.last_seq
            )));
        }
        acc.state = match (acc.last_kind, entry.kind) {
            (EntryKind::Created | EntryKind::TickCompleted, EntryKind::TickCompleted) => {
                if entry.details.tick_count != acc.details.tick_count.saturating_add(1) {
                    return Err(corrupt(format!(
                        "tick count jumps from {} to {} at seq {}",
                        acc.details.tick_count, entry.details.tick_count, entry.seq
                    )));
                }
                acc.ticks_logged += 1;
                CampaignState::Active
            }
            (EntryKind::Created | EntryKind::TickCompleted, EntryKind::CancelRequested) => {
                CampaignState::Cancelling
            }
            (EntryKind::CancelRequested, EntryKind::Terminated) => CampaignState::Terminated,
            (prev, next) => {
                return Err(corrupt(format!("{next} cannot follow {prev} (seq {})", entry.seq)));
            }
        };
        acc.details = entry.details.clone();
        acc.last_seq = entry.seq;
        acc.last_kind = entry.kind;
        acc.last_logical = entry.logical_time;
        acc.next_due = entry.next_due;
    }

    Ok(acc)
}

/// Typed access to the subscription log.
pub struct DurableLog {
    db: Arc<StateDb>,
}

impl DurableLog {
    pub fn new(db: Arc<StateDb>) -> Self {
        Self { db }
    }

    /// Append an entry together with its timer change, in one transaction.
    pub fn commit(&self, entry: &LogEntry, timer: &TimerChange) -> Result<()> {
        self.db.append_entry(entry, timer)?;
        tracing::debug!(
            "📝 {} run {} seq {}: {}",
            entry.subscriber_id,
            entry.run,
            entry.seq,
            entry.kind
        );
        Ok(())
    }

    pub fn entries(&self, subscriber: &SubscriberId, run: u32) -> Result<Vec<LogEntry>> {
        self.db.load_entries(subscriber, run)
    }

    pub fn latest_run(&self, subscriber: &SubscriberId) -> Result<Option<u32>> {
        self.db.latest_run(subscriber)
    }

    /// Entries of the subscriber's most recent run.
    pub fn latest(&self, subscriber: &SubscriberId) -> Result<Option<(u32, Vec<LogEntry>)>> {
        match self.latest_run(subscriber)? {
            Some(run) => Ok(Some((run, self.entries(subscriber, run)?))),
            None => Ok(None),
        }
    }

    pub fn unfinished_runs(&self) -> Result<Vec<(SubscriberId, u32)>> {
        self.db.unfinished_runs()
    }
}
