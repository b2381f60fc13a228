//! # Drip Scheduler
//!
//! Durable, per-subscriber drip campaigns on a single SQLite file.
//!
//! ## Design Principles
//! - No external broker; log, timers and side-effect ledger share one database
//! - A log append and its timer change commit in one transaction
//! - Side effects are keyed, so a replayed step never sends twice
//! - Tokio timers only; the loop parks until the earliest due time
//!
//! ## Architecture
//! ```text
//! ProcessRegistry
//!   ├── start / query / cancel  ← gateway
//!   ├── recover()               ← process start
//!   └── run_timers() loop
//!         └── fire_due(now) → SubscriptionMachine::on_timer_fire
//!                               ├── SideEffectExecutor → Notifier
//!                               └── DurableLog::commit (+ TimerChange)
//! ```

pub mod clock;
pub mod executor;
pub mod journal;
pub mod machine;
pub mod persistence;
pub mod registry;
pub mod timers;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use executor::{Execution, RetryPolicy, SideEffectExecutor};
pub use journal::{DurableLog, EntryKind, LogEntry};
pub use machine::{CancelOutcome, FireOutcome, Snapshot, SubscriptionMachine};
pub use persistence::StateDb;
pub use registry::{CancelAck, EngineSettings, ProcessRegistry, RecoveryReport};
pub use timers::{ScheduledTimer, TimerChange, TimerScheduler};
