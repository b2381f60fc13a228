//! SQLite-backed durable state: the subscription log, pending timers and the
//! side-effect ledger live in one database so a log append and its timer
//! change commit in a single transaction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use drip_core::{DripError, EmailDetails, Result, SubscriberId};

use crate::clock::from_millis;
use crate::journal::{EntryKind, LogEntry};
use crate::timers::{ScheduledTimer, TimerChange};

/// State of a side effect in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectStatus {
    InFlight,
    Done,
    Failed,
}

impl EffectStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "in_flight" => Some(Self::InFlight),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One row of the side-effect ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectRecord {
    pub dedup_key: String,
    pub status: EffectStatus,
    pub attempts: u32,
    pub detail: Option<String>,
    pub updated_at: String,
}

/// Durable store shared by the log, the timer scheduler and the executor.
pub struct StateDb {
    conn: Mutex<Connection>,
}

impl StateDb {
    /// Open or create the state database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| storage("DB open", e))?;
        // WAL keeps readers off the writer; FULL sync makes every commit durable.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")
            .map_err(|e| storage("DB pragmas", e))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| storage("DB open", e))?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            -- Append-only per-subscriber event log
            CREATE TABLE IF NOT EXISTS subscription_log (
                subscriber_id TEXT NOT NULL,
                run INTEGER NOT NULL,             -- lifecycle number, 1-based
                seq INTEGER NOT NULL,             -- 1-based within a run
                kind TEXT NOT NULL,               -- created, tick_completed, cancel_requested, terminated
                payload TEXT NOT NULL,            -- JSON EmailDetails snapshot
                logical_ms INTEGER NOT NULL,
                next_due_ms INTEGER,              -- timer armed with this entry
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (subscriber_id, run, seq)
            );

            -- At most one pending tick per subscriber
            CREATE TABLE IF NOT EXISTS scheduled_timers (
                subscriber_id TEXT PRIMARY KEY,
                run INTEGER NOT NULL,
                seq INTEGER NOT NULL,             -- seq the TickCompleted entry will get
                due_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_timers_due ON scheduled_timers(due_ms);

            -- Side-effect ledger keyed by dedup key
            CREATE TABLE IF NOT EXISTS side_effects (
                dedup_key TEXT PRIMARY KEY,
                status TEXT NOT NULL,             -- in_flight, done, failed
                attempts INTEGER NOT NULL DEFAULT 0,
                detail TEXT,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(|e| storage("Migration", e))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| DripError::Storage(format!("Lock: {e}")))
    }

    // ─── Subscription Log ──────────────────────────────────────

    /// Append a log entry and apply its timer change atomically.
    pub fn append_entry(&self, entry: &LogEntry, timer: &TimerChange) -> Result<()> {
        let payload = serde_json::to_string(&entry.details)?;
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(|e| storage("Begin", e))?;

        tx.execute(
            "INSERT INTO subscription_log
             (subscriber_id, run, seq, kind, payload, logical_ms, next_due_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.subscriber_id.as_str(),
                entry.run,
                to_sql_int(entry.seq)?,
                entry.kind.as_str(),
                payload,
                entry.logical_time.timestamp_millis(),
                entry.next_due.map(|t| t.timestamp_millis()),
                entry.recorded_at.to_rfc3339(),
            ],
        )
        .map_err(|e| storage("Append entry", e))?;

        match timer {
            TimerChange::Keep => {}
            TimerChange::Arm(t) => {
                tx.execute(
                    "INSERT OR REPLACE INTO scheduled_timers (subscriber_id, run, seq, due_ms)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        t.subscriber_id.as_str(),
                        t.run,
                        to_sql_int(t.seq)?,
                        t.due_at.timestamp_millis(),
                    ],
                )
                .map_err(|e| storage("Arm timer", e))?;
            }
            TimerChange::Clear => {
                tx.execute(
                    "DELETE FROM scheduled_timers WHERE subscriber_id = ?1",
                    [entry.subscriber_id.as_str()],
                )
                .map_err(|e| storage("Clear timer", e))?;
            }
        }

        tx.commit().map_err(|e| storage("Commit", e))?;
        Ok(())
    }

    /// All entries of one run, in sequence order.
    pub fn load_entries(&self, subscriber: &SubscriberId, run: u32) -> Result<Vec<LogEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, kind, payload, logical_ms, next_due_ms, recorded_at FROM subscription_log
                 WHERE subscriber_id = ?1 AND run = ?2 ORDER BY seq",
            )
            .map_err(|e| storage("Load entries", e))?;

        let rows = stmt
            .query_map(params![subscriber.as_str(), run], |row| {
                let seq = from_sql_int(0, row.get(0)?)?;
                let kind_str: String = row.get(1)?;
                let payload: String = row.get(2)?;
                let logical_ms: i64 = row.get(3)?;
                let next_due_ms: Option<i64> = row.get(4)?;
                let recorded_at_str: String = row.get(5)?;

                let kind = EntryKind::parse(&kind_str).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        1,
                        rusqlite::types::Type::Text,
                        format!("unknown entry kind '{kind_str}'").into(),
                    )
                })?;
                let details: EmailDetails = serde_json::from_str(&payload).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        2,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })?;
                let recorded_at = DateTime::parse_from_rfc3339(&recorded_at_str)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or_else(|_| from_millis(logical_ms));

                Ok(LogEntry {
                    subscriber_id: subscriber.clone(),
                    run,
                    seq,
                    kind,
                    details,
                    logical_time: from_millis(logical_ms),
                    next_due: next_due_ms.map(from_millis),
                    recorded_at,
                })
            })
            .map_err(|e| storage("Load entries", e))?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| storage("Decode entry", e))
    }

    /// Highest run number recorded for a subscriber.
    pub fn latest_run(&self, subscriber: &SubscriberId) -> Result<Option<u32>> {
        self.lock()?
            .query_row(
                "SELECT MAX(run) FROM subscription_log WHERE subscriber_id = ?1",
                [subscriber.as_str()],
                |row| row.get::<_, Option<u32>>(0),
            )
            .map_err(|e| storage("Latest run", e))
    }

    /// Latest run of every subscriber whose last entry is not `terminated`.
    pub fn unfinished_runs(&self) -> Result<Vec<(SubscriberId, u32)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT l.subscriber_id, l.run FROM subscription_log l
                 JOIN (SELECT subscriber_id, MAX(run) AS run FROM subscription_log
                       GROUP BY subscriber_id) latest
                   ON l.subscriber_id = latest.subscriber_id AND l.run = latest.run
                 WHERE l.seq = (SELECT MAX(seq) FROM subscription_log s
                                WHERE s.subscriber_id = l.subscriber_id AND s.run = l.run)
                   AND l.kind != 'terminated'
                 ORDER BY l.subscriber_id",
            )
            .map_err(|e| storage("Unfinished runs", e))?;

        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
            })
            .map_err(|e| storage("Unfinished runs", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, run) = row.map_err(|e| storage("Unfinished runs", e))?;
            match SubscriberId::parse(&id) {
                Ok(id) => out.push((id, run)),
                Err(e) => tracing::warn!("⚠️ Skipping log stream with bad id: {e}"),
            }
        }
        Ok(out)
    }

    // ─── Timers ──────────────────────────────────────

    /// Register or replace the pending timer of a subscriber.
    pub fn upsert_timer(&self, timer: &ScheduledTimer) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO scheduled_timers (subscriber_id, run, seq, due_ms)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    timer.subscriber_id.as_str(),
                    timer.run,
                    to_sql_int(timer.seq)?,
                    timer.due_at.timestamp_millis(),
                ],
            )
            .map_err(|e| storage("Upsert timer", e))?;
        Ok(())
    }

    /// Remove a subscriber's pending timer. Returns whether one existed.
    pub fn delete_timer(&self, subscriber: &SubscriberId) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "DELETE FROM scheduled_timers WHERE subscriber_id = ?1",
                [subscriber.as_str()],
            )
            .map_err(|e| storage("Delete timer", e))?;
        Ok(n > 0)
    }

    /// Remove exactly this registration, leaving a newer one in place.
    pub fn delete_timer_exact(&self, timer: &ScheduledTimer) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "DELETE FROM scheduled_timers WHERE subscriber_id = ?1 AND run = ?2 AND seq = ?3",
                params![timer.subscriber_id.as_str(), timer.run, to_sql_int(timer.seq)?],
            )
            .map_err(|e| storage("Delete timer", e))?;
        Ok(n > 0)
    }

    pub fn get_timer(&self, subscriber: &SubscriberId) -> Result<Option<ScheduledTimer>> {
        self.lock()?
            .query_row(
                "SELECT run, seq, due_ms FROM scheduled_timers WHERE subscriber_id = ?1",
                [subscriber.as_str()],
                |row| {
                    Ok(ScheduledTimer {
                        subscriber_id: subscriber.clone(),
                        run: row.get(0)?,
                        seq: from_sql_int(1, row.get(1)?)?,
                        due_at: from_millis(row.get(2)?),
                    })
                },
            )
            .optional()
            .map_err(|e| storage("Get timer", e))
    }

    /// Timers due at or before `now`, oldest first.
    pub fn due_timers(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledTimer>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT subscriber_id, run, seq, due_ms FROM scheduled_timers
                 WHERE due_ms <= ?1 ORDER BY due_ms, subscriber_id",
            )
            .map_err(|e| storage("Due timers", e))?;

        let rows = stmt
            .query_map([now.timestamp_millis()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    from_sql_int(2, row.get(2)?)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| storage("Due timers", e))?;

        let mut out = Vec::new();
        for row in rows {
            let (id, run, seq, due_ms) = row.map_err(|e| storage("Due timers", e))?;
            match SubscriberId::parse(&id) {
                Ok(subscriber_id) => out.push(ScheduledTimer {
                    subscriber_id,
                    run,
                    seq,
                    due_at: from_millis(due_ms),
                }),
                Err(e) => tracing::warn!("⚠️ Skipping timer with bad id: {e}"),
            }
        }
        Ok(out)
    }

    /// Earliest due time strictly after `now`.
    pub fn next_due_after(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let ms = self
            .lock()?
            .query_row(
                "SELECT MIN(due_ms) FROM scheduled_timers WHERE due_ms > ?1",
                [now.timestamp_millis()],
                |row| row.get::<_, Option<i64>>(0),
            )
            .map_err(|e| storage("Next due", e))?;
        Ok(ms.map(from_millis))
    }

    pub fn timer_count(&self) -> Result<usize> {
        let n: i64 = self
            .lock()?
            .query_row("SELECT COUNT(*) FROM scheduled_timers", [], |row| row.get(0))
            .map_err(|e| storage("Count timers", e))?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    // ─── Side-Effect Ledger ──────────────────────────────────────

    pub fn effect(&self, dedup_key: &str) -> Result<Option<EffectRecord>> {
        self.lock()?
            .query_row(
                "SELECT status, attempts, detail, updated_at FROM side_effects WHERE dedup_key = ?1",
                [dedup_key],
                |row| {
                    let status_str: String = row.get(0)?;
                    Ok(EffectRecord {
                        dedup_key: dedup_key.to_string(),
                        status: EffectStatus::parse(&status_str).unwrap_or(EffectStatus::Failed),
                        attempts: row.get(1)?,
                        detail: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
            .map_err(|e| storage("Load effect", e))
    }

    /// Mark a side effect as being attempted.
    pub fn begin_effect(&self, dedup_key: &str) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO side_effects (dedup_key, status, attempts, updated_at)
                 VALUES (?1, 'in_flight', 0, ?2)
                 ON CONFLICT(dedup_key) DO UPDATE SET status = 'in_flight', updated_at = ?2",
                params![dedup_key, Utc::now().to_rfc3339()],
            )
            .map_err(|e| storage("Begin effect", e))?;
        Ok(())
    }

    /// Record the outcome of an attempt series. Attempts accumulate across calls.
    pub fn finish_effect(
        &self,
        dedup_key: &str,
        status: EffectStatus,
        attempts: u32,
        detail: Option<&str>,
    ) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE side_effects
                 SET status = ?2, attempts = attempts + ?3, detail = ?4, updated_at = ?5
                 WHERE dedup_key = ?1",
                params![
                    dedup_key,
                    status.as_str(),
                    attempts,
                    detail,
                    Utc::now().to_rfc3339()
                ],
            )
            .map_err(|e| storage("Finish effect", e))?;
        Ok(())
    }
}

fn storage(op: &str, e: rusqlite::Error) -> DripError {
    DripError::Storage(format!("{op}: {e}"))
}

fn to_sql_int(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| DripError::Storage(format!("integer {v} out of range")))
}

fn from_sql_int(idx: usize, v: i64) -> rusqlite::Result<u64> {
    u64::try_from(v).map_err(|_| rusqlite::Error::IntegralValueOutOfRange(idx, v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn id(s: &str) -> SubscriberId {
        SubscriberId::parse(s).unwrap()
    }

    fn entry(sub: &SubscriberId, run: u32, seq: u64, kind: EntryKind) -> LogEntry {
        let t = from_millis(1_700_000_000_000);
        LogEntry {
            subscriber_id: sub.clone(),
            run,
            seq,
            kind,
            details: EmailDetails::welcome(sub.clone()),
            logical_time: t,
            next_due: None,
            recorded_at: t,
        }
    }

    fn timer(sub: &SubscriberId, run: u32, seq: u64, due_ms: i64) -> ScheduledTimer {
        ScheduledTimer {
            subscriber_id: sub.clone(),
            run,
            seq,
            due_at: from_millis(due_ms),
        }
    }

    #[test]
    fn test_open_and_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let db = StateDb::open(&dir.path().join("state").join("drip.db")).unwrap();
        assert_eq!(db.timer_count().unwrap(), 0);
        assert!(db.unfinished_runs().unwrap().is_empty());
    }

    #[test]
    fn test_append_arms_timer_in_same_commit() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        db.append_entry(
            &entry(&a, 1, 1, EntryKind::Created),
            &TimerChange::Arm(timer(&a, 1, 2, 5_000)),
        )
        .unwrap();

        let pending = db.get_timer(&a).unwrap().unwrap();
        assert_eq!(pending.seq, 2);
        assert_eq!(db.load_entries(&a, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_sequence_is_rejected_and_rolled_back() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        db.append_entry(
            &entry(&a, 1, 1, EntryKind::Created),
            &TimerChange::Arm(timer(&a, 1, 2, 5_000)),
        )
        .unwrap();

        let err = db
            .append_entry(
                &entry(&a, 1, 1, EntryKind::TickCompleted),
                &TimerChange::Arm(timer(&a, 1, 3, 9_000)),
            )
            .unwrap_err();
        assert!(err.is_storage());
        // The timer change rolled back with the failed append.
        assert_eq!(db.get_timer(&a).unwrap().unwrap().seq, 2);
    }

    #[test]
    fn test_clear_removes_timer() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        db.append_entry(
            &entry(&a, 1, 1, EntryKind::Created),
            &TimerChange::Arm(timer(&a, 1, 2, 5_000)),
        )
        .unwrap();
        db.append_entry(&entry(&a, 1, 2, EntryKind::CancelRequested), &TimerChange::Clear)
            .unwrap();
        assert!(db.get_timer(&a).unwrap().is_none());
    }

    #[test]
    fn test_unfinished_runs_uses_latest_run() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        let b = id("b@x.com");

        // a: run 1 terminated, run 2 active
        db.append_entry(&entry(&a, 1, 1, EntryKind::Created), &TimerChange::Keep).unwrap();
        db.append_entry(&entry(&a, 1, 2, EntryKind::CancelRequested), &TimerChange::Keep)
            .unwrap();
        db.append_entry(&entry(&a, 1, 3, EntryKind::Terminated), &TimerChange::Keep).unwrap();
        db.append_entry(&entry(&a, 2, 1, EntryKind::Created), &TimerChange::Keep).unwrap();
        // b: terminated
        db.append_entry(&entry(&b, 1, 1, EntryKind::Created), &TimerChange::Keep).unwrap();
        db.append_entry(&entry(&b, 1, 2, EntryKind::CancelRequested), &TimerChange::Keep)
            .unwrap();
        db.append_entry(&entry(&b, 1, 3, EntryKind::Terminated), &TimerChange::Keep).unwrap();

        assert_eq!(db.unfinished_runs().unwrap(), vec![(a.clone(), 2)]);
        assert_eq!(db.latest_run(&a).unwrap(), Some(2));
        assert_eq!(db.latest_run(&id("c@x.com")).unwrap(), None);
    }

    #[test]
    fn test_due_and_next_due() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        let b = id("b@x.com");
        db.upsert_timer(&timer(&a, 1, 2, 1_000)).unwrap();
        db.upsert_timer(&timer(&b, 1, 2, 3_000)).unwrap();

        let now = from_millis(2_000);
        let due = db.due_timers(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].subscriber_id, a);
        assert_eq!(db.next_due_after(now).unwrap(), Some(from_millis(3_000)));
        assert_eq!(
            db.next_due_after(now + TimeDelta::seconds(5)).unwrap(),
            None
        );
    }

    #[test]
    fn test_delete_timer_exact_keeps_newer_registration() {
        let db = StateDb::in_memory().unwrap();
        let a = id("a@x.com");
        db.upsert_timer(&timer(&a, 1, 3, 1_000)).unwrap();
        assert!(!db.delete_timer_exact(&timer(&a, 1, 2, 1_000)).unwrap());
        assert!(db.get_timer(&a).unwrap().is_some());
        assert!(db.delete_timer_exact(&timer(&a, 1, 3, 1_000)).unwrap());
        assert!(!db.delete_timer(&a).unwrap());
    }

    #[test]
    fn test_effect_ledger() {
        let db = StateDb::in_memory().unwrap();
        assert!(db.effect("k").unwrap().is_none());

        db.begin_effect("k").unwrap();
        assert_eq!(db.effect("k").unwrap().unwrap().status, EffectStatus::InFlight);

        db.finish_effect("k", EffectStatus::Failed, 3, Some("smtp down")).unwrap();
        db.begin_effect("k").unwrap();
        db.finish_effect("k", EffectStatus::Done, 1, None).unwrap();

        let rec = db.effect("k").unwrap().unwrap();
        assert_eq!(rec.status, EffectStatus::Done);
        assert_eq!(rec.attempts, 4);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drip.db");
        let a = id("a@x.com");
        {
            let db = StateDb::open(&path).unwrap();
            db.append_entry(
                &entry(&a, 1, 1, EntryKind::Created),
                &TimerChange::Arm(timer(&a, 1, 2, 5_000)),
            )
            .unwrap();
        }
        let db = StateDb::open(&path).unwrap();
        assert_eq!(db.load_entries(&a, 1).unwrap().len(), 1);
        assert_eq!(db.get_timer(&a).unwrap().unwrap().due_at, from_millis(5_000));
    }
}
