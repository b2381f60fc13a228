//! Side-Effect Executor — runs a notifier call at most once per dedup key.
//!
//! The ledger row for a key turns `done` after the first confirmed send;
//! every later call with that key short-circuits. Transient failures are
//! retried here with exponential backoff and jitter; terminal failures and
//! exhausted budgets are reported back, never raised.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use drip_core::config::RetryConfig;
use drip_core::{
    EmailDetails, Notifier, OutboundMessage, Result, SendOutcome, SideEffectError, SubscriberId,
};

use crate::persistence::{EffectStatus, StateDb};

/// Dedup key of a tick's send.
pub fn tick_key(subscriber: &SubscriberId, run: u32, tick_count: u64) -> String {
    format!("{subscriber}/run-{run}/tick-{tick_count}")
}

/// Dedup key of a run's farewell send.
pub fn farewell_key(subscriber: &SubscriberId, run: u32) -> String {
    format!("{subscriber}/run-{run}/farewell")
}

/// Bounded exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Upper bound for one notifier call.
    pub send_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            send_timeout: Duration::from_secs(config.send_timeout_secs),
        }
    }

    /// Backoff before retry number `attempt` (1 = after the first failure), no jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exp);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    /// Backoff scaled by a random factor in [0.5, 1.0].
    fn jittered(&self, attempt: u32) -> Duration {
        let factor = rand::thread_rng().gen_range(0.5..=1.0);
        self.backoff(attempt).mul_f64(factor)
    }
}

/// What happened to a requested side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// The notifier confirmed the send.
    Performed { attempts: u32 },
    /// An earlier call with the same key already performed it.
    AlreadyDone,
    /// Nothing was delivered.
    Failed(SideEffectError),
}

pub struct SideEffectExecutor {
    db: Arc<StateDb>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl SideEffectExecutor {
    pub fn new(db: Arc<StateDb>, notifier: Arc<dyn Notifier>, policy: RetryPolicy) -> Self {
        Self {
            db,
            notifier,
            policy,
        }
    }

    pub fn notifier_name(&self) -> &str {
        self.notifier.name()
    }

    /// Send `details` under `dedup_key`. `Err` means the ledger itself failed.
    pub async fn execute(&self, dedup_key: &str, details: &EmailDetails) -> Result<Execution> {
        if let Some(record) = self.db.effect(dedup_key)?
            && record.status == EffectStatus::Done
        {
            tracing::debug!("♻️ Side effect {dedup_key} already performed, skipping");
            return Ok(Execution::AlreadyDone);
        }

        self.db.begin_effect(dedup_key)?;
        let message = OutboundMessage::from_details(dedup_key, details);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(
                self.policy.send_timeout,
                self.notifier.send_message(&message),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => SendOutcome::Retriable(format!(
                    "{} timed out after {:?}",
                    self.notifier.name(),
                    self.policy.send_timeout
                )),
            };

            match outcome {
                SendOutcome::Sent => {
                    self.db
                        .finish_effect(dedup_key, EffectStatus::Done, attempt, None)?;
                    return Ok(Execution::Performed { attempts: attempt });
                }
                SendOutcome::Terminal(reason) => {
                    self.db
                        .finish_effect(dedup_key, EffectStatus::Failed, attempt, Some(&reason))?;
                    return Ok(Execution::Failed(SideEffectError::Terminal(reason)));
                }
                SendOutcome::Retriable(reason) if attempt >= self.policy.max_attempts => {
                    self.db
                        .finish_effect(dedup_key, EffectStatus::Failed, attempt, Some(&reason))?;
                    return Ok(Execution::Failed(SideEffectError::Transient {
                        attempts: attempt,
                        reason,
                    }));
                }
                SendOutcome::Retriable(reason) => {
                    let wait = self.policy.jittered(attempt);
                    tracing::warn!(
                        "⚠️ Send {dedup_key} failed (attempt {attempt}/{}): {reason}, retrying in {wait:?}",
                        self.policy.max_attempts
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingNotifier, fast_policy};

    fn details() -> EmailDetails {
        EmailDetails::welcome(SubscriberId::parse("a@x.com").unwrap())
    }

    fn executor(notifier: Arc<RecordingNotifier>, attempts: u32) -> SideEffectExecutor {
        SideEffectExecutor::new(
            Arc::new(StateDb::in_memory().unwrap()),
            notifier,
            fast_policy(attempts),
        )
    }

    #[test]
    fn test_keys_are_scoped_by_run() {
        let id = SubscriberId::parse("a@x.com").unwrap();
        assert_eq!(tick_key(&id, 1, 3), "a@x.com/run-1/tick-3");
        assert_ne!(farewell_key(&id, 1), farewell_key(&id, 2));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(3),
            multiplier: 2.0,
            send_timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(3));
        assert_eq!(policy.backoff(30), Duration::from_secs(3));
        let j = policy.jittered(2);
        assert!(j >= Duration::from_millis(500) && j <= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_same_key_sends_once() {
        let notifier = Arc::new(RecordingNotifier::new());
        let exec = executor(notifier.clone(), 3);

        let first = exec.execute("k1", &details()).await.unwrap();
        assert_eq!(first, Execution::Performed { attempts: 1 });
        let second = exec.execute("k1", &details()).await.unwrap();
        assert_eq!(second, Execution::AlreadyDone);
        assert_eq!(notifier.calls_for("k1"), 1);
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.script([
            SendOutcome::Retriable("421 try later".into()),
            SendOutcome::Retriable("421 try later".into()),
        ]);
        let exec = executor(notifier.clone(), 5);

        let out = exec.execute("k", &details()).await.unwrap();
        assert_eq!(out, Execution::Performed { attempts: 3 });
        assert_eq!(notifier.calls_for("k"), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.script(std::iter::repeat_n(SendOutcome::Retriable("down".into()), 5));
        let exec = executor(notifier.clone(), 3);

        let out = exec.execute("k", &details()).await.unwrap();
        assert_eq!(
            out,
            Execution::Failed(SideEffectError::Transient {
                attempts: 3,
                reason: "down".into()
            })
        );
        assert_eq!(notifier.calls_for("k"), 3);
    }

    #[tokio::test]
    async fn test_terminal_is_not_retried() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.script([SendOutcome::Terminal("550 no such user".into())]);
        let exec = executor(notifier.clone(), 5);

        let out = exec.execute("k", &details()).await.unwrap();
        assert_eq!(
            out,
            Execution::Failed(SideEffectError::Terminal("550 no such user".into()))
        );
        assert_eq!(notifier.calls_for("k"), 1);

        // Nothing was delivered, so a later call may try again.
        let again = exec.execute("k", &details()).await.unwrap();
        assert_eq!(again, Execution::Performed { attempts: 1 });
    }

    #[tokio::test]
    async fn test_slow_notifier_times_out() {
        let notifier = Arc::new(RecordingNotifier::new());
        notifier.set_delay(Duration::from_millis(200));
        let mut policy = fast_policy(2);
        policy.send_timeout = Duration::from_millis(20);
        let exec = SideEffectExecutor::new(
            Arc::new(StateDb::in_memory().unwrap()),
            notifier.clone(),
            policy,
        );

        match exec.execute("k", &details()).await.unwrap() {
            Execution::Failed(SideEffectError::Transient { attempts, reason }) => {
                assert_eq!(attempts, 2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected transient failure, got {other:?}"),
        }
    }
}
