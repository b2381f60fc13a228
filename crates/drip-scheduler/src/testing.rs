//! Test doubles shared by the engine's unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use drip_core::{Notifier, OutboundMessage, SendOutcome, SubscriberId};

use crate::executor::RetryPolicy;

/// Retry policy without waits.
pub fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        multiplier: 1.0,
        send_timeout: Duration::from_secs(5),
    }
}

/// Records every call; answers from a script, then `Sent`.
#[derive(Default)]
pub struct RecordingNotifier {
    calls: Mutex<Vec<OutboundMessage>>,
    script: Mutex<VecDeque<SendOutcome>>,
    delay: Mutex<Option<Duration>>,
    slow: Mutex<Option<(SubscriberId, Duration)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, outcomes: impl IntoIterator<Item = SendOutcome>) {
        self.script.lock().unwrap().extend(outcomes);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    /// Delay only the sends addressed to `subscriber`.
    pub fn set_delay_for(&self, subscriber: &SubscriberId, delay: Duration) {
        *self.slow.lock().unwrap() = Some((subscriber.clone(), delay));
    }

    pub fn calls(&self) -> Vec<OutboundMessage> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, dedup_key: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.dedup_key == dedup_key)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_message(&self, message: &OutboundMessage) -> SendOutcome {
        self.calls.lock().unwrap().push(message.clone());
        let slow = self
            .slow
            .lock()
            .unwrap()
            .as_ref()
            .filter(|(who, _)| *who == message.subscriber)
            .map(|(_, delay)| *delay);
        let delay = slow.or(*self.delay.lock().unwrap());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(SendOutcome::Sent)
    }
}
