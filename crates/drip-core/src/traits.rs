//! Seams implemented outside the engine.

use async_trait::async_trait;

use crate::types::{OutboundMessage, SendOutcome};

/// Outbound message delivery.
///
/// Implementations should use `message.dedup_key` to deduplicate on their
/// side when the transport allows it. Retries are the executor's job: a
/// notifier makes exactly one attempt per call.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send_message(&self, message: &OutboundMessage) -> SendOutcome;
}
