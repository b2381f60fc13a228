//! Log notifier — writes the message to the log instead of delivering it.

use async_trait::async_trait;
use drip_core::{Notifier, OutboundMessage, SendOutcome};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send_message(&self, message: &OutboundMessage) -> SendOutcome {
        tracing::info!(
            "📧 Sending email to {} with message: {}, count: {}",
            message.subscriber,
            message.message,
            message.tick_count
        );
        SendOutcome::Sent
    }
}
