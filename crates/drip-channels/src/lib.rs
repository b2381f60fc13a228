//! # Drip Channels
//! Outbound delivery for campaign messages.
//!
//! Every channel implements [`drip_core::Notifier`] and makes one attempt
//! per call; retries belong to the engine's side-effect executor.

pub mod email;
pub mod log;
pub mod webhook;

use std::sync::Arc;

use drip_core::config::{NotifierConfig, NotifierKind};
use drip_core::{DripError, Notifier, Result};

pub use email::SmtpNotifier;
pub use log::LogNotifier;
pub use webhook::WebhookNotifier;

/// Build the configured notifier.
pub fn from_config(config: &NotifierConfig) -> Result<Arc<dyn Notifier>> {
    let notifier: Arc<dyn Notifier> = match config.kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Smtp => {
            let smtp = config
                .smtp
                .clone()
                .ok_or_else(|| DripError::Config("missing [notifier.smtp] section".into()))?;
            Arc::new(SmtpNotifier::new(smtp)?)
        }
        NotifierKind::Webhook => {
            let webhook = config
                .webhook
                .clone()
                .ok_or_else(|| DripError::Config("missing [notifier.webhook] section".into()))?;
            Arc::new(WebhookNotifier::new(webhook)?)
        }
    };
    tracing::info!("📮 Notifier: {}", notifier.name());
    Ok(notifier)
}
