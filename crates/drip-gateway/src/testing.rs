//! Gateway state for handler tests.

use async_trait::async_trait;
use std::sync::Arc;

use drip_core::{Notifier, OutboundMessage, SendOutcome};
use drip_scheduler::{EngineSettings, ProcessRegistry, StateDb, SystemClock};

use crate::server::AppState;

struct Quiet;

#[async_trait]
impl Notifier for Quiet {
    fn name(&self) -> &str {
        "quiet"
    }

    async fn send_message(&self, _: &OutboundMessage) -> SendOutcome {
        SendOutcome::Sent
    }
}

pub fn test_state() -> Arc<AppState> {
    let registry = ProcessRegistry::new(
        Arc::new(StateDb::in_memory().unwrap()),
        Arc::new(Quiet),
        EngineSettings::default(),
        Arc::new(SystemClock),
    )
    .unwrap();
    Arc::new(AppState {
        registry: Arc::new(registry),
        gateway_config: drip_core::config::GatewayConfig::default(),
        start_time: std::time::Instant::now(),
    })
}
