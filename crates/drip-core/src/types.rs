//! Domain types shared by the engine, the notifiers and the gateway.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{DripError, Result};

pub const WELCOME_MESSAGE: &str = "Welcome to our Subscription Workflow!";
pub const THANK_YOU_MESSAGE: &str = "Thank you for staying subscribed!";
pub const FAREWELL_MESSAGE: &str = "Sorry to see you go";

/// Subscriber key: an email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubscriberId(String);

impl SubscriberId {
    /// Parse and validate an email-shaped id. Surrounding whitespace is trimmed.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let mut parts = trimmed.split('@');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => {
                !local.is_empty()
                    && !domain.is_empty()
                    && !trimmed.chars().any(char::is_whitespace)
            }
            _ => false,
        };
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(DripError::InvalidSubscriber(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SubscriberId {
    type Error = DripError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SubscriberId> for String {
    fn from(id: SubscriberId) -> Self {
        id.0
    }
}

/// Query-visible state of one subscription.
///
/// Wire names (`email`, `message`, `count`) match the public HTTP API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailDetails {
    #[serde(rename = "email")]
    pub subscriber_id: SubscriberId,
    pub message: String,
    #[serde(rename = "count")]
    pub tick_count: u64,
    pub subscribed: bool,
}

impl EmailDetails {
    /// Snapshot at the start of a lifecycle.
    pub fn welcome(subscriber_id: SubscriberId) -> Self {
        Self {
            subscriber_id,
            message: WELCOME_MESSAGE.to_string(),
            tick_count: 0,
            subscribed: true,
        }
    }

    /// Snapshot after one more completed tick.
    pub fn next_tick(&self) -> Self {
        let tick_count = self.tick_count.saturating_add(1);
        let message = if tick_count > 1 {
            THANK_YOU_MESSAGE.to_string()
        } else {
            self.message.clone()
        };
        Self {
            subscriber_id: self.subscriber_id.clone(),
            message,
            tick_count,
            subscribed: true,
        }
    }

    /// Snapshot once cancellation has begun. The tick count is frozen.
    pub fn farewell(&self) -> Self {
        Self {
            subscriber_id: self.subscriber_id.clone(),
            message: FAREWELL_MESSAGE.to_string(),
            tick_count: self.tick_count,
            subscribed: false,
        }
    }
}

/// Lifecycle state of a subscription machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignState {
    Active,
    Cancelling,
    Terminated,
}

impl CampaignState {
    /// Active and Cancelling runs block a new start for the same id.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Terminated)
    }
}

impl fmt::Display for CampaignState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What the executor hands to a notifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    /// Replay-safe key; the same logical send always carries the same key.
    pub dedup_key: String,
    pub subscriber: SubscriberId,
    pub message: String,
    pub tick_count: u64,
}

impl OutboundMessage {
    pub fn from_details(dedup_key: impl Into<String>, details: &EmailDetails) -> Self {
        Self {
            dedup_key: dedup_key.into(),
            subscriber: details.subscriber_id.clone(),
            message: details.message.clone(),
            tick_count: details.tick_count,
        }
    }
}

/// Result of one notifier call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Transient trouble; worth another attempt.
    Retriable(String),
    /// Will never succeed for this message.
    Terminal(String),
}
