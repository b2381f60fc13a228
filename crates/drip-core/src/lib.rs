//! # Drip Core
//!
//! Shared vocabulary for the Drip workspace: configuration, the error
//! taxonomy, subscriber/domain types and the outbound [`Notifier`] seam.
//!
//! Every other crate depends on this one; it has no async runtime of its own.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::DripConfig;
pub use error::{DripError, Result, SideEffectError};
pub use traits::Notifier;
pub use types::{
    CampaignState, EmailDetails, OutboundMessage, SendOutcome, SubscriberId, FAREWELL_MESSAGE,
    THANK_YOU_MESSAGE, WELCOME_MESSAGE,
};
