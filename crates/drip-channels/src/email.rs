//! SMTP notifier — delivers campaign messages through an async lettre relay.
//!
//! The dedup key becomes the `Message-ID`, so a relay or mailbox that
//! deduplicates on it drops a resend of the same tick.

use async_trait::async_trait;
use lettre::message::Mailbox;
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};

use drip_core::config::SmtpConfig;
use drip_core::{DripError, Notifier, OutboundMessage, Result, SendOutcome};

pub struct SmtpNotifier {
    config: SmtpConfig,
    from: Mailbox,
    mailer: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpNotifier {
    pub fn new(config: SmtpConfig) -> Result<Self> {
        let from_name = config.display_name.as_deref().unwrap_or("Drip");
        let from: Mailbox = format!("{from_name} <{}>", config.email)
            .parse()
            .map_err(|e| DripError::Config(format!("Invalid from address: {e}")))?;

        let creds = Credentials::new(config.email.clone(), config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| DripError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self {
            config,
            from,
            mailer,
        })
    }

    /// Build the email. `Err` means the message can never be sent as is.
    fn build_email(&self, message: &OutboundMessage) -> std::result::Result<LettreMessage, String> {
        let to: Mailbox = message
            .subscriber
            .as_str()
            .parse()
            .map_err(|e| format!("Invalid recipient {}: {e}", message.subscriber))?;

        LettreMessage::builder()
            .from(self.from.clone())
            .to(to)
            .subject(self.config.subject.as_str())
            .message_id(Some(message_id(&message.dedup_key, &self.config.email)))
            .header(ContentType::TEXT_PLAIN)
            .body(format!(
                "{}\n\nMessages so far: {}\n",
                message.message, message.tick_count
            ))
            .map_err(|e| format!("Build email: {e}"))
    }
}

/// `<dedup-key@sender-domain>`, with the key reduced to atom characters.
fn message_id(dedup_key: &str, sender: &str) -> String {
    let local: String = dedup_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '.' })
        .collect();
    let domain = sender.rsplit_once('@').map(|(_, d)| d).unwrap_or("drip.local");
    format!("<{local}@{domain}>")
}

/// Permanent (5xx) and malformed-message errors will not improve on retry.
fn classify(err: &lettre::transport::smtp::Error) -> SendOutcome {
    if err.is_permanent() || err.is_client() {
        SendOutcome::Terminal(format!("SMTP send: {err}"))
    } else {
        SendOutcome::Retriable(format!("SMTP send: {err}"))
    }
}

#[async_trait]
impl Notifier for SmtpNotifier {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send_message(&self, message: &OutboundMessage) -> SendOutcome {
        let email = match self.build_email(message) {
            Ok(email) => email,
            Err(reason) => return SendOutcome::Terminal(reason),
        };

        match self.mailer.send(email).await {
            Ok(_) => {
                tracing::info!("📤 Email sent to: {} ({})", message.subscriber, message.dedup_key);
                SendOutcome::Sent
            }
            Err(e) => classify(&e),
        }
    }
}
