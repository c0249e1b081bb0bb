//! SMTP mailer — outbound reply/forward composition via lettre.
//!
//! Sends are blocking (the executor wraps them in `spawn_blocking`) and
//! fire-and-log: a transport failure surfaces as an [`ActionError`], never
//! an uncaught panic.

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::config::MailboxConfig;
use crate::error::ActionError;
use crate::message::InboundMessage;

/// Outbound SMTP sender for one mailbox.
#[derive(Clone)]
pub struct Mailer {
    config: MailboxConfig,
}

impl Mailer {
    pub fn new(config: MailboxConfig) -> Self {
        Self { config }
    }

    /// Reply to the sender with a static template, threading the original
    /// message id through References/In-Reply-To.
    pub fn send_reply(
        &self,
        message: &InboundMessage,
        template: &str,
    ) -> Result<(), ActionError> {
        let to = parse_mailbox(&message.from)?;
        let thread_ref = thread_id(&message.message_id);

        let email = Message::builder()
            .from(self.from_mailbox()?)
            .to(to)
            .subject(reply_subject(message.subject.as_deref()))
            .in_reply_to(thread_ref.clone())
            .references(thread_ref)
            .body(template.to_string())
            .map_err(|e| ActionError::SendFailed {
                reason: format!("failed to build reply: {e}"),
            })?;

        self.transport()?.send(&email).map_err(|e| ActionError::SendFailed {
            reason: format!("SMTP send failed: {e}"),
        })?;

        info!(to = %message.from, "Auto-reply sent");
        Ok(())
    }

    /// Forward the message to a fixed recipient with the standard banner.
    pub fn send_forward(&self, message: &InboundMessage, to: &str) -> Result<(), ActionError> {
        let email = Message::builder()
            .from(self.from_mailbox()?)
            .to(parse_mailbox(to)?)
            .subject(forward_subject(message.subject.as_deref()))
            .body(forward_body(message))
            .map_err(|e| ActionError::SendFailed {
                reason: format!("failed to build forward: {e}"),
            })?;

        self.transport()?.send(&email).map_err(|e| ActionError::SendFailed {
            reason: format!("SMTP send failed: {e}"),
        })?;

        info!(to = %to, "Message forwarded");
        Ok(())
    }

    fn transport(&self) -> Result<SmtpTransport, ActionError> {
        if !self.config.smtp_configured() {
            return Err(ActionError::SmtpNotConfigured);
        }

        let creds = Credentials::new(
            self.config.smtp_user.clone(),
            self.config.smtp_password.expose_secret().to_string(),
        );

        Ok(SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| ActionError::SendFailed {
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build())
    }

    fn from_mailbox(&self) -> Result<Mailbox, ActionError> {
        let display = if self.config.from_name.is_empty() {
            self.config.from_email.clone()
        } else {
            format!("{} <{}>", self.config.from_name, self.config.from_email)
        };
        parse_mailbox(&display)
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, ActionError> {
    address.parse().map_err(|e| ActionError::InvalidAddress {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

pub(crate) fn reply_subject(subject: Option<&str>) -> String {
    format!("Re: {}", subject.unwrap_or_default())
}

pub(crate) fn forward_subject(subject: Option<&str>) -> String {
    format!("Fwd: {}", subject.unwrap_or_default())
}

/// Forwarding banner with the original sender/date/subject/recipient,
/// followed by the original body.
pub(crate) fn forward_body(message: &InboundMessage) -> String {
    format!(
        "---------- Forwarded message ----------\n\
         From: {}\n\
         Date: {}\n\
         Subject: {}\n\
         To: {}\n\n\
         {}",
        message.from,
        message.received_at.to_rfc2822(),
        message.subject.as_deref().unwrap_or_default(),
        message.to,
        message.body,
    )
}

/// Normalize a message id into angle-bracket form for threading headers.
fn thread_id(message_id: &str) -> String {
    if message_id.starts_with('<') {
        message_id.to_string()
    } else {
        format!("<{message_id}>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_subject_is_prefixed() {
        assert_eq!(reply_subject(Some("Invoice")), "Re: Invoice");
        assert_eq!(reply_subject(None), "Re: ");
    }

    #[test]
    fn forward_subject_is_prefixed() {
        assert_eq!(forward_subject(Some("Invoice")), "Fwd: Invoice");
    }

    #[test]
    fn forward_body_carries_original_fields() {
        let message = InboundMessage::fixture(
            "<m1@x>",
            "alice@example.com",
            "Quarterly numbers",
            "See attachment.",
        );
        let body = forward_body(&message);
        assert!(body.starts_with("---------- Forwarded message ----------"));
        assert!(body.contains("From: alice@example.com"));
        assert!(body.contains("Subject: Quarterly numbers"));
        assert!(body.contains("To: me@example.com"));
        assert!(body.ends_with("See attachment."));
    }

    #[test]
    fn thread_id_normalizes_angle_brackets() {
        assert_eq!(thread_id("abc@mail"), "<abc@mail>");
        assert_eq!(thread_id("<abc@mail>"), "<abc@mail>");
    }

    #[test]
    fn named_sender_addresses_parse() {
        assert!(parse_mailbox("Alice <alice@example.com>").is_ok());
        assert!(parse_mailbox("alice@example.com").is_ok());
        assert!(parse_mailbox("").is_err());
    }
}
