//! Normalized inbound message, constructed per fetch.

use chrono::{DateTime, Utc};

/// A message as seen by the matcher and executor.
///
/// Ephemeral — exists only for the duration of one processing pass.
/// `message_id` is stable across fetches and is the de-duplication key;
/// `source_ref` is the provider-native handle (IMAP UID or provider
/// message id) that archive/label operations act on.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub message_id: String,
    pub source_ref: String,
    pub from: String,
    pub to: String,
    pub subject: Option<String>,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Test/fixture constructor with sensible defaults.
    #[cfg(test)]
    pub fn fixture(message_id: &str, from: &str, subject: &str, body: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            source_ref: message_id.to_string(),
            from: from.to_string(),
            to: "me@example.com".to_string(),
            subject: Some(subject.to_string()),
            body: body.to_string(),
            received_at: Utc::now(),
        }
    }
}
