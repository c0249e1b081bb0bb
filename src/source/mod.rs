//! Message source adapters — one capability, three transport strategies.
//!
//! The strategy is selected by mailbox configuration: an access token picks
//! the provider-API source, otherwise raw IMAP (with an optional IDLE
//! watcher running alongside, see [`idle`]).

pub mod gmail;
pub mod idle;
pub mod imap;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MailboxConfig;
use crate::error::{ParseError, TransportError};
use crate::message::InboundMessage;

/// One fetch result — a parsed message, or a payload that could not be
/// decoded (logged with status `error`, skipped; the scan continues).
#[derive(Debug)]
pub enum Fetched {
    Parsed(InboundMessage),
    Unparsed { source_ref: String, error: ParseError },
}

/// Abstracts over the mailbox transport.
///
/// `fetch_unseen` is finite (bounded by what the mailbox reports as unseen
/// at call time) and not restartable — each call establishes a fresh
/// transport session. `archive`/`add_label` act on the same transport.
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Connect/authenticate probe, used once at monitor start.
    async fn check(&self) -> Result<(), TransportError>;

    /// Fetch currently-unseen messages. Zero results is a success.
    async fn fetch_unseen(&self) -> Result<Vec<Fetched>, TransportError>;

    /// Remove the message from the inbox. A no-op success on transports
    /// without folder semantics.
    async fn archive(&self, message: &InboundMessage) -> Result<(), TransportError>;

    /// Attach a named label, creating it on the mailbox if absent.
    /// Creation is idempotent under concurrent create.
    async fn add_label(
        &self,
        message: &InboundMessage,
        name: &str,
    ) -> Result<(), TransportError>;
}

/// Factory signature for building a source from mailbox credentials.
/// Injectable so the supervisor can be tested without live transports.
pub type SourceFactory = Arc<dyn Fn(&MailboxConfig) -> Arc<dyn MessageSource> + Send + Sync>;

/// The default strategy selection.
pub fn for_mailbox(config: &MailboxConfig) -> Arc<dyn MessageSource> {
    if config.access_token.is_some() {
        Arc::new(gmail::GmailSource::new(config.clone()))
    } else {
        Arc::new(imap::ImapSource::new(config.clone()))
    }
}

/// The default [`SourceFactory`].
pub fn default_factory() -> SourceFactory {
    Arc::new(|config: &MailboxConfig| for_mailbox(config))
}

/// Strip HTML tags from content (basic).
pub(crate) fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
